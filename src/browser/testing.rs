//! Scripted in-memory browser driver for tests.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::browser::driver::{BrowserContext, BrowserDriver};
use crate::browser::session::EngineKind;
use crate::error::DriverError;

#[derive(Default)]
struct Script {
    opened: AtomicUsize,
    closed: AtomicUsize,
    crashes_remaining: AtomicUsize,
    fail_open_page: AtomicBool,
    open_delay_ms: AtomicU64,
    /// Contexts opened before this serial are dead
    killed_before: AtomicUsize,
    failed_pings: AtomicUsize,
    shut_down: AtomicBool,
    failing_urls: Mutex<HashSet<String>>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeDriver {
    script: Arc<Script>,
}

impl FakeDriver {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The next `n` navigations report a dead context
    pub(crate) fn crash_next_navigations(&self, n: usize) {
        self.script.crashes_remaining.store(n, Ordering::SeqCst);
    }

    pub(crate) fn fail_open_page(&self, fail: bool) {
        self.script.fail_open_page.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_open_delay_ms(&self, ms: u64) {
        self.script.open_delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Navigations to `url` always fail with a non-crash error
    pub(crate) fn fail_url(&self, url: &str) {
        self.script
            .failing_urls
            .lock()
            .unwrap()
            .insert(url.to_string());
    }

    /// Every context opened so far dies without the pool noticing
    pub(crate) fn kill_open_contexts(&self) {
        let opened = self.script.opened.load(Ordering::SeqCst);
        self.script.killed_before.store(opened, Ordering::SeqCst);
    }

    pub(crate) fn failed_pings(&self) -> usize {
        self.script.failed_pings.load(Ordering::SeqCst)
    }

    pub(crate) fn opened(&self) -> usize {
        self.script.opened.load(Ordering::SeqCst)
    }

    pub(crate) fn closed(&self) -> usize {
        self.script.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.script.shut_down.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserDriver for FakeDriver {
    async fn open_context(
        &self,
        _engine: EngineKind,
        _headless: bool,
    ) -> Result<Arc<dyn BrowserContext>, DriverError> {
        let delay = self.script.open_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let serial = self.script.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeContext {
            script: Arc::clone(&self.script),
            serial,
            dead: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            url: Mutex::new(String::from("about:blank")),
        }))
    }

    async fn shutdown(&self) -> Result<(), DriverError> {
        self.script.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeContext {
    script: Arc<Script>,
    serial: usize,
    dead: AtomicBool,
    closed: AtomicBool,
    url: Mutex<String>,
}

impl FakeContext {
    fn check_alive(&self) -> Result<(), DriverError> {
        let killed = self.serial < self.script.killed_before.load(Ordering::SeqCst);
        if killed || self.dead.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            Err(DriverError::ContextClosed("no such window".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrowserContext for FakeContext {
    async fn open_page(&self) -> Result<(), DriverError> {
        if self.script.fail_open_page.load(Ordering::SeqCst) {
            return Err(DriverError::Command("cannot open page".to_string()));
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), DriverError> {
        let alive = self.check_alive();
        if alive.is_err() {
            self.script.failed_pings.fetch_add(1, Ordering::SeqCst);
        }
        alive
    }

    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        self.check_alive()?;

        let crashed = self
            .script
            .crashes_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if crashed {
            self.dead.store(true, Ordering::SeqCst);
            return Err(DriverError::ContextClosed("target window already closed".to_string()));
        }

        if self.script.failing_urls.lock().unwrap().contains(url) {
            return Err(DriverError::Navigation {
                url: url.to_string(),
                reason: "net::ERR_CONNECTION_REFUSED".to_string(),
            });
        }

        *self.url.lock().unwrap() = url.to_string();
        Ok(())
    }

    async fn page_source(&self) -> Result<String, DriverError> {
        self.check_alive()?;
        let url = self.url.lock().unwrap().clone();
        Ok(format!(
            "<html><head><title>Page {url}</title></head>\
             <body><h1>Legacy</h1><a href=\"/next\">next</a></body></html>"
        ))
    }

    async fn title(&self) -> Result<String, DriverError> {
        self.check_alive()?;
        Ok(format!("Page {}", self.url.lock().unwrap()))
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        self.check_alive()?;
        Ok(self.url.lock().unwrap().clone())
    }

    async fn close(&self) -> Result<(), DriverError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.script.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
