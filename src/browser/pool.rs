use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::browser::driver::{BrowserContext, BrowserDriver, PageHandle};
use crate::browser::session::{BrowserSession, EngineKind, SessionStatus};
use crate::error::{DriverError, PoolError};

/// Point-in-time pool statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolMetrics {
    pub active_sessions: usize,
    pub max_concurrent: usize,
    pub available_slots: usize,
    pub total_pages_loaded: u64,
    pub total_crashes: u64,
}

/// A session together with the live context backing it
struct PooledSession {
    session: BrowserSession,
    headless: bool,
    context: Arc<dyn BrowserContext>,
}

#[derive(Default)]
struct PoolState {
    sessions: HashMap<String, PooledSession>,
}

/// A slot claimed while a context is being opened.
///
/// Claimed under the state lock; released on drop so a cancelled
/// creation or recovery never keeps the slot.
struct SlotReservation<'a>(&'a AtomicUsize);

impl<'a> SlotReservation<'a> {
    fn claim(reserved: &'a AtomicUsize) -> Self {
        reserved.fetch_add(1, Ordering::SeqCst);
        Self(reserved)
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Owns every browser session and enforces the concurrency ceiling.
///
/// Admission control is strict: when `max_concurrent_sessions` sessions are
/// live (or being opened), `create_session` fails with
/// [`PoolError::SessionLimitExceeded`] instead of waiting.
pub struct BrowserSessionPool {
    driver: Arc<dyn BrowserDriver>,
    max_concurrent: usize,
    state: Mutex<PoolState>,
    /// Slots claimed by creations or recoveries whose driver I/O is in flight
    reserved: AtomicUsize,
    total_pages_loaded: AtomicU64,
    total_crashes: AtomicU64,
    shut_down: AtomicBool,
}

impl BrowserSessionPool {
    /// Create a new pool on top of a browser driver
    pub fn new(driver: Arc<dyn BrowserDriver>, max_concurrent_sessions: usize) -> Self {
        Self {
            driver,
            max_concurrent: max_concurrent_sessions.max(1),
            state: Mutex::new(PoolState::default()),
            reserved: AtomicUsize::new(0),
            total_pages_loaded: AtomicU64::new(0),
            total_crashes: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    fn occupied(&self, state: &PoolState) -> usize {
        state.sessions.len() + self.reserved.load(Ordering::SeqCst)
    }

    /// Open a new session under `key`
    pub async fn create_session(
        &self,
        key: &str,
        engine: EngineKind,
        headless: bool,
    ) -> Result<BrowserSession, PoolError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(PoolError::ShutDown);
        }

        let reservation = {
            let state = self.state.lock().await;
            if state.sessions.contains_key(key) {
                return Err(PoolError::DuplicateKey(key.to_string()));
            }
            if self.occupied(&state) >= self.max_concurrent {
                debug!(
                    "Rejecting session '{}': {}/{} slots in use",
                    key,
                    self.occupied(&state),
                    self.max_concurrent
                );
                return Err(PoolError::SessionLimitExceeded {
                    max: self.max_concurrent,
                });
            }
            SlotReservation::claim(&self.reserved)
        };

        let opened = self.open_context(engine, headless).await;

        let mut state = self.state.lock().await;
        drop(reservation);
        let context = opened?;

        if state.sessions.contains_key(key) {
            drop(state);
            Self::close_quietly(key, &context).await;
            return Err(PoolError::DuplicateKey(key.to_string()));
        }

        let session = BrowserSession::new(engine);
        debug!("Created session {} under key '{}'", session.id, key);
        state.sessions.insert(
            key.to_string(),
            PooledSession {
                session: session.clone(),
                headless,
                context,
            },
        );

        Ok(session)
    }

    /// Look up the session registered under `key`
    pub async fn get_session(&self, key: &str) -> Option<BrowserSession> {
        let state = self.state.lock().await;
        state.sessions.get(key).map(|entry| entry.session.clone())
    }

    /// Navigate the session under `key` to `url`.
    ///
    /// A dead context is closed and recreated under the same key and the
    /// navigation retried exactly once; the returned handle then carries the
    /// new session id.
    pub async fn navigate_page(&self, key: &str, url: &str) -> Result<PageHandle, PoolError> {
        let (session_id, context) = self.lookup(key).await?;

        match self.timed_navigation(key, &session_id, &context, url).await {
            Ok(()) => Ok(PageHandle::new(session_id, url.to_string(), context)),
            Err(e) if e.is_context_closed() => {
                warn!("Session {} under '{}' crashed: {}. Recreating", session_id, key, e);
                let (new_id, new_context) = self.recreate(key, &session_id).await?;
                self.timed_navigation(key, &new_id, &new_context, url)
                    .await
                    .map_err(PoolError::Driver)?;
                info!("Recovered session '{}' ({} -> {})", key, session_id, new_id);
                Ok(PageHandle::new(new_id, url.to_string(), new_context))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Close and forget the session under `key`
    pub async fn close_session(&self, key: &str) -> Result<(), PoolError> {
        let entry = {
            let mut state = self.state.lock().await;
            state.sessions.remove(key)
        }
        .ok_or_else(|| PoolError::SessionNotFound(key.to_string()))?;

        let mut session = entry.session;
        Self::close_quietly(key, &entry.context).await;
        session.status = SessionStatus::Closed;
        debug!(
            "Closed session {} under '{}' after {} page(s)",
            session.id, key, session.pages_loaded
        );

        Ok(())
    }

    /// Close every live session and release the driver
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        self.shut_down.store(true, Ordering::SeqCst);

        let entries: Vec<(String, PooledSession)> = {
            let mut state = self.state.lock().await;
            state.sessions.drain().collect()
        };

        info!("Shutting down browser pool ({} live session(s))", entries.len());

        futures::future::join_all(
            entries
                .iter()
                .map(|(key, entry)| Self::close_quietly(key, &entry.context)),
        )
        .await;

        self.driver.shutdown().await?;

        Ok(())
    }

    pub async fn get_metrics(&self) -> PoolMetrics {
        let state = self.state.lock().await;
        let active_sessions = state.sessions.len();

        PoolMetrics {
            active_sessions,
            max_concurrent: self.max_concurrent,
            available_slots: self.max_concurrent.saturating_sub(self.occupied(&state)),
            total_pages_loaded: self.total_pages_loaded.load(Ordering::Relaxed),
            total_crashes: self.total_crashes.load(Ordering::Relaxed),
        }
    }

    async fn lookup(&self, key: &str) -> Result<(String, Arc<dyn BrowserContext>), PoolError> {
        let state = self.state.lock().await;
        state
            .sessions
            .get(key)
            .map(|entry| (entry.session.id.clone(), Arc::clone(&entry.context)))
            .ok_or_else(|| PoolError::SessionNotFound(key.to_string()))
    }

    /// Open a context and its page, closing the context if the page fails
    async fn open_context(
        &self,
        engine: EngineKind,
        headless: bool,
    ) -> Result<Arc<dyn BrowserContext>, DriverError> {
        let context = self.driver.open_context(engine, headless).await?;

        if let Err(e) = context.open_page().await {
            warn!("Failed to open page, closing context: {}", e);
            if let Err(close_err) = context.close().await {
                warn!("Error closing half-open context: {}", close_err);
            }
            return Err(e);
        }

        Ok(context)
    }

    /// Ping, navigate, and record load metrics on success
    async fn timed_navigation(
        &self,
        key: &str,
        session_id: &str,
        context: &Arc<dyn BrowserContext>,
        url: &str,
    ) -> Result<(), DriverError> {
        context.ping().await?;

        let started = Instant::now();
        context.navigate(url).await?;
        let elapsed = started.elapsed();

        self.total_pages_loaded.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().await;
        if let Some(entry) = state.sessions.get_mut(key) {
            if entry.session.id == session_id {
                entry.session.record_load(elapsed);
            }
        }

        Ok(())
    }

    /// Replace the crashed session under `key` with a fresh one
    async fn recreate(
        &self,
        key: &str,
        crashed_id: &str,
    ) -> Result<(String, Arc<dyn BrowserContext>), PoolError> {
        let (stale, reservation) = {
            let mut state = self.state.lock().await;
            match state.sessions.get(key) {
                Some(entry) if entry.session.id == crashed_id => {}
                _ => return Err(PoolError::SessionNotFound(key.to_string())),
            }
            // Keep the slot claimed while the replacement is opened
            let reservation = SlotReservation::claim(&self.reserved);
            (state.sessions.remove(key), reservation)
        };

        let Some(mut stale) = stale else {
            return Err(PoolError::SessionNotFound(key.to_string()));
        };
        stale.session.mark_crashed();
        self.total_crashes.fetch_add(1, Ordering::Relaxed);
        Self::close_quietly(key, &stale.context).await;

        let opened = self
            .open_context(stale.session.engine_kind, stale.headless)
            .await;

        let mut state = self.state.lock().await;
        drop(reservation);
        let context = opened?;

        let mut session = BrowserSession::new(stale.session.engine_kind);
        session.crash_count = stale.session.crash_count;
        let id = session.id.clone();
        state.sessions.insert(
            key.to_string(),
            PooledSession {
                session,
                headless: stale.headless,
                context: Arc::clone(&context),
            },
        );

        Ok((id, context))
    }

    async fn close_quietly(key: &str, context: &Arc<dyn BrowserContext>) {
        if let Err(e) = context.close().await {
            warn!("Error closing browser context for '{}': {}", key, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::FakeDriver;
    use std::time::Duration;

    fn pool_with(driver: &FakeDriver, max: usize) -> BrowserSessionPool {
        BrowserSessionPool::new(Arc::new(driver.clone()), max)
    }

    #[tokio::test]
    async fn test_session_limit_exceeded() {
        let driver = FakeDriver::new();
        let pool = pool_with(&driver, 2);

        pool.create_session("a", EngineKind::Chrome, true).await.unwrap();
        pool.create_session("b", EngineKind::Chrome, true).await.unwrap();

        let err = pool
            .create_session("c", EngineKind::Chrome, true)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::SessionLimitExceeded { max: 2 }));

        // Freeing capacity lets the caller retry
        pool.close_session("a").await.unwrap();
        pool.create_session("c", EngineKind::Chrome, true).await.unwrap();
        assert_eq!(pool.get_metrics().await.active_sessions, 2);
    }

    #[tokio::test]
    async fn test_ceiling_holds_under_concurrent_requests() {
        let driver = FakeDriver::new();
        driver.set_open_delay_ms(20);
        let pool = Arc::new(pool_with(&driver, 3));

        let attempts = (0..10).map(|i| {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.create_session(&format!("key-{}", i), EngineKind::Chrome, true)
                    .await
            })
        });
        let results = futures::future::join_all(attempts).await;

        let ok = results.iter().filter(|r| matches!(r, Ok(Ok(_)))).count();
        let limited = results
            .iter()
            .filter(|r| matches!(r, Ok(Err(PoolError::SessionLimitExceeded { .. }))))
            .count();

        assert_eq!(ok, 3);
        assert_eq!(limited, 7);
        assert_eq!(driver.opened(), 3);
        assert_eq!(pool.get_metrics().await.available_slots, 0);
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected() {
        let driver = FakeDriver::new();
        let pool = pool_with(&driver, 3);

        pool.create_session("a", EngineKind::Chrome, true).await.unwrap();
        let err = pool
            .create_session("a", EngineKind::Chrome, true)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::DuplicateKey(_)));
    }

    #[tokio::test]
    async fn test_crash_recovery_recreates_once() {
        let driver = FakeDriver::new();
        driver.crash_next_navigations(1);
        let pool = pool_with(&driver, 1);

        let original = pool.create_session("page", EngineKind::Chrome, true).await.unwrap();
        let handle = pool
            .navigate_page("page", "https://legacy.example.com/")
            .await
            .unwrap();

        assert_ne!(handle.session_id(), original.id);
        assert_eq!(driver.opened(), 2);
        assert_eq!(driver.closed(), 1);

        let current = pool.get_session("page").await.unwrap();
        assert_eq!(current.id, handle.session_id());
        assert_eq!(current.crash_count, 1);
        assert_eq!(current.pages_loaded, 1);

        let metrics = pool.get_metrics().await;
        assert_eq!(metrics.total_crashes, 1);
        assert_eq!(metrics.total_pages_loaded, 1);
        assert_eq!(metrics.active_sessions, 1);
    }

    #[tokio::test]
    async fn test_dead_context_detected_before_navigation() {
        let driver = FakeDriver::new();
        let pool = pool_with(&driver, 1);

        let original = pool.create_session("page", EngineKind::Chrome, true).await.unwrap();
        // The browser dies while the session sits idle
        driver.kill_open_contexts();

        let handle = pool
            .navigate_page("page", "https://legacy.example.com/menu.asp")
            .await
            .unwrap();

        assert_eq!(driver.failed_pings(), 1);
        assert_ne!(handle.session_id(), original.id);
        assert_eq!(driver.opened(), 2);
        assert_eq!(driver.closed(), 1);

        let metrics = pool.get_metrics().await;
        assert_eq!(metrics.total_crashes, 1);
        assert_eq!(metrics.active_sessions, 1);
        assert_eq!(pool.get_session("page").await.unwrap().crash_count, 1);
    }

    #[tokio::test]
    async fn test_cancelled_creation_releases_slot() {
        let driver = FakeDriver::new();
        driver.set_open_delay_ms(200);
        let pool = pool_with(&driver, 1);

        let attempt = tokio::time::timeout(
            Duration::from_millis(10),
            pool.create_session("slow", EngineKind::Chrome, true),
        )
        .await;
        assert!(attempt.is_err());

        let metrics = pool.get_metrics().await;
        assert_eq!(metrics.available_slots, 1);
        assert_eq!(metrics.active_sessions, 0);

        driver.set_open_delay_ms(0);
        pool.create_session("fast", EngineKind::Chrome, true).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_recovery_propagates() {
        let driver = FakeDriver::new();
        driver.crash_next_navigations(2);
        let pool = pool_with(&driver, 1);

        pool.create_session("page", EngineKind::Chrome, true).await.unwrap();
        let err = pool
            .navigate_page("page", "https://legacy.example.com/")
            .await
            .unwrap_err();

        assert!(matches!(err, PoolError::Driver(DriverError::ContextClosed(_))));
        // Exactly one recovery attempt
        assert_eq!(driver.opened(), 2);
    }

    #[tokio::test]
    async fn test_navigation_error_is_not_recovered() {
        let driver = FakeDriver::new();
        driver.fail_url("https://legacy.example.com/broken");
        let pool = pool_with(&driver, 1);

        pool.create_session("page", EngineKind::Chrome, true).await.unwrap();
        let err = pool
            .navigate_page("page", "https://legacy.example.com/broken")
            .await
            .unwrap_err();

        assert!(matches!(err, PoolError::Driver(DriverError::Navigation { .. })));
        assert_eq!(driver.opened(), 1);
    }

    #[tokio::test]
    async fn test_page_open_failure_closes_context() {
        let driver = FakeDriver::new();
        driver.fail_open_page(true);
        let pool = pool_with(&driver, 1);

        let err = pool
            .create_session("page", EngineKind::Chrome, true)
            .await
            .unwrap_err();

        assert!(matches!(err, PoolError::Driver(_)));
        assert_eq!(driver.opened(), 1);
        assert_eq!(driver.closed(), 1);

        // The reservation was released
        assert_eq!(pool.get_metrics().await.available_slots, 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let driver = FakeDriver::new();
        let pool = pool_with(&driver, 3);

        for key in ["a", "b", "c"] {
            pool.create_session(key, EngineKind::Firefox, true).await.unwrap();
        }
        pool.shutdown().await.unwrap();

        assert_eq!(driver.closed(), 3);
        assert!(driver.is_shut_down());
        assert_eq!(pool.get_metrics().await.active_sessions, 0);
        assert!(matches!(
            pool.create_session("d", EngineKind::Chrome, true).await,
            Err(PoolError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn test_close_unknown_session() {
        let driver = FakeDriver::new();
        let pool = pool_with(&driver, 1);

        assert!(matches!(
            pool.close_session("missing").await,
            Err(PoolError::SessionNotFound(_))
        ));
        assert!(pool.get_session("missing").await.is_none());
    }
}
