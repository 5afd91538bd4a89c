use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thirtyfour::prelude::*;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::browser::session::EngineKind;
use crate::error::DriverError;

/// Error message fragments WebDriver servers use when the session or window is gone
const DEAD_CONTEXT_MARKERS: &[&str] = &[
    "invalid session id",
    "no such session",
    "session deleted",
    "no such window",
    "target window already closed",
    "chrome not reachable",
    "not connected to devtools",
    "disconnected",
];

/// Launches browser contexts. Implemented over WebDriver in production.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Open a fresh, isolated browser context
    async fn open_context(
        &self,
        engine: EngineKind,
        headless: bool,
    ) -> Result<Arc<dyn BrowserContext>, DriverError>;

    /// Release any engine-level resources held by the driver
    async fn shutdown(&self) -> Result<(), DriverError>;
}

/// One live browser context with a single page
#[async_trait]
pub trait BrowserContext: Send + Sync {
    /// Prepare the page inside the context
    async fn open_page(&self) -> Result<(), DriverError>;

    /// Cheap no-op round trip used to detect a dead context
    async fn ping(&self) -> Result<(), DriverError>;

    async fn navigate(&self, url: &str) -> Result<(), DriverError>;

    async fn page_source(&self) -> Result<String, DriverError>;

    async fn title(&self) -> Result<String, DriverError>;

    async fn current_url(&self) -> Result<String, DriverError>;

    /// Close the context. Must be safe to call more than once.
    async fn close(&self) -> Result<(), DriverError>;
}

/// Borrowed view of a session's page, valid for the duration of one task
#[derive(Clone)]
pub struct PageHandle {
    session_id: String,
    url: String,
    context: Arc<dyn BrowserContext>,
}

impl PageHandle {
    pub(crate) fn new(session_id: String, url: String, context: Arc<dyn BrowserContext>) -> Self {
        Self {
            session_id,
            url,
            context,
        }
    }

    /// Id of the session this page belongs to
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// URL the page was navigated to
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Get the rendered page source
    pub async fn source(&self) -> Result<String, DriverError> {
        self.context.page_source().await
    }

    /// Get the page title
    pub async fn title(&self) -> Result<String, DriverError> {
        self.context.title().await
    }

    /// Get the URL after redirects
    pub async fn current_url(&self) -> Result<String, DriverError> {
        self.context.current_url().await
    }
}

impl fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageHandle")
            .field("session_id", &self.session_id)
            .field("url", &self.url)
            .finish()
    }
}

/// Map a WebDriver error onto the pool's crash/non-crash taxonomy
fn classify(err: WebDriverError) -> DriverError {
    let message = err.to_string();
    let lowered = message.to_lowercase();
    if DEAD_CONTEXT_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        DriverError::ContextClosed(message)
    } else {
        DriverError::Command(message)
    }
}

fn launch_error(err: WebDriverError) -> DriverError {
    DriverError::Launch(err.to_string())
}

/// Driver backed by a WebDriver server (chromedriver, geckodriver, Selenium)
pub struct WebDriverDriver {
    server_url: String,
    page_load_timeout: Duration,
}

impl WebDriverDriver {
    pub fn new(server_url: impl Into<String>, page_load_timeout: Duration) -> Self {
        Self {
            server_url: server_url.into(),
            page_load_timeout,
        }
    }
}

#[async_trait]
impl BrowserDriver for WebDriverDriver {
    async fn open_context(
        &self,
        engine: EngineKind,
        headless: bool,
    ) -> Result<Arc<dyn BrowserContext>, DriverError> {
        let driver = match engine {
            EngineKind::Chrome => {
                let mut caps = DesiredCapabilities::chrome();
                if headless {
                    caps.set_headless().map_err(launch_error)?;
                }
                caps.add_chrome_arg("--disable-dev-shm-usage")
                    .map_err(launch_error)?;
                caps.add_chrome_arg("--no-first-run")
                    .map_err(launch_error)?;
                WebDriver::new(self.server_url.as_str(), caps).await
            }
            EngineKind::Firefox => {
                let mut caps = DesiredCapabilities::firefox();
                if headless {
                    caps.set_headless().map_err(launch_error)?;
                }
                WebDriver::new(self.server_url.as_str(), caps).await
            }
        }
        .map_err(launch_error)?;

        driver
            .set_page_load_timeout(self.page_load_timeout)
            .await
            .map_err(launch_error)?;

        debug!("Opened {} context via {}", engine, self.server_url);

        Ok(Arc::new(WebDriverContext {
            driver: Mutex::new(Some(driver)),
        }))
    }

    async fn shutdown(&self) -> Result<(), DriverError> {
        // Each WebDriver session owns its own browser process; closing the
        // contexts is what releases the engines.
        debug!("WebDriver driver shut down");
        Ok(())
    }
}

/// One WebDriver session
struct WebDriverContext {
    driver: Mutex<Option<WebDriver>>,
}

macro_rules! with_driver {
    ($self:ident, $driver:ident => $body:expr) => {{
        let guard = $self.driver.lock().await;
        let $driver = guard
            .as_ref()
            .ok_or_else(|| DriverError::ContextClosed("session already closed".to_string()))?;
        $body
    }};
}

#[async_trait]
impl BrowserContext for WebDriverContext {
    async fn open_page(&self) -> Result<(), DriverError> {
        with_driver!(self, driver => driver.goto("about:blank").await.map_err(classify))
    }

    async fn ping(&self) -> Result<(), DriverError> {
        with_driver!(self, driver => driver.title().await.map(|_| ()).map_err(classify))
    }

    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        with_driver!(self, driver => {
            debug!("Navigating to: {}", url);
            driver.goto(url).await.map_err(|e| match classify(e) {
                DriverError::Command(reason) => DriverError::Navigation {
                    url: url.to_string(),
                    reason,
                },
                closed => closed,
            })
        })
    }

    async fn page_source(&self) -> Result<String, DriverError> {
        with_driver!(self, driver => driver.source().await.map_err(classify))
    }

    async fn title(&self) -> Result<String, DriverError> {
        with_driver!(self, driver => driver.title().await.map_err(classify))
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        with_driver!(self, driver => driver.current_url().await.map(|u| u.to_string()).map_err(classify))
    }

    async fn close(&self) -> Result<(), DriverError> {
        if let Some(driver) = self.driver.lock().await.take() {
            driver.quit().await.map_err(classify)?;
            debug!("Browser session closed");
        }
        Ok(())
    }
}

impl Drop for WebDriverContext {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().take() {
            // Last-resort cleanup when a context is dropped without close()
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = driver.quit().await {
                        error!("Error closing browser session during drop: {}", e);
                    }
                });
            }
        }
    }
}
