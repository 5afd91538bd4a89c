pub mod driver;
pub mod pool;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

// Re-export common types
pub use driver::{BrowserContext, BrowserDriver, PageHandle, WebDriverDriver};
pub use pool::{BrowserSessionPool, PoolMetrics};
pub use session::{BrowserSession, EngineKind, SessionStatus};
