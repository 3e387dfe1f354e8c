//! Configuration builder for tests.
//!
//! Defaults are tuned for fast tests: short poll and backoff intervals and a
//! short request timeout.

use uprelay_config::AppConfig;

/// Fluent builder for [`AppConfig`] in tests.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .server_url(&server.url)
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        let mut config = AppConfig::default();
        config.server.poll_interval_ms = 100;
        config.distributor.request_timeout_ms = 2_000;
        config.listener.idle_poll_ms = 100;
        config.listener.backoff_initial_ms = 50;
        config.listener.backoff_max_ms = 500;
        Self { config }
    }

    pub fn record_ttl_secs(mut self, secs: u64) -> Self {
        self.config.server.record_ttl_secs = secs;
        self
    }

    /// Point the distributor at a push server.
    pub fn server_url(mut self, url: &str) -> Self {
        self.config.distributor.server_url = url.to_string();
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
