//! Runtime configuration.

use crate::proxy::ProxyConfig;
use crate::tenant::InvocationSecrets;
use std::io;
use std::time::Duration;

/// Default limit on request bodies.
pub const DEFAULT_MAX_BODY_BYTES: usize = 100 * 1024;

/// Configuration of a pad host process.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Secrets handed to every invocation.
    pub secrets: InvocationSecrets,
    /// Worker threads of the tokio runtime. `1` runs on the current thread.
    pub worker_threads: usize,
    /// Largest request body accepted over HTTP.
    pub max_body_bytes: usize,
    /// Reporting proxy settings.
    pub proxy: ProxyConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeConfig {
    /// Creates a new config with default values.
    pub fn new() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4000,
            secrets: InvocationSecrets::new("[]"),
            worker_threads: 1,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            proxy: ProxyConfig::new(),
        }
    }

    /// Sets the host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the `userContext` secrets payload.
    pub fn user_context(mut self, payload: impl Into<String>) -> Self {
        self.secrets.user_context = payload.into();
        self
    }

    /// Sets the platform URL of this function.
    pub fn platform_url(mut self, url: impl Into<String>) -> Self {
        self.secrets.url = Some(url.into());
        self
    }

    /// Sets the worker thread hint. Zero is treated as one.
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.max(1);
        self
    }

    /// Sets the request body limit.
    pub fn max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    /// Sets the proxy configuration.
    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = proxy;
        self
    }

    /// Sets the reporting endpoint of the proxy agent.
    pub fn reporting_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.proxy = self.proxy.reporting_endpoint(endpoint);
        self
    }

    /// Sets the report flush interval.
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.proxy = self.proxy.flush_interval(interval);
        self
    }

    /// Socket address string to bind.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Builds the tokio runtime for this process.
    pub fn build_runtime(&self) -> io::Result<tokio::runtime::Runtime> {
        if self.worker_threads <= 1 {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
        } else {
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(self.worker_threads)
                .enable_all()
                .build()
        }
    }
}
