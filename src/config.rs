//! Server configuration (§6 "Configuration (enumerated)"). Follows the
//! teacher's `ClientBuilder`/`ServerBuilder` shape in `lib.rs`: a plain
//! struct with consuming, chainable setters and a `Default` impl, rather
//! than a file or environment-variable format.

/// Every knob the core cares about. Constructed programmatically;
/// loading these from a file or environment is left to the binary
/// embedding this crate.
#[derive(Debug, Clone)]
pub struct Config {
    pub address: String,
    pub port: u16,
    pub unix_path: Option<String>,

    pub buffer_size: usize,
    pub max_size: usize,
    pub max_headers: usize,

    pub handshake_max_size: usize,
    pub handshake_pool_count: usize,
    pub handshake_timeout_ms: Option<u64>,

    pub large_buffer_pool_count: usize,
    pub large_buffer_size: usize,

    pub handle_ping: bool,
    pub handle_pong: bool,
    pub handle_close: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            address: "127.0.0.1".to_string(),
            port: 9223,
            unix_path: None,
            buffer_size: 4096,
            max_size: 65536,
            max_headers: 32,
            handshake_max_size: 1024,
            handshake_pool_count: 50,
            handshake_timeout_ms: Some(10_000),
            large_buffer_pool_count: 32,
            large_buffer_size: 32768,
            handle_ping: false,
            handle_pong: false,
            handle_close: false,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Bind a Unix domain socket instead of TCP. Mutually exclusive with
    /// `address`/`port` at bind time; `TCP_NODELAY` does not apply.
    pub fn unix_path(mut self, path: impl Into<String>) -> Self {
        self.unix_path = Some(path.into());
        self
    }

    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn max_headers(mut self, max_headers: usize) -> Self {
        self.max_headers = max_headers;
        self
    }

    pub fn handshake_max_size(mut self, handshake_max_size: usize) -> Self {
        self.handshake_max_size = handshake_max_size;
        self
    }

    pub fn handshake_pool_count(mut self, handshake_pool_count: usize) -> Self {
        self.handshake_pool_count = handshake_pool_count;
        self
    }

    pub fn handshake_timeout_ms(mut self, timeout: Option<u64>) -> Self {
        self.handshake_timeout_ms = timeout;
        self
    }

    pub fn large_buffer_pool_count(mut self, count: usize) -> Self {
        self.large_buffer_pool_count = count;
        self
    }

    pub fn large_buffer_size(mut self, size: usize) -> Self {
        self.large_buffer_size = size;
        self
    }

    pub fn handle_ping(mut self, yes: bool) -> Self {
        self.handle_ping = yes;
        self
    }

    pub fn handle_pong(mut self, yes: bool) -> Self {
        self.handle_pong = yes;
        self
    }

    pub fn handle_close(mut self, yes: bool) -> Self {
        self.handle_close = yes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.port, 9223);
        assert_eq!(cfg.address, "127.0.0.1");
        assert_eq!(cfg.buffer_size, 4096);
        assert_eq!(cfg.max_size, 65536);
        assert_eq!(cfg.handshake_max_size, 1024);
        assert_eq!(cfg.handshake_pool_count, 50);
        assert_eq!(cfg.handshake_timeout_ms, Some(10_000));
        assert_eq!(cfg.large_buffer_pool_count, 32);
        assert_eq!(cfg.large_buffer_size, 32768);
        assert!(!cfg.handle_ping && !cfg.handle_pong && !cfg.handle_close);
    }

    #[test]
    fn builder_chains() {
        let cfg = Config::new()
            .port(8080)
            .buffer_size(8192)
            .handle_ping(true);
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.buffer_size, 8192);
        assert!(cfg.handle_ping);
    }
}
