use std::time::Duration;

/// Environment variable read by [`ClientConfig::from_env`].
pub const SERVER_ADDRESS_ENV: &str = "COMFYUI_SERVER_ADDRESS";

/// Default ComfyUI listen address.
pub const DEFAULT_SERVER_ADDRESS: &str = "127.0.0.1:8188";

/// Connection and timing settings for a ComfyUI server.
///
/// Use [`ClientConfig::builder()`] for ergonomic construction, or
/// [`ClientConfig::new`] with just a `host:port`.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the ComfyUI server, without scheme.
    pub server_address: String,

    /// Use `https`/`wss` instead of `http`/`ws`.
    pub use_tls: bool,

    /// Upper bound on the wait for the completion message.
    pub completion_timeout: Duration,

    /// Per-request timeout for HTTP calls.
    pub request_timeout: Duration,

    /// Also fetch preview images from ComfyUI's `temp` folder.
    pub include_previews: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: DEFAULT_SERVER_ADDRESS.to_string(),
            use_tls: false,
            completion_timeout: Duration::from_secs(300),
            request_timeout: Duration::from_secs(30),
            include_previews: false,
        }
    }
}

impl ClientConfig {
    /// Defaults pointed at `server_address`. A leading scheme or trailing
    /// slash is stripped.
    pub fn new(server_address: impl Into<String>) -> Self {
        Self::builder().with_server_address(server_address).build()
    }

    /// Start building a config with the builder pattern.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Defaults, with the address taken from `COMFYUI_SERVER_ADDRESS` when set.
    pub fn from_env() -> Self {
        match std::env::var(SERVER_ADDRESS_ENV) {
            Ok(addr) if !addr.trim().is_empty() => Self::new(addr.trim()),
            _ => Self::default(),
        }
    }

    /// Base URL for HTTP endpoints, e.g. `http://127.0.0.1:8188`.
    pub fn http_base(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{}://{}", scheme, self.server_address)
    }

    /// Base URL for the WebSocket endpoint, e.g. `ws://127.0.0.1:8188`.
    pub fn ws_base(&self) -> String {
        let scheme = if self.use_tls { "wss" } else { "ws" };
        format!("{}://{}", scheme, self.server_address)
    }
}

fn normalize(address: String) -> String {
    let trimmed = address.trim();
    let without_scheme = ["http://", "https://", "ws://", "wss://"]
        .iter()
        .find_map(|scheme| trimmed.strip_prefix(scheme))
        .unwrap_or(trimmed);
    without_scheme.trim_end_matches('/').to_string()
}

/// Builder for [`ClientConfig`].
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Set the `host:port` of the server. `https://` and `wss://` prefixes
    /// switch TLS on.
    pub fn with_server_address(mut self, address: impl Into<String>) -> Self {
        let address = address.into();
        let lowered = address.trim().to_ascii_lowercase();
        if lowered.starts_with("https://") || lowered.starts_with("wss://") {
            self.config.use_tls = true;
        }
        self.config.server_address = normalize(address);
        self
    }

    pub fn with_tls(mut self, use_tls: bool) -> Self {
        self.config.use_tls = use_tls;
        self
    }

    /// Set how long to wait for the completion message before giving up.
    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.config.completion_timeout = timeout;
        self
    }

    /// Set the per-request HTTP timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Fetch `temp` preview images in addition to saved outputs.
    pub fn with_previews(mut self, include: bool) -> Self {
        self.config.include_previews = include;
        self
    }

    /// Build the final [`ClientConfig`].
    pub fn build(self) -> ClientConfig {
        self.config
    }
}
