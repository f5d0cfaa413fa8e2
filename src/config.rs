use std::time::Duration;

use bon::Builder;

/// Configuration for the DDP client.
#[derive(Debug, Clone, Builder)]
pub struct ClientConfig {
    /// Answer server `ping` frames with `pong`.
    /// When disabled, pings are forwarded to the generic message consumers like any other frame.
    #[builder(default = true)]
    pub keep_alive: bool,

    /// How long after the last heartbeat the session still counts as alive.
    #[builder(default = Duration::from_secs(30))]
    pub liveness_window: Duration,

    /// Timeout for waiting on the transport to report open.
    #[builder(default = Duration::from_secs(30))]
    pub connect_timeout: Duration,

    /// Optional timeout applied when awaiting a correlated reply.
    /// If not set, waits last until the reply arrives or the session closes.
    pub call_timeout: Option<Duration>,

    /// Protocol version proposed in the `connect` handshake.
    #[builder(default = "1".to_string())]
    pub protocol_version: String,

    /// Protocol versions advertised as supported in the `connect` handshake.
    #[builder(default = vec!["1".to_string(), "pre1".to_string()])]
    pub supported_versions: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
