use serde::{Deserialize, Serialize};

/// Top-level server configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WavecastConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// HTTP port (TLS termination belongs to a fronting proxy)
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Signaling transport limits, shared by client and relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Maximum WebSocket text frame size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Inbound messages allowed per connection per window
    #[serde(default = "default_rate_limit_messages")]
    pub rate_limit_messages: usize,
    /// Rate limit window in seconds
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
}

/// ICE/TURN server configuration for WebRTC NAT traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN server URLs (default: Google's public STUN servers)
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    /// TURN server URLs (e.g., "turn:turn.example.com:3478")
    #[serde(default)]
    pub turn_urls: Vec<String>,
    /// TURN username (long-term credential mechanism)
    pub turn_username: Option<String>,
    /// TURN credential/password
    pub turn_credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Chat messages retained per stream (sliding window)
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Messages replayed to a participant on join
    #[serde(default = "default_replay_limit")]
    pub replay_limit: usize,
}

/// Client-side configuration: where the signaling relay lives plus the
/// shared transport/ICE/chat knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Relay base URL, e.g. "wss://stream.example.com" or "ws://127.0.0.1:8787"
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            rate_limit_messages: default_rate_limit_messages(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            replay_limit: default_replay_limit(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            signaling: SignalingConfig::default(),
            ice: IceConfig::default(),
            chat: ChatConfig::default(),
        }
    }
}

impl WavecastConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, server should not start) or
    /// "WARNING:" (advisory, server can start but the config is likely wrong).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push("ERROR: server.port must be between 1 and 65535, got 0.".to_string());
        }

        if self.signaling.max_message_size < 1024 {
            issues.push(format!(
                "ERROR: signaling.max_message_size must be at least 1024 bytes \
                 (SDP offers alone run into kilobytes), got {}.",
                self.signaling.max_message_size
            ));
        }

        if self.signaling.rate_limit_messages == 0 {
            issues.push(
                "ERROR: signaling.rate_limit_messages must be >= 1, \
                 a zero limit rejects every message."
                    .to_string(),
            );
        }
        if self.signaling.rate_limit_window_secs == 0 {
            issues.push("ERROR: signaling.rate_limit_window_secs must be >= 1.".to_string());
        }

        if self.chat.history_limit == 0 {
            issues.push("ERROR: chat.history_limit must be >= 1.".to_string());
        }
        if self.chat.replay_limit > self.chat.history_limit {
            issues.push(format!(
                "WARNING: chat.replay_limit ({}) exceeds chat.history_limit ({}); \
                 at most the retained history can be replayed.",
                self.chat.replay_limit, self.chat.history_limit
            ));
        }

        for url in &self.ice.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{}' must start with 'stun:' or 'stuns:'. \
                     Example: stun:stun.l.google.com:19302",
                    url
                ));
            }
        }
        for url in &self.ice.turn_urls {
            if !url.starts_with("turn:") && !url.starts_with("turns:") {
                issues.push(format!(
                    "ERROR: TURN URL '{}' must start with 'turn:' or 'turns:'.",
                    url
                ));
            }
        }
        if !self.ice.turn_urls.is_empty()
            && (self.ice.turn_username.is_none() || self.ice.turn_credential.is_none())
        {
            issues.push(
                "WARNING: TURN servers configured without turn_username/turn_credential; \
                 most TURN deployments require long-term credentials."
                    .to_string(),
            );
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8787
}

fn default_server_url() -> String {
    "ws://127.0.0.1:8787".to_string()
}

fn default_max_message_size() -> usize {
    65_536
}

fn default_rate_limit_messages() -> usize {
    30
}

fn default_rate_limit_window_secs() -> u64 {
    60
}

fn default_stun_urls() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}

fn default_history_limit() -> usize {
    100
}

fn default_replay_limit() -> usize {
    50
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config: WavecastConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.port, 8787);
        assert_eq!(config.signaling.max_message_size, 65_536);
        assert_eq!(config.signaling.rate_limit_messages, 30);
        assert_eq!(config.signaling.rate_limit_window_secs, 60);
        assert_eq!(config.chat.history_limit, 100);
        assert_eq!(config.chat.replay_limit, 50);
        assert_eq!(config.ice.stun_urls.len(), 2);
        assert!(config.ice.turn_urls.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn client_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.server_url, "ws://127.0.0.1:8787");
        assert_eq!(config.chat.history_limit, 100);
    }

    #[test]
    fn validate_rejects_zero_port_and_bad_stun() {
        let config: WavecastConfig = toml::from_str(
            r#"
            [server]
            port = 0

            [ice]
            stun_urls = ["http://not-stun.example"]
            "#,
        )
        .unwrap();
        let issues = config.validate().unwrap_err();
        assert_eq!(issues.iter().filter(|i| i.starts_with("ERROR:")).count(), 2);
    }

    #[test]
    fn validate_warns_on_turn_without_credentials() {
        let config: WavecastConfig = toml::from_str(
            r#"
            [ice]
            turn_urls = ["turn:turn.example.com:3478"]
            "#,
        )
        .unwrap();
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.starts_with("WARNING:")));
    }
}
