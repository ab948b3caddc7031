use serde::{Deserialize, Serialize};

/// Top-level engine configuration, mirroring the ini groups the operator
/// edits: `[local]`, `[remote]`, `[signal_server]`, `[ice_server]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub local: LocalConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub signal_server: SignalServerConfig,
    #[serde(default)]
    pub ice_server: IceServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Plain access password; the MD5 digest is derived at startup. Empty or
    /// malformed values are replaced with a generated UUID.
    #[serde(default)]
    pub local_pwd: String,
    /// Parsed for compatibility with the desktop build; this engine is
    /// headless either way.
    #[serde(rename = "showUI", default = "default_true")]
    pub show_ui: bool,
    #[serde(rename = "logLevel", default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Default capture framerate; clamped to [1, 60].
    #[serde(default = "default_fps")]
    pub fps: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalServerConfig {
    /// Base signaling URL; the engine appends `?sessionId=..&hostname=..`.
    #[serde(rename = "wsUrl", default)]
    pub ws_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_ice_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            local_pwd: String::new(),
            show_ui: true,
            log_level: default_log_level(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self { fps: default_fps() }
    }
}

impl Default for IceServerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_ice_port(),
            username: String::new(),
            password: String::new(),
        }
    }
}

impl RemoteConfig {
    pub fn clamped_fps(&self) -> u32 {
        self.fps.clamp(1, 60)
    }
}

impl LocalConfig {
    /// Map the configured level name onto a tracing filter directive.
    /// `critical` has no tracing equivalent and maps to `error`.
    pub fn log_filter(&self) -> &'static str {
        match self.log_level.as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "warn" => "warn",
            "error" | "critical" => "error",
            _ => "info",
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_fps() -> u32 {
    15
}
fn default_ice_port() -> u16 {
    3478
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.remote.fps, 15);
        assert!(config.local.show_ui);
        assert_eq!(config.local.log_level, "info");
        assert_eq!(config.ice_server.port, 3478);
        assert!(config.signal_server.ws_url.is_empty());
    }

    #[test]
    fn config_parses_ini_style_keys() {
        let config: EngineConfig = toml::from_str(
            r#"
            [local]
            local_pwd = "s3cret"
            showUI = false
            logLevel = "debug"

            [remote]
            fps = 30

            [signal_server]
            wsUrl = "wss://hub.example.com/ws"

            [ice_server]
            host = "turn.example.com"
            port = 3479
            username = "turnuser"
            password = "turnpass"
            "#,
        )
        .unwrap();
        assert_eq!(config.local.local_pwd, "s3cret");
        assert!(!config.local.show_ui);
        assert_eq!(config.local.log_filter(), "debug");
        assert_eq!(config.remote.fps, 30);
        assert_eq!(config.signal_server.ws_url, "wss://hub.example.com/ws");
        assert_eq!(config.ice_server.host, "turn.example.com");
        assert_eq!(config.ice_server.port, 3479);
    }

    #[test]
    fn fps_is_clamped() {
        let config: EngineConfig = toml::from_str("[remote]\nfps = 0\n").unwrap();
        assert_eq!(config.remote.clamped_fps(), 1);
        let config: EngineConfig = toml::from_str("[remote]\nfps = 240\n").unwrap();
        assert_eq!(config.remote.clamped_fps(), 60);
    }

    #[test]
    fn critical_maps_to_error() {
        let config: EngineConfig = toml::from_str("[local]\nlogLevel = \"critical\"\n").unwrap();
        assert_eq!(config.local.log_filter(), "error");
    }
}
