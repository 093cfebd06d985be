//! Client configuration.

use std::time::Duration;

use serde::Deserialize;

/// Tunables for a [`BspClient`](crate::BspClient).
///
/// Every field has a default, so an empty TOML table is a valid config.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// `displayName` advertised in `build/initialize`.
    pub display_name: String,
    /// Client `version` advertised in `build/initialize`.
    pub version: String,
    /// Protocol version advertised in `build/initialize`.
    pub bsp_version: String,
    /// Language ids advertised as `capabilities.languageIds`.
    pub languages: Vec<String>,
    /// Deadline for awaited requests. Unset means wait until the response
    /// arrives or the connection closes.
    pub request_timeout_ms: Option<u64>,
    /// Frame `exit` as a notification instead of an id-carrying request.
    pub exit_as_notification: bool,
    /// Capacity of the engine's operation queue. Callers and the stdio
    /// listener wait here when it is full; outbound frames never do.
    pub command_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            display_name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            bsp_version: String::from("2.1.0"),
            languages: vec![String::from("scala"), String::from("java")],
            request_timeout_ms: None,
            exit_as_notification: false,
            command_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = ClientConfig::from_toml_str("").unwrap();
        assert_eq!(config.display_name, "bsp-client");
        assert_eq!(config.bsp_version, "2.1.0");
        assert_eq!(config.languages, vec!["scala", "java"]);
        assert!(config.request_timeout().is_none());
        assert!(!config.exit_as_notification);
    }

    #[test]
    fn test_toml_overrides() {
        let config = ClientConfig::from_toml_str(
            r#"
display_name = "my-editor"
languages = ["kotlin"]
request_timeout_ms = 2500
exit_as_notification = true
"#,
        )
        .unwrap();
        assert_eq!(config.display_name, "my-editor");
        assert_eq!(config.languages, vec!["kotlin"]);
        assert_eq!(config.request_timeout(), Some(Duration::from_millis(2500)));
        assert!(config.exit_as_notification);
        assert_eq!(config.command_capacity, 256);
    }

    #[test]
    fn test_toml_rejects_wrong_types() {
        assert!(ClientConfig::from_toml_str("languages = 3").is_err());
    }
}
