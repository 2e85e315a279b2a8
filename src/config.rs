//! Startup configuration.
//!
//! Read once from `$XDG_CONFIG_HOME/hypr/hyprcast.toml` (or
//! `~/.config/hypr/hyprcast.toml`); a missing file yields the defaults.
//! There is no hot reload.

use std::path::PathBuf;

use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub screencopy: ScreencopyConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// When true, the foreign-toplevel registry is only bound while a session
    /// needs it, instead of pre-emptively at startup.
    pub toplevel_dynamic_bind: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScreencopyConfig {
    /// Upper clamp for the session framerate. 0 means "use the output rate".
    pub max_fps: u32,
    /// Pass `--allow-token` to the picker so the restore checkbox defaults on.
    pub allow_token_by_default: bool,
    /// Override for the picker binary. Empty means the stock picker.
    pub custom_picker_binary: String,
}

impl Default for ScreencopyConfig {
    fn default() -> Self {
        Self {
            max_fps: 120,
            allow_token_by_default: false,
            custom_picker_binary: String::new(),
        }
    }
}

impl Config {
    /// Load the config from the conventional path, falling back to defaults
    /// when the file is absent or malformed.
    pub fn load() -> Self {
        let Some(path) = Self::path() else {
            warn!("neither $HOME nor $XDG_CONFIG_HOME is present in env");
            return Self::default();
        };

        match std::fs::read_to_string(&path) {
            Ok(text) => Self::parse(&text).unwrap_or_else(|err| {
                warn!(path = %path.display(), "failed to parse config: {err}");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    fn path() -> Option<PathBuf> {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            return Some(PathBuf::from(xdg).join("hypr/hyprcast.toml"));
        }
        std::env::var("HOME")
            .ok()
            .map(|home| PathBuf::from(home).join(".config/hypr/hyprcast.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(!config.general.toplevel_dynamic_bind);
        assert_eq!(config.screencopy.max_fps, 120);
        assert!(!config.screencopy.allow_token_by_default);
        assert!(config.screencopy.custom_picker_binary.is_empty());
    }

    #[test]
    fn test_parse_full() {
        let config = Config::parse(
            r#"
            [general]
            toplevel_dynamic_bind = true

            [screencopy]
            max_fps = 60
            allow_token_by_default = true
            custom_picker_binary = "/usr/local/bin/my-picker"
            "#,
        )
        .unwrap();

        assert!(config.general.toplevel_dynamic_bind);
        assert_eq!(config.screencopy.max_fps, 60);
        assert!(config.screencopy.allow_token_by_default);
        assert_eq!(config.screencopy.custom_picker_binary, "/usr/local/bin/my-picker");
    }

    #[test]
    fn test_parse_partial_keeps_defaults() {
        let config = Config::parse("[screencopy]\nmax_fps = 0\n").unwrap();
        assert_eq!(config.screencopy.max_fps, 0);
        assert!(!config.general.toplevel_dynamic_bind);
    }
}
