//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

use linkchat_core::HardwareClass;

/// Daemon configuration. File: ~/.config/linkchat/config.toml or
/// /etc/linkchat/config.toml. Env overrides: LINKCHAT_PORT,
/// LINKCHAT_COOLDOWN_MS, LINKCHAT_SUBNET_PREFIX, LINKCHAT_STORAGE_DIR,
/// LINKCHAT_DEVICE_CLASS, LINKCHAT_DISPLAY_NAME.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Chat transport TCP port (default 8888).
    #[serde(default = "default_port")]
    pub transport_port: u16,
    /// Cooldown between encounters with the same peer (default 5000 ms).
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// /24 prefix of the ad-hoc link subnet, with trailing dot.
    #[serde(default = "default_subnet_prefix")]
    pub subnet_prefix: String,
    /// Admission controller storage location.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    /// Hardware-class override; resolved from the environment signal when absent.
    #[serde(default)]
    pub device_class: Option<HardwareClass>,
    /// Name shown to the remote peer's UI.
    #[serde(default)]
    pub display_name: Option<String>,
}

fn default_port() -> u16 {
    8888
}
fn default_cooldown_ms() -> u64 {
    5000
}
fn default_subnet_prefix() -> String {
    "192.168.49.".to_string()
}
fn default_storage_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".local/share/linkchat"),
        None => PathBuf::from("linkchat-storage"),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport_port: default_port(),
            cooldown_ms: default_cooldown_ms(),
            subnet_prefix: default_subnet_prefix(),
            storage_dir: default_storage_dir(),
            device_class: None,
            display_name: None,
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("LINKCHAT_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.transport_port = p;
        }
    }
    if let Ok(s) = std::env::var("LINKCHAT_COOLDOWN_MS") {
        if let Ok(ms) = s.parse::<u64>() {
            c.cooldown_ms = ms;
        }
    }
    if let Ok(s) = std::env::var("LINKCHAT_SUBNET_PREFIX") {
        c.subnet_prefix = s;
    }
    if let Ok(s) = std::env::var("LINKCHAT_STORAGE_DIR") {
        c.storage_dir = PathBuf::from(s);
    }
    if let Ok(s) = std::env::var("LINKCHAT_DEVICE_CLASS") {
        c.device_class = Some(HardwareClass::from_signal(&s));
    }
    if let Ok(s) = std::env::var("LINKCHAT_DISPLAY_NAME") {
        c.display_name = Some(s);
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(home.join(".config/linkchat/config.toml"));
    }
    out.push(PathBuf::from("/etc/linkchat/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.transport_port, 8888);
        assert_eq!(c.cooldown_ms, 5000);
        assert_eq!(c.subnet_prefix, "192.168.49.");
        assert!(c.device_class.is_none());
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let c: Config = toml::from_str("transport_port = 9000\ndevice_class = \"conservative\"").unwrap();
        assert_eq!(c.transport_port, 9000);
        assert_eq!(c.device_class, Some(HardwareClass::Conservative));
        assert_eq!(c.cooldown_ms, 5000);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("bogus = 1").is_err());
    }
}
