//! Client configuration: TOML file + programmatic overrides.

use overlay_core::{CarrierType, NetworkError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    client: ClientSection,
    #[serde(default)]
    stcp: StcpSection,
    #[serde(default)]
    stcpr: ResolvedSection,
    #[serde(default)]
    sudph: ResolvedSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ClientSection {
    carrier: Option<String>,
    bind_addr: Option<String>,
    handshake_timeout_secs: Option<u64>,
    log_level: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct StcpSection {
    pk_table_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ResolvedSection {
    resolver_url: Option<String>,
}

/// Programmatic overrides, e.g. from CLI flags in the demo binary. Any
/// `Some` field here wins over the corresponding TOML value.
#[derive(Debug, Clone, Default)]
pub struct ClientConfigOverrides {
    pub carrier: Option<CarrierType>,
    pub bind_addr: Option<String>,
    pub handshake_timeout_secs: Option<u64>,
    pub resolver_url: Option<String>,
    pub pk_table_path: Option<String>,
}

/// Resolved client configuration (all paths expanded, overrides applied,
/// validated).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub carrier: CarrierType,
    pub bind_addr: String,
    pub handshake_timeout: Duration,
    pub log_level: String,
    pub pk_table_path: Option<PathBuf>,
    pub resolver_url: Option<String>,
}

impl ClientConfig {
    /// Load configuration from an optional TOML file, then apply
    /// overrides. A missing file silently falls back to defaults.
    /// Validation (unknown carrier, missing resolver URL for a
    /// resolver-backed carrier) happens here, synchronously, rather than
    /// at first dial.
    pub fn load(
        config_path: Option<&Path>,
        overrides: ClientConfigOverrides,
    ) -> Result<Self, NetworkError> {
        let file = load_file(config_path)?;

        let carrier_str = overrides
            .carrier
            .map(|c| c.as_str().to_string())
            .or(file.client.carrier)
            .unwrap_or_else(|| "stcp".to_string());
        let carrier: CarrierType = carrier_str
            .parse()
            .map_err(|_| NetworkError::ConfigError(format!("unknown carrier type `{carrier_str}`")))?;

        let bind_addr = overrides
            .bind_addr
            .or(file.client.bind_addr)
            .unwrap_or_else(|| "0.0.0.0:0".to_string());

        let handshake_timeout_secs = overrides
            .handshake_timeout_secs
            .or(file.client.handshake_timeout_secs)
            .unwrap_or(10);

        let log_level = file.client.log_level.unwrap_or_else(|| "info".to_string());

        let pk_table_path = overrides
            .pk_table_path
            .or(file.stcp.pk_table_path)
            .map(|s| expand_tilde_str(&s));

        let resolver_section = match carrier {
            CarrierType::Stcpr => &file.stcpr,
            CarrierType::Sudph => &file.sudph,
            CarrierType::Stcp => &ResolvedSection { resolver_url: None },
        };
        let resolver_url = overrides.resolver_url.or_else(|| resolver_section.resolver_url.clone());

        if matches!(carrier, CarrierType::Stcpr | CarrierType::Sudph) && resolver_url.is_none() {
            return Err(NetworkError::ConfigError(format!(
                "carrier `{carrier}` requires a resolver_url"
            )));
        }

        Ok(Self {
            carrier,
            bind_addr,
            handshake_timeout: Duration::from_secs(handshake_timeout_secs),
            log_level,
            pk_table_path,
            resolver_url,
        })
    }
}

fn load_file(config_path: Option<&Path>) -> Result<ConfigFile, NetworkError> {
    let Some(path) = config_path else {
        return Ok(ConfigFile::default());
    };
    let expanded = expand_tilde(path);
    if !expanded.exists() {
        info!(path = %expanded.display(), "client config file not found, using defaults");
        return Ok(ConfigFile::default());
    }
    info!(path = %expanded.display(), "loading client config file");
    let content = std::fs::read_to_string(&expanded)
        .map_err(|e| NetworkError::ConfigError(format!("reading config: {e}")))?;
    toml::from_str(&content).map_err(|e| NetworkError::ConfigError(format!("parsing config: {e}")))
}

fn expand_tilde(path: &Path) -> PathBuf {
    expand_tilde_str(&path.to_string_lossy())
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let cfg = ClientConfig::load(None, ClientConfigOverrides::default()).unwrap();
        assert_eq!(cfg.carrier, CarrierType::Stcp);
        assert_eq!(cfg.handshake_timeout, Duration::from_secs(10));
    }

    #[test]
    fn stcpr_without_resolver_url_is_a_config_error() {
        let overrides = ClientConfigOverrides {
            carrier: Some(CarrierType::Stcpr),
            ..Default::default()
        };
        let err = ClientConfig::load(None, overrides).unwrap_err();
        assert!(matches!(err, NetworkError::ConfigError(_)));
    }

    #[test]
    fn overrides_win_over_missing_file() {
        let overrides = ClientConfigOverrides {
            bind_addr: Some("127.0.0.1:1234".to_string()),
            ..Default::default()
        };
        let cfg = ClientConfig::load(None, overrides).unwrap();
        assert_eq!(cfg.bind_addr, "127.0.0.1:1234");
    }
}
