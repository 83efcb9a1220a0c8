//! Configuration types and loading.
//!
//! Gateway config is loaded from a JSON file (e.g. `~/.vissgw/config.json`) and environment.
//! Transport security lives in a separate `transportSec.json` next to the certificate material;
//! a missing or broken security file disables TLS instead of failing startup.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};

/// File name of the transport security config inside the security directory.
pub const TRANSPORT_SEC_FILE: &str = "transportSec.json";

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Listener, session pool and manager routing settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Manager channel table sizing.
    #[serde(default)]
    pub hub: HubConfig,

    /// Where to find `transportSec.json` and the certificate material.
    #[serde(default)]
    pub transport_security: TransportSecurityConfig,

    /// Auxiliary resources for the compressed WebSocket subprotocols.
    #[serde(default)]
    pub compression: CompressionConfig,
}

/// Gateway bind, ports and session limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Bind address for both listeners (default "0.0.0.0").
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Plain HTTP port used when transport security is disabled (default 8888).
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Plain WebSocket port used when transport security is disabled (default 8080).
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,

    /// Manager index HTTP sessions are routed to.
    #[serde(default)]
    pub http_manager_id: usize,

    /// Manager index WebSocket sessions are routed to.
    #[serde(default = "default_ws_manager_id")]
    pub ws_manager_id: usize,

    /// Concurrent HTTP exchanges in flight.
    #[serde(default = "default_max_sessions")]
    pub max_http_sessions: usize,

    /// Concurrent WebSocket sessions.
    #[serde(default = "default_max_sessions")]
    pub max_ws_sessions: usize,

    /// TLS server name.
    #[serde(default = "default_server_name")]
    pub server_name: String,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8888
}

fn default_ws_port() -> u16 {
    8080
}

fn default_ws_manager_id() -> usize {
    1
}

fn default_max_sessions() -> usize {
    20
}

fn default_server_name() -> String {
    "localhost".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            http_port: default_http_port(),
            ws_port: default_ws_port(),
            http_manager_id: 0,
            ws_manager_id: default_ws_manager_id(),
            max_http_sessions: default_max_sessions(),
            max_ws_sessions: default_max_sessions(),
            server_name: default_server_name(),
        }
    }
}

/// Manager channel table sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubConfig {
    /// Number of backend managers (fixed for the process lifetime).
    #[serde(default = "default_managers")]
    pub managers: usize,

    /// Buffer depth of every gateway channel.
    #[serde(default = "default_channel_buffer")]
    pub channel_buffer: usize,
}

fn default_managers() -> usize {
    2
}

fn default_channel_buffer() -> usize {
    16
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            managers: default_managers(),
            channel_buffer: default_channel_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportSecurityConfig {
    /// Directory holding `transportSec.json`; certificate paths inside it are relative to this directory.
    #[serde(default = "default_transport_sec_dir")]
    pub directory: PathBuf,
}

fn default_transport_sec_dir() -> PathBuf {
    PathBuf::from("../transport_sec/")
}

impl Default for TransportSecurityConfig {
    fn default() -> Self {
        Self {
            directory: default_transport_sec_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionConfig {
    /// Signal path list required by `VISSv2prop` and `VISSv2pbl2`.
    #[serde(default = "default_path_list")]
    pub path_list: PathBuf,
}

fn default_path_list() -> PathBuf {
    PathBuf::from("../vsspathlist.json")
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            path_list: default_path_list(),
        }
    }
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("VISSGW_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".vissgw").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path, or the default path (VISSGW_CONFIG_PATH / ~/.vissgw/config.json).
/// Missing file => default config. Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

/// Contents of `transportSec.json`. Ports are accepted as strings or numbers.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportSecConfig {
    /// "yes" enables TLS on both listeners; anything else leaves them plain.
    #[serde(default)]
    pub transport_sec: String,

    #[serde(default, deserialize_with = "port_from_str_or_int")]
    pub http_sec_port: Option<u16>,

    #[serde(default, deserialize_with = "port_from_str_or_int")]
    pub ws_sec_port: Option<u16>,

    /// Relative to the security directory; holds `Root.CA.crt`.
    #[serde(default)]
    pub ca_sec_path: PathBuf,

    /// Relative to the security directory; holds `server.crt` and `server.key`.
    #[serde(default)]
    pub server_sec_path: PathBuf,

    /// One of NoClientCert, ClientCertNoVerification, ClientCertVerification.
    #[serde(default)]
    pub server_cert_opt: String,

    #[serde(skip)]
    base_dir: PathBuf,
}

fn invalid_port<E: serde::de::Error>(value: impl std::fmt::Display) -> E {
    E::custom(format!("invalid port: {}", value))
}

fn port_from_str_or_int<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => n
            .as_u64()
            .and_then(|p| u16::try_from(p).ok())
            .map(Some)
            .ok_or_else(|| invalid_port::<D::Error>(&n)),
        Some(serde_json::Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(serde_json::Value::String(s)) => {
            s.trim().parse::<u16>().map(Some).map_err(|_| invalid_port::<D::Error>(&s))
        }
        Some(other) => Err(invalid_port::<D::Error>(&other)),
    }
}

impl TransportSecConfig {
    /// A config with transport security off.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Read `transportSec.json` from `dir`. Any failure is logged and yields a disabled config.
    pub fn load(dir: &Path) -> Self {
        let path = dir.join(TRANSPORT_SEC_FILE);
        let data = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) => {
                log::info!("transport security config {} not read ({}); TLS disabled", path.display(), e);
                return Self::disabled();
            }
        };
        let mut sec: TransportSecConfig = match serde_json::from_str(&data) {
            Ok(sec) => sec,
            Err(e) => {
                log::error!("parsing {}: {}; TLS disabled", path.display(), e);
                return Self::disabled();
            }
        };
        if sec.enabled() && (sec.http_sec_port.is_none() || sec.ws_sec_port.is_none()) {
            log::error!("{} enables TLS but does not name both secure ports; TLS disabled", path.display());
            return Self::disabled();
        }
        sec.base_dir = dir.to_path_buf();
        log::info!("transport security: {}", if sec.enabled() { "yes" } else { "no" });
        sec
    }

    pub fn enabled(&self) -> bool {
        self.transport_sec.trim() == "yes"
    }

    pub fn ca_cert_path(&self) -> PathBuf {
        self.base_dir.join(&self.ca_sec_path).join("Root.CA.crt")
    }

    pub fn server_cert_path(&self) -> PathBuf {
        self.base_dir.join(&self.server_sec_path).join("server.crt")
    }

    pub fn server_key_path(&self) -> PathBuf {
        self.base_dir.join(&self.server_sec_path).join("server.key")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "vissgw-config-{}-{}-{}",
            tag,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn default_ports_and_pools() {
        let g = GatewayConfig::default();
        assert_eq!(g.http_port, 8888);
        assert_eq!(g.ws_port, 8080);
        assert_eq!(g.http_manager_id, 0);
        assert_eq!(g.ws_manager_id, 1);
        assert_eq!(HubConfig::default().managers, 2);
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let c: Config = serde_json::from_str(r#"{"gateway":{"wsPort":9000}}"#).unwrap();
        assert_eq!(c.gateway.ws_port, 9000);
        assert_eq!(c.gateway.http_port, 8888);
        assert_eq!(c.compression.path_list, PathBuf::from("../vsspathlist.json"));
    }

    #[test]
    fn missing_config_file_uses_defaults() {
        let dir = temp_dir("missing");
        let (c, path) = load_config(Some(dir.join("nope.json"))).unwrap();
        assert_eq!(path, dir.join("nope.json"));
        assert_eq!(c.gateway.http_port, 8888);
    }

    #[test]
    fn malformed_config_file_is_an_error() {
        let dir = temp_dir("malformed");
        let path = dir.join("config.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(load_config(Some(path)).is_err());
    }

    #[test]
    fn missing_transport_sec_disables_tls() {
        let dir = temp_dir("nosec");
        assert!(!TransportSecConfig::load(&dir).enabled());
    }

    #[test]
    fn malformed_transport_sec_disables_tls() {
        let dir = temp_dir("badsec");
        std::fs::write(dir.join(TRANSPORT_SEC_FILE), b"{\"transportSec\": ").unwrap();
        assert!(!TransportSecConfig::load(&dir).enabled());
    }

    #[test]
    fn transport_sec_with_string_ports_and_paths() {
        let dir = temp_dir("sec");
        let mut f = std::fs::File::create(dir.join(TRANSPORT_SEC_FILE)).unwrap();
        f.write_all(
            br#"{"transportSec":"yes","httpSecPort":"443","wsSecPort":6443,
                 "caSecPath":"ca/","serverSecPath":"server/","serverCertOpt":"NoClientCert"}"#,
        )
        .unwrap();
        let sec = TransportSecConfig::load(&dir);
        assert!(sec.enabled());
        assert_eq!(sec.http_sec_port, Some(443));
        assert_eq!(sec.ws_sec_port, Some(6443));
        assert_eq!(sec.ca_cert_path(), dir.join("ca").join("Root.CA.crt"));
        assert_eq!(sec.server_key_path(), dir.join("server").join("server.key"));
    }

    #[test]
    fn unparsable_secure_port_disables_tls() {
        let dir = temp_dir("badport");
        std::fs::write(
            dir.join(TRANSPORT_SEC_FILE),
            br#"{"transportSec":"yes","httpSecPort":"https","wsSecPort":"6443"}"#,
        )
        .unwrap();
        assert!(!TransportSecConfig::load(&dir).enabled());
    }

    #[test]
    fn out_of_range_numeric_port_disables_tls() {
        let dir = temp_dir("bigport");
        std::fs::write(
            dir.join(TRANSPORT_SEC_FILE),
            br#"{"transportSec":"yes","httpSecPort":70000,"wsSecPort":6443}"#,
        )
        .unwrap();
        assert!(!TransportSecConfig::load(&dir).enabled());
    }
}
