//! WebSocket subprotocol negotiation: picks the compression mode for a connection.
//!
//! The first offered subprotocol the gateway recognizes wins. The proprietary and
//! protobuf-level-2 modes need the signal path list; when it cannot be loaded the
//! mode is downgraded and the downgraded subprotocol is echoed instead.

use axum::http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderMap};
use serde::Deserialize;
use std::path::PathBuf;

pub const SUBPROTOCOL_PLAIN: &str = "VISSv2";
pub const SUBPROTOCOL_PROPRIETARY: &str = "VISSv2prop";
pub const SUBPROTOCOL_PB_LEVEL1: &str = "VISSv2pbl1";
pub const SUBPROTOCOL_PB_LEVEL2: &str = "VISSv2pbl2";

/// Wire encoding of one WebSocket connection, fixed at handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMode {
    None,
    Proprietary,
    PbLevel1,
    PbLevel2,
}

impl CompressionMode {
    /// Compressed modes travel as binary frames, plain JSON as text frames.
    pub fn is_binary(self) -> bool {
        !matches!(self, CompressionMode::None)
    }

    pub fn subprotocol(self) -> &'static str {
        match self {
            CompressionMode::None => SUBPROTOCOL_PLAIN,
            CompressionMode::Proprietary => SUBPROTOCOL_PROPRIETARY,
            CompressionMode::PbLevel1 => SUBPROTOCOL_PB_LEVEL1,
            CompressionMode::PbLevel2 => SUBPROTOCOL_PB_LEVEL2,
        }
    }
}

/// Outcome of negotiation. `subprotocol` is what goes into the handshake response;
/// None when the client offered nothing the gateway recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub mode: CompressionMode,
    pub subprotocol: Option<&'static str>,
}

/// Auxiliary resource the path-list based modes depend on.
pub trait PathListSource: Send + Sync {
    /// Try to make the path list available. False means the dependent modes must not be used.
    fn init(&self) -> bool;
}

/// Signal path list read from a JSON file (`{"LeafPaths": [...]}`).
pub struct PathListFile {
    path: PathBuf,
}

#[derive(Deserialize)]
struct PathListDocument {
    #[serde(rename = "LeafPaths")]
    leaf_paths: Vec<String>,
}

impl PathListFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PathListSource for PathListFile {
    fn init(&self) -> bool {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) => {
                log::error!("cannot read path list {}: {}", self.path.display(), e);
                return false;
            }
        };
        match serde_json::from_str::<PathListDocument>(&data) {
            Ok(doc) => {
                log::debug!("path list {} has {} paths", self.path.display(), doc.leaf_paths.len());
                true
            }
            Err(e) => {
                log::error!("cannot parse path list {}: {}", self.path.display(), e);
                false
            }
        }
    }
}

/// Subprotocols offered in the handshake, in the client's order.
pub fn offered_subprotocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Pick the compression mode for a connection from the offered subprotocols.
pub fn negotiate<S: AsRef<str>>(offered: &[S], path_list: &dyn PathListSource) -> Negotiated {
    for sub in offered {
        let mode = match sub.as_ref() {
            SUBPROTOCOL_PLAIN => CompressionMode::None,
            SUBPROTOCOL_PROPRIETARY => {
                if path_list.init() {
                    CompressionMode::Proprietary
                } else {
                    log::error!("path list unavailable; {} falls back to {}", SUBPROTOCOL_PROPRIETARY, SUBPROTOCOL_PLAIN);
                    CompressionMode::None
                }
            }
            SUBPROTOCOL_PB_LEVEL1 => CompressionMode::PbLevel1,
            SUBPROTOCOL_PB_LEVEL2 => {
                if path_list.init() {
                    CompressionMode::PbLevel2
                } else {
                    log::error!("path list unavailable; {} falls back to {}", SUBPROTOCOL_PB_LEVEL2, SUBPROTOCOL_PB_LEVEL1);
                    CompressionMode::PbLevel1
                }
            }
            _ => continue,
        };
        return Negotiated {
            mode,
            subprotocol: Some(mode.subprotocol()),
        };
    }
    Negotiated {
        mode: CompressionMode::None,
        subprotocol: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Available(bool, AtomicUsize);

    impl Available {
        fn new(ok: bool) -> Self {
            Self(ok, AtomicUsize::new(0))
        }

        fn calls(&self) -> usize {
            self.1.load(Ordering::SeqCst)
        }
    }

    impl PathListSource for Available {
        fn init(&self) -> bool {
            self.1.fetch_add(1, Ordering::SeqCst);
            self.0
        }
    }

    #[test]
    fn each_subprotocol_selects_its_mode() {
        let ok = Available::new(true);
        for (sub, mode) in [
            (SUBPROTOCOL_PLAIN, CompressionMode::None),
            (SUBPROTOCOL_PROPRIETARY, CompressionMode::Proprietary),
            (SUBPROTOCOL_PB_LEVEL1, CompressionMode::PbLevel1),
            (SUBPROTOCOL_PB_LEVEL2, CompressionMode::PbLevel2),
        ] {
            let n = negotiate(&[sub], &ok);
            assert_eq!(n.mode, mode);
            assert_eq!(n.subprotocol, Some(sub));
        }
    }

    #[test]
    fn proprietary_falls_back_to_plain() {
        let n = negotiate(&["VISSv2prop"], &Available::new(false));
        assert_eq!(n.mode, CompressionMode::None);
        assert_eq!(n.subprotocol, Some("VISSv2"));
    }

    #[test]
    fn pb_level2_falls_back_to_level1() {
        let n = negotiate(&["VISSv2pbl2"], &Available::new(false));
        assert_eq!(n.mode, CompressionMode::PbLevel1);
        assert_eq!(n.subprotocol, Some("VISSv2pbl1"));
    }

    #[test]
    fn first_recognized_offer_wins() {
        let ok = Available::new(true);
        let n = negotiate(&["chat", "VISSv2pbl1", "VISSv2"], &ok);
        assert_eq!(n.mode, CompressionMode::PbLevel1);
        assert_eq!(ok.calls(), 0);
    }

    #[test]
    fn nothing_recognized_means_plain_without_echo() {
        let n = negotiate::<&str>(&[], &Available::new(true));
        assert_eq!(n, Negotiated { mode: CompressionMode::None, subprotocol: None });
        let n = negotiate(&["mqtt", "graphql-ws"], &Available::new(true));
        assert_eq!(n.mode, CompressionMode::None);
        assert_eq!(n.subprotocol, None);
    }

    #[test]
    fn negotiation_is_deterministic() {
        let missing = Available::new(false);
        let offers = ["VISSv2pbl2", "VISSv2prop"];
        let first = negotiate(&offers, &missing);
        for _ in 0..5 {
            assert_eq!(negotiate(&offers, &missing), first);
        }
    }

    #[test]
    fn offered_subprotocols_splits_and_trims() {
        let mut headers = HeaderMap::new();
        headers.append(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("VISSv2prop, VISSv2"));
        headers.append(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("VISSv2pbl1"));
        assert_eq!(offered_subprotocols(&headers), vec!["VISSv2prop", "VISSv2", "VISSv2pbl1"]);
    }

    #[test]
    fn path_list_file_requires_parsable_document() {
        let dir = std::env::temp_dir().join(format!("vissgw-pathlist-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let good = dir.join("vsspathlist.json");
        std::fs::write(&good, br#"{"LeafPaths":["Vehicle.Speed","Vehicle.Cabin.Door.Row1.Left.IsOpen"]}"#).unwrap();
        let bad = dir.join("broken.json");
        std::fs::write(&bad, b"[").unwrap();
        assert!(PathListFile::new(&good).init());
        assert!(!PathListFile::new(&bad).init());
        assert!(!PathListFile::new(dir.join("absent.json")).init());
    }
}
