//! Shared setup for gateway integration tests: free ports, a temp config, and readiness polling.

#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;
use vissgw::config::Config;
use vissgw::hub::{ManagerEndpoint, ManagerTable};

pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

/// Temp dir with no `transportSec.json`, so both listeners stay plain.
pub fn temp_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("vissgw-test-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

pub fn test_config(dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.gateway.bind = "127.0.0.1".to_string();
    config.gateway.http_port = free_port();
    config.gateway.ws_port = free_port();
    config.hub.channel_buffer = 8;
    config.transport_security.directory = dir.join("transport_sec");
    config.compression.path_list = dir.join("vsspathlist.json");
    config
}

/// Start the gateway in the background and wait until both ports accept connections.
/// Returns the manager endpoints for the test to serve.
pub async fn start_gateway(config: Config) -> Vec<ManagerEndpoint> {
    let (table, endpoints) = ManagerTable::new(config.hub.managers, config.hub.channel_buffer);
    let ports = [config.gateway.http_port, config.gateway.ws_port];
    tokio::spawn(async move {
        if let Err(e) = vissgw::gateway::run_gateway(config, table).await {
            panic!("gateway exited: {:#}", e);
        }
    });
    for port in ports {
        let mut ready = false;
        for _ in 0..100 {
            if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                ready = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(ready, "gateway port {} not ready within 5s", port);
    }
    endpoints
}
