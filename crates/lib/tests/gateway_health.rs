//! Integration test: start the gateway on a free port, GET /, assert health JSON, then stop it.
//! Does not require Ollama or Telegram.

use crier::config::Config;
use crier::gateway;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

fn temp_config_dir() -> (PathBuf, PathBuf) {
    let dir = std::env::temp_dir().join(format!("crier-gateway-test-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(dir.join("workspace")).expect("create workspace dir");
    let config_path = dir.join("config.json");
    std::fs::File::create(&config_path)
        .and_then(|mut f| f.write_all(b"{}"))
        .expect("write config.json");
    (dir, config_path)
}

#[tokio::test]
async fn gateway_health_http_responds_with_running() {
    let port = free_port();
    let (temp_dir, config_path) = temp_config_dir();

    let mut config = Config::default();
    config.gateway.port = port;
    config.gateway.bind = "127.0.0.1".to_string();
    config.agents.defaults.workspace = Some(temp_dir.join("workspace"));
    config.heartbeat.enabled = false;
    config.channels.telegram.enabled = false;

    let stop = CancellationToken::new();
    let gateway_handle = tokio::spawn(gateway::run_gateway_until(config, config_path, stop.clone()));

    let url = format!("http://127.0.0.1:{}/", port);
    let client = reqwest::Client::new();
    let mut health = None;
    let mut last_err = None;
    for _ in 0..100 {
        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                health = Some(resp.json::<serde_json::Value>().await.expect("parse JSON"));
                break;
            }
            Ok(_) => {}
            Err(e) => last_err = Some(e),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let Some(json) = health else {
        gateway_handle.abort();
        panic!(
            "GET {} did not return 200 with health JSON within 5s; last error: {:?}",
            url, last_err
        );
    };

    assert_eq!(json.get("runtime").and_then(|v| v.as_str()), Some("running"));
    assert_eq!(json.get("port").and_then(|v| v.as_u64()), Some(port as u64));
    assert_eq!(json.get("cronJobs").and_then(|v| v.as_u64()), Some(0));
    let tools: Vec<&str> = json["tools"]
        .as_array()
        .expect("tools array")
        .iter()
        .filter_map(|v| v.as_str())
        .collect();
    for name in ["exec", "read_file", "message", "spawn", "cron", "web_fetch"] {
        assert!(tools.contains(&name), "missing tool {} in {:?}", name, tools);
    }

    stop.cancel();
    let finished = tokio::time::timeout(Duration::from_secs(5), gateway_handle)
        .await
        .expect("gateway stops after cancel")
        .expect("gateway task joins");
    assert!(finished.is_ok(), "gateway returned error: {:?}", finished);
    let _ = std::fs::remove_dir_all(temp_dir);
}
