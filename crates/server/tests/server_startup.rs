use std::io::Write;
use std::net::TcpListener;
use std::path::Path;
use std::time::Duration;

use reqwest::Client;
use tempfile::{NamedTempFile, TempDir};
use tokio::time::{sleep, timeout};

/// Find an available port
fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// A minimal valid config keeping all state under `root`
fn minimal_config(port: u16, root: &Path) -> String {
    format!(
        r#"
[server]
host = "127.0.0.1"
port = {port}

[database]
path = "{root}/terrapipe.db"

[orchestrator]
download_root = "{root}/downloads"
"#,
        port = port,
        root = root.display()
    )
}

/// A config declaring one local-directory plugin and one project using it
fn project_config(port: u16, root: &Path) -> String {
    format!(
        r#"{base}
[[plugins]]
name = "chirps"

[[plugins.downloads]]
kind = "local"
directory = "{root}/incoming"
pattern = 'chirps_(?P<year>\d{{4}})(?P<doy>\d{{3}})\.tif'

[[plugins.process]]
program = "true"
output = "out.tif"

[[projects]]
name = "afar"
working_dir = "{root}/projects"
start_date = "2024-01-01"

[[projects.plugins]]
name = "chirps"
"#,
        base = minimal_config(port, root),
        root = root.display()
    )
}

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(content.as_bytes()).unwrap();
    temp_file.flush().unwrap();
    temp_file
}

/// Spawn the server and return a handle
async fn spawn_server(config_path: &Path) -> tokio::process::Child {
    tokio::process::Command::new(env!("CARGO_BIN_EXE_terrapipe"))
        .env("TERRAPIPE_CONFIG", config_path)
        .env("RUST_LOG", "error") // Quiet logs during tests
        .kill_on_drop(true)
        .spawn()
        .expect("Failed to spawn server")
}

/// Wait for server to be ready
async fn wait_for_server(port: u16, max_attempts: u32) -> bool {
    let client = Client::new();
    for _ in 0..max_attempts {
        if client
            .get(format!("http://127.0.0.1:{}/api/v1/health", port))
            .send()
            .await
            .is_ok()
        {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

async fn exits_with_error(config_path: &Path) -> bool {
    let result = timeout(
        Duration::from_secs(5),
        tokio::process::Command::new(env!("CARGO_BIN_EXE_terrapipe"))
            .env("TERRAPIPE_CONFIG", config_path)
            .env("RUST_LOG", "error")
            .output(),
    )
    .await
    .expect("Command timed out")
    .expect("Failed to execute command");

    !result.status.success()
}

#[tokio::test]
async fn test_health_endpoint() {
    let root = TempDir::new().unwrap();
    let port = get_available_port();
    let config = write_config(&minimal_config(port, root.path()));

    let mut server = spawn_server(config.path()).await;
    assert!(
        wait_for_server(port, 40).await,
        "Server did not start in time"
    );

    let client = Client::new();
    let response = client
        .get(format!("http://127.0.0.1:{}/api/v1/health", port))
        .send()
        .await
        .expect("Failed to send request");

    assert!(response.status().is_success());
    let json: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(json["status"], "ok");

    server.kill().await.ok();
}

#[tokio::test]
async fn test_configured_projects_are_seeded() {
    let root = TempDir::new().unwrap();
    std::fs::create_dir_all(root.path().join("incoming")).unwrap();
    let port = get_available_port();
    let config = write_config(&project_config(port, root.path()));

    let mut server = spawn_server(config.path()).await;
    assert!(
        wait_for_server(port, 40).await,
        "Server did not start in time"
    );

    let client = Client::new();
    let response = client
        .get(format!("http://127.0.0.1:{}/api/v1/schedulers/afar", port))
        .send()
        .await
        .expect("Failed to send request");

    assert!(response.status().is_success());
    let json: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(json["project_name"], "afar");
    assert_eq!(json["plugins"][0]["plugin"], "chirps");

    server.kill().await.ok();
}

#[tokio::test]
async fn test_missing_config_file_exits_with_error() {
    assert!(exits_with_error(Path::new("/nonexistent/terrapipe.toml")).await);
}

#[tokio::test]
async fn test_invalid_config_exits_with_error() {
    let config = write_config(
        r#"
[server]
port = 0
"#,
    );
    assert!(exits_with_error(config.path()).await);
}

#[tokio::test]
async fn test_project_with_unknown_plugin_exits_with_error() {
    let root = TempDir::new().unwrap();
    let config = write_config(&format!(
        r#"{}
[[projects]]
name = "afar"
working_dir = "{}/projects"
start_date = "2024-01-01"

[[projects.plugins]]
name = "landsat"
"#,
        minimal_config(get_available_port(), root.path()),
        root.path().display()
    ));
    assert!(exits_with_error(config.path()).await);
}
