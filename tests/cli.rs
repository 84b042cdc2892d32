//! End-to-end tests for the geogate binary.
//!
//! Everything here uses the in-process memory backend and a local feed
//! server, so no root privileges or network access are needed.

use axum::{extract::Path as UrlPath, http::StatusCode, routing::get, Router};
use std::io::Write;
use std::net::SocketAddr;
use std::process::Output;
use tempfile::TempDir;

fn geogate() -> tokio::process::Command {
    tokio::process::Command::new(env!("CARGO_BIN_EXE_geogate"))
}

async fn run_geogate(args: &[&str]) -> Output {
    geogate()
        .args(args)
        .output()
        .await
        .expect("Failed to execute geogate")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

/// Serves `<cc>.zone` feeds; `xx` answers 404
async fn start_feed_server() -> SocketAddr {
    async fn zone(UrlPath(name): UrlPath<String>) -> (StatusCode, String) {
        match name.as_str() {
            "us.zone" => (StatusCode::OK, "1.2.0.0/16\n3.0.0.0/8\n".to_string()),
            "de.zone" => (StatusCode::OK, "5.1.0.0/16\n".to_string()),
            _ => (StatusCode::NOT_FOUND, String::new()),
        }
    }

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().route("/:name", get(zone));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Memory-backend config pointing at the local feed server
fn write_config(dir: &TempDir, feeds: SocketAddr) -> String {
    let path = dir.path().join("config.yaml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "backend: memory").unwrap();
    writeln!(file, "lock_file: {}", dir.path().join("geogate.lock").display()).unwrap();
    writeln!(file, "feed:").unwrap();
    writeln!(file, "  url_template: \"http://{}/{{country}}.zone\"", feeds).unwrap();
    writeln!(file, "  max_retries: 1").unwrap();
    path.display().to_string()
}

#[tokio::test]
async fn test_version_command() {
    let output = run_geogate(&["version"]).await;
    assert!(output.status.success());
    assert!(stdout(&output).contains(&format!("geogate {}", env!("CARGO_PKG_VERSION"))));
}

#[tokio::test]
async fn test_help_lists_commands() {
    let output = run_geogate(&["--help"]).await;
    assert!(output.status.success());
    let out = stdout(&output);
    for command in ["run", "sync", "stats", "reset"] {
        assert!(out.contains(command), "missing {} in help", command);
    }
}

#[tokio::test]
async fn test_conflicting_modes_rejected() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "127.0.0.1:9".parse().unwrap());
    let output = run_geogate(&[
        "--config", &config, "--allow", "--deny", "--countries", "us", "sync",
    ])
    .await;
    assert!(!output.status.success());
    assert!(stderr(&output).contains("both allow and deny"));
}

#[tokio::test]
async fn test_missing_countries_rejected() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "127.0.0.1:9".parse().unwrap());
    let output = run_geogate(&["--config", &config, "--deny", "sync"]).await;
    assert!(!output.status.success());
    assert!(stderr(&output).contains("Invalid configuration"));
}

#[tokio::test]
async fn test_sync_against_local_feeds() {
    let feeds = start_feed_server().await;
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, feeds);

    let output = run_geogate(&[
        "--config", &config, "--deny", "--countries", "us,de", "sync",
    ])
    .await;
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("[OK] 3 entries enforced (+3 -0)"), "stdout: {}", out);
}

#[tokio::test]
async fn test_sync_skips_failed_country() {
    let feeds = start_feed_server().await;
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, feeds);

    let output = run_geogate(&[
        "--config", &config, "--deny", "--countries", "us,xx", "sync",
    ])
    .await;
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("[SKIP] feed for 'xx' unavailable: HTTP 404"), "stdout: {}", out);
    assert!(out.contains("[OK] 2 entries enforced"));
}

#[tokio::test]
async fn test_sync_fails_when_every_feed_fails() {
    let feeds = start_feed_server().await;
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, feeds);

    let output = run_geogate(&["--config", &config, "--allow", "--countries", "xx", "sync"]).await;
    assert!(!output.status.success());
    assert!(stderr(&output).contains("No feed could be fetched"));
}

#[tokio::test]
async fn test_dry_run_prints_plan() {
    let feeds = start_feed_server().await;
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, feeds);

    let output = run_geogate(&[
        "--config", &config, "--allow", "--countries", "de", "sync", "--dry-run",
    ])
    .await;
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("[DRY-RUN]"));
    assert!(out.contains("allow_de"));
}

#[tokio::test]
async fn test_run_exits_when_first_pass_fails() {
    let feeds = start_feed_server().await;
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, feeds);

    let metrics = {
        let spare = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        spare.local_addr().unwrap().to_string()
    };

    let output = tokio::time::timeout(
        std::time::Duration::from_secs(60),
        run_geogate(&[
            "--config",
            &config,
            "--deny",
            "--countries",
            "xx,yy",
            "--metrics-addr",
            &metrics,
            "run",
        ]),
    )
    .await
    .expect("run should exit on its own when the first pass fails");

    assert!(!output.status.success());
    assert!(stderr(&output).contains("Initial synchronization failed"));
    assert!(stderr(&output).contains("No feed could be fetched"));
    let logs = format!("{}{}", stdout(&output), stderr(&output));
    assert!(!logs.contains("Metrics endpoint listening"));
    assert!(!logs.contains("Scheduler started"));
}

#[tokio::test]
async fn test_stats_and_reset_on_memory_backend() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "127.0.0.1:9".parse().unwrap());

    let output = run_geogate(&["--config", &config, "stats"]).await;
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("No sets installed"));

    let output = run_geogate(&["--config", &config, "stats", "--json"]).await;
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert!(json.as_object().unwrap().is_empty());

    let output = run_geogate(&["--config", &config, "reset"]).await;
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("[OK]"));
}

#[tokio::test]
async fn test_xdp_stats_needs_running_daemon() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir, "127.0.0.1:9".parse().unwrap());
    let output = run_geogate(&["--config", &config, "--backend", "xdp", "stats"]).await;
    assert!(!output.status.success());
}
