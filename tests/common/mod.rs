#![allow(dead_code)]

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use declarest::config::AppConfig;
use declarest::App;

pub const JWT_SECRET: &str = "integration-secret";

pub struct TestServer {
    pub port: u16,
    pub base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Development config with a known JWT secret and audit logging on
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::development();
    config.security.jwt_secret = JWT_SECRET.to_string();
    config.security.enable_audit_logging = true;
    config.api.upload_cleanup_delay_ms = 10;
    config
}

/// Serve `app` in-process on a free port and wait until it accepts connections
pub async fn spawn(app: App) -> Result<TestServer> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    // Pick an unused port for isolation
    let port = portpicker::pick_unused_port().context("failed to pick free port")?;
    let base_url = format!("http://127.0.0.1:{}", port);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .context("failed to bind test listener")?;

    let handle = tokio::spawn(async move {
        if let Err(e) = app.serve(listener).await {
            eprintln!("test server stopped: {:#}", e);
        }
    });

    let server = TestServer { port, base_url, handle };
    wait_ready(&server, Duration::from_secs(5)).await?;
    Ok(server)
}

async fn wait_ready(server: &TestServer, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if tokio::net::TcpStream::connect(("127.0.0.1", server.port)).await.is_ok() {
            return Ok(());
        }
        if Instant::now() > deadline {
            anyhow::bail!("server did not become ready on {} within {:?}", server.base_url, timeout)
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Number of regular files directly inside `dir`
pub fn file_count(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(|e| e.ok()).filter(|e| e.path().is_file()).count())
        .unwrap_or(0)
}
