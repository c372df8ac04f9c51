use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use tracelens::config::Config;
use tracelens::events::EventStream;
use tracelens::gateway::run_gateway_with_listener;
use tracelens::registry::SessionRegistry;

pub struct GatewayTestServer {
    pub port: u16,
    pub traces: TempDir,
    pub events: Arc<EventStream>,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl GatewayTestServer {
    pub async fn start() -> Self {
        let traces = TempDir::new().expect("temp traces dir should be created");
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("ephemeral gateway listener should bind");
        let port = listener
            .local_addr()
            .expect("ephemeral gateway listener should expose local address")
            .port();

        let mut config = Config::default();
        config.enabled = true;
        config.storage.traces_dir = traces.path().to_string_lossy().into_owned();

        let events = Arc::new(EventStream::new(64, 8));

        let handle = {
            let events = Arc::clone(&events);
            tokio::spawn(async move {
                let registry = Arc::new(SessionRegistry::new());
                run_gateway_with_listener(listener, &config, events, registry).await
            })
        };

        wait_until_gateway_ready(port).await;

        Self {
            port,
            traces,
            events,
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port)
    }
}

impl Drop for GatewayTestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn wait_until_gateway_ready(port: u16) {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(200))
        .build()
        .expect("reqwest client should be built");

    for _ in 0..80 {
        let health = client
            .get(format!("http://127.0.0.1:{port}/health"))
            .send()
            .await;
        if health.is_ok_and(|response| response.status().is_success()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("gateway did not become ready on port {port}");
}
