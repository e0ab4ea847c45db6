//! Shared harness: a real TLS server on an ephemeral loopback port and a
//! client that trusts the test root CA.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chronicle_server::log::{Log, LogRecord, MemorySink};
use chronicle_server::router::{RouteTable, Router};
use chronicle_server::server::{Server, ServerOptions};

pub const ROOT_CA: &[u8] = include_bytes!("../credentials/rootCA.pem");
pub const CERT: &[u8] = include_bytes!("../credentials/certificate.pem");
pub const KEY: &[u8] = include_bytes!("../credentials/privateKey.pem");

pub struct TestServer {
    pub server: Server,
    pub sink: Arc<MemorySink>,
    pub client: reqwest::Client,
    pub url: String,
}

impl TestServer {
    pub async fn start(routes: RouteTable) -> Self {
        let sink = Arc::new(MemorySink::with_limit(1_000));
        let router = Router::new(routes, Log::new(sink.clone()));
        let options = ServerOptions {
            key: Some(KEY.to_vec()),
            cert: Some(CERT.to_vec()),
        };
        let server = Server::new(options, router).unwrap();
        server.listen(0, Some("127.0.0.1")).await.unwrap();
        let addr = server.address().unwrap();

        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .add_root_certificate(reqwest::Certificate::from_pem(ROOT_CA).unwrap())
            .resolve("localhost", addr)
            .build()
            .unwrap();

        Self {
            server,
            sink,
            client,
            url: format!("https://localhost:{}", addr.port()),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.url)
    }

    /// Wait until at least `count` records were written.
    ///
    /// The completion record is written once the server releases the
    /// response body, which may be after the client has read it.
    pub async fn records(&self, count: usize) -> Vec<LogRecord> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let records = self.sink.records();
            if records.len() >= count || tokio::time::Instant::now() > deadline {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn stop(self) {
        self.server.close().await.unwrap();
    }
}

pub fn messages(records: &[LogRecord]) -> Vec<&str> {
    records.iter().map(|r| r.msg.as_str()).collect()
}
