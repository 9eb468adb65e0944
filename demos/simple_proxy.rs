//! Explicit MITM proxy that logs every exchange and tags responses
//!
//! To run:
//! ```bash
//! RUST_LOG=mitm_hijack=debug cargo run --example simple_proxy
//! ```
//!
//! Then point a client at it, e.g. `curl -x http://127.0.0.1:8888 -k https://example.com`.

use async_trait::async_trait;
use bytes::Bytes;
use mitm_hijack::{FlowMirror, Hooks, HttpFlow, HttpHijacker, MitmConfig, ProxyServer};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Adds a marker header to every response
struct TagResponses;

#[async_trait]
impl HttpHijacker for TagResponses {
  async fn hijack_response(
    &self,
    _is_tls: bool,
    _request: &http::Request<Bytes>,
    _response: &http::Response<Bytes>,
    raw: Bytes,
    _remote_addr: Option<SocketAddr>,
  ) -> Option<Bytes> {
    let Some(end) = raw.windows(2).position(|w| w == b"\r\n") else {
      return Some(raw);
    };
    let mut tagged = Vec::with_capacity(raw.len() + 32);
    tagged.extend_from_slice(&raw[..end + 2]);
    tagged.extend_from_slice(b"X-Mitm-Hijack: tagged\r\n");
    tagged.extend_from_slice(&raw[end + 2..]);
    Some(Bytes::from(tagged))
  }
}

/// Prints one line per finished exchange
struct PrintFlows;

#[async_trait]
impl FlowMirror for PrintFlows {
  async fn mirror(&self, flow: HttpFlow) {
    let status = flow
      .response
      .split(|b| *b == b'\r')
      .next()
      .map(|line| String::from_utf8_lossy(line).to_string())
      .unwrap_or_default();
    println!(
      "{} {} -> {}{}",
      if flow.is_tls { "[tls]" } else { "[tcp]" },
      flow.url,
      status,
      if flow.response_truncated { " (streamed)" } else { "" }
    );
  }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .init();

  let config = MitmConfig {
    ca_storage_path: std::path::PathBuf::from(".mitm-hijack"),
    hooks: Hooks {
      http: Some(Arc::new(TagResponses)),
      mirror: Some(Arc::new(PrintFlows)),
      ..Default::default()
    },
    ..Default::default()
  };
  let server = ProxyServer::builder().config(config).build().await?;

  println!("Starting MITM proxy on 127.0.0.1:8888");
  println!("CA certificate: {}", server.ca_cert_path().display());
  println!("Or browse to http://mitm.local/download-ca through the proxy\n");

  server.run("127.0.0.1:8888").await?;
  Ok(())
}
