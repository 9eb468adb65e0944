//! Transparent MITM proxy
//!
//! Redirect traffic to the listener (for example with an iptables `REDIRECT` rule) and
//! the destination is taken from SNI or the `Host` header.
//!
//! To run:
//! ```bash
//! RUST_LOG=mitm_hijack=info cargo run --example transparent_proxy
//! ```

use mitm_hijack::{MitmConfig, ProxyMode, ProxyServer, SniResolver};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .init();

  // present a generic name to origins behind a shared front
  let sni = SniResolver::builder()
    .glob("*.internal.example", "gateway.example")
    .build()?;
  let config = MitmConfig {
    ca_storage_path: std::path::PathBuf::from(".mitm-hijack"),
    mode: ProxyMode::Transparent,
    sni,
    ..Default::default()
  };
  let server = ProxyServer::builder().config(config).build().await?;
  println!("CA certificate: {}", server.ca_cert_path().display());

  let handle = server.spawn("0.0.0.0:8443").await?;
  println!("Transparent proxy listening on {}", handle.local_addr());
  tokio::signal::ctrl_c().await?;
  handle.shutdown().await?;
  Ok(())
}
