#![cfg_attr(docsrs, feature(doc_cfg))]

//! # mitm-hijack
//!
//! A man-in-the-middle intercepting proxy for HTTP/1.x, HTTPS and WebSocket traffic,
//! with byte-level hijack and mirror hooks.
//!
//! # Features
//!
//! - Root CA generated on first start and persisted; leaf certificates forged per host
//! - Explicit proxy mode (`CONNECT` and absolute-form requests) and transparent mode
//! - Request and response hijacking on the raw wire bytes, with drop support
//! - WebSocket frame mirroring and payload hijacking, including `permessage-deflate`
//! - SNI remapping, static host overrides and a DNS cache
//! - Chained upstream HTTP or SOCKS5 proxies and upstream client certificates
//!
//! # Example
//!
//! ```no_run
//! use mitm_hijack::{MitmConfig, ProxyServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let server = ProxyServer::builder()
//!     .config(MitmConfig::default())
//!     .build()
//!     .await?;
//!   println!("trust this root:\n{}", server.ca_cert_pem());
//!   server.run("127.0.0.1:8080").await?;
//!   Ok(())
//! }
//! ```
//!
//! ## Hijacking
//!
//! Implement [`HttpHijacker`] and put it in [`Hooks`]. Returning `None` drops the message
//! and the client gets a placeholder page instead.
//!
//! ```no_run
//! use bytes::Bytes;
//! use mitm_hijack::{HttpHijacker, Hooks, MitmConfig};
//! use std::net::SocketAddr;
//! use std::sync::Arc;
//!
//! struct Rewrite;
//!
//! #[async_trait::async_trait]
//! impl HttpHijacker for Rewrite {
//!   async fn hijack_response(
//!     &self,
//!     _is_tls: bool,
//!     _request: &http::Request<Bytes>,
//!     _response: &http::Response<Bytes>,
//!     raw: Bytes,
//!     _remote: Option<SocketAddr>,
//!   ) -> Option<Bytes> {
//!     Some(Bytes::from(String::from_utf8_lossy(&raw).replace("Example", "Hijacked")))
//!   }
//! }
//!
//! let config = MitmConfig {
//!   hooks: Hooks {
//!     http: Some(Arc::new(Rewrite)),
//!     ..Default::default()
//!   },
//!   ..Default::default()
//! };
//! ```

mod ca;
mod classify;
mod config;
mod control;
mod dns;
mod error;
mod exchange;
mod explicit;
mod hijack;
pub mod http1;
mod registry;
mod server;
mod sni;
mod stream;
mod tls;
mod transparent;
mod upstream;
pub mod websocket;

pub use ca::{CertificateManager, LeafCertificate, RootAuthority, CA_CERT_FILE, CA_KEY_FILE};
pub use classify::{sniff, Classification};
pub use config::{
  ClientCertificate, MitmConfig, ProxyAuth, ProxyMode, DEFAULT_MAX_CONTENT_LENGTH,
  DEFAULT_MAX_REQUEST_BODY,
};
pub use control::{is_control_host, CA_DOWNLOAD_NAME, CONTROL_HOSTS};
pub use dns::{default_dns_servers, DnsCache};
pub use error::{Error, Result};
pub use explicit::PROXY_AUTH_REALM;
pub use hijack::{
  dropped_request, dropped_response, supervise, FlowMirror, Hooks, HttpFlow, HttpHijacker,
  Verdict, WebSocketContext, WebSocketHijacker, WebSocketMirror, Webhook,
  DROPPED_REQUEST_MESSAGE, DROPPED_RESPONSE_MESSAGE,
};
pub use registry::ProxyRegistry;
pub use server::{ConnContext, ProxyServer, ProxyServerBuilder, ServerHandle};
pub use sni::{DomainGlob, SniResolver, SniResolverBuilder};
pub use stream::{AsyncStream, BoxStream, Rewind};
pub use transparent::LOOPBACK_MESSAGE;
pub use upstream::{basic_auth, Dialer, Upstream, UpstreamProxy};
