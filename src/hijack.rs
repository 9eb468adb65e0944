//! Hijack and mirror hooks
//!
//! Hijackers sit on the live path and may replace or drop a message; mirrors observe
//! finished exchanges and can never influence them. Every hijack call runs behind
//! [`supervise`], so a panicking hook degrades to pass-through instead of taking the
//! connection worker down.
//!

use crate::error::{Error, Result};
use crate::http1::{pretty_page, simple_response};
use bytes::Bytes;
use http::StatusCode;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

/// Body of the page sent in place of a dropped response
pub const DROPPED_RESPONSE_MESSAGE: &str = "response dropped by user";
/// Body of the page sent in place of a dropped request
pub const DROPPED_REQUEST_MESSAGE: &str = "request dropped by user";

/// Request/response hijacking for HTTP exchanges.
///
/// Both methods default to identity. Returning `None` drops the message.
#[async_trait::async_trait]
pub trait HttpHijacker: Send + Sync {
  /// Called with the bytes about to be sent upstream
  async fn hijack_request(
    &self,
    _is_tls: bool,
    _request: &http::Request<Bytes>,
    raw: Bytes,
  ) -> Option<Bytes> {
    Some(raw)
  }

  /// Called with the bytes about to be sent to the client
  async fn hijack_response(
    &self,
    _is_tls: bool,
    _request: &http::Request<Bytes>,
    _response: &http::Response<Bytes>,
    raw: Bytes,
    _remote_addr: Option<SocketAddr>,
  ) -> Option<Bytes> {
    Some(raw)
  }
}

/// One finished request/response pair
#[derive(Debug, Clone)]
pub struct HttpFlow {
  pub is_tls: bool,
  /// `scheme://host[:port]/path` of the request
  pub url: String,
  pub request: Bytes,
  /// Response bytes; only the head when `response_truncated` is set
  pub response: Bytes,
  pub remote_addr: Option<SocketAddr>,
  /// The response exceeded the configured maximum and was streamed unhijacked
  pub response_truncated: bool,
}

/// Read-only observer of finished exchanges
#[async_trait::async_trait]
pub trait FlowMirror: Send + Sync {
  async fn mirror(&self, flow: HttpFlow);
}

/// Frame payload context handed to WebSocket hooks
#[derive(Debug, Clone)]
pub struct WebSocketContext {
  /// The upgrade request that opened the session
  pub upgrade_request: Arc<http::Request<Bytes>>,
  /// The `101` response that accepted it
  pub upgrade_response: Arc<http::Response<Bytes>>,
}

/// Payload hijacking for WebSocket data frames; defaults to identity
#[async_trait::async_trait]
pub trait WebSocketHijacker: Send + Sync {
  /// Client to server payloads
  async fn hijack_client_frame(&self, payload: Bytes, _ctx: &WebSocketContext) -> Bytes {
    payload
  }

  /// Server to client payloads
  async fn hijack_server_frame(&self, payload: Bytes, _ctx: &WebSocketContext) -> Bytes {
    payload
  }
}

/// Read-only observer of WebSocket data payloads
#[async_trait::async_trait]
pub trait WebSocketMirror: Send + Sync {
  async fn mirror_client_frame(&self, _payload: Bytes) {}

  async fn mirror_server_frame(&self, _payload: Bytes) {}
}

/// Receiver for requests that are not shaped like proxy traffic
#[async_trait::async_trait]
pub trait Webhook: Send + Sync {
  async fn receive(&self, peer: SocketAddr, request: http::Request<Bytes>, raw: Bytes);
}

/// The optional hooks of a proxy instance
#[derive(Clone, Default)]
pub struct Hooks {
  pub http: Option<Arc<dyn HttpHijacker>>,
  /// Sees each exchange after hijacking
  pub mirror: Option<Arc<dyn FlowMirror>>,
  /// Sees each exchange as it was before hijacking
  pub origin_mirror: Option<Arc<dyn FlowMirror>>,
  pub websocket: Option<Arc<dyn WebSocketHijacker>>,
  pub websocket_mirror: Option<Arc<dyn WebSocketMirror>>,
  pub webhook: Option<Arc<dyn Webhook>>,
}

impl Hooks {
  /// Whether anything needs structured access to HTTP exchanges
  pub fn wants_http(&self) -> bool {
    self.http.is_some() || self.mirror.is_some() || self.origin_mirror.is_some()
  }

  /// Whether upgraded WebSocket sessions need frame-level access
  pub fn wants_websocket(&self) -> bool {
    self.websocket.is_some() || self.websocket_mirror.is_some()
  }
}

impl std::fmt::Debug for Hooks {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Hooks")
      .field("http", &self.http.is_some())
      .field("mirror", &self.mirror.is_some())
      .field("origin_mirror", &self.origin_mirror.is_some())
      .field("websocket", &self.websocket.is_some())
      .field("websocket_mirror", &self.websocket_mirror.is_some())
      .field("webhook", &self.webhook.is_some())
      .finish()
  }
}

/// Outcome of running a message through a hijacker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
  /// Send these bytes; `modified` tells whether they differ from the origin
  Forward { bytes: Bytes, modified: bool },
  /// Send nothing; answer with a placeholder
  Dropped,
}

impl Verdict {
  /// Fold a supervised hook result into a verdict; panics keep the origin bytes
  pub(crate) fn from_hook(origin: Bytes, result: Result<Option<Bytes>>) -> Self {
    match result {
      Ok(Some(bytes)) => {
        let modified = bytes != origin;
        Verdict::Forward { bytes, modified }
      }
      Ok(None) => Verdict::Dropped,
      Err(_) => Verdict::Forward {
        bytes: origin,
        modified: false,
      },
    }
  }
}

/// Run a hook future on its own task and report a panic as an error.
pub async fn supervise<F, T>(what: &'static str, fut: F) -> Result<T>
where
  F: Future<Output = T> + Send + 'static,
  T: Send + 'static,
{
  match tokio::spawn(fut).await {
    Ok(value) => Ok(value),
    Err(e) if e.is_panic() => Err(Error::callback_panicked(format!("{} hook: {}", what, e))),
    Err(e) => Err(Error::other(format!("{} hook did not finish: {}", what, e))),
  }
}

/// Spawn a mirror call and forget it
pub(crate) fn spawn_mirror(mirror: &Option<Arc<dyn FlowMirror>>, flow: HttpFlow) {
  if let Some(mirror) = mirror {
    let mirror = mirror.clone();
    tokio::spawn(async move {
      mirror.mirror(flow).await;
    });
  }
}

pub(crate) async fn hijack_request(
  hooks: &Hooks,
  is_tls: bool,
  request: &http::Request<Bytes>,
  raw: Bytes,
) -> Verdict {
  let Some(hijacker) = hooks.http.clone() else {
    return Verdict::Forward {
      bytes: raw,
      modified: false,
    };
  };
  let request = request.clone();
  let origin = raw.clone();
  let result = supervise("request", async move {
    hijacker.hijack_request(is_tls, &request, raw).await
  })
  .await;
  Verdict::from_hook(origin, result)
}

pub(crate) async fn hijack_response(
  hooks: &Hooks,
  is_tls: bool,
  request: &http::Request<Bytes>,
  response: &http::Response<Bytes>,
  raw: Bytes,
  remote_addr: Option<SocketAddr>,
) -> Verdict {
  let Some(hijacker) = hooks.http.clone() else {
    return Verdict::Forward {
      bytes: raw,
      modified: false,
    };
  };
  let request = request.clone();
  let response = response.clone();
  let origin = raw.clone();
  let result = supervise("response", async move {
    hijacker
      .hijack_response(is_tls, &request, &response, raw, remote_addr)
      .await
  })
  .await;
  Verdict::from_hook(origin, result)
}

/// Placeholder sent when a response hijacker drops the response
pub fn dropped_response() -> Bytes {
  simple_response(
    StatusCode::OK,
    &[("Content-Type", "text/html; charset=utf-8")],
    pretty_page("MITM", DROPPED_RESPONSE_MESSAGE).as_bytes(),
    true,
  )
}

/// Placeholder sent when a request hijacker drops the request
pub fn dropped_request() -> Bytes {
  simple_response(
    StatusCode::OK,
    &[("Content-Type", "text/html; charset=utf-8")],
    pretty_page("MITM", DROPPED_REQUEST_MESSAGE).as_bytes(),
    true,
  )
}
