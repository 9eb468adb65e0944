//! WebSocket upgrade detection and frame interception
//!
//! After a successful `101 Switching Protocols` both connections are handed to
//! [`relay`], which runs one task per direction. In mirror mode frames are copied
//! byte for byte and completed messages are reported to the mirror; in hijack mode data
//! payloads are rewritten through the [`WebSocketHijacker`](crate::WebSocketHijacker).

pub mod frame;
mod relay;

pub use relay::{relay, RelayOptions};

use crate::error::Result;
use crate::exchange::{bad_request, hijack_outbound, upstream_failure, Route, UpstreamConn};
use crate::hijack::{
  dropped_response, hijack_response, spawn_mirror, HttpFlow, Verdict, WebSocketContext,
};
use crate::http1::{
  has_connection_token, join_host_port, read_response, write_all_flush, RawResponse,
  MAX_BODY_SIZE,
};
use crate::server::{ConnContext, Shared};
use crate::stream::{unbuffer, BoxStream};
use bytes::Bytes;
use http::header::{SEC_WEBSOCKET_EXTENSIONS, UPGRADE};
use http::{Method, StatusCode};
use std::sync::Arc;
use tokio::io::BufReader;

/// Whether `request` asks to switch to the WebSocket protocol
pub fn is_upgrade_request(request: &http::Request<Bytes>) -> bool {
  request.method() == Method::GET
    && has_connection_token(request.headers(), "upgrade")
    && request
      .headers()
      .get(UPGRADE)
      .and_then(|v| v.to_str().ok())
      .map(|v| v.trim().eq_ignore_ascii_case("websocket"))
      .unwrap_or(false)
}

/// Whether the handshake response accepted the upgrade
pub fn is_switching_protocols(response: &http::Response<Bytes>) -> bool {
  response.status() == StatusCode::SWITCHING_PROTOCOLS
}

/// Whether the accepted extensions include `permessage-deflate`
pub fn permessage_deflate(response: &http::Response<Bytes>) -> bool {
  response
    .headers()
    .get_all(SEC_WEBSOCKET_EXTENSIONS)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .any(|ext| {
      ext
        .split(';')
        .next()
        .map(|name| name.trim().eq_ignore_ascii_case("permessage-deflate"))
        .unwrap_or(false)
    })
}

/// Carry an upgrade request to the origin and, once it switches protocols, relay frames.
///
/// The handshake goes through the HTTP hooks like any other exchange. A kept-alive
/// connection in `pool` is used when it points at the same target; otherwise a fresh
/// one is dialed. The session ends with the WebSocket, or right after a refused upgrade.
pub(crate) async fn intercept(
  shared: &Shared,
  mut client: BufReader<BoxStream>,
  ctx: &mut ConnContext,
  pool: Option<UpstreamConn>,
  request: http::Request<Bytes>,
  prepared: Bytes,
  route: &Route,
) -> Result<()> {
  let hooks = &shared.config.hooks;
  let origin_request = prepared.clone();
  let Some((request, bytes)) =
    hijack_outbound(shared, client.get_mut(), ctx, request, prepared).await?
  else {
    return Ok(());
  };
  let key = match route.resolve(&request) {
    Ok(key) => key,
    Err(e) => return write_all_flush(client.get_mut(), &bad_request(&e.to_string())).await,
  };
  let url = key.url(&request);

  let mut upstream = match pool.filter(|c| c.key == key) {
    Some(conn) => conn,
    None => match shared.dialer.dial(&key.host, key.port, key.tls, false).await {
      Ok(upstream) => UpstreamConn::new(key.clone(), upstream),
      Err(e) => {
        return write_all_flush(client.get_mut(), &upstream_failure(&e, &key.host)).await;
      }
    },
  };
  ctx.remote_addr = upstream.remote_addr;
  write_all_flush(upstream.reader.get_mut(), &bytes).await?;
  let RawResponse { response, raw, .. } =
    match read_response(&mut upstream.reader, request.method(), MAX_BODY_SIZE).await {
      Ok(response) => response,
      Err(e) => {
        return write_all_flush(client.get_mut(), &upstream_failure(&e, &key.host)).await;
      }
    };

  let verdict = hijack_response(
    hooks,
    ctx.is_tls,
    &request,
    &response,
    raw.clone(),
    upstream.remote_addr,
  )
  .await;
  let flow = HttpFlow {
    is_tls: key.tls,
    url,
    request: origin_request,
    response: raw,
    remote_addr: upstream.remote_addr,
    response_truncated: false,
  };
  spawn_mirror(&hooks.origin_mirror, flow.clone());
  let out = match verdict {
    Verdict::Dropped => {
      write_all_flush(client.get_mut(), &dropped_response()).await?;
      return Ok(());
    }
    Verdict::Forward { bytes: out, .. } => out,
  };
  write_all_flush(client.get_mut(), &out).await?;
  spawn_mirror(
    &hooks.mirror,
    HttpFlow {
      request: bytes,
      response: out,
      ..flow
    },
  );

  if !is_switching_protocols(&response) {
    tracing::debug!(
      "[MITM] upgrade to {} refused with {}",
      join_host_port(&key.host, key.port),
      response.status()
    );
    return Ok(());
  }
  let options = RelayOptions {
    deflate: permessage_deflate(&response),
    hijack: shared.config.websocket_hijack,
    force_text: shared.config.websocket_force_text,
    max_message: frame::MAX_PAYLOAD as usize,
  };
  tracing::debug!(
    "[MITM] WebSocket to {} open (deflate: {}, hijack: {})",
    join_host_port(&key.host, key.port),
    options.deflate,
    options.hijack
  );
  let context = WebSocketContext {
    upgrade_request: Arc::new(request),
    upgrade_response: Arc::new(response),
  };
  relay(
    unbuffer(client),
    unbuffer(upstream.reader),
    context,
    hooks.clone(),
    options,
  )
  .await
}
