//! Transparent tunnel
//!
//! Connections arrive without any proxy framing; the destination is the TLS SNI, or the
//! `Host` of the first request. With no HTTP or WebSocket hooks configured the tunnel is a
//! pure byte relay after the first request; otherwise every exchange goes through the
//! hijack loop.

use crate::classify::{sniff, Classification};
use crate::control;
use crate::error::{Error, Result};
use crate::exchange::{exchange, next_request, DialKey, Next, Route, UpstreamConn};
use crate::http1::{
  default_port, prepare_upstream_request, pretty_page, simple_response, split_authority,
  write_all_flush, RawRequest,
};
use crate::server::{ConnContext, Shared};
use crate::stream::{splice, unbuffer, BoxStream};
use crate::tls;
use crate::websocket;
use bytes::Bytes;
use http::header::HOST;
use http::StatusCode;
use std::net::{IpAddr, SocketAddr};
use tokio::io::BufReader;
use tokio::net::TcpStream;

/// Body of the answer given to requests that would loop back into the proxy
pub const LOOPBACK_MESSAGE: &str = "mitm-hijack transparent proxy is running";

/// Serve one accepted connection in transparent mode
pub(crate) async fn handle(shared: &Shared, stream: TcpStream, peer: SocketAddr) -> Result<()> {
  let mut ctx = ConnContext::new(peer, shared.listen_addr);
  let Some((class, stream)) = sniff(stream).await? else {
    return Ok(());
  };
  let client: BoxStream = match class {
    Classification::PlainHttp => Box::new(stream),
    Classification::Tls => {
      let (start, hello) = tls::read_client_hello(stream).await?;
      // without SNI the leaf is forged for the listen address
      let leaf_host = hello
        .sni
        .clone()
        .unwrap_or_else(|| shared.listen_addr.ip().to_string());
      let alpn = tls::select_alpn(&hello, false);
      let stream = tls::complete_handshake(start, &shared.certs, &leaf_host, alpn).await?;
      ctx.is_tls = true;
      ctx.sni = hello.sni;
      Box::new(stream)
    }
    Classification::Unknown => {
      tracing::debug!("[MITM] {} sent neither TLS nor HTTP, closing", peer);
      return Ok(());
    }
  };

  let mut client = BufReader::new(client);
  let Some(RawRequest { request, raw }) = next_request(shared, &mut client, true).await?
  else {
    return Ok(());
  };

  let host_header = request
    .headers()
    .get(HOST)
    .and_then(|v| v.to_str().ok())
    .map(split_authority)
    .transpose()?;
  let host = match (&ctx.sni, &host_header) {
    (Some(sni), _) => sni.clone(),
    (None, Some((host, _))) => host.clone(),
    (None, None) => {
      return Err(Error::invalid_request(format!(
        "No SNI and no Host header from {}",
        peer
      )))
    }
  };
  let port = host_header
    .and_then(|(_, port)| port)
    .unwrap_or(default_port(ctx.is_tls));

  if control::is_control_host(&host) {
    let answer = control::respond(request.uri().path(), &shared.certs);
    return write_all_flush(client.get_mut(), &answer).await;
  }

  let ip = shared.dialer.dns().resolve(&host).await?;
  let target = SocketAddr::new(ip, port);
  if loops_back(target, shared.listen_addr) {
    tracing::warn!(
      "[MITM] {} asked for {} ({}), which is this proxy; answering locally",
      peer,
      host,
      target
    );
    return write_all_flush(client.get_mut(), &loopback_response()).await;
  }

  let upstream = shared.dialer.dial(&host, port, ctx.is_tls, false).await?;
  ctx.remote_addr = upstream.remote_addr;
  tracing::debug!("[MITM] {} tunneled to {}:{} ({})", peer, host, port, target);

  let hooks = &shared.config.hooks;
  if !hooks.wants_http() && !hooks.wants_websocket() {
    let mut upstream = upstream.stream;
    write_all_flush(&mut upstream, &raw).await?;
    let (sent, received) = splice(unbuffer(client), upstream).await;
    tracing::debug!(
      "[MITM] relay {} <-> {}:{} closed ({} bytes up, {} down)",
      peer,
      host,
      port,
      sent + raw.len() as u64,
      received
    );
    return Ok(());
  }

  let key = DialKey {
    host,
    port,
    tls: ctx.is_tls,
  };
  let route = Route::Fixed(key.clone());
  let mut pool = Some(UpstreamConn::new(key, upstream));
  let mut next = Some((request, raw));
  while let Some((request, raw)) = next.take() {
    let prepared = prepare_upstream_request(&raw)?;
    if websocket::is_upgrade_request(&request) {
      return websocket::intercept(shared, client, &mut ctx, pool, request, prepared, &route).await;
    }
    let outcome = exchange(
      shared,
      client.get_mut(),
      &mut ctx,
      &mut pool,
      request,
      prepared,
      &route,
    )
    .await?;
    if outcome == Next::Close {
      break;
    }
    next = next_request(shared, &mut client, true)
      .await?
      .map(|r| (r.request, r.raw));
  }
  Ok(())
}

/// Whether a direct dial to `host:port` would reach this proxy's own listener.
///
/// Unresolvable hosts are left for the dial to report.
pub(crate) async fn targets_listener(shared: &Shared, host: &str, port: u16) -> bool {
  if shared.dialer.uses_proxy() {
    return false;
  }
  match shared.dialer.dns().resolve(host).await {
    Ok(ip) => loops_back(SocketAddr::new(ip, port), shared.listen_addr),
    Err(_) => false,
  }
}

/// Whether dialing `target` would connect back to the listener
pub(crate) fn loops_back(target: SocketAddr, listen_addr: SocketAddr) -> bool {
  if target == listen_addr {
    return true;
  }
  if target.port() != listen_addr.port() || !listen_addr.ip().is_unspecified() {
    return false;
  }
  is_local_ip(target.ip())
}

/// Whether `ip` belongs to this host
fn is_local_ip(ip: IpAddr) -> bool {
  if ip.is_loopback() || ip.is_unspecified() {
    return true;
  }
  // binding succeeds only for addresses assigned to a local interface
  std::net::UdpSocket::bind(SocketAddr::new(ip, 0)).is_ok()
}

pub(crate) fn loopback_response() -> Bytes {
  simple_response(
    StatusCode::OK,
    &[("Content-Type", "text/html; charset=utf-8")],
    pretty_page("MITM", LOOPBACK_MESSAGE).as_bytes(),
    true,
  )
}
