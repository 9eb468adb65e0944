//! Explicit-proxy sessions
//!
//! A client configured to use the proxy sends absolute-form requests or opens a
//! `CONNECT` tunnel. Inside a tunnel the stream is classified again: TLS is terminated
//! with a forged leaf and the decrypted requests run through the same loop.

use crate::classify::{sniff, Classification};
use crate::control;
use crate::error::{Error, Result};
use crate::exchange::{
  bad_request, exchange, next_request, DialKey, Next, Route, UpstreamConn,
};
use crate::http1::{
  join_host_port, prepare_upstream_request, pretty_page, simple_response, split_host_port,
  wants_close, write_all_flush, RawRequest,
};
use crate::server::{ConnContext, Shared};
use crate::stream::{splice, unbuffer, BoxStream};
use crate::tls::{self, ALPN_H2};
use crate::transparent::{loopback_response, targets_listener};
use crate::upstream::basic_auth;
use crate::websocket;
use bytes::Bytes;
use http::header::{HOST, PROXY_AUTHORIZATION};
use http::{Method, StatusCode};
use std::net::SocketAddr;
use tokio::io::BufReader;
use tokio::net::TcpStream;

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Realm announced in `Proxy-Authenticate`
pub const PROXY_AUTH_REALM: &str = "mitm-hijack proxy";

/// How a session loop ended
enum SessionEnd {
  Closed,
  /// The client opened a tunnel; the stream now carries its bytes
  Connect(BoxStream, ConnContext),
}

/// Serve one accepted connection in explicit mode
pub(crate) async fn handle(shared: &Shared, stream: TcpStream, peer: SocketAddr) -> Result<()> {
  let mut ctx = ConnContext::new(peer, shared.listen_addr);
  let Some((class, stream)) = sniff(stream).await? else {
    return Ok(());
  };
  let end = match class {
    Classification::PlainHttp => session(shared, Box::new(stream), ctx, None).await?,
    Classification::Tls => {
      // TLS straight at the proxy: the SNI names the destination
      let fallback = shared.listen_addr.ip().to_string();
      let (stream, sni) = tls::accept(stream, &shared.certs, Some(&fallback)).await?;
      ctx.is_tls = true;
      ctx.sni = sni;
      session(shared, Box::new(stream), ctx, None).await?
    }
    Classification::Unknown => {
      tracing::debug!("[MITM] {} sent neither TLS nor HTTP, closing", peer);
      return Ok(());
    }
  };
  match end {
    SessionEnd::Closed => Ok(()),
    SessionEnd::Connect(stream, ctx) => tunnel(shared, stream, ctx).await,
  }
}

/// Classify the inside of a CONNECT tunnel and serve it
async fn tunnel(shared: &Shared, stream: BoxStream, mut ctx: ConnContext) -> Result<()> {
  let Some((host, port)) = ctx.connect_target.clone() else {
    return Err(Error::proxy_error("Tunnel without a CONNECT target"));
  };
  let Some((class, stream)) = sniff(stream).await? else {
    return Ok(());
  };
  let client: BoxStream = match class {
    Classification::PlainHttp => Box::new(stream),
    Classification::Unknown => {
      tracing::debug!(
        "[MITM] tunnel to {}:{} carries neither TLS nor HTTP, closing",
        host,
        port
      );
      return Ok(());
    }
    Classification::Tls => {
      let (start, hello) = tls::read_client_hello(stream).await?;
      let leaf_host = hello.sni.clone().unwrap_or_else(|| host.clone());
      ctx.is_tls = true;
      ctx.sni = hello.sni.clone();

      let mut pool = None;
      if shared.config.http2 && hello.offers(ALPN_H2) {
        match shared.dialer.dial(&host, port, true, true).await {
          Ok(upstream) if upstream.alpn.as_deref() == Some(ALPN_H2) => {
            let h2 = vec![ALPN_H2.to_vec()];
            let client = tls::complete_handshake(start, &shared.certs, &leaf_host, h2).await?;
            tracing::debug!(
              "[MITM] splicing h2 between {} and {}:{}",
              ctx.peer_addr,
              host,
              port
            );
            let (sent, received) = splice(client, upstream.stream).await;
            tracing::debug!(
              "[MITM] h2 tunnel to {}:{} closed ({} bytes up, {} down)",
              host,
              port,
              sent,
              received
            );
            return Ok(());
          }
          Ok(upstream) => {
            let key = DialKey {
              host: host.clone(),
              port,
              tls: true,
            };
            pool = Some(UpstreamConn::new(key, upstream));
          }
          Err(e) => tracing::debug!("[MITM] early dial to {}:{} failed: {}", host, port, e),
        }
      }
      let alpn = tls::select_alpn(&hello, false);
      let client = tls::complete_handshake(start, &shared.certs, &leaf_host, alpn).await?;
      // nested CONNECT is refused inside the session, so it always ends closed
      return session(shared, Box::new(client), ctx, pool).await.map(|_| ());
    }
  };
  session(shared, client, ctx, None).await.map(|_| ())
}

/// Serve requests on one client stream until it closes or turns into a tunnel
async fn session(
  shared: &Shared,
  stream: BoxStream,
  mut ctx: ConnContext,
  mut pool: Option<UpstreamConn>,
) -> Result<SessionEnd> {
  let mut client = BufReader::new(stream);
  loop {
    let Some(RawRequest { request, raw }) = next_request(shared, &mut client, false).await?
    else {
      tracing::debug!("[MITM] {} closed the connection", ctx.peer_addr);
      return Ok(SessionEnd::Closed);
    };
    tracing::debug!(
      "[MITM] {} -> {} {}",
      ctx.peer_addr,
      request.method(),
      request.uri()
    );

    if !authorize(shared, &mut ctx, &request) {
      tracing::info!("[MITM] {} failed proxy authentication", ctx.peer_addr);
      write_all_flush(client.get_mut(), &proxy_auth_required()).await?;
      return Ok(SessionEnd::Closed);
    }
    let close = wants_close(request.version(), request.headers());

    if request.method() == Method::CONNECT {
      if ctx.via_connect || ctx.is_tls {
        let refusal = bad_request("Nested CONNECT is not supported");
        write_all_flush(client.get_mut(), &refusal).await?;
        return Ok(SessionEnd::Closed);
      }
      let authority = request.uri().authority().map(|a| a.as_str()).unwrap_or_default();
      let (host, port) = match split_host_port(authority, None) {
        Ok(target) => target,
        Err(e) => {
          write_all_flush(client.get_mut(), &bad_request(&e.to_string())).await?;
          return Ok(SessionEnd::Closed);
        }
      };
      write_all_flush(client.get_mut(), CONNECT_ESTABLISHED).await?;
      tracing::debug!("[MITM] {} opened a tunnel to {}:{}", ctx.peer_addr, host, port);
      ctx.via_connect = true;
      ctx.connect_target = Some((host, port));
      return Ok(SessionEnd::Connect(unbuffer(client), ctx));
    }

    if let Some(host) = request_host(&request) {
      if control::is_control_host(&host) {
        let answer = control::respond(request.uri().path(), &shared.certs);
        write_all_flush(client.get_mut(), &answer).await?;
        if close {
          return Ok(SessionEnd::Closed);
        }
        continue;
      }
    }

    let origin_form = request.uri().scheme().is_none() && request.uri().authority().is_none();
    if origin_form && !ctx.via_connect && !ctx.is_tls {
      if let Some(webhook) = shared.config.hooks.webhook.clone() {
        let peer = ctx.peer_addr;
        tracing::debug!("[MITM] {} {} handed to the webhook", request.method(), request.uri());
        tokio::spawn(async move {
          webhook.receive(peer, request, raw).await;
        });
        let ok = simple_response(StatusCode::OK, &[], b"", close);
        write_all_flush(client.get_mut(), &ok).await?;
        if close {
          return Ok(SessionEnd::Closed);
        }
        continue;
      }
    }

    let prepared = match prepare_upstream_request(&raw) {
      Ok(prepared) => prepared,
      Err(e) => {
        write_all_flush(client.get_mut(), &bad_request(&e.to_string())).await?;
        return Ok(SessionEnd::Closed);
      }
    };
    let route = Route::Request {
      tls: ctx.is_tls,
      connect_target: ctx.connect_target.clone(),
      reuse_connect_target: shared.config.reuse_connect_target,
    };
    if let Ok(key) = route.resolve(&request) {
      if targets_listener(shared, &key.host, key.port).await {
        tracing::warn!(
          "[MITM] {} asked for {}, which is this proxy; answering locally",
          ctx.peer_addr,
          join_host_port(&key.host, key.port)
        );
        write_all_flush(client.get_mut(), &loopback_response()).await?;
        return Ok(SessionEnd::Closed);
      }
    }

    if websocket::is_upgrade_request(&request) {
      websocket::intercept(shared, client, &mut ctx, pool, request, prepared, &route).await?;
      return Ok(SessionEnd::Closed);
    }

    let next = exchange(
      shared,
      client.get_mut(),
      &mut ctx,
      &mut pool,
      request,
      prepared,
      &route,
    )
    .await?;
    if next == Next::Close {
      return Ok(SessionEnd::Closed);
    }
  }
}

/// Host named by the absolute URI or `Host`
fn request_host(request: &http::Request<Bytes>) -> Option<String> {
  if let Some(host) = request.uri().host() {
    return Some(host.to_string());
  }
  request
    .headers()
    .get(HOST)
    .and_then(|v| v.to_str().ok())
    .map(str::to_string)
}

/// Check `Proxy-Authorization` once per connection
fn authorize(shared: &Shared, ctx: &mut ConnContext, request: &http::Request<Bytes>) -> bool {
  let Some(auth) = &shared.config.proxy_auth else {
    return true;
  };
  if ctx.authenticated {
    return true;
  }
  let expected = basic_auth(&auth.username, &auth.password);
  let accepted = request
    .headers()
    .get(PROXY_AUTHORIZATION)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.trim().split_once(' '))
    .zip(expected.split_once(' '))
    .map(|((scheme, given), (_, wanted))| {
      scheme.eq_ignore_ascii_case("basic") && given.trim() == wanted
    })
    .unwrap_or(false);
  ctx.authenticated = accepted;
  accepted
}

fn proxy_auth_required() -> Bytes {
  let challenge = format!("Basic realm=\"{}\", charset=\"UTF-8\"", PROXY_AUTH_REALM);
  simple_response(
    StatusCode::PROXY_AUTHENTICATION_REQUIRED,
    &[
      ("Proxy-Authenticate", &challenge),
      ("Content-Type", "text/html; charset=utf-8"),
    ],
    pretty_page("Proxy Authentication Required", "Valid proxy credentials are required").as_bytes(),
    true,
  )
}
