//! One request/response round trip through the hijack hooks
//!
//! Shared by the explicit session and the transparent hijack loop. The caller has already
//! read the client request and stripped its hop-by-hop headers; everything from the
//! request hijack to the mirrors happens here.

use crate::error::{Error, Result};
use crate::hijack::{
  dropped_request, dropped_response, hijack_request, hijack_response, spawn_mirror, HttpFlow,
  Verdict,
};
use crate::http1::{
  default_port, join_host_port, parse_request_bytes, pretty_page, read_request,
  read_response_head, read_response_rest, response_framing, simple_response, split_authority,
  stream_body, wants_close, write_all_flush, Framing, RawRequest, RawResponse, ResponseHead,
  MAX_BODY_SIZE,
};
use crate::server::{ConnContext, Shared};
use crate::stream::BoxStream;
use crate::upstream::Upstream;
use bytes::{Bytes, BytesMut};
use http::header::HOST;
use http::{Method, StatusCode};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Where an exchange is dialed
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DialKey {
  pub(crate) host: String,
  pub(crate) port: u16,
  pub(crate) tls: bool,
}

impl DialKey {
  /// `scheme://host[:port]/path` for flow records
  pub(crate) fn url(&self, request: &http::Request<Bytes>) -> String {
    let scheme = if self.tls { "https" } else { "http" };
    let authority = if self.port == default_port(self.tls) {
      if self.host.contains(':') {
        format!("[{}]", self.host)
      } else {
        self.host.clone()
      }
    } else {
      join_host_port(&self.host, self.port)
    };
    let path = request
      .uri()
      .path_and_query()
      .map(|p| p.as_str())
      .unwrap_or("/");
    format!("{}://{}{}", scheme, authority, path)
  }
}

/// How the dial target of a request is chosen
#[derive(Debug, Clone)]
pub(crate) enum Route {
  /// From the absolute URI or `Host`, preferring the CONNECT target when it matches
  Request {
    tls: bool,
    connect_target: Option<(String, u16)>,
    reuse_connect_target: bool,
  },
  /// Always the same destination
  Fixed(DialKey),
}

impl Route {
  pub(crate) fn resolve(&self, request: &http::Request<Bytes>) -> Result<DialKey> {
    let (tls, connect_target, reuse) = match self {
      Route::Fixed(key) => return Ok(key.clone()),
      Route::Request {
        tls,
        connect_target,
        reuse_connect_target,
      } => (*tls, connect_target, *reuse_connect_target),
    };

    let uri = request.uri();
    if let (Some(scheme), Some(host)) = (uri.scheme_str(), uri.host()) {
      let tls = matches!(scheme, "https" | "wss");
      return Ok(DialKey {
        host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
        port: uri.port_u16().unwrap_or(default_port(tls)),
        tls,
      });
    }

    let host_header = request.headers().get(HOST).and_then(|v| v.to_str().ok());
    match (host_header, connect_target) {
      (Some(value), connect_target) => {
        let (host, port) = split_authority(value)?;
        if let Some((connect_host, connect_port)) = connect_target {
          let same_port = port.map(|p| p == *connect_port).unwrap_or(true);
          if reuse && same_port && host.eq_ignore_ascii_case(connect_host) {
            return Ok(DialKey {
              host: connect_host.clone(),
              port: *connect_port,
              tls,
            });
          }
        }
        Ok(DialKey {
          host,
          port: port.unwrap_or(default_port(tls)),
          tls,
        })
      }
      (None, Some((host, port))) => Ok(DialKey {
        host: host.clone(),
        port: *port,
        tls,
      }),
      (None, None) => Err(Error::invalid_request(format!(
        "Request for {} names no host",
        uri
      ))),
    }
  }
}

/// A kept-alive upstream connection and the target it was dialed for
pub(crate) struct UpstreamConn {
  pub(crate) key: DialKey,
  pub(crate) reader: BufReader<BoxStream>,
  pub(crate) remote_addr: Option<SocketAddr>,
}

impl UpstreamConn {
  pub(crate) fn new(key: DialKey, upstream: Upstream) -> Self {
    Self {
      key,
      reader: BufReader::new(upstream.stream),
      remote_addr: upstream.remote_addr,
    }
  }
}

/// What the session does after an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Next {
  KeepAlive,
  Close,
}

/// Run the request hijack, answering the client when the request is dropped.
///
/// Returns the request to route by and the bytes to send upstream.
pub(crate) async fn hijack_outbound<W>(
  shared: &Shared,
  client: &mut W,
  ctx: &ConnContext,
  request: http::Request<Bytes>,
  prepared: Bytes,
) -> Result<Option<(http::Request<Bytes>, Bytes)>>
where
  W: AsyncWrite + Unpin,
{
  match hijack_request(&shared.config.hooks, ctx.is_tls, &request, prepared).await {
    Verdict::Dropped => {
      tracing::debug!("[MITM] request {} {} dropped", request.method(), request.uri());
      write_all_flush(client, &dropped_request()).await?;
      Ok(None)
    }
    Verdict::Forward {
      bytes,
      modified: false,
    } => Ok(Some((request, bytes))),
    Verdict::Forward {
      bytes,
      modified: true,
    } => match parse_request_bytes(&bytes) {
      Ok(rewritten) => Ok(Some((rewritten, bytes))),
      Err(e) => {
        tracing::warn!(
          "[MITM] rewritten request does not parse, routing by the original: {}",
          e
        );
        Ok(Some((request, bytes)))
      }
    },
  }
}

/// Local answer for a failed dial or round trip
pub(crate) fn upstream_failure(err: &Error, host: &str) -> Bytes {
  let html = [("Content-Type", "text/html; charset=utf-8")];
  if err.is_dns() {
    return simple_response(
      StatusCode::OK,
      &html,
      pretty_page("MITM", &format!("Unknown host: {}", host)).as_bytes(),
      true,
    );
  }
  simple_response(
    StatusCode::BAD_GATEWAY,
    &html,
    pretty_page("Bad Gateway", &err.to_string()).as_bytes(),
    true,
  )
}

/// Local answer for a request the proxy cannot route
pub(crate) fn bad_request(message: &str) -> Bytes {
  simple_response(
    StatusCode::BAD_REQUEST,
    &[("Content-Type", "text/html; charset=utf-8")],
    pretty_page("Bad Request", message).as_bytes(),
    true,
  )
}

/// Local answer for a request body over the configured limit
pub(crate) fn payload_too_large(limit: usize) -> Bytes {
  simple_response(
    StatusCode::PAYLOAD_TOO_LARGE,
    &[("Content-Type", "text/html; charset=utf-8")],
    pretty_page(
      "Payload Too Large",
      &format!("Request bodies are limited to {} bytes", limit),
    )
    .as_bytes(),
    true,
  )
}

/// Read the next client request.
///
/// A body over the limit is answered with `413` and ends the session like a clean close.
pub(crate) async fn next_request<S>(
  shared: &Shared,
  client: &mut BufReader<S>,
  skip_junk: bool,
) -> Result<Option<RawRequest>>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let limit = shared.config.request_body_limit();
  match read_request(client, skip_junk, limit).await {
    Err(e) if e.is_payload_too_large() => {
      write_all_flush(client.get_mut(), &payload_too_large(limit)).await?;
      Ok(None)
    }
    other => other,
  }
}

/// Forward one prepared request and relay its response
pub(crate) async fn exchange<W>(
  shared: &Shared,
  client: &mut W,
  ctx: &mut ConnContext,
  pool: &mut Option<UpstreamConn>,
  request: http::Request<Bytes>,
  prepared: Bytes,
  route: &Route,
) -> Result<Next>
where
  W: AsyncWrite + Unpin,
{
  let hooks = &shared.config.hooks;
  let origin_request = prepared.clone();
  let Some((request, bytes)) = hijack_outbound(shared, client, ctx, request, prepared).await?
  else {
    return Ok(Next::Close);
  };

  let key = match route.resolve(&request) {
    Ok(key) => key,
    Err(e) => {
      write_all_flush(client, &bad_request(&e.to_string())).await?;
      return Ok(Next::Close);
    }
  };
  let url = key.url(&request);
  tracing::debug!("[MITM] {} {}", request.method(), url);

  let (head, raw_head) = match send(shared, pool, &key, request.method(), &bytes).await {
    Ok(response) => response,
    Err(e) => {
      *pool = None;
      tracing::warn!("[MITM] {} {} failed: {}", request.method(), url, e);
      write_all_flush(client, &upstream_failure(&e, &key.host)).await?;
      return Ok(Next::Close);
    }
  };
  let Some(conn) = pool.as_mut() else {
    return Err(Error::connection_error("Upstream connection vanished"));
  };
  let remote_addr = conn.remote_addr;
  ctx.remote_addr = remote_addr;
  ctx.response_truncated = false;

  let framing = response_framing(request.method(), head.status, &head.headers);
  let close = wants_close(request.version(), request.headers())
    || wants_close(head.version, &head.headers)
    || framing == Framing::UntilClose;

  if let Framing::Length(n) = framing {
    if shared.config.exceeds_content_limit(n) || n > MAX_BODY_SIZE as u64 {
      tracing::info!(
        "[MITM] response from {} is {} bytes, streaming it without hijack",
        url,
        n
      );
      let head_bytes = raw_head.freeze();
      write_all_flush(client, &head_bytes).await?;
      if let Err(e) = stream_body(&mut conn.reader, client, n).await {
        *pool = None;
        return Err(e);
      }
      client.flush().await?;
      ctx.response_truncated = true;
      let flow = HttpFlow {
        is_tls: key.tls,
        url,
        request: bytes,
        response: head_bytes,
        remote_addr,
        response_truncated: true,
      };
      spawn_mirror(
        &hooks.origin_mirror,
        HttpFlow {
          request: origin_request,
          ..flow.clone()
        },
      );
      spawn_mirror(&hooks.mirror, flow);
      return Ok(finish(pool, close));
    }
  }

  let RawResponse { response, raw, .. } =
    match read_response_rest(&mut conn.reader, request.method(), head, raw_head, MAX_BODY_SIZE)
      .await
    {
      Ok(response) => response,
      Err(e) => {
        *pool = None;
        tracing::warn!("[MITM] reading response from {} failed: {}", url, e);
        write_all_flush(client, &upstream_failure(&e, &key.host)).await?;
        return Ok(Next::Close);
      }
    };

  let verdict = hijack_response(
    hooks,
    ctx.is_tls,
    &request,
    &response,
    raw.clone(),
    remote_addr,
  )
  .await;
  let flow = HttpFlow {
    is_tls: key.tls,
    url,
    request: origin_request,
    response: raw,
    remote_addr,
    response_truncated: false,
  };
  spawn_mirror(&hooks.origin_mirror, flow.clone());

  match verdict {
    Verdict::Dropped => {
      tracing::debug!("[MITM] response from {} dropped", flow.url);
      let placeholder = dropped_response();
      write_all_flush(client, &placeholder).await?;
      spawn_mirror(
        &hooks.mirror,
        HttpFlow {
          request: bytes,
          response: placeholder,
          ..flow
        },
      );
      *pool = None;
      Ok(Next::Close)
    }
    Verdict::Forward { bytes: out, .. } => {
      write_all_flush(client, &out).await?;
      spawn_mirror(
        &hooks.mirror,
        HttpFlow {
          request: bytes,
          response: out,
          ..flow
        },
      );
      Ok(finish(pool, close))
    }
  }
}

fn finish(pool: &mut Option<UpstreamConn>, close: bool) -> Next {
  if close {
    *pool = None;
    Next::Close
  } else {
    Next::KeepAlive
  }
}

/// Send `bytes` on a pooled connection for `key`, or a fresh one, and read the final head.
///
/// A reused connection that fails is redialed once, unless the request may already have
/// reached the origin and `method` is not idempotent.
async fn send(
  shared: &Shared,
  pool: &mut Option<UpstreamConn>,
  key: &DialKey,
  method: &Method,
  bytes: &[u8],
) -> Result<(ResponseHead, BytesMut)> {
  if let Some(conn) = pool.as_mut().filter(|c| c.key == *key) {
    let failure = match write_all_flush(conn.reader.get_mut(), bytes).await {
      Err(e) => e,
      Ok(()) => match read_final_head(conn).await {
        Ok(response) => return Ok(response),
        Err(e) if !is_idempotent(method) => {
          tracing::debug!(
            "[MITM] kept-alive connection to {}:{} failed after sending {} ({}), not retrying",
            key.host,
            key.port,
            method,
            e
          );
          *pool = None;
          return Err(e);
        }
        Err(e) => e,
      },
    };
    tracing::debug!(
      "[MITM] kept-alive connection to {}:{} failed ({}), redialing",
      key.host,
      key.port,
      failure
    );
  }
  *pool = None;
  let upstream = shared
    .dialer
    .dial(&key.host, key.port, key.tls, false)
    .await?;
  let conn = pool.insert(UpstreamConn::new(key.clone(), upstream));
  write_all_flush(conn.reader.get_mut(), bytes).await?;
  read_final_head(conn).await
}

/// Methods that are safe to send twice
fn is_idempotent(method: &Method) -> bool {
  matches!(
    *method,
    Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS | Method::TRACE
  )
}

async fn read_final_head(conn: &mut UpstreamConn) -> Result<(ResponseHead, BytesMut)> {
  loop {
    let (head, raw) = read_response_head(&mut conn.reader).await?;
    // interim responses; the request body was already sent in full
    if head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
      continue;
    }
    return Ok((head, raw));
  }
}
