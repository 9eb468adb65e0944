//! HTTP/1.x message reading and rewriting
//!
//! Messages are read from a buffered stream together with their exact wire bytes, so
//! that hijack callbacks see what was actually sent and pass-through stays byte exact.
//! The parsed [`http::Request`]/[`http::Response`] views carry decoded bodies.
//!

use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a request or response head
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Largest body ever buffered, whatever the configured limits say
pub const MAX_BODY_SIZE: usize = 256 * 1024 * 1024;

/// Buffer preallocated for a declared length; the rest grows as bytes arrive
const BODY_PREALLOC: usize = 64 * 1024;

const CR_LF: &[u8] = b"\r\n";

/// Headers that never travel past this proxy
const HOP_BY_HOP: &[&str] = &[
  "proxy-connection",
  "proxy-authorization",
  "proxy-authenticate",
  "keep-alive",
  "te",
  "trailer",
];

/// How the length of a message body is determined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
  /// No body
  Empty,
  /// `Content-Length` bytes
  Length(u64),
  /// `Transfer-Encoding: chunked`
  Chunked,
  /// Everything until the peer closes
  UntilClose,
}

/// Request line and headers
#[derive(Debug, Clone)]
pub struct RequestHead {
  pub method: Method,
  pub target: String,
  pub version: Version,
  pub headers: HeaderMap,
}

/// Status line and headers
#[derive(Debug, Clone)]
pub struct ResponseHead {
  pub version: Version,
  pub status: StatusCode,
  pub headers: HeaderMap,
}

/// A request read off the wire
#[derive(Debug, Clone)]
pub struct RawRequest {
  /// Parsed view, body de-chunked
  pub request: http::Request<Bytes>,
  /// Exact bytes received
  pub raw: Bytes,
}

/// A response read off the wire
#[derive(Debug, Clone)]
pub struct RawResponse {
  /// Parsed view, body de-chunked
  pub response: http::Response<Bytes>,
  /// Exact bytes received
  pub raw: Bytes,
  pub framing: Framing,
}

/// Where a request-target points
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
  /// `/path?query`
  Origin,
  /// `scheme://host[:port]/path`
  Absolute {
    tls: bool,
    host: String,
    port: u16,
    path: String,
  },
  /// `host:port`, only valid for CONNECT
  Authority { host: String, port: u16 },
}

/// Read a message head (start line through the blank line).
///
/// Blank lines before the start line are skipped. With `skip_junk`, any leading bytes
/// that are not ASCII letters are discarded as well. `None` means the stream ended
/// cleanly before a message began.
pub async fn read_head<R>(reader: &mut R, skip_junk: bool) -> Result<Option<BytesMut>>
where
  R: AsyncBufRead + Unpin,
{
  loop {
    let buf = reader.fill_buf().await?;
    if buf.is_empty() {
      return Ok(None);
    }
    let skip = buf
      .iter()
      .take_while(|b| {
        if skip_junk {
          !b.is_ascii_alphabetic()
        } else {
          **b == b'\r' || **b == b'\n'
        }
      })
      .count();
    if skip == 0 {
      break;
    }
    reader.consume(skip);
  }

  let mut head = BytesMut::with_capacity(1024);
  let mut line = Vec::with_capacity(256);
  loop {
    line.clear();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
      return Err(Error::invalid_request("Connection closed inside message head"));
    }
    head.extend_from_slice(&line);
    if head.len() > MAX_HEAD_SIZE {
      return Err(Error::invalid_request("Message head exceeds maximum allowed size"));
    }
    if line == CR_LF || line == b"\n" {
      return Ok(Some(head));
    }
  }
}

fn head_lines(head: &[u8]) -> impl Iterator<Item = &[u8]> {
  head
    .split(|b| *b == b'\n')
    .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
}

pub(crate) fn parser_headers<'a>(lines: impl Iterator<Item = &'a [u8]>) -> HeaderMap {
  let mut headers = HeaderMap::new();
  for line in lines {
    if line.is_empty() {
      break;
    }
    let Some(idx) = line.iter().position(|b| *b == b':') else {
      continue;
    };
    let (name, value) = line.split_at(idx);
    let value = trim_ascii(&value[1..]);
    if let (Ok(k), Ok(v)) = (
      HeaderName::from_bytes(trim_ascii(name)),
      HeaderValue::from_bytes(value),
    ) {
      headers.append(k, v);
    }
  }
  headers
}

fn trim_ascii(mut b: &[u8]) -> &[u8] {
  while let [first, rest @ ..] = b {
    if first.is_ascii_whitespace() {
      b = rest;
    } else {
      break;
    }
  }
  while let [rest @ .., last] = b {
    if last.is_ascii_whitespace() {
      b = rest;
    } else {
      break;
    }
  }
  b
}

fn parse_version(v: &[u8]) -> Result<Version> {
  match v {
    b"HTTP/1.1" => Ok(Version::HTTP_11),
    b"HTTP/1.0" => Ok(Version::HTTP_10),
    b"HTTP/0.9" => Ok(Version::HTTP_09),
    _ => Err(Error::invalid_request(format!(
      "Unsupported HTTP version: {}",
      String::from_utf8_lossy(v)
    ))),
  }
}

/// Parse a request head
pub fn parse_request_head(head: &[u8]) -> Result<RequestHead> {
  let mut lines = head_lines(head);
  let request_line = lines
    .next()
    .ok_or_else(|| Error::invalid_request("Empty request"))?;
  let parts: Vec<&[u8]> = request_line
    .split(|b| *b == b' ')
    .filter(|p| !p.is_empty())
    .collect();
  if parts.len() != 3 {
    return Err(Error::invalid_request(format!(
      "Invalid request line: {}",
      String::from_utf8_lossy(request_line)
    )));
  }
  let method = Method::from_bytes(parts[0])
    .map_err(|e| Error::invalid_request(format!("Invalid method: {}", e)))?;
  let target = String::from_utf8(parts[1].to_vec())
    .map_err(|_| Error::invalid_request("Request target is not UTF-8"))?;
  let version = parse_version(parts[2])?;
  Ok(RequestHead {
    method,
    target,
    version,
    headers: parser_headers(lines),
  })
}

/// Parse a response head
pub fn parse_response_head(head: &[u8]) -> Result<ResponseHead> {
  let mut lines = head_lines(head);
  let status_line = lines
    .next()
    .ok_or_else(|| Error::invalid_request("Empty response"))?;
  let mut parts = status_line.splitn(3, |b| *b == b' ');
  let version = parse_version(parts.next().unwrap_or_default())?;
  let status = parts
    .next()
    .and_then(|s| StatusCode::from_bytes(s).ok())
    .ok_or_else(|| {
      Error::invalid_request(format!(
        "Invalid status line: {}",
        String::from_utf8_lossy(status_line)
      ))
    })?;
  Ok(ResponseHead {
    version,
    status,
    headers: parser_headers(lines),
  })
}

fn is_chunked(headers: &HeaderMap) -> bool {
  headers
    .get_all(TRANSFER_ENCODING)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .last()
    .map(|v| v.trim().eq_ignore_ascii_case("chunked"))
    .unwrap_or(false)
}

/// Declared `Content-Length`, if any and well formed
pub fn content_length(headers: &HeaderMap) -> Option<u64> {
  headers
    .get(CONTENT_LENGTH)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.trim().parse().ok())
}

/// Body framing of a request
pub fn request_framing(headers: &HeaderMap) -> Framing {
  if is_chunked(headers) {
    Framing::Chunked
  } else {
    match content_length(headers) {
      Some(0) | None => Framing::Empty,
      Some(n) => Framing::Length(n),
    }
  }
}

/// Body framing of a response to a `method` request
pub fn response_framing(method: &Method, status: StatusCode, headers: &HeaderMap) -> Framing {
  if method == Method::HEAD
    || status.is_informational()
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED
  {
    return Framing::Empty;
  }
  if is_chunked(headers) {
    return Framing::Chunked;
  }
  match content_length(headers) {
    Some(0) => Framing::Empty,
    Some(n) => Framing::Length(n),
    None => Framing::UntilClose,
  }
}

/// Clamp a configured body limit; 0 means [`MAX_BODY_SIZE`]
pub fn body_limit(configured: usize) -> usize {
  if configured == 0 {
    MAX_BODY_SIZE
  } else {
    configured.min(MAX_BODY_SIZE)
  }
}

fn too_large(limit: usize) -> Error {
  Error::payload_too_large(format!("Body exceeds {} bytes", limit))
}

/// Read up to `n` bytes into `body`; fewer means the peer closed early
async fn read_up_to<R>(reader: &mut R, n: u64, body: &mut Vec<u8>) -> Result<u64>
where
  R: AsyncBufRead + Unpin,
{
  let read = (&mut *reader).take(n).read_to_end(body).await?;
  Ok(read as u64)
}

/// Read a body according to `framing`, appending its wire bytes to `raw`.
///
/// Returns the decoded body. Bodies over `limit` bytes fail with
/// [`Error::PayloadTooLarge`] before they are buffered.
pub async fn read_body<R>(
  reader: &mut R,
  framing: Framing,
  raw: &mut BytesMut,
  limit: usize,
) -> Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  let limit = body_limit(limit);
  match framing {
    Framing::Empty => Ok(Bytes::new()),
    Framing::Length(n) => {
      if n > limit as u64 {
        return Err(too_large(limit));
      }
      let mut body = Vec::with_capacity((n as usize).min(BODY_PREALLOC));
      if read_up_to(reader, n, &mut body).await? != n {
        return Err(Error::connection_error("Peer closed inside message body"));
      }
      raw.extend_from_slice(&body);
      Ok(Bytes::from(body))
    }
    Framing::Chunked => read_chunked_body(reader, raw, limit).await,
    Framing::UntilClose => {
      let mut body = Vec::new();
      if read_up_to(reader, limit as u64 + 1, &mut body).await? > limit as u64 {
        return Err(too_large(limit));
      }
      raw.extend_from_slice(&body);
      Ok(Bytes::from(body))
    }
  }
}

async fn read_chunked_body<R>(reader: &mut R, raw: &mut BytesMut, limit: usize) -> Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  let mut body = BytesMut::new();
  let mut line = Vec::with_capacity(32);
  loop {
    line.clear();
    if reader.read_until(b'\n', &mut line).await? == 0 {
      return Err(Error::invalid_request("Connection closed inside chunked body"));
    }
    raw.extend_from_slice(&line);
    let size_text = String::from_utf8_lossy(trim_ascii(&line));
    let size_text = size_text.split(';').next().unwrap_or_default().trim();
    let size = usize::from_str_radix(size_text, 16)
      .map_err(|_| Error::invalid_request(format!("Invalid chunk size: {}", size_text)))?;
    if size == 0 {
      // trailers, terminated by an empty line
      loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
          return Ok(body.freeze());
        }
        raw.extend_from_slice(&line);
        if line == CR_LF || line == b"\n" {
          return Ok(body.freeze());
        }
      }
    }
    if size > limit - body.len() {
      return Err(too_large(limit));
    }
    let mut chunk = Vec::with_capacity(size.min(BODY_PREALLOC));
    if read_up_to(reader, size as u64, &mut chunk).await? != size as u64 {
      return Err(Error::connection_error("Peer closed inside chunked body"));
    }
    raw.extend_from_slice(&chunk);
    body.extend_from_slice(&chunk);
    line.clear();
    reader.read_until(b'\n', &mut line).await?;
    raw.extend_from_slice(&line);
  }
}

fn build_request(head: RequestHead, body: Bytes) -> Result<http::Request<Bytes>> {
  let uri: Uri = head
    .target
    .parse()
    .map_err(|e| Error::invalid_request(format!("Invalid request target {}: {}", head.target, e)))?;
  let mut request = http::Request::new(body);
  *request.method_mut() = head.method;
  *request.uri_mut() = uri;
  *request.version_mut() = head.version;
  *request.headers_mut() = head.headers;
  Ok(request)
}

fn build_response(head: ResponseHead, body: Bytes) -> http::Response<Bytes> {
  let mut response = http::Response::new(body);
  *response.status_mut() = head.status;
  *response.version_mut() = head.version;
  *response.headers_mut() = head.headers;
  response
}

/// Read one complete request. `None` on clean EOF between messages.
///
/// A body over `limit` bytes fails with [`Error::PayloadTooLarge`].
pub async fn read_request<R>(
  reader: &mut R,
  skip_junk: bool,
  limit: usize,
) -> Result<Option<RawRequest>>
where
  R: AsyncBufRead + Unpin,
{
  let Some(mut raw) = read_head(reader, skip_junk).await? else {
    return Ok(None);
  };
  let head = parse_request_head(&raw)?;
  let framing = if head.method == Method::CONNECT {
    Framing::Empty
  } else {
    request_framing(&head.headers)
  };
  let body = read_body(reader, framing, &mut raw, limit).await?;
  Ok(Some(RawRequest {
    request: build_request(head, body)?,
    raw: raw.freeze(),
  }))
}

/// Read the head of a response. Interim `100 Continue` heads are returned like any other.
pub async fn read_response_head<R>(reader: &mut R) -> Result<(ResponseHead, BytesMut)>
where
  R: AsyncBufRead + Unpin,
{
  let raw = read_head(reader, false)
    .await?
    .ok_or_else(|| Error::connection_error("Upstream closed before sending a response"))?;
  let head = parse_response_head(&raw)?;
  Ok((head, raw))
}

/// Read one complete response to a `method` request
pub async fn read_response<R>(reader: &mut R, method: &Method, limit: usize) -> Result<RawResponse>
where
  R: AsyncBufRead + Unpin,
{
  let (head, mut raw) = read_response_head(reader).await?;
  let framing = response_framing(method, head.status, &head.headers);
  let body = read_body(reader, framing, &mut raw, limit).await?;
  Ok(RawResponse {
    response: build_response(head, body),
    raw: raw.freeze(),
    framing,
  })
}

/// Finish a response whose head was read separately
pub async fn read_response_rest<R>(
  reader: &mut R,
  method: &Method,
  head: ResponseHead,
  mut raw: BytesMut,
  limit: usize,
) -> Result<RawResponse>
where
  R: AsyncBufRead + Unpin,
{
  let framing = response_framing(method, head.status, &head.headers);
  let body = read_body(reader, framing, &mut raw, limit).await?;
  Ok(RawResponse {
    response: build_response(head, body),
    raw: raw.freeze(),
    framing,
  })
}

/// Copy exactly `n` body bytes from `reader` to `writer` without buffering them
pub async fn stream_body<R, W>(reader: &mut R, writer: &mut W, n: u64) -> Result<()>
where
  R: AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut limited = reader.take(n);
  let copied = tokio::io::copy_buf(&mut limited, writer).await?;
  if copied != n {
    return Err(Error::connection_error("Upstream closed inside response body"));
  }
  Ok(())
}

fn split_head(raw: &[u8]) -> Option<(&[u8], &[u8])> {
  if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
    return Some(raw.split_at(pos + 4));
  }
  raw
    .windows(2)
    .position(|w| w == b"\n\n")
    .map(|pos| raw.split_at(pos + 2))
}

/// Parse request bytes handed back by a hijack callback.
///
/// Everything after the head is taken as the body verbatim; the declared framing is not
/// enforced since callbacks often edit bodies without fixing lengths.
pub fn parse_request_bytes(raw: &[u8]) -> Result<http::Request<Bytes>> {
  let (head, body) =
    split_head(raw).ok_or_else(|| Error::invalid_request("Request bytes have no complete head"))?;
  build_request(parse_request_head(head)?, Bytes::copy_from_slice(body))
}

/// Classify a request-target
pub fn parse_target(method: &Method, target: &str) -> Result<Target> {
  if target.starts_with('/') || target == "*" {
    return Ok(Target::Origin);
  }
  if method == Method::CONNECT {
    let (host, port) = split_host_port(target, None)?;
    return Ok(Target::Authority { host, port });
  }
  let uri: Uri = target
    .parse()
    .map_err(|e| Error::invalid_request(format!("Invalid request target {}: {}", target, e)))?;
  let tls = match uri.scheme_str().map(|s| s.to_ascii_lowercase()) {
    Some(s) if s == "https" || s == "wss" => true,
    Some(s) if s == "http" || s == "ws" => false,
    _ => {
      return Err(Error::invalid_request(format!(
        "Unsupported request target: {}",
        target
      )))
    }
  };
  let authority = uri
    .authority()
    .ok_or_else(|| Error::invalid_request(format!("No host in request target: {}", target)))?;
  let (host, port) = split_host_port(authority.as_str(), Some(default_port(tls)))?;
  let path = uri
    .path_and_query()
    .map(|p| p.as_str().to_string())
    .filter(|p| !p.is_empty())
    .unwrap_or_else(|| "/".to_string());
  Ok(Target::Absolute {
    tls,
    host,
    port,
    path,
  })
}

/// Default port of the HTTP scheme
pub fn default_port(tls: bool) -> u16 {
  if tls {
    443
  } else {
    80
  }
}

/// Split `host[:port]`, accepting bracketed IPv6 literals.
///
/// Without a port, `default` is used; with no default either, a port is required.
pub fn split_host_port(authority: &str, default: Option<u16>) -> Result<(String, u16)> {
  let (host, port) = split_authority(authority)?;
  let port = match port.or(default) {
    Some(p) => p,
    None => return Err(Error::invalid_request(format!("Missing port in {}", authority))),
  };
  Ok((host, port))
}

/// Split `host[:port]` leaving a missing port as `None`
pub fn split_authority(authority: &str) -> Result<(String, Option<u16>)> {
  let authority = authority.rsplit('@').next().unwrap_or(authority).trim();
  let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
    let end = rest
      .find(']')
      .ok_or_else(|| Error::invalid_request(format!("Invalid authority: {}", authority)))?;
    let host = &rest[..end];
    let port = rest[end + 1..].strip_prefix(':');
    (host, port)
  } else if authority.matches(':').count() > 1 {
    // bare IPv6 literal
    (authority, None)
  } else {
    match authority.split_once(':') {
      Some((h, p)) => (h, Some(p)),
      None => (authority, None),
    }
  };
  if host.is_empty() {
    return Err(Error::invalid_request(format!("Empty host in {}", authority)));
  }
  let port = port
    .map(|p| {
      p.parse::<u16>()
        .map_err(|_| Error::invalid_request(format!("Invalid port: {}", p)))
    })
    .transpose()?;
  Ok((host.to_string(), port))
}

/// Format `host:port`, bracketing IPv6 literals
pub fn join_host_port(host: &str, port: u16) -> String {
  if host.contains(':') {
    format!("[{}]:{}", host, port)
  } else {
    format!("{}:{}", host, port)
  }
}

/// Whether the `Connection` header lists `token`
pub fn has_connection_token(headers: &HeaderMap, token: &str) -> bool {
  headers
    .get_all(CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Whether a message with these headers ends its connection
pub fn wants_close(version: Version, headers: &HeaderMap) -> bool {
  if has_connection_token(headers, "close") {
    return true;
  }
  version == Version::HTTP_10 && !has_connection_token(headers, "keep-alive")
}

/// Rewrite a client request for the upstream leg.
///
/// An absolute-form target becomes origin-form (adding `Host` if it is missing), and
/// hop-by-hop headers are removed: the fixed set plus anything named in `Connection`,
/// except `close`, `keep-alive` and `upgrade`. Everything else is kept byte for byte.
pub fn prepare_upstream_request(raw: &[u8]) -> Result<Bytes> {
  let (head, body) =
    split_head(raw).ok_or_else(|| Error::invalid_request("Request bytes have no complete head"))?;
  let parsed = parse_request_head(head)?;

  let mut strip: Vec<String> = HOP_BY_HOP.iter().map(|s| s.to_string()).collect();
  for token in parsed
    .headers
    .get_all(CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
  {
    let token = token.trim().to_ascii_lowercase();
    if !token.is_empty() && !matches!(token.as_str(), "close" | "keep-alive" | "upgrade") {
      strip.push(token);
    }
  }

  let mut out = BytesMut::with_capacity(raw.len());
  let mut lines = head.split_inclusive(|b| *b == b'\n');
  let request_line = lines.next().unwrap_or_default();
  let mut add_host = None;
  match parse_target(&parsed.method, &parsed.target)? {
    Target::Absolute {
      tls,
      host,
      port,
      path,
    } => {
      out.put_slice(parsed.method.as_str().as_bytes());
      out.put_u8(b' ');
      out.put_slice(path.as_bytes());
      out.put_u8(b' ');
      out.put_slice(version_str(parsed.version).as_bytes());
      out.put_slice(CR_LF);
      if !parsed.headers.contains_key(HOST) {
        add_host = Some(if port == default_port(tls) {
          host_for_header(&host)
        } else {
          join_host_port(&host, port)
        });
      }
    }
    _ => out.put_slice(request_line),
  }
  if let Some(host) = add_host {
    out.put_slice(b"Host: ");
    out.put_slice(host.as_bytes());
    out.put_slice(CR_LF);
  }
  for line in lines {
    let trimmed = line.strip_suffix(b"\n").unwrap_or(line);
    let trimmed = trimmed.strip_suffix(b"\r").unwrap_or(trimmed);
    if !trimmed.is_empty() {
      if let Some(idx) = trimmed.iter().position(|b| *b == b':') {
        let name = String::from_utf8_lossy(trim_ascii(&trimmed[..idx])).to_ascii_lowercase();
        if strip.iter().any(|s| *s == name) {
          continue;
        }
      }
    }
    out.put_slice(line);
  }
  out.put_slice(body);
  Ok(out.freeze())
}

fn host_for_header(host: &str) -> String {
  if host.contains(':') {
    format!("[{}]", host)
  } else {
    host.to_string()
  }
}

pub(crate) fn version_str(version: Version) -> &'static str {
  match version {
    Version::HTTP_10 => "HTTP/1.0",
    Version::HTTP_09 => "HTTP/0.9",
    _ => "HTTP/1.1",
  }
}

/// Compose a complete response with a fixed body
pub fn simple_response(
  status: StatusCode,
  headers: &[(&str, &str)],
  body: &[u8],
  close: bool,
) -> Bytes {
  let mut out = BytesMut::with_capacity(body.len() + 256);
  out.put_slice(
    format!(
      "HTTP/1.1 {} {}\r\n",
      status.as_u16(),
      status.canonical_reason().unwrap_or("Unknown")
    )
    .as_bytes(),
  );
  for (name, value) in headers {
    out.put_slice(format!("{}: {}\r\n", name, value).as_bytes());
  }
  out.put_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
  out.put_slice(if close {
    b"Connection: close\r\n".as_slice()
  } else {
    b"Connection: keep-alive\r\n".as_slice()
  });
  out.put_slice(CR_LF);
  out.put_slice(body);
  out.freeze()
}

/// A small HTML page carrying `message`, used for local answers
pub fn pretty_page(title: &str, message: &str) -> String {
  format!(
    "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>{title}</title></head>\
     <body><h3>{title}</h3><p>{message}</p></body></html>",
    title = escape_html(title),
    message = escape_html(message)
  )
}

fn escape_html(s: &str) -> String {
  s.replace('&', "&amp;")
    .replace('<', "&lt;")
    .replace('>', "&gt;")
    .replace('"', "&quot;")
}

/// Write `bytes` and flush
pub async fn write_all_flush<W>(writer: &mut W, bytes: &[u8]) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  writer.write_all(bytes).await?;
  writer.flush().await?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::BufReader;

  #[tokio::test]
  async fn reads_chunked_request_with_raw_bytes() {
    let wire = b"POST /up HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nwiki\r\n5;x=y\r\npedia\r\n0\r\nX-T: 1\r\n\r\nGET / HTTP/1.1\r\n\r\n";
    let mut reader = BufReader::new(&wire[..]);
    let req = read_request(&mut reader, false, 0).await.unwrap().unwrap();
    assert_eq!(req.request.body().as_ref(), b"wikipedia");
    assert_eq!(req.raw.len(), wire.len() - b"GET / HTTP/1.1\r\n\r\n".len());
    let next = read_request(&mut reader, false, 0).await.unwrap().unwrap();
    assert_eq!(next.request.uri(), "/");
    assert!(read_request(&mut reader, false, 0).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn skips_junk_before_request() {
    let wire = b"\r\n\x00\x01 GET /x HTTP/1.1\r\nHost: a\r\n\r\n";
    let mut reader = BufReader::new(&wire[..]);
    let req = read_request(&mut reader, true, 0).await.unwrap().unwrap();
    assert_eq!(req.request.uri(), "/x");
  }

  #[tokio::test]
  async fn head_response_has_no_body() {
    let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n";
    let mut reader = BufReader::new(&wire[..]);
    let rsp = read_response(&mut reader, &Method::HEAD, 0).await.unwrap();
    assert_eq!(rsp.framing, Framing::Empty);
    assert!(rsp.response.body().is_empty());
  }

  #[tokio::test]
  async fn close_delimited_response_reads_to_eof() {
    let wire = b"HTTP/1.0 200 OK\r\n\r\nuntil the end";
    let mut reader = BufReader::new(&wire[..]);
    let rsp = read_response(&mut reader, &Method::GET, 0).await.unwrap();
    assert_eq!(rsp.framing, Framing::UntilClose);
    assert_eq!(rsp.response.body().as_ref(), b"until the end");
    assert_eq!(rsp.raw.as_ref(), &wire[..]);
  }

  #[tokio::test]
  async fn declared_length_over_limit_is_refused_unread() {
    let wire = b"POST /up HTTP/1.1\r\nHost: a\r\nContent-Length: 100000000000000\r\n\r\nabc";
    let mut reader = BufReader::new(&wire[..]);
    let err = read_request(&mut reader, false, 1024).await.unwrap_err();
    assert!(err.is_payload_too_large());
  }

  #[tokio::test]
  async fn chunked_body_over_limit_is_refused() {
    let wire = b"POST /up HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n";
    let mut reader = BufReader::new(&wire[..]);
    let err = read_request(&mut reader, false, 8).await.unwrap_err();
    assert!(err.is_payload_too_large());

    let mut reader = BufReader::new(&wire[..]);
    let req = read_request(&mut reader, false, 9).await.unwrap().unwrap();
    assert_eq!(req.request.body().as_ref(), b"wikipedia");
  }

  #[tokio::test]
  async fn huge_chunk_size_is_refused_before_allocating() {
    let wire = b"POST /up HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffff\r\nabc";
    let mut reader = BufReader::new(&wire[..]);
    let err = read_request(&mut reader, false, 0).await.unwrap_err();
    assert!(err.is_payload_too_large());
  }

  #[tokio::test]
  async fn close_delimited_response_over_limit_is_refused() {
    let wire = b"HTTP/1.0 200 OK\r\n\r\nuntil the end";
    let mut reader = BufReader::new(&wire[..]);
    let err = read_response(&mut reader, &Method::GET, 5).await.unwrap_err();
    assert!(err.is_payload_too_large());
  }

  #[tokio::test]
  async fn short_body_is_a_connection_error() {
    let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc";
    let mut reader = BufReader::new(&wire[..]);
    let err = read_response(&mut reader, &Method::GET, 0).await.unwrap_err();
    assert!(matches!(err, Error::ConnectionError(_)));
  }

  #[test]
  fn body_limit_is_capped() {
    assert_eq!(body_limit(0), MAX_BODY_SIZE);
    assert_eq!(body_limit(usize::MAX), MAX_BODY_SIZE);
    assert_eq!(body_limit(10), 10);
  }

  #[test]
  fn upstream_request_drops_hop_by_hop_only() {
    let raw = b"GET http://example.com:8080/a?b=1 HTTP/1.1\r\nUser-Agent: t\r\nProxy-Connection: keep-alive\r\nConnection: keep-alive, X-Secret\r\nX-Secret: 1\r\nProxy-Authorization: Basic Zm9vOmJhcg==\r\nX-Keep: yes\r\n\r\n";
    let out = prepare_upstream_request(raw).unwrap();
    assert_eq!(
      String::from_utf8_lossy(&out),
      "GET /a?b=1 HTTP/1.1\r\nHost: example.com:8080\r\nUser-Agent: t\r\nConnection: keep-alive, X-Secret\r\nX-Keep: yes\r\n\r\n"
    );
  }

  #[test]
  fn origin_form_request_is_untouched() {
    let raw = b"POST /p HTTP/1.1\r\nHost: h\r\nContent-Length: 3\r\n\r\nabc";
    assert_eq!(prepare_upstream_request(raw).unwrap().as_ref(), &raw[..]);
  }

  #[test]
  fn targets_and_authorities() {
    assert_eq!(
      parse_target(&Method::CONNECT, "example.com:443").unwrap(),
      Target::Authority {
        host: "example.com".into(),
        port: 443
      }
    );
    assert_eq!(
      parse_target(&Method::GET, "https://[::1]/x").unwrap(),
      Target::Absolute {
        tls: true,
        host: "::1".into(),
        port: 443,
        path: "/x".into()
      }
    );
    assert_eq!(parse_target(&Method::GET, "/x").unwrap(), Target::Origin);
    assert_eq!(join_host_port("::1", 80), "[::1]:80");
    assert!(split_host_port("example.com", None).is_err());
    assert_eq!(split_authority("Example.com").unwrap(), ("Example.com".into(), None));
    assert_eq!(split_authority("[::1]:8080").unwrap(), ("::1".into(), Some(8080)));
  }

  #[test]
  fn connection_semantics() {
    let mut headers = HeaderMap::new();
    assert!(wants_close(Version::HTTP_10, &headers));
    assert!(!wants_close(Version::HTTP_11, &headers));
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade, Close"));
    assert!(wants_close(Version::HTTP_11, &headers));
    assert!(has_connection_token(&headers, "upgrade"));
  }
}
