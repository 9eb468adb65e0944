//! Outbound connections
//!
//! A [`Dialer`] resolves the destination through the [`DnsCache`], optionally tunnels
//! through a chained HTTP or SOCKS5 proxy, and wraps the result in TLS when asked.
//!
use crate::config::{ClientCertificate, MitmConfig};
use crate::dns::DnsCache;
use crate::error::{Error, Result};
use crate::http1::{join_host_port, read_response_head};
use crate::sni::SniResolver;
use crate::stream::{BoxStream, Rewind};
use crate::tls::{client_config, server_name, ALPN_H2, ALPN_HTTP1};
use base64::prelude::{Engine as _, BASE64_STANDARD};
use bytes::Bytes;
use percent_encoding::percent_decode_str;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;

#[rustfmt::skip]
mod consts {
  pub const SOCKS5_VERSION: u8 = 0x05;
  pub const SOCKS5_AUTH_METHOD_NONE: u8 = 0x00;
  pub const SOCKS5_AUTH_METHOD_PASSWORD: u8 = 0x02;
  pub const SOCKS5_AUTH_VERSION: u8 = 0x01;
  pub const SOCKS5_CMD_TCP_CONNECT: u8 = 0x01;
  pub const SOCKS5_ADDR_TYPE_IPV4: u8 = 0x01;
  pub const SOCKS5_ADDR_TYPE_DOMAIN_NAME: u8 = 0x03;
  pub const SOCKS5_ADDR_TYPE_IPV6: u8 = 0x04;
  pub const SOCKS5_REPLY_SUCCEEDED: u8 = 0x00;
}

/// A chained proxy that upstream connections go through
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamProxy {
  /// HTTP proxy spoken to with `CONNECT`
  Http {
    host: String,
    port: u16,
    /// `Basic ...` value for `Proxy-Authorization`
    auth: Option<String>,
  },
  /// SOCKS5 proxy; `remote_dns` leaves name resolution to the proxy (`socks5h`)
  Socks5 {
    host: String,
    port: u16,
    auth: Option<(String, String)>,
    remote_dns: bool,
  },
}

impl UpstreamProxy {
  /// Parse a proxy URL.
  ///
  /// Supported schemes: `http`, `socks5`, `socks5h`, each with optional percent-encoded
  /// `user:pass@` userinfo.
  pub fn parse(url: &str) -> Result<Self> {
    let uri: http::Uri = url
      .parse()
      .map_err(|e| Error::config_error(format!("Invalid upstream proxy URL {}: {}", url, e)))?;
    let scheme = uri
      .scheme_str()
      .map(|s| s.to_ascii_lowercase())
      .ok_or_else(|| Error::config_error(format!("Upstream proxy URL has no scheme: {}", url)))?;
    let authority = uri
      .authority()
      .ok_or_else(|| Error::config_error(format!("Upstream proxy URL has no host: {}", url)))?;
    let host = authority
      .host()
      .trim_start_matches('[')
      .trim_end_matches(']')
      .to_string();
    if host.is_empty() {
      return Err(Error::config_error(format!("Upstream proxy URL has no host: {}", url)));
    }
    let credentials = authority
      .as_str()
      .rsplit_once('@')
      .and_then(|(userinfo, _)| userinfo.split_once(':'))
      .map(|(user, pass)| {
        (
          percent_decode_str(user).decode_utf8_lossy().to_string(),
          percent_decode_str(pass).decode_utf8_lossy().to_string(),
        )
      });
    match scheme.as_str() {
      "http" => Ok(UpstreamProxy::Http {
        host,
        port: authority.port_u16().unwrap_or(80),
        auth: credentials.map(|(u, p)| basic_auth(&u, &p)),
      }),
      "socks5" | "socks5h" => Ok(UpstreamProxy::Socks5 {
        host,
        port: authority.port_u16().unwrap_or(1080),
        auth: credentials,
        remote_dns: scheme == "socks5h",
      }),
      other => Err(Error::config_error(format!(
        "Unsupported upstream proxy scheme: {}",
        other
      ))),
    }
  }

  fn host_port(&self) -> (&str, u16) {
    match self {
      UpstreamProxy::Http { host, port, .. } | UpstreamProxy::Socks5 { host, port, .. } => {
        (host, *port)
      }
    }
  }
}

/// `Basic base64(user:pass)`
pub fn basic_auth(username: &str, password: &str) -> String {
  format!(
    "Basic {}",
    BASE64_STANDARD.encode(format!("{}:{}", username, password))
  )
}

/// An established upstream connection
pub struct Upstream {
  pub stream: BoxStream,
  /// Address of the origin when it was resolved locally
  pub remote_addr: Option<SocketAddr>,
  /// Protocol negotiated by ALPN, if TLS was used
  pub alpn: Option<Vec<u8>>,
}

/// Builds upstream connections for both pipelines
#[derive(Clone)]
pub struct Dialer {
  dns: DnsCache,
  sni: SniResolver,
  proxy: Option<UpstreamProxy>,
  tls_http1: Arc<ClientConfig>,
  tls_h2: Arc<ClientConfig>,
  connect_timeout: Duration,
}

impl Dialer {
  /// Build the dialer described by `config`; errors are configuration errors
  pub fn from_config(config: &MitmConfig, dns: DnsCache) -> Result<Self> {
    let proxy = config
      .upstream_proxy
      .as_deref()
      .map(UpstreamProxy::parse)
      .transpose()?;
    let client_cert: Option<&ClientCertificate> = config.client_certificates.first();
    Ok(Self {
      dns,
      sni: config.sni.clone(),
      proxy,
      tls_http1: client_config(client_cert, &[ALPN_HTTP1])?,
      tls_h2: client_config(client_cert, &[ALPN_H2, ALPN_HTTP1])?,
      connect_timeout: config.connect_timeout,
    })
  }

  pub fn dns(&self) -> &DnsCache {
    &self.dns
  }

  /// Whether dials go through an upstream proxy instead of straight to the target
  pub fn uses_proxy(&self) -> bool {
    self.proxy.is_some()
  }

  /// The name sent as SNI for `host`
  pub fn outbound_sni(&self, host: &str) -> String {
    self.sni.resolve(host).unwrap_or_else(|| host.to_string())
  }

  /// Connect to `host:port`, wrapping in TLS when `tls` is set.
  ///
  /// With `offer_h2` the TLS leg offers `h2` before `http/1.1`.
  pub async fn dial(&self, host: &str, port: u16, tls: bool, offer_h2: bool) -> Result<Upstream> {
    let (stream, remote_addr) = match &self.proxy {
      None => {
        let ip = self.dns.resolve(host).await?;
        let addr = SocketAddr::new(ip, port);
        (self.connect_tcp(addr).await?, Some(addr))
      }
      Some(proxy) => self.connect_via_proxy(proxy, host, port).await?,
    };
    if !tls {
      return Ok(Upstream {
        stream,
        remote_addr,
        alpn: None,
      });
    }

    let sni = self.outbound_sni(host);
    let config = if offer_h2 {
      self.tls_h2.clone()
    } else {
      self.tls_http1.clone()
    };
    let connector = TlsConnector::from(config);
    let tls_stream = tokio::time::timeout(
      self.connect_timeout,
      connector.connect(server_name(&sni)?, stream),
    )
    .await
    .map_err(|_| Error::tls_error(format!("TLS handshake with {} timed out", sni)))?
    .map_err(|e| Error::tls_error(format!("rustls handshake with {} failed: {}", sni, e)))?;
    let alpn = tls_stream.get_ref().1.alpn_protocol().map(|p| p.to_vec());
    tracing::debug!("[MITM] upstream TLS to {}:{} (sni {}) established", host, port, sni);
    Ok(Upstream {
      stream: Box::new(tls_stream),
      remote_addr,
      alpn,
    })
  }

  async fn connect_tcp(&self, addr: SocketAddr) -> Result<BoxStream> {
    let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
      .await
      .map_err(|_| Error::connection_error(format!("Connecting to {} timed out", addr)))?
      .map_err(|e| Error::connection_error(format!("Failed to connect to {}: {}", addr, e)))?;
    stream.set_nodelay(true)?;
    Ok(Box::new(stream))
  }

  async fn connect_via_proxy(
    &self,
    proxy: &UpstreamProxy,
    host: &str,
    port: u16,
  ) -> Result<(BoxStream, Option<SocketAddr>)> {
    let (proxy_host, proxy_port) = proxy.host_port();
    let proxy_ip = self.dns.resolve(proxy_host).await?;
    let mut stream = self
      .connect_tcp(SocketAddr::new(proxy_ip, proxy_port))
      .await?;
    match proxy {
      UpstreamProxy::Http { auth, .. } => {
        let stream = http_connect(stream, host, port, auth.as_deref()).await?;
        Ok((stream, None))
      }
      UpstreamProxy::Socks5 {
        auth, remote_dns, ..
      } => {
        let target = if *remote_dns {
          match host.parse::<IpAddr>() {
            Ok(ip) => SocksTarget::Ip(SocketAddr::new(ip, port)),
            Err(_) => SocksTarget::Domain(host.to_string(), port),
          }
        } else {
          SocksTarget::Ip(SocketAddr::new(self.dns.resolve(host).await?, port))
        };
        socks5_connect(&mut stream, auth.as_ref(), &target).await?;
        let remote_addr = match target {
          SocksTarget::Ip(addr) => Some(addr),
          SocksTarget::Domain(..) => None,
        };
        Ok((stream, remote_addr))
      }
    }
  }
}

impl std::fmt::Debug for Dialer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Dialer")
      .field("dns", &self.dns)
      .field("sni", &self.sni)
      .field("proxy", &self.proxy)
      .field("connect_timeout", &self.connect_timeout)
      .finish()
  }
}

/// Open a tunnel through an HTTP proxy
async fn http_connect(
  stream: BoxStream,
  host: &str,
  port: u16,
  auth: Option<&str>,
) -> Result<BoxStream> {
  let host_port = join_host_port(host, port);
  let mut request = format!(
    "CONNECT {hp} HTTP/1.1\r\nHost: {hp}\r\nProxy-Connection: Keep-Alive\r\n",
    hp = host_port
  );
  if let Some(auth) = auth {
    request.push_str("Proxy-Authorization: ");
    request.push_str(auth);
    request.push_str("\r\n");
  }
  request.push_str("\r\n");

  let mut reader = BufReader::new(stream);
  reader.get_mut().write_all(request.as_bytes()).await?;
  reader.get_mut().flush().await?;
  let (head, _) = read_response_head(&mut reader).await?;
  if !head.status.is_success() {
    return Err(Error::proxy_error(format!(
      "Upstream proxy refused CONNECT {}: {}",
      host_port, head.status
    )));
  }
  let leftover = Bytes::copy_from_slice(reader.buffer());
  Ok(Box::new(Rewind::new(leftover, reader.into_inner())))
}

enum SocksTarget {
  Ip(SocketAddr),
  Domain(String, u16),
}

async fn socks5_connect(
  stream: &mut BoxStream,
  auth: Option<&(String, String)>,
  target: &SocksTarget,
) -> Result<()> {
  use consts::*;

  let mut greeting = vec![SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_NONE];
  if auth.is_some() {
    greeting[1] = 2;
    greeting.push(SOCKS5_AUTH_METHOD_PASSWORD);
  }
  stream.write_all(&greeting).await?;

  let mut buf = [0u8; 2];
  stream.read_exact(&mut buf).await?;
  let [version, method] = buf;
  if version != SOCKS5_VERSION {
    return Err(Error::proxy_error(format!("Unsupported SOCKS version: {}", version)));
  }
  match (method, auth) {
    (SOCKS5_AUTH_METHOD_NONE, _) => {}
    (SOCKS5_AUTH_METHOD_PASSWORD, Some((username, password))) => {
      if username.len() > u8::MAX as usize || password.len() > u8::MAX as usize {
        return Err(Error::proxy_error("SOCKS5 credentials too long"));
      }
      let mut packet = vec![SOCKS5_AUTH_VERSION, username.len() as u8];
      packet.extend_from_slice(username.as_bytes());
      packet.push(password.len() as u8);
      packet.extend_from_slice(password.as_bytes());
      stream.write_all(&packet).await?;
      let mut reply = [0u8; 2];
      stream.read_exact(&mut reply).await?;
      if reply[1] != SOCKS5_REPLY_SUCCEEDED {
        return Err(Error::proxy_error(format!(
          "Authentication with username `{}`, rejected.",
          username
        )));
      }
    }
    _ => {
      return Err(Error::proxy_error("no acceptable auth methods"));
    }
  }

  let mut request = vec![SOCKS5_VERSION, SOCKS5_CMD_TCP_CONNECT, 0x00];
  match target {
    SocksTarget::Ip(SocketAddr::V4(addr)) => {
      request.push(SOCKS5_ADDR_TYPE_IPV4);
      request.extend_from_slice(&addr.ip().octets());
      request.extend_from_slice(&addr.port().to_be_bytes());
    }
    SocksTarget::Ip(SocketAddr::V6(addr)) => {
      request.push(SOCKS5_ADDR_TYPE_IPV6);
      request.extend_from_slice(&addr.ip().octets());
      request.extend_from_slice(&addr.port().to_be_bytes());
    }
    SocksTarget::Domain(domain, port) => {
      if domain.len() > u8::MAX as usize {
        return Err(Error::proxy_error("domain name too long"));
      }
      request.push(SOCKS5_ADDR_TYPE_DOMAIN_NAME);
      request.push(domain.len() as u8);
      request.extend_from_slice(domain.as_bytes());
      request.extend_from_slice(&port.to_be_bytes());
    }
  }
  stream.write_all(&request).await?;
  stream.flush().await?;

  let mut head = [0u8; 4];
  stream.read_exact(&mut head).await?;
  let [version, reply, _rsv, address_type] = head;
  if version != SOCKS5_VERSION {
    return Err(Error::proxy_error(format!("Unsupported SOCKS version: {}", version)));
  }
  if reply != SOCKS5_REPLY_SUCCEEDED {
    return Err(Error::proxy_error(format!("SOCKS5 connect failed with reply {:#04x}", reply)));
  }
  // bound address and port, unused
  let skip = match address_type {
    SOCKS5_ADDR_TYPE_IPV4 => 4 + 2,
    SOCKS5_ADDR_TYPE_IPV6 => 16 + 2,
    SOCKS5_ADDR_TYPE_DOMAIN_NAME => {
      let mut len = [0u8; 1];
      stream.read_exact(&mut len).await?;
      len[0] as usize + 2
    }
    other => {
      return Err(Error::proxy_error(format!("Incorrect SOCKS5 address type: {}", other)));
    }
  };
  let mut bound = vec![0u8; skip];
  stream.read_exact(&mut bound).await?;
  Ok(())
}
