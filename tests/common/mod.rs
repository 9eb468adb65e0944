//! Helpers shared by the integration tests
#![allow(dead_code)]

use bytes::Bytes;
use mitm_hijack::http1::{read_request, read_response, read_response_head, RawResponse};
use mitm_hijack::{
  CertificateManager, FlowMirror, HttpFlow, MitmConfig, ProxyServer, ServerHandle,
};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_rustls::rustls::{self, pki_types::ServerName, ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

pub const ORIGIN_HOST: &str = "origin.test";

/// A fresh, empty directory under the system temp dir
pub fn temp_dir(name: &str) -> PathBuf {
  let dir = std::env::temp_dir().join(format!("mitm-hijack-it-{}", name));
  if dir.exists() {
    std::fs::remove_dir_all(&dir).ok();
  }
  dir
}

pub fn cleanup(dir: &PathBuf) {
  std::fs::remove_dir_all(dir).ok();
}

/// Config pointing `origin.test` at localhost
pub fn config(dir: &PathBuf) -> MitmConfig {
  let mut hosts = HashMap::new();
  hosts.insert(ORIGIN_HOST.to_string(), IpAddr::V4(Ipv4Addr::LOCALHOST));
  MitmConfig {
    ca_storage_path: dir.clone(),
    hosts,
    ..Default::default()
  }
}

/// Build and spawn a proxy; returns its handle and certificate manager
pub async fn start_proxy(config: MitmConfig) -> (ServerHandle, Arc<CertificateManager>) {
  let server = ProxyServer::builder()
    .config(config)
    .build()
    .await
    .expect("proxy should build");
  let certs = server.cert_manager();
  let handle = server.spawn("127.0.0.1:0").await.expect("proxy should bind");
  (handle, certs)
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
  Arc::new(rustls::crypto::ring::default_provider())
}

/// Body the test origin answers with
pub fn origin_body(method: &str, path: &str, body_len: usize) -> String {
  if path == "/big" {
    return "x".repeat(4096);
  }
  format!("Example origin saw {} {} ({} body bytes)", method, path, body_len)
}

/// Exact response bytes the test origin sends
pub fn origin_response(method: &str, path: &str, body_len: usize) -> String {
  let body = origin_body(method, path, body_len);
  format!(
    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
    body.len(),
    body
  )
}

/// An HTTP/1.1 origin on localhost. Counts the requests it answers and records the SNI
/// of every TLS handshake.
pub struct Origin {
  pub addr: SocketAddr,
  pub hits: Arc<AtomicUsize>,
  pub snis: Arc<Mutex<Vec<String>>>,
}

impl Origin {
  pub fn port(&self) -> u16 {
    self.addr.port()
  }

  pub fn hits(&self) -> usize {
    self.hits.load(Ordering::SeqCst)
  }

  pub fn snis(&self) -> Vec<String> {
    self.snis.lock().unwrap().clone()
  }
}

pub async fn spawn_origin(tls: Option<Arc<ServerConfig>>) -> Origin {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let hits = Arc::new(AtomicUsize::new(0));
  let snis = Arc::new(Mutex::new(Vec::new()));
  let (counter, seen) = (hits.clone(), snis.clone());
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let tls = tls.clone();
      let counter = counter.clone();
      let seen = seen.clone();
      tokio::spawn(async move {
        match tls {
          Some(config) => {
            if let Ok(stream) = TlsAcceptor::from(config).accept(stream).await {
              if let Some(sni) = stream.get_ref().1.server_name() {
                seen.lock().unwrap().push(sni.to_string());
              }
              serve_http(stream, counter).await;
            }
          }
          None => serve_http(stream, counter).await,
        }
      });
    }
  });
  Origin { addr, hits, snis }
}

/// An origin that answers the first request on each connection and closes after
/// reading the second one
pub async fn spawn_one_answer_origin() -> Origin {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let hits = Arc::new(AtomicUsize::new(0));
  let counter = hits.clone();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let counter = counter.clone();
      tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let Ok(Some(raw)) = read_request(&mut reader, false, 0).await else {
          return;
        };
        counter.fetch_add(1, Ordering::SeqCst);
        let request = raw.request;
        let response = origin_response(
          request.method().as_str(),
          request.uri().path(),
          request.body().len(),
        );
        if reader.get_mut().write_all(response.as_bytes()).await.is_err() {
          return;
        }
        if let Ok(Some(_)) = read_request(&mut reader, false, 0).await {
          counter.fetch_add(1, Ordering::SeqCst);
        }
      });
    }
  });
  Origin {
    addr,
    hits,
    snis: Arc::new(Mutex::new(Vec::new())),
  }
}

/// A UDP DNS server answering every query with NXDOMAIN
pub async fn spawn_nxdomain_dns() -> SocketAddr {
  let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
  let addr = socket.local_addr().unwrap();
  tokio::spawn(async move {
    let mut buf = [0u8; 512];
    while let Ok((n, from)) = socket.recv_from(&mut buf).await {
      let Some(end) = question_end(&buf[..n]) else {
        continue;
      };
      let mut reply = buf[..end].to_vec();
      // QR and RD kept; RA set, RCODE 3
      reply[2] |= 0x80;
      reply[3] = 0x80 | 3;
      // no answer, authority or additional records
      reply[6..12].fill(0);
      socket.send_to(&reply, from).await.ok();
    }
  });
  addr
}

/// Offset just past the first question of a DNS message
fn question_end(msg: &[u8]) -> Option<usize> {
  let mut pos = 12;
  loop {
    let len = *msg.get(pos)? as usize;
    pos += 1;
    if len == 0 {
      break;
    }
    pos += len;
  }
  let end = pos + 4;
  (end <= msg.len()).then_some(end)
}

async fn serve_http<S>(stream: S, hits: Arc<AtomicUsize>)
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let mut reader = BufReader::new(stream);
  while let Ok(Some(raw)) = read_request(&mut reader, false, 0).await {
    hits.fetch_add(1, Ordering::SeqCst);
    let request = raw.request;
    let response = origin_response(
      request.method().as_str(),
      request.uri().path(),
      request.body().len(),
    );
    if reader.get_mut().write_all(response.as_bytes()).await.is_err() {
      break;
    }
    reader.get_mut().flush().await.ok();
  }
}

/// Server config for a TLS origin, with a leaf from its own throwaway root
pub async fn origin_tls_config(dir: &PathBuf) -> Arc<ServerConfig> {
  let certs = CertificateManager::new(dir).await.unwrap();
  let leaf = certs.leaf(ORIGIN_HOST).await.unwrap();
  let config = ServerConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(leaf.chain().to_vec(), leaf.key())
    .unwrap();
  Arc::new(config)
}

/// A TLS connector trusting only the proxy root
pub fn trusting_connector(certs: &CertificateManager) -> TlsConnector {
  let mut roots = RootCertStore::empty();
  roots.add(certs.root().cert_der().clone()).unwrap();
  let config = ClientConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
  TlsConnector::from(Arc::new(config))
}

pub fn server_name(host: &str) -> ServerName<'static> {
  ServerName::try_from(host.to_string()).unwrap()
}

/// Write a request and read one response
pub async fn round_trip<S>(reader: &mut BufReader<S>, request: &str) -> RawResponse
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  reader.get_mut().write_all(request.as_bytes()).await.unwrap();
  reader.get_mut().flush().await.unwrap();
  let method = request.split(' ').next().unwrap_or("GET");
  let method = http::Method::from_bytes(method.as_bytes()).unwrap();
  tokio::time::timeout(Duration::from_secs(10), read_response(reader, &method, 0))
    .await
    .expect("response timed out")
    .expect("response should parse")
}

pub async fn connect(addr: SocketAddr) -> BufReader<TcpStream> {
  BufReader::new(TcpStream::connect(addr).await.unwrap())
}

/// Open a `CONNECT` tunnel to `host:port` through the proxy and return the raw stream
pub async fn open_tunnel(proxy: SocketAddr, host: &str, port: u16) -> TcpStream {
  let mut client = connect(proxy).await;
  let request = format!(
    "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n",
    host = host,
    port = port
  );
  client.get_mut().write_all(request.as_bytes()).await.unwrap();
  let (head, _) = read_response_head(&mut client).await.unwrap();
  assert_eq!(head.status, http::StatusCode::OK, "CONNECT should be accepted");
  client.into_inner()
}

pub fn body_text(response: &RawResponse) -> String {
  String::from_utf8_lossy(response.response.body()).to_string()
}

/// Mirror that forwards every flow to a channel
pub struct ChannelMirror(pub mpsc::UnboundedSender<HttpFlow>);

#[async_trait::async_trait]
impl FlowMirror for ChannelMirror {
  async fn mirror(&self, flow: HttpFlow) {
    self.0.send(flow).ok();
  }
}

pub fn channel_mirror() -> (Arc<ChannelMirror>, mpsc::UnboundedReceiver<HttpFlow>) {
  let (tx, rx) = mpsc::unbounded_channel();
  (Arc::new(ChannelMirror(tx)), rx)
}

pub async fn next_flow(rx: &mut mpsc::UnboundedReceiver<HttpFlow>) -> HttpFlow {
  tokio::time::timeout(Duration::from_secs(5), rx.recv())
    .await
    .expect("mirror was not called")
    .expect("mirror channel closed")
}

pub fn text(bytes: &Bytes) -> String {
  String::from_utf8_lossy(bytes).to_string()
}
