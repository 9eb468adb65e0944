//! TLS on both legs of the proxy
//!
//! Inbound connections are accepted lazily: the ClientHello is read first so the SNI
//! can pick the forged leaf and the offered ALPN can steer the session. Outbound
//! connections never verify the server certificate.
//!
use crate::ca::{CertificateManager, LeafCertificate};
use crate::config::ClientCertificate;
use crate::error::{Error, Result};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::rustls::{
  self,
  client::danger::HandshakeSignatureValid,
  client::danger::ServerCertVerified,
  client::danger::ServerCertVerifier,
  crypto::CryptoProvider,
  ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme,
};
use tokio_rustls::{server, LazyConfigAcceptor, StartHandshake};

/// ALPN id of HTTP/2
pub const ALPN_H2: &[u8] = b"h2";
/// ALPN id of HTTP/1.1
pub const ALPN_HTTP1: &[u8] = b"http/1.1";

/// Handshake timeout on the client leg
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}

fn provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Parse a PEM chain and key for upstream client authentication
pub fn load_client_certificate(
  cert: &ClientCertificate,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
  let chain = rustls_pemfile::certs(&mut cert.cert_pem.as_bytes())
    .collect::<std::result::Result<Vec<_>, _>>()
    .map_err(|e| Error::certificate_error(format!("Invalid client certificate PEM: {}", e)))?;
  if chain.is_empty() {
    return Err(Error::certificate_error("No certificate found in client certificate PEM"));
  }
  let key = rustls_pemfile::private_key(&mut cert.key_pem.as_bytes())
    .map_err(|e| Error::certificate_error(format!("Invalid client key PEM: {}", e)))?
    .ok_or_else(|| Error::certificate_error("No private key found in client key PEM"))?;
  Ok((chain, key))
}

/// Client config for upstream legs: no verification, optional mTLS, given ALPN offer
pub fn client_config(
  client_cert: Option<&ClientCertificate>,
  alpn: &[&[u8]],
) -> Result<Arc<ClientConfig>> {
  let builder = ClientConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::tls_error(format!("invalid TLS versions: {}", e)))?
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(NoVerifier));
  let mut config = match client_cert {
    Some(cert) => {
      let (chain, key) = load_client_certificate(cert)?;
      builder
        .with_client_auth_cert(chain, key)
        .map_err(|e| Error::tls_error(format!("Failed to use client certificate: {}", e)))?
    }
    None => builder.with_no_client_auth(),
  };
  config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
  Ok(Arc::new(config))
}

/// Server config presenting `leaf` and selecting from `alpn`
pub fn server_config(leaf: &LeafCertificate, alpn: Vec<Vec<u8>>) -> Result<Arc<ServerConfig>> {
  let mut config = ServerConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::tls_error(format!("invalid TLS versions: {}", e)))?
    .with_no_client_auth()
    .with_single_cert(leaf.chain().to_vec(), leaf.key())
    .map_err(|e| Error::tls_error(format!("Failed to create TLS config: {}", e)))?;
  config.alpn_protocols = alpn;
  Ok(Arc::new(config))
}

/// What a client asked for in its ClientHello
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHelloInfo {
  pub sni: Option<String>,
  pub alpn: Vec<Vec<u8>>,
}

impl ClientHelloInfo {
  pub fn offers(&self, protocol: &[u8]) -> bool {
    self.alpn.iter().any(|p| p == protocol)
  }
}

/// Read the ClientHello without answering it yet
pub async fn read_client_hello<S>(io: S) -> Result<(StartHandshake<S>, ClientHelloInfo)>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), io);
  let start = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor)
    .await
    .map_err(|_| Error::tls_error("Timed out waiting for ClientHello"))?
    .map_err(|e| Error::tls_error(format!("Failed to read ClientHello: {}", e)))?;
  let hello = start.client_hello();
  let info = ClientHelloInfo {
    sni: hello.server_name().map(|s| s.to_ascii_lowercase()),
    alpn: hello
      .alpn()
      .map(|protocols| protocols.map(|p| p.to_vec()).collect())
      .unwrap_or_default(),
  };
  Ok((start, info))
}

/// Server ALPN list for a client offer; `h2` only when `allow_h2`
pub fn select_alpn(hello: &ClientHelloInfo, allow_h2: bool) -> Vec<Vec<u8>> {
  let mut alpn = Vec::new();
  if allow_h2 && hello.offers(ALPN_H2) {
    alpn.push(ALPN_H2.to_vec());
  }
  if hello.offers(ALPN_HTTP1) {
    alpn.push(ALPN_HTTP1.to_vec());
  }
  alpn
}

/// Finish the handshake with a leaf for `host`
pub async fn complete_handshake<S>(
  start: StartHandshake<S>,
  certs: &CertificateManager,
  host: &str,
  alpn: Vec<Vec<u8>>,
) -> Result<server::TlsStream<S>>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let leaf = certs.leaf(host).await?;
  let config = server_config(&leaf, alpn)?;
  tokio::time::timeout(HANDSHAKE_TIMEOUT, start.into_stream(config))
    .await
    .map_err(|_| Error::tls_error(format!("TLS handshake with client timed out for {}", host)))?
    .map_err(|e| Error::tls_error(format!("TLS handshake with client failed for {}: {}", host, e)))
}

/// Accept a TLS client, forging a leaf for its SNI or `fallback_host`.
///
/// Returns the stream and the SNI the client sent.
pub async fn accept<S>(
  io: S,
  certs: &CertificateManager,
  fallback_host: Option<&str>,
) -> Result<(server::TlsStream<S>, Option<String>)>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let (start, hello) = read_client_hello(io).await?;
  let host = hello
    .sni
    .clone()
    .or_else(|| fallback_host.map(str::to_string))
    .ok_or_else(|| Error::tls_error("ClientHello carries no SNI and no fallback host is known"))?;
  let alpn = select_alpn(&hello, false);
  let stream = complete_handshake(start, certs, &host, alpn).await?;
  Ok((stream, hello.sni))
}

/// The name presented upstream, after SNI remapping
pub fn server_name(name: &str) -> Result<ServerName<'static>> {
  let name = name.trim_start_matches('[').trim_end_matches(']');
  ServerName::try_from(name.to_string())
    .map_err(|e| Error::tls_error(format!("Invalid server name {}: {}", name, e)))
}
