//! Error types for the MITM proxy

use std::io;
use thiserror::Error;

/// Result type for MITM operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for MITM proxy operations
#[derive(Error, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(io::Error),

  /// Certificate error
  #[error("Certificate error: {0}")]
  CertificateError(String),

  /// TLS error
  #[error("TLS error: {0}")]
  TlsError(String),

  /// HTTP parsing error
  #[error("HTTP error: {0}")]
  HttpError(http::Error),

  /// Proxy error
  #[error("Proxy error: {0}")]
  ProxyError(String),

  /// Invalid request
  #[error("Invalid request: {0}")]
  InvalidRequest(String),

  /// A message body over the allowed size
  #[error("Payload too large: {0}")]
  PayloadTooLarge(String),

  /// Connection error
  #[error("Connection error: {0}")]
  ConnectionError(String),

  /// Name resolution failed
  #[error("DNS error: {0}")]
  DnsError(String),

  /// Rejected configuration, surfaced before the server starts
  #[error("Config error: {0}")]
  ConfigError(String),

  /// A user callback panicked
  #[error("Callback panicked: {0}")]
  CallbackPanicked(String),

  /// Other errors
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Create a certificate error and log it
  pub fn certificate_error(msg: impl Into<String>) -> Self {
    let error = Error::CertificateError(msg.into());
    tracing::error!("Certificate error: {}", error);
    error
  }

  /// Create a TLS error and log it
  pub fn tls_error(msg: impl Into<String>) -> Self {
    let error = Error::TlsError(msg.into());
    tracing::error!("TLS error: {}", error);
    error
  }

  /// Create a proxy error and log it
  pub fn proxy_error(msg: impl Into<String>) -> Self {
    let error = Error::ProxyError(msg.into());
    tracing::error!("Proxy error: {}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::error!("Invalid request: {}", error);
    error
  }

  /// Create a payload-too-large error and log it; the peer is at fault, so only a warning
  pub fn payload_too_large(msg: impl Into<String>) -> Self {
    let error = Error::PayloadTooLarge(msg.into());
    tracing::warn!("Payload too large: {}", error);
    error
  }

  /// Create a connection error and log it
  pub fn connection_error(msg: impl Into<String>) -> Self {
    let error = Error::ConnectionError(msg.into());
    tracing::error!("Connection error: {}", error);
    error
  }

  /// Create a DNS error and log it
  pub fn dns_error(msg: impl Into<String>) -> Self {
    let error = Error::DnsError(msg.into());
    tracing::error!("DNS error: {}", error);
    error
  }

  /// Create a configuration error and log it
  pub fn config_error(msg: impl Into<String>) -> Self {
    let error = Error::ConfigError(msg.into());
    tracing::error!("Config error: {}", error);
    error
  }

  /// Record a callback panic; logged as a warning since the pipeline recovers
  pub fn callback_panicked(msg: impl Into<String>) -> Self {
    let error = Error::CallbackPanicked(msg.into());
    tracing::warn!("Callback panicked: {}", error);
    error
  }

  /// Create an other error and log it
  pub fn other(msg: impl Into<String>) -> Self {
    let error = Error::Other(msg.into());
    tracing::error!("Other error: {}", error);
    error
  }

  /// True when the error came from name resolution
  pub fn is_dns(&self) -> bool {
    matches!(self, Error::DnsError(_))
  }

  /// True when a body outgrew its limit
  pub fn is_payload_too_large(&self) -> bool {
    matches!(self, Error::PayloadTooLarge(_))
  }
}

impl From<io::Error> for Error {
  fn from(value: io::Error) -> Self {
    let error = Error::Io(value);
    tracing::debug!("IO error: {}", error);
    error
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    let error = Error::HttpError(value);
    tracing::error!("HTTP error: {}", error);
    error
  }
}
