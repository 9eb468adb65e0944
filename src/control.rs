//! Control-plane virtual host
//!
//! Requests for the reserved hosts never leave the proxy. They serve a status page and
//! the root certificate for installation on clients.

use crate::ca::{normalize_host, CertificateManager};
use crate::http1::{pretty_page, simple_response};
use bytes::Bytes;
use http::StatusCode;

/// Hostnames answered locally
pub const CONTROL_HOSTS: &[&str] = &["download-mitm-ca.com", "mitm.local"];

/// File name offered when downloading the root certificate
pub const CA_DOWNLOAD_NAME: &str = "mitm-server.crt";

/// Whether `host` (optionally with a port) is a control-plane host
pub fn is_control_host(host: &str) -> bool {
  let host = normalize_host(host);
  CONTROL_HOSTS.iter().any(|h| *h == host)
}

/// Answer a control-plane request for `path`
pub fn respond(path: &str, certs: &CertificateManager) -> Bytes {
  let path = path.split(['?', '#']).next().unwrap_or_default();
  if path == "/download-ca" || path.ends_with(".crt") || path.ends_with(".pem") {
    let disposition = format!("attachment; filename=\"{}\"", CA_DOWNLOAD_NAME);
    return simple_response(
      StatusCode::OK,
      &[
        ("Content-Type", "application/x-x509-ca-cert"),
        ("Content-Disposition", &disposition),
      ],
      certs.ca_cert_pem().as_bytes(),
      false,
    );
  }
  if path == "/" || path.is_empty() {
    let body = format!(
      "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>MITM</title></head><body>\
       <h3>mitm-hijack is running</h3>\
       <p>Install the root certificate to intercept HTTPS traffic: \
       <a href=\"/download-ca\">{}</a></p>\
       <p>Leaf certificates issued: {}</p></body></html>",
      CA_DOWNLOAD_NAME,
      certs.issued_count()
    );
    return simple_response(
      StatusCode::OK,
      &[("Content-Type", "text/html; charset=utf-8")],
      body.as_bytes(),
      false,
    );
  }
  simple_response(
    StatusCode::NOT_FOUND,
    &[("Content-Type", "text/html; charset=utf-8")],
    pretty_page("MITM", "Not found").as_bytes(),
    false,
  )
}
