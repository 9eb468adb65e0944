//! Integration tests for transparent mode

mod common;

use bytes::Bytes;
use common::*;
use mitm_hijack::http1::read_response;
use mitm_hijack::{MitmConfig, ProxyMode, LOOPBACK_MESSAGE};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};

fn transparent(dir: &std::path::PathBuf) -> MitmConfig {
  MitmConfig {
    mode: ProxyMode::Transparent,
    ..config(dir)
  }
}

fn origin_get(port: u16, path: &str) -> String {
  format!("GET {} HTTP/1.1\r\nHost: {}:{}\r\n\r\n", path, ORIGIN_HOST, port)
}

#[tokio::test]
async fn test_pure_relay_without_hooks() {
  let dir = temp_dir("transparent-relay");
  let origin = spawn_origin(None).await;
  let (proxy, _) = start_proxy(transparent(&dir)).await;

  let mut client = connect(proxy.local_addr()).await;
  let first = round_trip(&mut client, &origin_get(origin.port(), "/one")).await;
  assert_eq!(first.raw, Bytes::from(origin_response("GET", "/one", 0)));
  let second = round_trip(&mut client, &origin_get(origin.port(), "/two")).await;
  assert_eq!(
    second.raw,
    Bytes::from(origin_response("GET", "/two", 0)),
    "relay should carry later requests on the same connection"
  );
  assert_eq!(origin.hits(), 2);

  proxy.shutdown().await.unwrap();
  cleanup(&dir);
}

#[tokio::test]
async fn test_hijack_loop_skips_junk_between_requests() {
  let dir = temp_dir("transparent-loop");
  let origin = spawn_origin(None).await;
  let (mirror, mut flows) = channel_mirror();
  let mut config = transparent(&dir);
  config.hooks.mirror = Some(mirror);
  let (proxy, _) = start_proxy(config).await;

  let mut client = connect(proxy.local_addr()).await;
  let first = round_trip(&mut client, &origin_get(origin.port(), "/one")).await;
  assert_eq!(body_text(&first), "Example origin saw GET /one (0 body bytes)");
  let flow = next_flow(&mut flows).await;
  assert!(!flow.is_tls);
  assert_eq!(
    flow.url,
    format!("http://{}:{}/one", ORIGIN_HOST, origin.port())
  );

  let junk = format!("\x00\r\n{}", origin_get(origin.port(), "/two"));
  let second = round_trip(&mut client, &junk).await;
  assert_eq!(body_text(&second), "Example origin saw GET /two (0 body bytes)");
  assert!(next_flow(&mut flows).await.url.ends_with("/two"));

  proxy.shutdown().await.unwrap();
  cleanup(&dir);
}

#[tokio::test]
async fn test_tls_destination_comes_from_sni() {
  let dir = temp_dir("transparent-tls");
  let origin_dir = temp_dir("transparent-tls-origin");
  let origin = spawn_origin(Some(origin_tls_config(&origin_dir).await)).await;
  let (mirror, mut flows) = channel_mirror();
  let mut config = transparent(&dir);
  config.hooks.mirror = Some(mirror);
  let (proxy, certs) = start_proxy(config).await;

  let stream = tokio::net::TcpStream::connect(proxy.local_addr()).await.unwrap();
  let tls = trusting_connector(&certs)
    .connect(server_name(ORIGIN_HOST), stream)
    .await
    .expect("client should trust the forged leaf");
  let mut client = BufReader::new(tls);
  let response = round_trip(&mut client, &origin_get(origin.port(), "/secure")).await;
  assert_eq!(
    body_text(&response),
    "Example origin saw GET /secure (0 body bytes)"
  );

  let flow = next_flow(&mut flows).await;
  assert!(flow.is_tls);
  assert_eq!(
    flow.url,
    format!("https://{}:{}/secure", ORIGIN_HOST, origin.port())
  );

  proxy.shutdown().await.unwrap();
  cleanup(&dir);
  cleanup(&origin_dir);
}

#[tokio::test]
async fn test_request_for_the_proxy_itself_is_answered_locally() {
  let dir = temp_dir("transparent-loopback");
  let mut config = transparent(&dir);
  config
    .hosts
    .insert("loop.test".to_string(), IpAddr::V4(Ipv4Addr::LOCALHOST));
  let (proxy, _) = start_proxy(config).await;

  let mut client = connect(proxy.local_addr()).await;
  let request = format!(
    "GET / HTTP/1.1\r\nHost: loop.test:{}\r\n\r\n",
    proxy.local_addr().port()
  );
  let response = round_trip(&mut client, &request).await;
  assert_eq!(response.response.status(), http::StatusCode::OK);
  assert!(body_text(&response).contains(LOOPBACK_MESSAGE));

  proxy.shutdown().await.unwrap();
  cleanup(&dir);
}

#[tokio::test]
async fn test_unresolvable_sni_aborts_the_connection() {
  let dir = temp_dir("transparent-nxdomain");
  let origin = spawn_origin(None).await;
  let config = MitmConfig {
    dns_servers: vec![spawn_nxdomain_dns().await],
    ..transparent(&dir)
  };
  let (proxy, certs) = start_proxy(config).await;

  let stream = tokio::net::TcpStream::connect(proxy.local_addr()).await.unwrap();
  let tls = trusting_connector(&certs)
    .connect(server_name("nowhere.test"), stream)
    .await
    .expect("the handshake completes before the destination is resolved");
  let mut client = BufReader::new(tls);
  client
    .get_mut()
    .write_all(b"GET / HTTP/1.1\r\nHost: nowhere.test\r\n\r\n")
    .await
    .unwrap();
  let outcome = tokio::time::timeout(
    Duration::from_secs(10),
    read_response(&mut client, &http::Method::GET, 0),
  )
  .await
  .expect("the proxy should close the connection");
  assert!(outcome.is_err(), "no response is sent for an unknown host");

  let mut client = connect(proxy.local_addr()).await;
  let response = round_trip(&mut client, &origin_get(origin.port(), "/still")).await;
  assert_eq!(
    body_text(&response),
    "Example origin saw GET /still (0 body bytes)"
  );

  proxy.shutdown().await.unwrap();
  cleanup(&dir);
}

#[tokio::test]
async fn test_oversized_first_request_gets_413() {
  let dir = temp_dir("transparent-413");
  let origin = spawn_origin(None).await;
  let (proxy, _) = start_proxy(transparent(&dir)).await;

  let mut client = connect(proxy.local_addr()).await;
  let request = format!(
    "POST / HTTP/1.1\r\nHost: {}:{}\r\nContent-Length: 100000000000000\r\n\r\n",
    ORIGIN_HOST,
    origin.port()
  );
  let response = round_trip(&mut client, &request).await;
  assert_eq!(response.response.status(), http::StatusCode::PAYLOAD_TOO_LARGE);
  assert_eq!(origin.hits(), 0);

  proxy.shutdown().await.unwrap();
  cleanup(&dir);
}

