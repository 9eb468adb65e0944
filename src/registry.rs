//! Named proxy instances
//!
//! A [`ProxyRegistry`] is an ordinary value: create one, share it by cloning, and use it
//! to start, look up and stop proxies by name.

use crate::error::{Error, Result};
use crate::server::{ProxyServer, ServerHandle};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Map from name to running proxy
#[derive(Debug, Clone, Default)]
pub struct ProxyRegistry {
  servers: Arc<RwLock<HashMap<String, ServerHandle>>>,
}

impl ProxyRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Track an already running proxy under `name`
  pub async fn register(&self, name: impl Into<String>, handle: ServerHandle) -> Result<()> {
    let name = name.into();
    let mut servers = self.servers.write().await;
    if servers.contains_key(&name) {
      return Err(Error::config_error(format!(
        "A proxy named {} is already registered",
        name
      )));
    }
    tracing::info!("[MITM] registered proxy {} on {}", name, handle.local_addr());
    servers.insert(name, handle);
    Ok(())
  }

  /// Start `server` on `addr` and register it. Returns the bound address.
  ///
  /// The table stays write-locked until the new proxy is inserted, so two starts under
  /// one name never both bind.
  pub async fn start(
    &self,
    name: impl Into<String>,
    server: ProxyServer,
    addr: &str,
  ) -> Result<SocketAddr> {
    let name = name.into();
    let mut servers = self.servers.write().await;
    if servers.contains_key(&name) {
      return Err(Error::config_error(format!(
        "A proxy named {} is already registered",
        name
      )));
    }
    let handle = server.spawn(addr).await?;
    let local_addr = handle.local_addr();
    tracing::info!("[MITM] registered proxy {} on {}", name, local_addr);
    servers.insert(name, handle);
    Ok(local_addr)
  }

  pub async fn contains(&self, name: &str) -> bool {
    self.servers.read().await.contains_key(name)
  }

  pub async fn local_addr(&self, name: &str) -> Option<SocketAddr> {
    self.servers.read().await.get(name).map(|h| h.local_addr())
  }

  /// Names of registered proxies, sorted
  pub async fn names(&self) -> Vec<String> {
    let mut names: Vec<String> = self.servers.read().await.keys().cloned().collect();
    names.sort();
    names
  }

  /// Forget `name` without stopping it
  pub async fn remove(&self, name: &str) -> Option<ServerHandle> {
    self.servers.write().await.remove(name)
  }

  /// Stop and forget `name`. Returns whether it was registered.
  pub async fn shutdown(&self, name: &str) -> Result<bool> {
    let Some(handle) = self.remove(name).await else {
      return Ok(false);
    };
    tracing::info!("[MITM] stopping proxy {} on {}", name, handle.local_addr());
    handle.shutdown().await?;
    Ok(true)
  }

  /// Stop every registered proxy
  pub async fn shutdown_all(&self) -> Result<()> {
    let handles: Vec<(String, ServerHandle)> = self.servers.write().await.drain().collect();
    for (name, handle) in handles {
      tracing::info!("[MITM] stopping proxy {} on {}", name, handle.local_addr());
      handle.shutdown().await?;
    }
    Ok(())
  }
}
