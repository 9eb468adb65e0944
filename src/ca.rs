//! Certificate Authority (CA) management for the MITM proxy
//!
//! The root authority is loaded from (or generated into) a storage directory once at
//! startup. Leaf certificates are issued per hostname on demand and cached for the
//! lifetime of the [`CertificateManager`].
//!

use crate::error::{Error, Result};
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Leaf validity period in seconds (1 year)
const TTL_SECS: i64 = 365 * 24 * 60 * 60;
/// Offset for not_before timestamp to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;
/// Root validity period in days (10 years)
const ROOT_TTL_DAYS: i64 = 3650;

/// File name of the persisted root certificate
pub const CA_CERT_FILE: &str = "ca_cert.pem";
/// File name of the persisted root private key
pub const CA_KEY_FILE: &str = "ca_key.pem";

/// The self-signed root that signs every leaf.
pub struct RootAuthority {
  issuer: Issuer<'static, KeyPair>,
  cert_der: CertificateDer<'static>,
  cert_pem: String,
  storage_path: PathBuf,
}

impl RootAuthority {
  /// Load the root from `storage_path`, or generate and persist a fresh one.
  ///
  /// An existing pair is only reused when both the certificate and the key decode;
  /// anything else is replaced by a newly generated root.
  pub async fn load_or_generate(storage_path: impl AsRef<Path>) -> Result<Self> {
    let storage_path = storage_path.as_ref().to_path_buf();

    if !storage_path.exists() {
      fs::create_dir_all(&storage_path).await?;
    }

    let cert_path = storage_path.join(CA_CERT_FILE);
    let key_path = storage_path.join(CA_KEY_FILE);

    let (issuer, cert_der, cert_pem) = if cert_path.exists() && key_path.exists() {
      match Self::load(&cert_path, &key_path).await {
        Ok(loaded) => {
          tracing::info!("[MITM] loaded root CA from {}", storage_path.display());
          loaded
        }
        Err(e) => {
          tracing::warn!("[MITM] stored root CA unusable ({}), generating a new one", e);
          Self::generate(&cert_path, &key_path).await?
        }
      }
    } else {
      Self::generate(&cert_path, &key_path).await?
    };

    Ok(Self {
      issuer,
      cert_der,
      cert_pem,
      storage_path,
    })
  }

  async fn load(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>, String)> {
    let cert_pem = fs::read_to_string(cert_path).await?;
    let key_pem = fs::read_to_string(key_path).await?;

    let key_pair = KeyPair::from_pem(&key_pem)
      .map_err(|e| Error::certificate_error(format!("Failed to parse CA key: {}", e)))?;

    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate_error("No certificate found in PEM"))?
      .map_err(|e| Error::certificate_error(format!("Failed to parse PEM: {}", e)))?;

    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair).map_err(|e| {
      Error::certificate_error(format!("Failed to create issuer from CA cert: {}", e))
    })?;

    Ok((issuer, cert_der, cert_pem))
  }

  async fn generate(
    cert_path: &Path,
    key_path: &Path,
  ) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>, String)> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "MITM Hijack Root CA");
    dn.push(DnType::OrganizationName, "mitm-hijack");
    dn.push(DnType::CountryName, "CN");
    dn.push(DnType::LocalityName, "Internet");
    dn.push(DnType::StateOrProvinceName, "World");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::days(ROOT_TTL_DAYS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))?;

    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate_error(format!("Failed to generate CA: {}", e)))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();

    let mut cert_file = fs::File::create(cert_path).await?;
    cert_file.write_all(cert_pem.as_bytes()).await?;
    cert_file.flush().await?;

    let mut key_file = fs::File::create(key_path).await?;
    key_file.write_all(key_pem.as_bytes()).await?;
    key_file.flush().await?;

    tracing::info!("[MITM] generated new root CA at {}", cert_path.display());

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate_error(format!("Failed to create issuer: {}", e)))?;

    Ok((issuer, cert_der, cert_pem))
  }

  /// Issue a leaf for `host`, signed by this root.
  ///
  /// `host` must already be stripped of any port. IP literals get an IP SAN plus a DNS
  /// SAN carrying the textual address.
  pub fn issue_leaf(&self, host: &str) -> Result<LeafCertificate> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;

    params.subject_alt_names = if let Ok(ip) = host.parse::<IpAddr>() {
      let mut sans = vec![SanType::IpAddress(ip)];
      if let Ok(dns_name) = host.try_into() {
        sans.push(SanType::DnsName(dns_name));
      }
      sans
    } else {
      vec![SanType::DnsName(host.try_into().map_err(|_| {
        Error::certificate_error(format!("Invalid domain name: {}", host))
      })?)]
    };
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(TTL_SECS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_error(format!("Failed to generate key pair: {}", e)))?;

    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate_error(format!("Failed to sign leaf cert: {}", e)))?;

    let key = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate_error("Failed to serialize leaf key"))?;

    Ok(LeafCertificate {
      host: host.to_string(),
      chain: vec![CertificateDer::from(cert.der().to_vec()), self.cert_der.clone()],
      key,
    })
  }

  /// Root certificate in DER form
  pub fn cert_der(&self) -> &CertificateDer<'static> {
    &self.cert_der
  }

  /// Root certificate in PEM form, as served to clients for installation
  pub fn cert_pem(&self) -> &str {
    &self.cert_pem
  }

  /// Path of the persisted root certificate
  pub fn cert_path(&self) -> PathBuf {
    self.storage_path.join(CA_CERT_FILE)
  }
}

/// A leaf certificate chain (`[leaf, root]`) and its private key.
pub struct LeafCertificate {
  host: String,
  chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
}

impl LeafCertificate {
  /// Hostname the leaf was issued for
  pub fn host(&self) -> &str {
    &self.host
  }

  /// Certificate chain, leaf first
  pub fn chain(&self) -> &[CertificateDer<'static>] {
    &self.chain
  }

  /// A fresh copy of the private key
  pub fn key(&self) -> PrivateKeyDer<'static> {
    self.key.clone_key()
  }
}

/// Issues leaves through the root and caches them by hostname.
pub struct CertificateManager {
  root: RootAuthority,
  cache: Cache<String, Arc<LeafCertificate>>,
  issued: AtomicUsize,
}

impl CertificateManager {
  /// Load or generate the root in `storage_path` and start with an empty cache
  pub async fn new(storage_path: impl AsRef<Path>) -> Result<Self> {
    let root = RootAuthority::load_or_generate(storage_path).await?;
    Ok(Self::from_root(root))
  }

  /// Wrap an already loaded root
  pub fn from_root(root: RootAuthority) -> Self {
    Self {
      root,
      // unbounded and without expiry: one issuance per hostname for the process
      cache: Cache::builder().build(),
      issued: AtomicUsize::new(0),
    }
  }

  /// Return the cached leaf for `host`, issuing it on first use.
  ///
  /// A trailing `:port` is stripped and the name is lowercased before lookup.
  /// Concurrent first requests for the same host share one issuance.
  pub async fn leaf(&self, host: &str) -> Result<Arc<LeafCertificate>> {
    let host = normalize_host(host);
    if host.is_empty() {
      return Err(Error::certificate_error("Cannot issue a certificate for an empty host"));
    }
    self
      .cache
      .try_get_with(host.clone(), async {
        let leaf = self.root.issue_leaf(&host)?;
        self.issued.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("[MITM] issued leaf certificate for {}", host);
        Ok::<_, Error>(Arc::new(leaf))
      })
      .await
      .map_err(|e| Error::certificate_error(format!("Failed to issue leaf for {}: {}", host, e)))
  }

  /// Number of leaves actually generated (cache misses)
  pub fn issued_count(&self) -> usize {
    self.issued.load(Ordering::SeqCst)
  }

  /// The root authority
  pub fn root(&self) -> &RootAuthority {
    &self.root
  }

  /// Get the CA certificate in PEM format
  pub fn ca_cert_pem(&self) -> &str {
    self.root.cert_pem()
  }

  /// Get the CA certificate path
  pub fn ca_cert_path(&self) -> PathBuf {
    self.root.cert_path()
  }
}

/// Strip a port suffix and brackets, then lowercase.
pub(crate) fn normalize_host(host: &str) -> String {
  let host = host.trim();
  let bare = if let Some(rest) = host.strip_prefix('[') {
    rest.split(']').next().unwrap_or(rest)
  } else if host.matches(':').count() == 1 {
    host.split(':').next().unwrap_or(host)
  } else {
    host
  };
  bare.trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn normalize_host_strips_ports() {
    assert_eq!(normalize_host("Example.COM:443"), "example.com");
    assert_eq!(normalize_host("[::1]:8443"), "::1");
    assert_eq!(normalize_host("::1"), "::1");
    assert_eq!(normalize_host("a.b.c."), "a.b.c");
  }

  #[tokio::test]
  async fn leaf_for_ip_literal_carries_ip_san() {
    let dir = std::env::temp_dir().join("mitm-hijack-unit-ip-leaf");
    std::fs::remove_dir_all(&dir).ok();
    let manager = CertificateManager::new(&dir).await.unwrap();
    let leaf = manager.leaf("127.0.0.1:443").await.unwrap();
    assert_eq!(leaf.host(), "127.0.0.1");
    assert_eq!(leaf.chain().len(), 2, "chain should be leaf + root");
    assert_eq!(&leaf.chain()[1], manager.root().cert_der());
    std::fs::remove_dir_all(&dir).ok();
  }
}
