//! Host to SNI remapping
//!
//! Rules are evaluated in a fixed order: exact hostnames, then glob patterns in
//! registration order, then the forced default when it is enabled.

use crate::error::{Error, Result};
use std::collections::HashMap;

/// A dot-delimited glob such as `*.example.com` or `api.**`.
///
/// `*` (and `?`) match inside a single label. A label that is exactly `**` matches any
/// number of labels, including none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainGlob {
  pattern: String,
  labels: Vec<String>,
}

impl DomainGlob {
  pub fn new(pattern: &str) -> Result<Self> {
    let pattern = pattern.trim().trim_end_matches('.').to_ascii_lowercase();
    if pattern.is_empty() {
      return Err(Error::config_error("Empty SNI glob pattern"));
    }
    if pattern.split('.').any(|l| l.is_empty()) {
      return Err(Error::config_error(format!("Invalid SNI glob pattern: {}", pattern)));
    }
    let labels = pattern.split('.').map(str::to_string).collect();
    Ok(Self { pattern, labels })
  }

  pub fn as_str(&self) -> &str {
    &self.pattern
  }

  pub fn matches(&self, host: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let host_labels: Vec<&str> = host.split('.').collect();
    let pattern: Vec<&str> = self.labels.iter().map(String::as_str).collect();
    match_labels(&pattern, &host_labels)
  }
}

fn match_labels(pattern: &[&str], host: &[&str]) -> bool {
  match pattern.split_first() {
    None => host.is_empty(),
    Some((&"**", rest)) => (0..=host.len()).any(|skip| match_labels(rest, &host[skip..])),
    Some((first, rest)) => match host.split_first() {
      Some((label, host_rest)) => match_label(first.as_bytes(), label.as_bytes()) && match_labels(rest, host_rest),
      None => false,
    },
  }
}

fn match_label(pattern: &[u8], label: &[u8]) -> bool {
  match pattern.split_first() {
    None => label.is_empty(),
    Some((b'*', rest)) => (0..=label.len()).any(|skip| match_label(rest, &label[skip..])),
    Some((b'?', rest)) => !label.is_empty() && match_label(rest, &label[1..]),
    Some((c, rest)) => label.first() == Some(c) && match_label(rest, &label[1..]),
  }
}

/// Immutable SNI override table
#[derive(Debug, Clone, Default)]
pub struct SniResolver {
  exact: HashMap<String, String>,
  globs: Vec<(DomainGlob, String)>,
  forced: Option<String>,
}

impl SniResolver {
  pub fn builder() -> SniResolverBuilder {
    SniResolverBuilder::default()
  }

  /// The SNI to present upstream for `host`, or `None` to keep the original
  pub fn resolve(&self, host: &str) -> Option<String> {
    let key = host.trim_end_matches('.').to_ascii_lowercase();
    if let Some(sni) = self.exact.get(&key) {
      return Some(sni.clone());
    }
    if let Some((_, sni)) = self.globs.iter().find(|(glob, _)| glob.matches(&key)) {
      return Some(sni.clone());
    }
    self.forced.clone()
  }

  pub fn is_empty(&self) -> bool {
    self.exact.is_empty() && self.globs.is_empty() && self.forced.is_none()
  }
}

/// Collects SNI rules; invalid globs surface from [`SniResolverBuilder::build`]
#[derive(Debug, Default)]
pub struct SniResolverBuilder {
  exact: Vec<(String, String)>,
  globs: Vec<(String, String)>,
  forced: Option<String>,
}

impl SniResolverBuilder {
  /// Map one hostname to a replacement SNI
  pub fn exact(mut self, host: impl Into<String>, sni: impl Into<String>) -> Self {
    self.exact.push((host.into(), sni.into()));
    self
  }

  /// Map every host matching `pattern` to a replacement SNI
  pub fn glob(mut self, pattern: impl Into<String>, sni: impl Into<String>) -> Self {
    self.globs.push((pattern.into(), sni.into()));
    self
  }

  /// Fallback SNI for hosts no rule matches
  pub fn force(mut self, sni: impl Into<String>) -> Self {
    self.forced = Some(sni.into());
    self
  }

  pub fn build(self) -> Result<SniResolver> {
    let exact = self
      .exact
      .into_iter()
      .map(|(h, s)| (h.trim_end_matches('.').to_ascii_lowercase(), s))
      .collect();
    let globs = self
      .globs
      .into_iter()
      .map(|(p, s)| Ok((DomainGlob::new(&p)?, s)))
      .collect::<Result<Vec<_>>>()?;
    Ok(SniResolver {
      exact,
      globs,
      forced: self.forced,
    })
  }
}
