use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// A captured outgoing request.
///
/// This is the unit the router classifies, the strategies fetch, and the
/// retry queue serializes. Method is kept upper-case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
  pub method: String,
  pub url: Url,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  #[serde(default, with = "body_base64")]
  pub body: Vec<u8>,
  /// Full-page navigation (as opposed to a subresource or API call)
  #[serde(default)]
  pub navigate: bool,
}

impl Request {
  pub fn new(method: &str, url: Url) -> Self {
    Self {
      method: method.to_ascii_uppercase(),
      url,
      headers: BTreeMap::new(),
      body: Vec::new(),
      navigate: false,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new("GET", url)
  }

  /// A GET flagged as a full-page navigation.
  pub fn navigation(url: Url) -> Self {
    Self {
      navigate: true,
      ..Self::get(url)
    }
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = body.into();
    self
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  /// Anything other than GET and HEAD changes server state and is never cached.
  pub fn is_mutating(&self) -> bool {
    !matches!(self.method.as_str(), "GET" | "HEAD")
  }
}

/// A full response snapshot: status, headers and body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  #[serde(default, with = "body_base64")]
  pub body: Vec<u8>,
  /// Set when the snapshot was written to a cache partition
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cached_at: Option<DateTime<Utc>>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body: body.into(),
      cached_at: None,
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Bodies travel as standard base64 in JSON so binary payloads survive
/// queue persistence and the host protocol byte for byte.
mod body_base64 {
  use base64::{engine::general_purpose::STANDARD, Engine};
  use serde::{de::Error, Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(body))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let s = String::deserialize(deserializer)?;
    STANDARD
      .decode(s.as_bytes())
      .map_err(|e| D::Error::custom(format!("invalid base64 body: {}", e)))
  }
}
