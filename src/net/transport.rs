use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use std::collections::BTreeMap;

use super::types::{Request, Response};

/// The network as seen by the worker.
///
/// `Err` means delivery failed (offline, refused, DNS). Any HTTP status,
/// including 4xx/5xx, is a successful delivery and comes back as `Ok`.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// Transport backed by reqwest.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("offsync/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let (method, headers) = wire_parts(request)?;

    let response = self
      .client
      .request(method, request.url.clone())
      .headers(headers)
      .body(request.body.clone())
      .send()
      .await
      .map_err(|e| eyre!("Network request to {} failed: {}", request.url, e))?;

    let status = response.status().as_u16();
    let headers = from_header_map(response.headers());
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response body from {}: {}", request.url, e))?;

    Ok(Response {
      status,
      headers,
      body: body.to_vec(),
      cached_at: None,
    })
  }
}

/// Check that a request can be put on the wire at all.
///
/// A malformed method or header is a local error: no amount of retrying
/// delivers it, so callers check before treating a failure as offline.
pub fn validate_request(request: &Request) -> Result<()> {
  wire_parts(request).map(|_| ())
}

fn wire_parts(request: &Request) -> Result<(Method, HeaderMap)> {
  let method = Method::from_bytes(request.method.as_bytes())
    .map_err(|e| eyre!("Invalid method {}: {}", request.method, e))?;
  Ok((method, to_header_map(&request.headers)?))
}

fn to_header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap> {
  let mut map = HeaderMap::new();
  for (name, value) in headers {
    let name = HeaderName::from_bytes(name.as_bytes())
      .map_err(|e| eyre!("Invalid header name {}: {}", name, e))?;
    let value =
      HeaderValue::from_str(value).map_err(|e| eyre!("Invalid header value for {}: {}", name, e))?;
    map.insert(name, value);
  }
  Ok(map)
}

/// Non-UTF-8 header values are dropped from the snapshot.
fn from_header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
  headers
    .iter()
    .filter_map(|(name, value)| {
      value
        .to_str()
        .ok()
        .map(|v| (name.as_str().to_string(), v.to_string()))
    })
    .collect()
}
