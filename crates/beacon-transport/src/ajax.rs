//! HTTP request helpers for the long-poll transport.
//!
//! `append_params` and `serialize_params` are pure helpers for building
//! query strings; nested objects and arrays round-trip using bracket
//! notation (`a[b][]=v`). `request` performs one HTTP request and resolves
//! exactly once with the parsed JSON body, `None` on failure, or a timeout
//! error.

use std::time::Duration;

use reqwest::{Client, Method};
use serde_json::Value;

use crate::traits::TransportError;

/// Serialize a JSON object into a bracket-notation query string.
///
/// Array element order is preserved; keys and values are percent-encoded,
/// brackets are literal.
#[must_use]
pub fn serialize_params(params: &Value) -> String {
    let mut pairs = Vec::new();
    collect_pairs("", params, &mut pairs);
    pairs.join("&")
}

/// Append params to a URL as a query string.
///
/// Returns the URL unchanged when the params serialize to nothing.
#[must_use]
pub fn append_params(url: &str, params: &Value) -> String {
    let query = serialize_params(params);
    if query.is_empty() {
        return url.to_string();
    }
    let separator = if url.contains('?') { "&" } else { "?" };
    format!("{url}{separator}{query}")
}

fn collect_pairs(prefix: &str, value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                let key = encode_component(key);
                let nested_prefix = if prefix.is_empty() {
                    key
                } else {
                    format!("{prefix}[{key}]")
                };
                collect_pairs(&nested_prefix, nested, out);
            }
        }
        Value::Array(items) => {
            let nested_prefix = format!("{prefix}[]");
            for item in items {
                collect_pairs(&nested_prefix, item, out);
            }
        }
        Value::Null => out.push(format!("{prefix}=")),
        Value::String(s) => out.push(format!("{prefix}={}", encode_component(s))),
        other => out.push(format!("{prefix}={}", encode_component(&other.to_string()))),
    }
}

fn encode_component(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

/// Perform one HTTP request.
///
/// Resolves with `Some(body)` when the response body parses as JSON,
/// `None` when the request fails or the body is not JSON. The timeout path
/// is reported separately so callers can distinguish an elapsed long-poll
/// window from a dead server.
///
/// # Errors
///
/// Returns [`TransportError::Timeout`] when the request times out.
pub async fn request(
    client: &Client,
    method: Method,
    url: &str,
    headers: &[(&str, &str)],
    body: Option<String>,
    timeout: Duration,
) -> Result<Option<Value>, TransportError> {
    let mut builder = client
        .request(method, url)
        .header("accept", "application/json")
        .timeout(timeout);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    if let Some(body) = body {
        builder = builder
            .header("content-type", "application/json")
            .body(body);
    }

    match builder.send().await {
        Ok(response) => Ok(response.json::<Value>().await.ok()),
        Err(e) if e.is_timeout() => Err(TransportError::Timeout),
        Err(_) => Ok(None),
    }
}
