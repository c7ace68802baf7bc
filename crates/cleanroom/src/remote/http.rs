//! Shared HTTP plumbing: a single-attempt client and uniform error mapping.

use std::time::Duration;

use common::{CleanroomError, Result};
use reqwest::{Method, RequestBuilder, Response, StatusCode};

/// Thin wrapper around [`reqwest::Client`] with a bounded per-request timeout.
///
/// Every call is a single attempt. Retry policy belongs to the caller.
#[derive(Clone, Debug)]
pub struct HttpClient {
    inner: reqwest::Client,
}

impl HttpClient {
    /// Build a client whose requests time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`CleanroomError::Configuration`] if the TLS backend cannot be
    /// initialised.
    pub fn new(timeout: Duration) -> Result<Self> {
        let inner = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("cleanroom/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CleanroomError::Configuration(format!("http client: {e}")))?;
        Ok(Self { inner })
    }

    /// Start a request, attaching a bearer token when one is supplied.
    pub fn request(&self, method: Method, url: &str, token: Option<&str>) -> RequestBuilder {
        let builder = self.inner.request(method, url);
        match token {
            Some(t) => builder.bearer_auth(t),
            None => builder,
        }
    }
}

/// Send `builder` and return the response if its status is a success, or
/// `Ok(None)` for a 404 when `allow_missing` is set.
///
/// # Errors
///
/// Transport failures surface as [`CleanroomError::RemoteService`] with
/// status `0`; non-success statuses carry the response body.
pub async fn send(
    method: &Method,
    url: &str,
    builder: RequestBuilder,
    allow_missing: bool,
) -> Result<Option<Response>> {
    let response = builder
        .send()
        .await
        .map_err(|e| remote_error(method, url, 0, e.to_string()))?;

    let status = response.status();
    if status.is_success() {
        return Ok(Some(response));
    }
    if allow_missing && status == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    let body = response.text().await.unwrap_or_default();
    Err(remote_error(method, url, status.as_u16(), body))
}

/// Send `builder`, treating any non-success status as an error.
pub async fn send_expect(method: &Method, url: &str, builder: RequestBuilder) -> Result<Response> {
    send(method, url, builder, false)
        .await?
        .ok_or_else(|| remote_error(method, url, StatusCode::NOT_FOUND.as_u16(), String::new()))
}

/// Read a response body as JSON.
pub async fn json_body<T: serde::de::DeserializeOwned>(
    method: &Method,
    url: &str,
    response: Response,
) -> Result<T> {
    let status = response.status().as_u16();
    response
        .json::<T>()
        .await
        .map_err(|e| remote_error(method, url, status, format!("unreadable body: {e}")))
}

/// Read a response body as text.
pub async fn text_body(method: &Method, url: &str, response: Response) -> Result<String> {
    let status = response.status().as_u16();
    response
        .text()
        .await
        .map_err(|e| remote_error(method, url, status, format!("unreadable body: {e}")))
}

/// Build a [`CleanroomError::RemoteService`].
pub fn remote_error(method: &Method, url: &str, status: u16, body: String) -> CleanroomError {
    CleanroomError::RemoteService {
        method: method.to_string(),
        url: url.to_owned(),
        status,
        body,
    }
}

/// Join a base URL and a path with exactly one `/` between them.
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_normalises_slashes() {
        assert_eq!(join_url("https://a/", "/b"), "https://a/b");
        assert_eq!(join_url("https://a", "b/c"), "https://a/b/c");
    }

    #[test]
    fn remote_error_carries_request_details() {
        let e = remote_error(&Method::PUT, "https://kv/keys/k", 403, "forbidden".into());
        match e {
            CleanroomError::RemoteService {
                method,
                url,
                status,
                body,
            } => {
                assert_eq!(method, "PUT");
                assert_eq!(url, "https://kv/keys/k");
                assert_eq!(status, 403);
                assert_eq!(body, "forbidden");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_failure_maps_to_status_zero() {
        let client = HttpClient::new(Duration::from_millis(200)).unwrap();
        // Port 9 (discard) on loopback is not expected to be listening.
        let url = "http://127.0.0.1:9/unreachable";
        let err = send(&Method::GET, url, client.request(Method::GET, url, None), false)
            .await
            .unwrap_err();
        assert!(matches!(err, CleanroomError::RemoteService { status: 0, .. }));
        assert!(err.is_retryable());
    }
}
