//! HTTP transport for OCSP, CRL and TSA exchanges.
//!
//! The collectors talk to [`HttpTransport`] only, so tests and embedders can
//! swap the network for an in-memory responder. [`ReqwestTransport`] is the
//! blocking `reqwest` implementation used by default.

use crate::error::{Error, Result};
use std::time::Duration;

/// HTTP response structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// `Content-Type` header, if sent
    pub content_type: Option<String>,
    /// Response body as bytes
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Check if the response status indicates success (2xx)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The body of a 2xx response, an [`Error::Http`] otherwise.
    pub fn into_body(self, url: &str) -> Result<Vec<u8>> {
        if self.is_success() {
            Ok(self.body)
        } else {
            Err(Error::Http(format!("HTTP {} from {}", self.status, url)))
        }
    }
}

/// HTTP basic credentials. The password never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct BasicAuth {
    /// User name
    pub username: String,
    /// Password
    pub password: String,
}

impl std::fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// A POST exchange.
#[derive(Debug, Clone, Copy)]
pub struct PostRequest<'a> {
    /// Target URL
    pub url: &'a str,
    /// Request body
    pub body: &'a [u8],
    /// `Content-Type` of the body
    pub content_type: &'a str,
    /// Expected `Accept` type
    pub accept: &'a str,
    /// Deadline for the whole exchange
    pub timeout: Duration,
    /// Optional basic authentication
    pub credentials: Option<&'a BasicAuth>,
}

/// Blocking HTTP client seam.
pub trait HttpTransport: Send + Sync {
    /// Perform a GET request.
    fn get(&self, url: &str, timeout: Duration) -> Result<HttpResponse>;

    /// Perform a POST request.
    fn post(&self, request: &PostRequest<'_>) -> Result<HttpResponse>;
}

/// [`HttpTransport`] over `reqwest::blocking`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    /// Build a client. `verify_tls = false` accepts any server certificate.
    pub fn new(verify_tls: bool) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("pades_oxide/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .map_err(|e| Error::Http(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    fn finish(url: &str, response: reqwest::blocking::Response) -> Result<HttpResponse> {
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .map_err(|e| Error::Http(format!("reading body from {} failed: {}", url, e)))?;
        log::debug!("{} -> HTTP {} ({} bytes)", url, status, body.len());
        Ok(HttpResponse {
            status,
            content_type,
            body: body.to_vec(),
        })
    }
}

impl HttpTransport for ReqwestTransport {
    fn get(&self, url: &str, timeout: Duration) -> Result<HttpResponse> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .map_err(|e| Error::Http(format!("GET {} failed: {}", url, e)))?;
        Self::finish(url, response)
    }

    fn post(&self, request: &PostRequest<'_>) -> Result<HttpResponse> {
        let mut builder = self
            .client
            .post(request.url)
            .timeout(request.timeout)
            .header(reqwest::header::CONTENT_TYPE, request.content_type)
            .header(reqwest::header::ACCEPT, request.accept)
            .body(request.body.to_vec());
        if let Some(auth) = request.credentials {
            builder = builder.basic_auth(&auth.username, Some(&auth.password));
        }
        let response = builder
            .send()
            .map_err(|e| Error::Http(format!("POST {} failed: {}", request.url, e)))?;
        Self::finish(request.url, response)
    }
}
