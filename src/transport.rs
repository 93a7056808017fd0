//! Abstract HTTP transport collaborator (spec.md §6). The core consumes
//! an abstract POST-capable client; production binaries plug in a real
//! one. A `reqwest`-backed default is provided behind the
//! `reqwest-client` feature, the same "bring your own http client, but
//! ship a batteries-included default" shape as the teacher's
//! `DatadogPipelineBuilder::with_http_client`.

use crate::error::TransportError;
use std::time::Duration;

pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// `HTTPClient::post` per spec.md §6. Synchronous/blocking: the core's
/// two background workers are plain OS threads with no implicit async
/// runtime (spec.md §5), so collaborators are called from a blocking
/// context.
pub trait HttpClient: Send + Sync {
    fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: Vec<u8>,
        deadline: Duration,
    ) -> Result<HttpResponse, TransportError>;
}

#[cfg(feature = "reqwest-client")]
pub struct ReqwestClient {
    client: reqwest::blocking::Client,
}

#[cfg(feature = "reqwest-client")]
impl ReqwestClient {
    pub fn new() -> Self {
        ReqwestClient {
            client: reqwest::blocking::Client::new(),
        }
    }
}

#[cfg(feature = "reqwest-client")]
impl Default for ReqwestClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "reqwest-client")]
impl HttpClient for ReqwestClient {
    fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: Vec<u8>,
        deadline: Duration,
    ) -> Result<HttpResponse, TransportError> {
        let mut req = self.client.post(url).timeout(deadline).body(body);
        for (k, v) in headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let resp = req.send().map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::ConnectionFailure(e.to_string())
            }
        })?;

        let status = resp.status().as_u16();
        let body = resp
            .bytes()
            .map_err(|e| TransportError::ConnectionFailure(e.to_string()))?
            .to_vec();

        Ok(HttpResponse { status, body })
    }
}
