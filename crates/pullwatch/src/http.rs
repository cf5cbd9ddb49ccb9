use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Fixed request timeout applied by the default transport.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// User agent sent with every request.
pub const USER_AGENT: &str = concat!("pullwatch/", env!("CARGO_PKG_VERSION"));

/// HTTP headers represented as key/value pairs.
///
/// Header names are treated case-insensitively by helper functions.
pub type HttpHeaders = Vec<(String, String)>;

/// A GET request as issued by the sync engine.
///
/// The engine only ever reads from the remote API, so the transport surface
/// is GET-only by design.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub headers: HttpHeaders,
}

/// A minimal HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HttpHeaders,
    pub body: Vec<u8>,
}

impl HttpResponse {
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        header_get(&self.headers, name)
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("http transport error: {0}")]
    Transport(String),

    #[error("no mock response registered for GET {url}")]
    NoMockResponse { url: String },
}

/// Transport boundary for all HTTP I/O.
///
/// Implementations must enforce their own request timeout; a timeout is
/// reported as [`HttpError::Transport`] like any other connection failure.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, request: HttpRequest) -> Result<HttpResponse, HttpError>;
}

/// Get the first header value matching `name` (case-insensitive).
#[must_use]
pub fn header_get<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// A real HTTP transport backed by reqwest.
///
/// The underlying client is shared and connection-pooled; concurrency toward
/// a single host is additionally bounded by the request layer.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Build a transport with the engine's default timeout and user agent.
    pub fn with_defaults() -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| HttpError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let mut builder = self.client.get(&request.url);
        for (k, v) in request.headers {
            builder = builder.header(&k, &v);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| HttpError::Transport(e.to_string()))?;

        let status = resp.status().as_u16();
        let mut headers: HttpHeaders = Vec::new();
        for (name, value) in resp.headers().iter() {
            headers.push((
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            ));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| HttpError::Transport(e.to_string()))?
            .to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

// ---------- Test-only mock transport ----------

#[cfg(test)]
pub(crate) use mock::MockTransport;

#[cfg(test)]
pub(crate) mod mock {
    use super::*;

    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};

    /// In-memory mock transport keyed by exact URL.
    ///
    /// Designed for unit tests: no sockets, no loopback HTTP servers.
    #[derive(Clone, Default)]
    pub struct MockTransport {
        inner: Arc<Mutex<MockTransportInner>>,
    }

    #[derive(Default)]
    struct MockTransportInner {
        routes: HashMap<String, VecDeque<HttpResponse>>,
        requests: Vec<HttpRequest>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Register a response for a URL.
        ///
        /// Multiple responses for the same URL are returned in FIFO order;
        /// the last one registered repeats once the queue drains, so a test
        /// can run several cycles without re-mounting every route.
        pub fn push_response(&self, url: impl Into<String>, response: HttpResponse) {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner
                .routes
                .entry(url.into())
                .or_default()
                .push_back(response);
        }

        /// Register a JSON response with the given status and extra headers.
        pub fn push_json(
            &self,
            url: impl Into<String>,
            status: u16,
            body: &serde_json::Value,
            extra_headers: &[(&str, &str)],
        ) {
            let mut headers: HttpHeaders =
                vec![("Content-Type".to_string(), "application/json".to_string())];
            for (k, v) in extra_headers {
                headers.push(((*k).to_string(), (*v).to_string()));
            }
            self.push_response(
                url,
                HttpResponse {
                    status,
                    headers,
                    body: serde_json::to_vec(body).expect("mock body should serialize"),
                },
            );
        }

        /// Replace any queued responses for a URL with a single JSON response.
        pub fn set_json(
            &self,
            url: impl Into<String>,
            status: u16,
            body: &serde_json::Value,
            extra_headers: &[(&str, &str)],
        ) {
            let url = url.into();
            {
                let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                inner.routes.remove(&url);
            }
            self.push_json(url, status, body, extra_headers);
        }

        #[must_use]
        pub fn requests(&self) -> Vec<HttpRequest> {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.requests.clone()
        }

        /// Number of requests issued to a URL.
        #[must_use]
        pub fn hits(&self, url: &str) -> usize {
            self.requests().iter().filter(|r| r.url == url).count()
        }
    }

    #[async_trait]
    impl HttpTransport for MockTransport {
        async fn get(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

            let url = request.url.clone();
            inner.requests.push(request);

            match inner.routes.get_mut(&url) {
                Some(queue) if queue.len() > 1 => {
                    Ok(queue.pop_front().expect("non-empty queue"))
                }
                Some(queue) => queue
                    .front()
                    .cloned()
                    .ok_or(HttpError::NoMockResponse { url }),
                None => Err(HttpError::NoMockResponse { url }),
            }
        }
    }
}
