use crate::config::Destination;
use crate::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;

/// Header carrying the destination's access token.
pub const ACCESS_TOKEN_HEADER: &str = "X-Rollbar-Access-Token";

/// Rate-limit hint sent by the ingestion API alongside 429 responses.
pub const RATE_LIMIT_REMAINING_SECONDS_HEADER: &str = "X-Rate-Limit-Remaining-Seconds";

/// What came back from the endpoint. Any HTTP status is an `Ok` here; only
/// failures to get a response at all are [`TransportError`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
    /// How long the endpoint asked us to back off, when it said so.
    pub retry_after: Option<Duration>,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            retry_after: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(200, "{\"err\":0}")
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Stateless HTTP wrapper the dispatch side talks to.
///
/// Implementations own their connection pool; one instance is shared by every
/// drain loop for the life of the process.
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST one serialized payload for `destination`.
    ///
    /// **Returns**
    /// - `Ok(response)` for any HTTP answer, success or not.
    /// - `Err(..)` when no answer was obtained (connect error, timeout).
    async fn post(&self, destination: &Destination, payload: &[u8]) -> Result<TransportResponse, TransportError>;

    /// Read-style query against `{endpoint}{path}`.
    ///
    /// Default implementation reports the operation as unsupported.
    async fn get(
        &self,
        destination: &Destination,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<TransportResponse, TransportError> {
        let _ = (destination, query);
        Err(TransportError::Network(format!("GET {} is not supported by this transport", path)))
    }
}

/// A transport that accepts everything without any I/O.
///
/// Useful for measuring the overhead of the pipeline itself, and for tests
/// that don't care about delivery.
#[derive(Clone, Default)]
pub struct NoopTransport;

#[async_trait]
impl Transport for NoopTransport {
    async fn post(&self, _destination: &Destination, _payload: &[u8]) -> Result<TransportResponse, TransportError> {
        Ok(TransportResponse::ok())
    }

    async fn get(
        &self,
        _destination: &Destination,
        _path: &str,
        _query: &[(&str, &str)],
    ) -> Result<TransportResponse, TransportError> {
        Ok(TransportResponse::ok())
    }
}

/// Append query parameters the way the ingestion API expects them.
pub fn build_query(base: &str, params: &[(&str, &str)]) -> String {
    if params.is_empty() {
        return base.to_string();
    }
    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    format!("{}?{}", base, query)
}

#[cfg(feature = "http")]
pub use http::HttpTransport;

#[cfg(feature = "http")]
mod http {
    use super::*;
    use crate::config::TransportOptions;
    use reqwest::header::{HeaderMap, CONTENT_TYPE, RETRY_AFTER};
    use reqwest::Client;

    /// reqwest-backed [`Transport`] talking to the ingestion API.
    #[derive(Clone)]
    pub struct HttpTransport {
        client: Client,
        endpoint: String,
    }

    impl HttpTransport {
        /// Build the transport and its long-lived connection pool.
        ///
        /// **Parameters**
        /// - `options`: [`TransportOptions`] with the API root and request
        ///   timeout.
        pub fn new(options: &TransportOptions) -> Result<Self, TransportError> {
            let client = Client::builder()
                .timeout(options.request_timeout)
                .pool_idle_timeout(Duration::from_secs(90))
                .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
                .build()?;
            let mut endpoint = options.endpoint.trim().to_string();
            if !endpoint.ends_with('/') {
                endpoint.push('/');
            }
            Ok(Self { client, endpoint })
        }

        pub fn item_url(&self) -> String {
            format!("{}item/", self.endpoint)
        }

        async fn into_response(resp: reqwest::Response) -> TransportResponse {
            let status = resp.status().as_u16();
            let retry_after = parse_retry_after(resp.headers());
            let body = resp.text().await.unwrap_or_else(|_| "<no body>".to_string());
            TransportResponse { status, body, retry_after }
        }
    }

    /// Read the back-off hint from `Retry-After` (seconds) or the API's own
    /// remaining-seconds header.
    pub(crate) fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
        [RETRY_AFTER.as_str(), RATE_LIMIT_REMAINING_SECONDS_HEADER]
            .iter()
            .filter_map(|name| headers.get(*name))
            .filter_map(|value| value.to_str().ok())
            .filter_map(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .next()
    }

    #[async_trait]
    impl Transport for HttpTransport {
        async fn post(&self, destination: &Destination, payload: &[u8]) -> Result<TransportResponse, TransportError> {
            let resp = self
                .client
                .post(self.item_url())
                .header(ACCESS_TOKEN_HEADER, destination.access_token.as_str())
                .header(CONTENT_TYPE, "application/json")
                .body(payload.to_vec())
                .send()
                .await?;
            Ok(Self::into_response(resp).await)
        }

        async fn get(
            &self,
            destination: &Destination,
            path: &str,
            query: &[(&str, &str)],
        ) -> Result<TransportResponse, TransportError> {
            let mut params = Vec::with_capacity(query.len() + 1);
            params.push(("access_token", destination.access_token.as_str()));
            params.extend_from_slice(query);
            let url = build_query(
                &format!("{}{}", self.endpoint, path.trim_start_matches('/')),
                &params,
            );
            let resp = self.client.get(&url).send().await?;
            Ok(Self::into_response(resp).await)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use reqwest::header::HeaderValue;

        #[test]
        fn retry_after_prefers_standard_header() {
            let mut headers = HeaderMap::new();
            headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
            headers.insert(RATE_LIMIT_REMAINING_SECONDS_HEADER, HeaderValue::from_static("30"));
            assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));
        }

        #[test]
        fn retry_after_falls_back_to_api_header() {
            let mut headers = HeaderMap::new();
            headers.insert(RATE_LIMIT_REMAINING_SECONDS_HEADER, HeaderValue::from_static(" 12 "));
            assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(12)));
        }

        #[test]
        fn retry_after_ignores_http_dates() {
            let mut headers = HeaderMap::new();
            headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
            assert_eq!(parse_retry_after(&headers), None);
        }

        #[test]
        fn endpoint_gets_trailing_slash() {
            let transport = HttpTransport::new(&TransportOptions {
                endpoint: "http://localhost:1234/api/1".into(),
                ..Default::default()
            })
            .unwrap();
            assert_eq!(transport.item_url(), "http://localhost:1234/api/1/item/");
        }
    }
}
