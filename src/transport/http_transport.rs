use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{StreamExt, TryStreamExt};
use http::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};

use crate::config::TransportConfig;
use crate::error::StreamError;

use super::retry_policy::{
    error_chain_message, retry_backoff_delay, retry_delay, should_retry_transport_error,
    should_retry_upstream_status, RETRY_MAX_ATTEMPTS,
};
use super::{ByteStream, StreamTransport};

const ERROR_BODY_MAX_CHARS: usize = 512;

fn build_reqwest_client(
    config: &TransportConfig,
    proxy_url: Option<&str>,
) -> Result<reqwest::Client, StreamError> {
    let pool_idle_timeout =
        (config.pool_idle_timeout_secs > 0).then(|| Duration::from_secs(config.pool_idle_timeout_secs));
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .pool_idle_timeout(pool_idle_timeout)
        .tcp_nodelay(true)
        .connect_timeout(config.connect_timeout())
        .redirect(reqwest::redirect::Policy::none())
        .timeout(config.timeout());

    if let Some(proxy_url) = proxy_url {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|err| StreamError::Config(format!("Invalid proxy URL: {err}")))?;
        builder = builder.no_proxy().proxy(proxy);
    } else if !config.use_env_proxy {
        builder = builder.no_proxy();
    }

    builder.build().map_err(StreamError::transport)
}

/// Pooled reqwest client posting streaming chat requests.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    headers: HeaderMap,
}

impl HttpTransport {
    /// Build a transport with its own connection pool.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Config`] for an invalid proxy URL and
    /// [`StreamError::Transport`] when the client cannot be built.
    pub fn new(config: &TransportConfig, proxy_url: Option<&str>) -> Result<Self, StreamError> {
        let mut headers = HeaderMap::with_capacity(3);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        Ok(Self {
            client: build_reqwest_client(config, proxy_url)?,
            headers,
        })
    }

    /// Send `Authorization: Bearer <api_key>` with every request.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Config`] when the key is not a valid header value.
    pub fn with_bearer_auth(mut self, api_key: &str) -> Result<Self, StreamError> {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", api_key.trim()))
            .map_err(|_| StreamError::Config("api_key contains invalid header characters".into()))?;
        value.set_sensitive(true);
        self.headers.insert(AUTHORIZATION, value);
        Ok(self)
    }

    async fn send_with_retry(
        &self,
        url: &url::Url,
        body: Bytes,
    ) -> Result<reqwest::Response, StreamError> {
        let mut attempt = 0;
        loop {
            let mut request = reqwest::Request::new(http::Method::POST, url.clone());
            *request.headers_mut() = self.headers.clone();
            *request.body_mut() = Some(reqwest::Body::from(body.clone()));

            match self.client.execute(request).await {
                Ok(response) => {
                    if attempt < RETRY_MAX_ATTEMPTS
                        && should_retry_upstream_status(response.status())
                    {
                        let delay = retry_delay(response.headers(), attempt);
                        tracing::warn!(
                            status = response.status().as_u16(),
                            retry_attempt = attempt + 1,
                            delay_ms = delay.as_millis(),
                            "retrying upstream request after retriable status"
                        );
                        drop(response);
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Ok(response);
                }
                Err(err) => {
                    if attempt >= RETRY_MAX_ATTEMPTS || !should_retry_transport_error(&err) {
                        return Err(StreamError::from(err));
                    }

                    let delay = retry_backoff_delay(attempt);
                    tracing::warn!(
                        retry_attempt = attempt + 1,
                        delay_ms = delay.as_millis(),
                        error = %error_chain_message(&err),
                        "retrying upstream request after transport error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl StreamTransport for HttpTransport {
    fn open_stream<'a>(
        &'a self,
        endpoint: &'a str,
        body: Bytes,
    ) -> BoxFuture<'a, Result<ByteStream, StreamError>> {
        Box::pin(async move {
            let url = url::Url::parse(endpoint).map_err(|err| {
                StreamError::Config(format!("invalid endpoint URL '{endpoint}': {err}"))
            })?;
            let response = self.send_with_retry(&url, body).await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(StreamError::Upstream {
                    status: status.as_u16(),
                    message: upstream_error_message(status, &body),
                });
            }
            Ok(response.bytes_stream().map_err(StreamError::from).boxed())
        })
    }
}

/// Vendor error message from a non-2xx body, falling back to the body text
/// and then to the status reason.
pub(crate) fn upstream_error_message(status: http::StatusCode, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        let error = value.get("error").unwrap_or(&value);
        let message = match error {
            serde_json::Value::String(message) => Some(message.as_str()),
            other => other.get("message").and_then(serde_json::Value::as_str),
        };
        if let Some(message) = message.filter(|m| !m.is_empty()) {
            return message.to_owned();
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return status
            .canonical_reason()
            .unwrap_or("upstream request failed")
            .to_owned();
    }
    trimmed.chars().take(ERROR_BODY_MAX_CHARS).collect()
}
