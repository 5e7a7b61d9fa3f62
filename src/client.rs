use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, StreamSettings, UpstreamConfig};
use crate::error::StreamError;
use crate::protocol::canonical::{ResponseMetadata, StreamEvent};
use crate::stream::{stream_events, StreamSequencer};
use crate::transport::{HttpTransport, StreamTransport};

/// Events of one streamed call.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, StreamError>> + Send>>;

/// Streams chat completions from one configured upstream.
///
/// Every call gets its own [`StreamSequencer`]; nothing is shared between
/// concurrent calls except the transport's connection pool.
#[derive(Debug, Clone)]
pub struct ChatStreamClient<T> {
    transport: T,
    upstream: UpstreamConfig,
    endpoint: String,
    settings: StreamSettings,
}

impl ChatStreamClient<HttpTransport> {
    /// Build a client with a reqwest transport from a loaded config.
    ///
    /// # Errors
    ///
    /// Returns an error when the HTTP client cannot be built.
    pub fn from_config(config: &AppConfig) -> Result<Self, StreamError> {
        let transport = HttpTransport::new(&config.transport, config.upstream.proxy.as_deref())?
            .with_bearer_auth(&config.upstream.api_key)?;
        Ok(Self::new(
            transport,
            config.upstream.clone(),
            config.stream.clone(),
        ))
    }
}

impl<T: StreamTransport> ChatStreamClient<T> {
    #[must_use]
    pub fn new(transport: T, upstream: UpstreamConfig, settings: StreamSettings) -> Self {
        let endpoint = upstream.endpoint();
        Self {
            transport,
            upstream,
            endpoint,
            settings,
        }
    }

    #[must_use]
    pub fn upstream(&self) -> &UpstreamConfig {
        &self.upstream
    }

    /// Send a chat-completion request and stream its events.
    ///
    /// `"stream": true` is forced on the body, and `model` is filled from the
    /// configuration when absent.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Config`] when `body` is not a JSON object, and
    /// any error from opening the stream ([`StreamError::Transport`],
    /// [`StreamError::Upstream`]). Cancellation before the stream opens yields
    /// [`StreamError::Cancelled`].
    pub async fn stream_chat(
        &self,
        mut body: Value,
        cancel: CancellationToken,
    ) -> Result<EventStream, StreamError> {
        let model = prepare_request_body(&mut body, &self.upstream.model)?;
        let payload = serde_json::to_vec(&body)
            .map_err(|err| StreamError::Config(format!("failed to serialize request: {err}")))?;

        tracing::debug!(
            provider = self.upstream.provider.as_str(),
            model = model.as_str(),
            endpoint = self.endpoint.as_str(),
            "opening chat stream"
        );
        let chunks = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(StreamError::Cancelled),
            opened = self.transport.open_stream(&self.endpoint, Bytes::from(payload)) => opened?,
        };

        let sequencer = StreamSequencer::new(
            ResponseMetadata::new(self.upstream.provider.clone(), model),
            &self.settings,
        );
        Ok(Box::pin(stream_events(chunks, sequencer, cancel)))
    }
}

/// Force streaming and fill the model. Returns the model id of the call.
fn prepare_request_body(body: &mut Value, default_model: &str) -> Result<String, StreamError> {
    let Value::Object(obj) = body else {
        return Err(StreamError::Config(
            "request body must be a JSON object".to_string(),
        ));
    };
    obj.insert("stream".to_string(), Value::Bool(true));
    let requested = obj
        .get("model")
        .and_then(Value::as_str)
        .filter(|model| !model.trim().is_empty())
        .map(str::to_owned);
    if let Some(model) = requested {
        return Ok(model);
    }
    obj.insert("model".to_string(), Value::String(default_model.to_owned()));
    Ok(default_model.to_owned())
}
