mod http_transport;
mod retry_policy;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;

use crate::error::StreamError;

pub use http_transport::HttpTransport;

/// Response body of an opened stream.
pub type ByteStream = BoxStream<'static, Result<Bytes, StreamError>>;

/// Opens a streaming response for a serialized request body.
///
/// Implementations resolve once response headers are in, so a non-2xx status
/// surfaces as an error before any event is produced.
pub trait StreamTransport: Send + Sync {
    fn open_stream<'a>(
        &'a self,
        endpoint: &'a str,
        body: Bytes,
    ) -> BoxFuture<'a, Result<ByteStream, StreamError>>;
}
