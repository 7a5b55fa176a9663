//! HTTP byte transfer for streaming playback.
//!
//! One GET request; the response body is pushed into the pipeline as it arrives.

use std::io::Read;
use std::time::Duration;

use stream_player::transfer::{
    ByteTransfer, ReaderTransfer, TransferEnd, TransferError, TransferSink,
};

/// Bytes read from the response body per transfer chunk.
const BODY_CHUNK: usize = 16 * 1024;

#[derive(Clone, Debug)]
pub(crate) struct HttpOptions {
    /// Connect and response-header timeout. The body itself has no deadline.
    pub(crate) timeout: Duration,
    /// Sleep while the pipeline holds the transfer paused.
    pub(crate) idle: Duration,
}

/// Connected HTTP stream.
pub(crate) struct HttpTransfer {
    body: ReaderTransfer<Box<dyn Read + Send>>,
    content_type: Option<String>,
}

impl HttpTransfer {
    /// Issue the request and wait for response headers.
    pub(crate) fn connect(url: &str, options: &HttpOptions) -> Result<Self, TransferError> {
        let resp = ureq::get(url)
            .config()
            .timeout_connect(Some(options.timeout))
            .timeout_recv_response(Some(options.timeout))
            .build()
            .call()
            .map_err(|e| match e {
                ureq::Error::StatusCode(code) => TransferError::Status(code),
                other => TransferError::Connect(format!("{url}: {other}")),
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(TransferError::Status(status.as_u16()));
        }
        let content_type = resp
            .headers()
            .get("Content-Type")
            .and_then(|v| v.to_str().ok())
            .map(mime_essence);
        let content_length = resp
            .headers()
            .get("Content-Length")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        tracing::info!(
            url,
            status = status.as_u16(),
            content_type = content_type.as_deref().unwrap_or("-"),
            content_length = ?content_length,
            "stream connected"
        );

        let (_, body) = resp.into_parts();
        let reader: Box<dyn Read + Send> = Box::new(body.into_reader());
        Ok(Self {
            body: ReaderTransfer::new(reader, BODY_CHUNK, options.idle),
            content_type,
        })
    }

    /// MIME type without parameters, e.g. `audio/mpeg`.
    pub(crate) fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }
}

impl ByteTransfer for HttpTransfer {
    fn run(&mut self, sink: &mut dyn TransferSink) -> Result<TransferEnd, TransferError> {
        self.body.run(sink)
    }
}

/// Strip parameters such as `; charset=..` and normalize case.
fn mime_essence(header: &str) -> String {
    header
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_essence_drops_parameters() {
        assert_eq!(mime_essence("audio/mpeg"), "audio/mpeg");
        assert_eq!(mime_essence("Audio/AAC; charset=binary"), "audio/aac");
        assert_eq!(mime_essence(""), "");
    }

    #[test]
    fn unreachable_host_is_a_connect_error() {
        let options = HttpOptions {
            timeout: Duration::from_millis(500),
            idle: Duration::from_millis(10),
        };
        let err = HttpTransfer::connect("http://127.0.0.1:9/stream.mp3", &options)
            .err()
            .unwrap();
        assert!(matches!(err, TransferError::Connect(_)));
    }
}
