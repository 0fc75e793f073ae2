//! Request logging middleware.
//!
//! Outermost layer of the chain. It tags every request with a fresh
//! 16-hex-character id (forwarded upstream and echoed to the client in
//! `X-Request-Id`), wraps the response body to count the bytes actually
//! written, and emits exactly one access record per request once the body
//! finishes or the client goes away.
//!
//! The record is a typed struct serialized to one JSON line, so the field
//! names are fixed by this module and not by any subscriber: `time`
//! (RFC-3339), `level`, `msg`, `request_id`, `method`, `path`,
//! `remote_addr`, `status`, `bytes`, `duration_ms`. Records go to stdout
//! by default; tests inject their own writer.

use std::io::Write;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use http::header::HeaderValue;
use http::{Request, Response};
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, SizeHint};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::error;

use torii_common::request_id;

use crate::http_util::ProxyBody;
use crate::middleware::{ClientInfo, RequestHandler};

const REQUEST_ID_HEADER: &str = "x-request-id";

/// One access-log line. Field names and order are the wire contract.
#[derive(Debug, Serialize)]
struct AccessRecord {
    time: String,
    level: &'static str,
    msg: &'static str,
    request_id: String,
    method: String,
    path: String,
    remote_addr: String,
    status: u16,
    bytes: u64,
    duration_ms: u64,
}

/// Destination for access records: one JSON line per record.
struct AccessLog {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl AccessLog {
    fn stdout() -> Arc<Self> {
        Self::with_writer(Box::new(std::io::stdout()))
    }

    fn with_writer(writer: Box<dyn Write + Send>) -> Arc<Self> {
        Arc::new(Self {
            writer: Mutex::new(writer),
        })
    }

    fn log(&self, record: &AccessRecord) {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "failed to serialize access record");
                return;
            }
        };
        let mut writer = self.writer.lock();
        let _ = writeln!(writer, "{line}");
        let _ = writer.flush();
    }
}

/// Per-request access logging around an inner handler.
pub struct RequestLogger {
    inner: Arc<dyn RequestHandler>,
    log: Arc<AccessLog>,
}

impl RequestLogger {
    pub fn new(inner: Arc<dyn RequestHandler>) -> Self {
        Self {
            inner,
            log: AccessLog::stdout(),
        }
    }

    fn with_access_log(inner: Arc<dyn RequestHandler>, log: Arc<AccessLog>) -> Self {
        Self { inner, log }
    }
}

#[async_trait]
impl RequestHandler for RequestLogger {
    async fn handle(&self, mut req: Request<ProxyBody>, client: ClientInfo) -> Response<ProxyBody> {
        let start = Instant::now();
        let id = request_id();
        let id_value =
            HeaderValue::from_str(&id).expect("hex request id is a valid header value");

        let method = req.method().to_string();
        let path = req.uri().path().to_string();

        req.headers_mut().insert(REQUEST_ID_HEADER, id_value.clone());

        let mut response = self.inner.handle(req, client).await;
        response.headers_mut().insert(REQUEST_ID_HEADER, id_value);

        let pending = PendingRecord {
            log: Arc::clone(&self.log),
            request_id: id,
            method,
            path,
            remote_addr: client.remote_addr.to_string(),
            status: response.status().as_u16(),
            start,
        };
        response.map(|body| CountingBody::new(body, pending).boxed())
    }
}

/// Everything the access record needs besides the final byte count and
/// timings, captured while the response headers were at hand.
struct PendingRecord {
    log: Arc<AccessLog>,
    request_id: String,
    method: String,
    path: String,
    remote_addr: String,
    status: u16,
    start: Instant,
}

impl PendingRecord {
    fn emit(self, bytes: u64) {
        let record = AccessRecord {
            time: Utc::now().to_rfc3339(),
            level: "INFO",
            msg: "request",
            request_id: self.request_id,
            method: self.method,
            path: self.path,
            remote_addr: self.remote_addr,
            status: self.status,
            bytes,
            duration_ms: self.start.elapsed().as_millis() as u64,
        };
        self.log.log(&record);
    }
}

/// Body wrapper that counts data frames and emits the access record once
/// the stream ends. Dropping an unfinished body (client disconnect) still
/// emits, with the bytes counted so far.
struct CountingBody {
    inner: ProxyBody,
    bytes: u64,
    pending: Option<PendingRecord>,
}

impl CountingBody {
    fn new(inner: ProxyBody, pending: PendingRecord) -> Self {
        Self {
            inner,
            bytes: 0,
            pending: Some(pending),
        }
    }

    fn finish(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.emit(self.bytes);
        }
    }
}

impl Body for CountingBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.bytes += data.len() as u64;
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finish();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for CountingBody {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::test_support::{client, get, Echo};
    use serde_json::Value;
    use torii_common::REQUEST_ID_LENGTH;

    /// Write target that tests can read back after the fact.
    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().clone()).unwrap()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn capture_logger() -> (RequestLogger, SharedBuffer) {
        let buffer = SharedBuffer::default();
        let log = AccessLog::with_writer(Box::new(buffer.clone()));
        (RequestLogger::with_access_log(Arc::new(Echo), log), buffer)
    }

    #[tokio::test]
    async fn response_carries_a_request_id() {
        let (logger, _buffer) = capture_logger();
        let response = logger.handle(get("/"), client()).await;

        let id = response.headers()[REQUEST_ID_HEADER].to_str().unwrap().to_string();
        assert_eq!(id.len(), REQUEST_ID_LENGTH);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn same_id_is_forwarded_to_the_inner_handler() {
        let (logger, _buffer) = capture_logger();
        let response = logger.handle(get("/"), client()).await;

        // Echo mirrors the id it saw on the request.
        assert_eq!(
            response.headers()["x-echoed-request-id"],
            response.headers()[REQUEST_ID_HEADER]
        );
    }

    #[tokio::test]
    async fn ids_differ_between_requests() {
        let (logger, _buffer) = capture_logger();
        let a = logger.handle(get("/"), client()).await;
        let b = logger.handle(get("/"), client()).await;
        assert_ne!(
            a.headers()[REQUEST_ID_HEADER],
            b.headers()[REQUEST_ID_HEADER]
        );
    }

    #[tokio::test]
    async fn wrapped_body_passes_through_unchanged() {
        let (logger, _buffer) = capture_logger();
        let response = logger.handle(get("/"), client()).await;
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), b"echo");
    }

    #[tokio::test]
    async fn access_record_uses_the_contract_field_names() {
        let (logger, buffer) = capture_logger();
        let response = logger.handle(get("/status"), client()).await;
        let id = response.headers()[REQUEST_ID_HEADER].to_str().unwrap().to_string();

        // Draining the body completes the record.
        let _ = response.into_body().collect().await.unwrap();

        let text = buffer.contents();
        let record: Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();

        assert_eq!(record["level"], "INFO");
        assert_eq!(record["msg"], "request");
        assert_eq!(record["request_id"], id.as_str());
        assert_eq!(record["method"], "GET");
        assert_eq!(record["path"], "/status");
        assert_eq!(record["remote_addr"], "127.0.0.1:4242");
        assert_eq!(record["status"], 200);
        assert_eq!(record["bytes"], 4);
        assert!(record["duration_ms"].is_u64());
        chrono::DateTime::parse_from_rfc3339(record["time"].as_str().unwrap()).unwrap();

        // The contract names, not the subscriber's defaults.
        assert!(record.get("timestamp").is_none());
        assert!(record.get("message").is_none());
    }

    #[tokio::test]
    async fn exactly_one_record_per_request() {
        let (logger, buffer) = capture_logger();
        for _ in 0..3 {
            let response = logger.handle(get("/"), client()).await;
            let _ = response.into_body().collect().await.unwrap();
        }
        assert_eq!(buffer.contents().lines().count(), 3);
    }

    #[tokio::test]
    async fn dropped_body_still_emits_one_record() {
        let (logger, buffer) = capture_logger();
        let response = logger.handle(get("/"), client()).await;
        drop(response);

        let text = buffer.contents();
        assert_eq!(text.lines().count(), 1);
        let record: Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(record["bytes"], 0);
        assert_eq!(record["status"], 200);
    }
}
