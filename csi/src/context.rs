//! Per request context: correlation ids and the logging wrapper shared by
//! every gRPC handler.

use std::{collections::HashMap, future::Future, time::Instant};

use rand::{rngs::OsRng, RngCore};
use tonic::{Request, Response, Status};
use tracing::field::Empty;
use tracing_futures::Instrument;

/// Key of the correlation id in the publish context handed to the node.
pub const CORRELATION_ID_KEY: &str = "ctx_correlation_id";

/// gRPC metadata header a caller may set to choose the correlation id.
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Six random bytes, hex encoded. Falls back to a v4 uuid if the system
/// random source fails.
pub fn new_correlation_id() -> String {
    let mut bytes = [0u8; 6];
    match OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => bytes.iter().map(|b| format!("{:02x}", b)).collect(),
        Err(error) => {
            warn!("failed to read random bytes for correlation id: {}", error);
            uuid::Uuid::new_v4().to_string()
        }
    }
}

/// Correlation id chosen by the caller, or a fresh one.
pub fn correlation_id<T>(request: &Request<T>) -> String {
    request
        .metadata()
        .get(CORRELATION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(String::from)
        .unwrap_or_else(new_correlation_id)
}

/// Record the controller's correlation id from a publish context into the
/// current request span.
pub fn record_origin(publish_context: &HashMap<String, String>) {
    if let Some(origin) = publish_context.get(CORRELATION_ID_KEY) {
        tracing::Span::current()
            .record("origin_correlation_id", &origin.as_str());
    }
}

/// Run a handler inside a span carrying the method name and the correlation
/// id, logging its outcome and duration.
pub async fn traced<T, R, F, Fut>(
    method: &'static str,
    request: Request<T>,
    handler: F,
) -> Result<Response<R>, Status>
where
    F: FnOnce(String, T) -> Fut,
    Fut: Future<Output = Result<R, Status>>,
{
    let correlation_id = correlation_id(&request);
    let span = info_span!(
        "rpc",
        method,
        correlation_id = correlation_id.as_str(),
        origin_correlation_id = Empty,
    );
    let started = Instant::now();

    async move {
        trace!("request started");
        let result = handler(correlation_id, request.into_inner()).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => debug!(elapsed_ms, "request succeeded"),
            Err(status) => warn!(
                elapsed_ms,
                code = ?status.code(),
                "request failed: {}",
                status.message()
            ),
        }
        result.map(Response::new)
    }
    .instrument(span)
    .await
}
