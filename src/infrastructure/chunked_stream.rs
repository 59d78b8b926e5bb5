// Chunked JSON streaming utilities
use crate::infrastructure::http_response::brotli;
use axum::body::Body;
use axum::http::{Response, StatusCode, header};
use axum::response::IntoResponse;
use bytes::{BufMut, Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::Stream;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

/// Create a chunked streaming response of length-prefixed JSON messages.
pub fn chunked_json_stream<S, T>(stream: S, compress: bool) -> Result<Response<Body>, StatusCode>
where
    S: Stream<Item = T> + Send + 'static,
    T: Serialize + Send + 'static,
{
    let byte_stream = stream.then(move |msg| serialize_chunk(msg, compress));

    // Chunks are compressed one by one, so no Content-Encoding on the response.
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson-framed")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(byte_stream))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// One frame: 4-byte big-endian length, then the (optionally Brotli) JSON payload.
pub async fn serialize_chunk<T: Serialize>(msg: T, compress: bool) -> Result<Bytes, std::io::Error> {
    let json = serde_json::to_vec(&msg).map_err(std::io::Error::other)?;
    let payload = if compress { brotli(json).await? } else { json };

    let mut chunk = BytesMut::with_capacity(4 + payload.len());
    chunk.put_u32(payload.len() as u32);
    chunk.put_slice(&payload);
    Ok(chunk.freeze())
}

/// Stream `first` followed by every broadcast message. Lagged receivers skip
/// what they missed and keep going.
pub fn stream_from_broadcast<T, E>(
    first: T,
    rx: broadcast::Receiver<E>,
    compress: bool,
) -> impl IntoResponse
where
    T: Serialize + Send + 'static,
    E: Into<T> + Clone + Send + 'static,
{
    let events = BroadcastStream::new(rx).filter_map(|item| async move {
        match item {
            Ok(msg) => Some(Into::<T>::into(msg)),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Dashboard stream lagged");
                None
            }
        }
    });
    let stream = async_stream::stream! {
        yield first;
        futures::pin_mut!(events);
        while let Some(msg) = events.next().await {
            yield msg;
        }
    };

    match chunked_json_stream(stream, compress) {
        Ok(response) => response,
        Err(status) => status.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_serialize_chunk_prefixes_length() {
        let chunk = serialize_chunk(serde_json::json!({"panel": 1}), false).await.unwrap();
        assert_eq!(&chunk[..4], &[0, 0, 0, 11]);
        assert_eq!(&chunk[4..], br#"{"panel":1}"#);
    }

    #[tokio::test]
    async fn test_broadcast_stream_frames_messages() {
        let (tx, rx) = broadcast::channel(8);
        let response = stream_from_broadcast::<u32, u32>(0, rx, false).into_response();
        tx.send(7u32).unwrap();
        drop(tx);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], &[0, 0, 0, 1, b'0', 0, 0, 0, 1, b'7']);
    }
}
