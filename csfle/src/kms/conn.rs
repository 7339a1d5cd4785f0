//! One HTTP/1.1 exchange per KMS stream, framed by `hyper`.

use futures_util::future::{self, Either};
use http::{Request, Response};
use http_body_util::{BodyExt as _, Full, LengthLimitError, Limited};
use hyper::body::Bytes;
use hyper_util::rt::TokioIo;
use zeroize::Zeroizing;

use crate::error::KmsError;
use crate::transport::KmsStream;

/// Upper bound on a KMS response body.
pub const MAX_RESPONSE_SIZE: usize = 1 << 20;

/// A KMS response with its body read in full.
pub type KmsResponse = Response<Zeroizing<Vec<u8>>>;

/// Sends `request` over `stream` and reads the whole response.
///
/// The connection is driven inside the returned future, so dropping it
/// (for instance when a timeout fires) closes the stream.
///
/// # Errors
///
/// - `KmsError::Unreachable` if the handshake, the request or the body read fails
/// - `KmsError::UnwrapFailed` if the response is not HTTP or its body is
///   larger than [`MAX_RESPONSE_SIZE`]
pub async fn send(stream: Box<dyn KmsStream>, request: Request<Full<Bytes>>) -> Result<KmsResponse, KmsError> {
    let (mut sender, connection) = hyper::client::conn::http1::Builder::new()
        .title_case_headers(true)
        .handshake(TokioIo::new(stream))
        .await
        .map_err(|e| KmsError::Unreachable(format!("HTTP handshake failed: {e}")))?;

    let exchange = async move {
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| {
                if e.is_parse() {
                    KmsError::UnwrapFailed(format!("malformed HTTP response: {e}"))
                } else {
                    KmsError::Unreachable(format!("request failed: {e}"))
                }
            })?;
        let (parts, body) = response.into_parts();
        let body = Limited::new(body, MAX_RESPONSE_SIZE).collect().await.map_err(|e| {
            if e.is::<LengthLimitError>() {
                KmsError::UnwrapFailed(format!("response body exceeds {MAX_RESPONSE_SIZE} bytes"))
            } else {
                KmsError::Unreachable(format!("reading response failed: {e}"))
            }
        })?;
        Ok(Response::from_parts(parts, Zeroizing::new(body.to_bytes().to_vec())))
    };

    let exchange = std::pin::pin!(exchange);
    let connection = std::pin::pin!(connection);
    match future::select(exchange, connection).await {
        Either::Left((result, _)) => result,
        Either::Right((closed, exchange)) => {
            // The body may still be buffered after the server closes.
            if let Err(error) = closed {
                tracing::debug!(%error, "KMS connection ended with an error");
            }
            exchange.await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn request() -> Request<Full<Bytes>> {
        Request::builder()
            .method("POST")
            .uri("/")
            .header("Host", "kms.local")
            .header("X-Amz-Target", "TrentService.Decrypt")
            .body(Full::new(Bytes::from_static(b"{}")))
            .unwrap()
    }

    /// Answers the first request on a duplex pipe with `reply`, returning
    /// what the client wrote.
    fn answer(reply: &'static [u8]) -> (Box<dyn KmsStream>, tokio::task::JoinHandle<String>) {
        let (client, mut server) = tokio::io::duplex(16);
        let handle = tokio::spawn(async move {
            let mut seen = Vec::new();
            let mut buf = [0u8; 64];
            while !String::from_utf8_lossy(&seen).ends_with("\r\n\r\n{}") {
                let n = server.read(&mut buf).await.unwrap();
                assert!(n > 0, "client closed early");
                seen.extend_from_slice(&buf[..n]);
            }
            server.write_all(reply).await.unwrap();
            server.shutdown().await.unwrap();
            String::from_utf8(seen).unwrap()
        });
        (Box::new(client), handle)
    }

    #[tokio::test]
    async fn test_send_content_length_response() {
        let (stream, server) =
            answer(b"HTTP/1.1 200 OK\r\nContent-Type: application/x-amz-json-1.1\r\nContent-Length: 5\r\n\r\nhello");
        let response = send(stream, request()).await.unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["content-type"], "application/x-amz-json-1.1");
        assert_eq!(response.body().as_slice(), b"hello");

        let written = server.await.unwrap();
        assert!(written.starts_with("POST / HTTP/1.1\r\n"));
        assert!(written.contains("X-Amz-Target: TrentService.Decrypt\r\n"));
        assert!(written.contains("Content-Length: 2\r\n"));
    }

    #[tokio::test]
    async fn test_send_chunked_response() {
        let (stream, _server) =
            answer(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\n{}\r\n3\r\nabc\r\n0\r\n\r\n");
        let response = send(stream, request()).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.body().as_slice(), b"{}abc");
    }

    #[tokio::test]
    async fn test_send_truncated_response() {
        let (stream, _server) = answer(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort");
        assert!(matches!(send(stream, request()).await, Err(KmsError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_send_garbage_response() {
        let (stream, _server) = answer(b"SMTP ready\r\n\r\n");
        assert!(matches!(
            send(stream, request()).await,
            Err(KmsError::UnwrapFailed(_) | KmsError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_send_oversized_response() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let _ = server.read(&mut buf).await;
            let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", MAX_RESPONSE_SIZE + 1);
            server.write_all(head.as_bytes()).await.unwrap();
            let chunk = vec![b'x'; 64 * 1024];
            while server.write_all(&chunk).await.is_ok() {}
        });

        assert!(matches!(send(Box::new(client), request()).await, Err(KmsError::UnwrapFailed(_))));
    }
}
