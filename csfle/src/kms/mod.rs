//! Built-in AWS KMS client speaking JSON over HTTP/1.1 on a caller-supplied stream.
//!
//! Each unwrap (or wrap) opens its own stream through the configured
//! [`StreamConnector`], sends one signed request, and reads one response.

pub mod conn;
pub mod sigv4;

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use http::{Method, Request, StatusCode};
use http_body_util::Full;
use hyper::body::Bytes;
use secrecy::{ExposeSecret, SecretVec};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use crate::data_key::AwsMasterKey;
use crate::error::KmsError;
use crate::kdf::DATA_KEY_SIZE;
use crate::key_provider::KmsProvider;
use crate::transport::{with_default_port, StreamConnector, TcpConnector};

use self::conn::KmsResponse;

pub use sigv4::AwsCredentials;

const CONTENT_TYPE: &str = "application/x-amz-json-1.1";
const SERVICE: &str = "kms";

/// Error types that mean the request was rejected for its credentials.
const AUTH_ERROR_TYPES: &[&str] = &[
    "UnrecognizedClientException",
    "InvalidSignatureException",
    "IncompleteSignatureException",
    "AccessDeniedException",
    "MissingAuthenticationTokenException",
    "ExpiredTokenException",
];

/// KMS operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Encrypt,
    Decrypt,
}

impl Action {
    const fn target(self) -> &'static str {
        match self {
            Self::Encrypt => "TrentService.Encrypt",
            Self::Decrypt => "TrentService.Decrypt",
        }
    }

    fn failure(self, msg: String) -> KmsError {
        match self {
            Self::Encrypt => KmsError::WrapFailed(msg),
            Self::Decrypt => KmsError::UnwrapFailed(msg),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct DecryptRequest<'a> {
    ciphertext_blob: String,
    key_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct EncryptRequest<'a> {
    plaintext: &'a str,
    key_id: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DecryptResponse {
    key_id: Option<String>,
    plaintext: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EncryptResponse {
    key_id: Option<String>,
    ciphertext_blob: Option<String>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    #[serde(rename = "__type")]
    error_type: Option<String>,
    #[serde(alias = "Message")]
    message: Option<String>,
}

/// AWS KMS provider over raw streams.
pub struct HttpKmsProvider {
    credentials: AwsCredentials,
    connector: Arc<dyn StreamConnector>,
}

impl HttpKmsProvider {
    /// Creates a provider that connects over plain TCP.
    #[must_use]
    pub fn new(credentials: AwsCredentials) -> Self {
        Self::with_connector(credentials, Arc::new(TcpConnector))
    }

    /// Creates a provider that opens its streams through `connector`.
    #[must_use]
    pub fn with_connector(credentials: AwsCredentials, connector: Arc<dyn StreamConnector>) -> Self {
        Self { credentials, connector }
    }

    async fn exchange(&self, master_key: &AwsMasterKey, action: Action, body: &[u8]) -> Result<KmsResponse, KmsError> {
        let host = master_key.endpoint();
        let endpoint = with_default_port(&host);
        let amz_date = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();

        let signed = [
            ("Content-Type", CONTENT_TYPE),
            ("Host", host.as_str()),
            ("X-Amz-Date", amz_date.as_str()),
            ("X-Amz-Target", action.target()),
        ];
        let authorization = sigv4::authorization(
            &self.credentials,
            &sigv4::SigningInput {
                method: "POST",
                path: "/",
                headers: &signed,
                body,
                amz_date: &amz_date,
                region: &master_key.region,
                service: SERVICE,
            },
        )?;

        let request = signed
            .iter()
            .fold(Request::builder().method(Method::POST).uri("/"), |builder, (name, value)| {
                builder.header(*name, *value)
            })
            .header("Authorization", authorization)
            .header("Connection", "close")
            .body(Full::new(Bytes::copy_from_slice(body)))
            .map_err(|e| action.failure(format!("cannot build request: {e}")))?;

        tracing::debug!(%endpoint, target = action.target(), "sending KMS request");

        let stream = self
            .connector
            .connect(&endpoint)
            .await
            .map_err(|e| KmsError::Unreachable(format!("{endpoint}: {e}")))?;
        let response = conn::send(stream, request).await?;
        tracing::debug!(%endpoint, status = response.status().as_u16(), "received KMS response");

        if response.status() != StatusCode::OK {
            return Err(classify_failure(action, &response));
        }
        Ok(response)
    }
}

impl std::fmt::Debug for HttpKmsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpKmsProvider").field("credentials", &self.credentials).finish_non_exhaustive()
    }
}

#[async_trait]
impl KmsProvider for HttpKmsProvider {
    async fn wrap_dek(&self, master_key: &AwsMasterKey, dek: &SecretVec<u8>) -> Result<Vec<u8>, KmsError> {
        let plaintext = Zeroizing::new(STANDARD.encode(dek.expose_secret()));
        let request = EncryptRequest { plaintext: &plaintext, key_id: &master_key.key };
        let body = Zeroizing::new(
            serde_json::to_vec(&request)
                .map_err(|e| KmsError::WrapFailed(format!("cannot encode request: {e}")))?,
        );

        let response = self.exchange(master_key, Action::Encrypt, &body).await?;
        let parsed: EncryptResponse = serde_json::from_slice(response.body().as_slice())
            .map_err(|e| KmsError::WrapFailed(format!("invalid KMS response: {e}")))?;

        check_key_id(Action::Encrypt, master_key, parsed.key_id.as_deref())?;
        let blob = parsed
            .ciphertext_blob
            .ok_or_else(|| KmsError::WrapFailed("response has no CiphertextBlob".to_string()))?;
        STANDARD
            .decode(blob)
            .map_err(|e| KmsError::WrapFailed(format!("CiphertextBlob is not base64: {e}")))
    }

    async fn unwrap_dek(
        &self,
        master_key: &AwsMasterKey,
        wrapped_dek: &[u8],
    ) -> Result<SecretVec<u8>, KmsError> {
        let request = DecryptRequest { ciphertext_blob: STANDARD.encode(wrapped_dek), key_id: &master_key.key };
        let body = serde_json::to_vec(&request)
            .map_err(|e| KmsError::UnwrapFailed(format!("cannot encode request: {e}")))?;

        let response = self.exchange(master_key, Action::Decrypt, &body).await?;
        let mut parsed: DecryptResponse = serde_json::from_slice(response.body().as_slice())
            .map_err(|e| KmsError::UnwrapFailed(format!("invalid KMS response: {e}")))?;

        check_key_id(Action::Decrypt, master_key, parsed.key_id.as_deref())?;
        let mut plaintext = parsed
            .plaintext
            .take()
            .ok_or_else(|| KmsError::UnwrapFailed("response has no Plaintext".to_string()))?;
        let decoded = STANDARD.decode(&plaintext);
        plaintext.zeroize();

        let material =
            decoded.map_err(|e| KmsError::UnwrapFailed(format!("Plaintext is not base64: {e}")))?;
        if material.len() != DATA_KEY_SIZE {
            return Err(KmsError::UnwrapFailed(format!(
                "Plaintext is {} bytes, expected {DATA_KEY_SIZE}",
                material.len()
            )));
        }
        Ok(SecretVec::new(material))
    }
}

/// Requires the response to name the key we asked for.
///
/// KMS always answers with the key ARN, so the echo can only be compared
/// when the master key itself is an ARN.
fn check_key_id(action: Action, master_key: &AwsMasterKey, echoed: Option<&str>) -> Result<(), KmsError> {
    let echoed = echoed.ok_or_else(|| action.failure("response has no KeyId".to_string()))?;
    if master_key.key.starts_with("arn:") && echoed != master_key.key {
        return Err(action.failure(format!(
            "response KeyId '{echoed}' does not match requested key '{}'",
            master_key.key
        )));
    }
    Ok(())
}

fn classify_failure(action: Action, response: &KmsResponse) -> KmsError {
    let status = response.status().as_u16();
    let parsed: Option<ErrorResponse> = serde_json::from_slice(response.body().as_slice()).ok();
    let error_type = parsed
        .as_ref()
        .and_then(|e| e.error_type.as_deref())
        .map(|t| t.rsplit('#').next().unwrap_or(t))
        .unwrap_or("unknown");
    let message = parsed.as_ref().and_then(|e| e.message.as_deref()).unwrap_or("");
    let detail = format!("HTTP {status} {error_type}: {message}");

    let is_auth_status = matches!(status, 400 | 401 | 403);
    if is_auth_status && AUTH_ERROR_TYPES.contains(&error_type) {
        KmsError::AuthFailed(detail)
    } else {
        action.failure(detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const KEY_ARN: &str = "arn:aws:kms:us-east-1:579766882180:key/89fcc2c4-08b0-4bd9-9f25-e30687b580d0";

    /// Accepts one connection, reads a full request and writes `reply` verbatim.
    async fn serve_raw(reply: String) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_ascii_lowercase();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length: usize = text
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length: "))
                        .unwrap()
                        .parse()
                        .unwrap();
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
            }
            socket.write_all(reply.as_bytes()).await.unwrap();
            String::from_utf8(request).unwrap()
        });
        (addr, handle)
    }

    async fn serve_once(status: &'static str, body: String) -> (String, tokio::task::JoinHandle<String>) {
        serve_raw(format!("HTTP/1.1 {status}\r\nContent-Length: {}\r\n\r\n{body}", body.len())).await
    }

    fn provider() -> HttpKmsProvider {
        HttpKmsProvider::new(AwsCredentials::new("AKIDEXAMPLE", SecretString::new("secret".to_string())))
    }

    #[tokio::test]
    async fn test_unwrap_success() {
        let body = format!(r#"{{"KeyId":"{KEY_ARN}","Plaintext":"{}"}}"#, STANDARD.encode([7u8; 32]));
        let (addr, server) = serve_once("200 OK", body).await;
        let master_key = AwsMasterKey::new("us-east-1", KEY_ARN).with_endpoint(addr);

        let dek = provider().unwrap_dek(&master_key, b"wrapped").await.unwrap();
        assert_eq!(dek.expose_secret(), &vec![7u8; 32]);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST / HTTP/1.1\r\n"));
        assert!(request.contains("X-Amz-Target: TrentService.Decrypt\r\n"));
        assert!(request.contains("Authorization: AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
        assert!(request.contains(&format!("\"CiphertextBlob\":\"{}\"", STANDARD.encode(b"wrapped"))));
    }

    #[tokio::test]
    async fn test_unwrap_chunked_response() {
        let body = format!(r#"{{"KeyId":"{KEY_ARN}","Plaintext":"{}"}}"#, STANDARD.encode([9u8; 32]));
        let (head, tail) = body.split_at(10);
        let reply = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/x-amz-json-1.1\r\nTransfer-Encoding: chunked\r\n\r\n{:x}\r\n{head}\r\n{:x}\r\n{tail}\r\n0\r\n\r\n",
            head.len(),
            tail.len()
        );
        let (addr, _server) = serve_raw(reply).await;
        let master_key = AwsMasterKey::new("us-east-1", KEY_ARN).with_endpoint(addr);

        let dek = provider().unwrap_dek(&master_key, b"wrapped").await.unwrap();
        assert_eq!(dek.expose_secret(), &vec![9u8; 32]);
    }

    #[tokio::test]
    async fn test_unwrap_rejects_wrong_length() {
        let body = format!(r#"{{"KeyId":"{KEY_ARN}","Plaintext":"{}"}}"#, STANDARD.encode([7u8; 16]));
        let (addr, _server) = serve_once("200 OK", body).await;
        let master_key = AwsMasterKey::new("us-east-1", KEY_ARN).with_endpoint(addr);

        assert!(matches!(
            provider().unwrap_dek(&master_key, b"wrapped").await,
            Err(KmsError::UnwrapFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_unwrap_rejects_other_key_id() {
        let body = format!(
            r#"{{"KeyId":"arn:aws:kms:us-east-1:1:key/other","Plaintext":"{}"}}"#,
            STANDARD.encode([7u8; 32])
        );
        let (addr, _server) = serve_once("200 OK", body).await;
        let master_key = AwsMasterKey::new("us-east-1", KEY_ARN).with_endpoint(addr);

        assert!(matches!(
            provider().unwrap_dek(&master_key, b"wrapped").await,
            Err(KmsError::UnwrapFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_auth_failure() {
        let body = r#"{"__type":"UnrecognizedClientException","message":"The security token included in the request is invalid."}"#;
        let (addr, _server) = serve_once("400 Bad Request", body.to_string()).await;
        let master_key = AwsMasterKey::new("us-east-1", KEY_ARN).with_endpoint(addr);

        assert!(matches!(
            provider().unwrap_dek(&master_key, b"wrapped").await,
            Err(KmsError::AuthFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_other_failure() {
        let body = r#"{"__type":"InvalidCiphertextException"}"#;
        let (addr, _server) = serve_once("400 Bad Request", body.to_string()).await;
        let master_key = AwsMasterKey::new("us-east-1", KEY_ARN).with_endpoint(addr);

        assert!(matches!(
            provider().unwrap_dek(&master_key, b"wrapped").await,
            Err(KmsError::UnwrapFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let master_key = AwsMasterKey::new("us-east-1", KEY_ARN).with_endpoint(addr);

        assert!(matches!(
            provider().unwrap_dek(&master_key, b"wrapped").await,
            Err(KmsError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_wrap_success() {
        let body = format!(r#"{{"KeyId":"{KEY_ARN}","CiphertextBlob":"{}"}}"#, STANDARD.encode(b"blob"));
        let (addr, server) = serve_once("200 OK", body).await;
        let master_key = AwsMasterKey::new("us-east-1", KEY_ARN).with_endpoint(addr);

        let wrapped = provider().wrap_dek(&master_key, &SecretVec::new(vec![1u8; 32])).await.unwrap();
        assert_eq!(wrapped, b"blob");

        let request = server.await.unwrap();
        assert!(request.contains("X-Amz-Target: TrentService.Encrypt\r\n"));
    }

    fn canned(status: u16, body: &[u8]) -> KmsResponse {
        http::Response::builder().status(status).body(Zeroizing::new(body.to_vec())).unwrap()
    }

    #[test]
    fn test_classify_namespaced_type() {
        let response = canned(403, br#"{"__type":"com.amazon.coral.service#AccessDeniedException"}"#);
        assert!(matches!(classify_failure(Action::Decrypt, &response), KmsError::AuthFailed(_)));

        let response = canned(500, b"oops");
        assert!(matches!(classify_failure(Action::Encrypt, &response), KmsError::WrapFailed(_)));
    }
}
