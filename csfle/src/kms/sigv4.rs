//! AWS Signature Version 4 request signing.

use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

use crate::error::KmsError;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Credentials used to sign KMS requests.
pub struct AwsCredentials {
    access_key_id: String,
    secret_access_key: SecretString,
}

impl AwsCredentials {
    /// Creates a credential pair.
    #[must_use]
    pub fn new(access_key_id: impl Into<String>, secret_access_key: SecretString) -> Self {
        Self { access_key_id: access_key_id.into(), secret_access_key }
    }

    /// Returns the access key id.
    #[must_use]
    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .finish()
    }
}

/// The parts of a request that are covered by the signature.
pub struct SigningInput<'a> {
    /// HTTP method.
    pub method: &'a str,
    /// Request path.
    pub path: &'a str,
    /// Headers to sign, as `(name, value)`. Names are lower-cased here.
    pub headers: &'a [(&'a str, &'a str)],
    /// Request body.
    pub body: &'a [u8],
    /// Timestamp in `YYYYMMDD'T'HHMMSS'Z'` form.
    pub amz_date: &'a str,
    /// Signing region.
    pub region: &'a str,
    /// Signing service.
    pub service: &'a str,
}

/// Returns the `Authorization` header value for a request.
///
/// # Errors
///
/// Returns `KmsError::AuthFailed` if the signing key cannot be derived.
pub fn authorization(credentials: &AwsCredentials, input: &SigningInput<'_>) -> Result<String, KmsError> {
    let date = &input.amz_date[..input.amz_date.len().min(8)];
    let scope = format!("{date}/{}/{}/aws4_request", input.region, input.service);

    let mut headers: Vec<(String, String)> = input
        .headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.trim().to_string()))
        .collect();
    headers.sort();

    let signed_headers = headers.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>().join(";");
    let canonical_headers: String =
        headers.iter().map(|(name, value)| format!("{name}:{value}\n")).collect();

    let canonical_request = format!(
        "{}\n{}\n\n{}\n{}\n{}",
        input.method,
        input.path,
        canonical_headers,
        signed_headers,
        hex::encode(Sha256::digest(input.body))
    );

    let string_to_sign = format!(
        "{ALGORITHM}\n{}\n{scope}\n{}",
        input.amz_date,
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let signature = signing_key(credentials.secret_access_key.expose_secret(), date, input.region, input.service)
        .and_then(|key| hmac(&key, string_to_sign.as_bytes()))
        .map(hex::encode)
        .map_err(|e| KmsError::AuthFailed(format!("request signing failed: {e}")))?;

    Ok(format!(
        "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
        credentials.access_key_id
    ))
}

/// Derives the SigV4 signing key for a date, region and service.
///
/// # Errors
///
/// Returns `InvalidLength` if HMAC rejects a key.
pub fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Result<Vec<u8>, InvalidLength> {
    let k_date = hmac(format!("AWS4{secret}").as_bytes(), date.as_bytes())?;
    let k_region = hmac(&k_date, region.as_bytes())?;
    let k_service = hmac(&k_region, service.as_bytes())?;
    hmac(&k_service, b"aws4_request")
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, InvalidLength> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}
