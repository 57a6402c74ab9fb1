//! V4 query-string signing with HMAC keys (`GOOG4-HMAC-SHA256`).

use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

pub const MAX_SIGNED_URL_EXPIRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const ALGORITHM: &str = "GOOG4-HMAC-SHA256";

/// RFC 3986 unreserved characters stay as is.
pub(crate) const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub(crate) const OBJECT_PATH: &AsciiSet = &UNRESERVED.remove(b'/');

#[derive(Debug, Clone)]
pub struct HmacKey {
    pub access_id: String,
    pub secret: String,
}

fn hmac(key: &[u8], message: &str) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::Storage(format!("invalid signing key: {}", e)))?;
    mac.update(message.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Signs a GET for `bucket/object` valid for `expires` from `now`.
pub fn signed_url(
    host: &str,
    bucket: &str,
    object: &str,
    key: &HmacKey,
    expires: Duration,
    now: DateTime<Utc>,
) -> Result<String> {
    if expires.is_zero() || expires > MAX_SIGNED_URL_EXPIRY {
        return Err(Error::Storage(format!(
            "signed URL expiry must be between 1s and {}s, got {}s",
            MAX_SIGNED_URL_EXPIRY.as_secs(),
            expires.as_secs()
        )));
    }

    let datetime = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();
    let scope = format!("{}/auto/storage/goog4_request", date);

    let canonical_uri = format!("/{}/{}", bucket, utf8_percent_encode(object, OBJECT_PATH));

    // already in byte order
    let params = [
        ("X-Goog-Algorithm", ALGORITHM.to_string()),
        ("X-Goog-Credential", format!("{}/{}", key.access_id, scope)),
        ("X-Goog-Date", datetime.clone()),
        ("X-Goog-Expires", expires.as_secs().to_string()),
        ("X-Goog-SignedHeaders", "host".to_string()),
    ];
    let canonical_query = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, utf8_percent_encode(v, UNRESERVED)))
        .collect::<Vec<_>>()
        .join("&");

    let canonical_request = format!(
        "GET\n{}\n{}\nhost:{}\n\nhost\nUNSIGNED-PAYLOAD",
        canonical_uri, canonical_query, host
    );
    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        datetime,
        scope,
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let k_date = hmac(format!("GOOG4{}", key.secret).as_bytes(), &date)?;
    let k_region = hmac(&k_date, "auto")?;
    let k_service = hmac(&k_region, "storage")?;
    let k_signing = hmac(&k_service, "goog4_request")?;
    let signature = hex::encode(hmac(&k_signing, &string_to_sign)?);

    Ok(format!(
        "https://{}{}?{}&X-Goog-Signature={}",
        host, canonical_uri, canonical_query, signature
    ))
}
