//! Access-key request signing
//!
//! When an app has an access key configured, the configuration service only
//! answers requests carrying
//!
//! ```text
//! Authorization: Apollo {appid}:{signature}
//! Timestamp: {unix millis}
//! ```
//!
//! where `signature = base64(HMAC-SHA1(secret, "{millis}\n{path?query}"))`.

use crate::error::{Result, SyncError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderValue, AUTHORIZATION};
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha1 = Hmac<Sha1>;

pub const TIMESTAMP_HEADER: &str = "Timestamp";

/// Compute the signature for one request.
pub fn signature(timestamp_ms: u64, path_with_query: &str, secret: &str) -> Result<String> {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes())
        .map_err(|e| SyncError::Config(format!("Invalid secret key: {}", e)))?;
    mac.update(timestamp_ms.to_string().as_bytes());
    mac.update(b"\n");
    mac.update(path_with_query.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// The part of `url` that gets signed: path, plus `?query` when present.
pub fn path_with_query(url: &reqwest::Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

/// Add the `Authorization` and `Timestamp` headers to a built request.
pub fn sign_request(request: &mut reqwest::Request, appid: &str, secret: &str) -> Result<()> {
    let timestamp_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    sign_request_at(request, appid, secret, timestamp_ms)
}

fn sign_request_at(
    request: &mut reqwest::Request,
    appid: &str,
    secret: &str,
    timestamp_ms: u64,
) -> Result<()> {
    let sig = signature(timestamp_ms, &path_with_query(request.url()), secret)?;
    let authorization = HeaderValue::from_str(&format!("Apollo {}:{}", appid, sig))
        .map_err(|e| SyncError::Config(format!("Invalid authorization header: {}", e)))?;

    let headers = request.headers_mut();
    headers.insert(AUTHORIZATION, authorization);
    headers.insert(TIMESTAMP_HEADER, HeaderValue::from(timestamp_ms));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_known_vector() {
        let sig = signature(
            1576478257344,
            "/configs/100004458/default/application?ip=10.0.0.1",
            "df23df3f59884980844ff3dada30fa97",
        )
        .unwrap();
        assert_eq!(sig, "EoKyziXvKqzHgwx+ijDJwgVTDgE=");
    }

    #[test]
    fn test_path_with_query() {
        let url = reqwest::Url::parse("http://localhost:8080/configs/app/default/ns?releaseKey=1")
            .unwrap();
        assert_eq!(path_with_query(&url), "/configs/app/default/ns?releaseKey=1");

        let url = reqwest::Url::parse("http://localhost:8080/configs/app/default/ns").unwrap();
        assert_eq!(path_with_query(&url), "/configs/app/default/ns");
    }

    #[test]
    fn test_sign_request_sets_headers() {
        let url = reqwest::Url::parse(
            "http://localhost:8080/configs/100004458/default/application?ip=10.0.0.1",
        )
        .unwrap();
        let mut request = reqwest::Request::new(reqwest::Method::GET, url);

        sign_request_at(
            &mut request,
            "100004458",
            "df23df3f59884980844ff3dada30fa97",
            1576478257344,
        )
        .unwrap();

        assert_eq!(
            request.headers()[AUTHORIZATION],
            "Apollo 100004458:EoKyziXvKqzHgwx+ijDJwgVTDgE="
        );
        assert_eq!(request.headers()[TIMESTAMP_HEADER], "1576478257344");
    }
}
