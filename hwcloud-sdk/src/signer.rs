//! AK/SK request signing (`SDK-HMAC-SHA256`).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Url};
use sha2::{Digest, Sha256};

use crate::error::{SdkError, SdkResult};

type HmacSha256 = Hmac<Sha256>;

pub const ALGORITHM: &str = "SDK-HMAC-SHA256";
pub const HEADER_SDK_DATE: &str = "x-sdk-date";
pub const HEADER_SECURITY_TOKEN: &str = "x-security-token";
const DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";

#[derive(Clone)]
pub struct Signer {
    access_key: String,
    secret_key: String,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("access_key", &self.access_key)
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

impl Signer {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }

    /// Add `X-Sdk-Date`, `Host` and `Authorization` to `headers`.
    ///
    /// Every header present at this point is signed.
    pub fn sign(
        &self,
        method: &Method,
        url: &Url,
        headers: &mut HeaderMap,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> SdkResult<()> {
        let date = now.format(DATE_FORMAT).to_string();
        headers.insert(HeaderName::from_static(HEADER_SDK_DATE), header_value(&date)?);
        headers.insert(reqwest::header::HOST, header_value(&host_header(url))?);

        let signed_headers = signed_header_names(headers);
        let canonical = canonical_request(method, url, headers, &signed_headers, body);
        let string_to_sign = format!("{}\n{}\n{}", ALGORITHM, date, hex_sha256(canonical.as_bytes()));
        let signature = self.signature(&string_to_sign)?;

        let authorization = format!(
            "{} Access={}, SignedHeaders={}, Signature={}",
            ALGORITHM,
            self.access_key,
            signed_headers.join(";"),
            signature
        );
        headers.insert(reqwest::header::AUTHORIZATION, header_value(&authorization)?);
        Ok(())
    }

    fn signature(&self, string_to_sign: &str) -> SdkResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .map_err(|e| SdkError::Config(format!("invalid secret key: {}", e)))?;
        mac.update(string_to_sign.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

fn header_value(value: &str) -> SdkResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| SdkError::Config(format!("invalid header value: {}", e)))
}

fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

pub(crate) fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// RFC 3986 unreserved characters stay, everything else is `%XX` (upper case)
fn escape(s: &str) -> String {
    urlencoding::encode(s).into_owned()
}

fn signed_header_names(headers: &HeaderMap) -> Vec<String> {
    let mut names: Vec<String> = headers.keys().map(|k| k.as_str().to_lowercase()).collect();
    names.sort();
    names.dedup();
    names
}

fn canonical_uri(url: &Url) -> String {
    let segments: Vec<String> = url
        .path()
        .split('/')
        .map(|segment| {
            let decoded = urlencoding::decode(segment)
                .map(|s| s.into_owned())
                .unwrap_or_else(|_| segment.to_string());
            escape(&decoded)
        })
        .collect();
    let mut uri = segments.join("/");
    if !uri.ends_with('/') {
        uri.push('/');
    }
    uri
}

fn canonical_query(url: &Url) -> String {
    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in url.query_pairs() {
        params
            .entry(escape(&key))
            .or_default()
            .push(escape(&value));
    }
    let mut pairs = Vec::new();
    for (key, mut values) in params {
        values.sort();
        for value in values {
            pairs.push(format!("{}={}", key, value));
        }
    }
    pairs.join("&")
}

fn canonical_request(
    method: &Method,
    url: &Url,
    headers: &HeaderMap,
    signed_headers: &[String],
    body: &[u8],
) -> String {
    let mut canonical_headers = String::new();
    for name in signed_headers {
        let values: Vec<&str> = headers
            .get_all(name.as_str())
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::trim)
            .collect();
        canonical_headers.push_str(&format!("{}:{}\n", name, values.join(",")));
    }

    format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method.as_str(),
        canonical_uri(url),
        canonical_query(url),
        canonical_headers,
        signed_headers.join(";"),
        hex_sha256(body)
    )
}
