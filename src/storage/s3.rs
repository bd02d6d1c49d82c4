//! Amazon S3 [`BlobStore`].
//!
//! Talks to the S3 REST API directly with AWS Signature V4 authentication.
//! Supports custom endpoints for S3-compatible services (MinIO, LocalStack),
//! which are addressed path-style; AWS itself is addressed virtual-host
//! style.
//!
//! Uses only pure-Rust dependencies (`hmac`, `sha2`) for signing.
//!
//! # Configuration
//!
//! ```toml
//! [storage]
//! backend = "s3"
//! bucket = "acme-documents"
//! region = "us-east-1"
//! # endpoint_url = "http://localhost:9000"   # MinIO
//! ```
//!
//! # Environment Variables
//!
//! - `AWS_ACCESS_KEY_ID`: required
//! - `AWS_SECRET_ACCESS_KEY`: required
//! - `AWS_SESSION_TOKEN`: optional (temporary credentials / IAM roles)
//!
//! # Error mapping
//!
//! | Failure | Error |
//! |---------|-------|
//! | connect / timeout, HTTP 500, 503 | [`Error::TransientInfra`] |
//! | HTTP 404 on `get` | [`Error::NotFound`] |
//! | other non-2xx | [`Error::Storage`] |

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};

use crate::config::StorageConfig;
use crate::error::{Error, Result};

use super::{strip_locator, BlobStore};

type HmacSha256 = Hmac<Sha256>;

// ============ AWS Credentials ============

/// AWS credentials.
#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl AwsCredentials {
    /// Load credentials from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`,
    /// and optionally `AWS_SESSION_TOKEN`.
    pub fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").map_err(|_| {
            Error::Configuration("AWS_ACCESS_KEY_ID environment variable not set".into())
        })?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").map_err(|_| {
            Error::Configuration("AWS_SECRET_ACCESS_KEY environment variable not set".into())
        })?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

// ============ Store ============

pub struct S3Store {
    bucket: String,
    region: String,
    endpoint_url: Option<String>,
    creds: AwsCredentials,
    client: reqwest::Client,
}

impl S3Store {
    pub fn new(
        bucket: &str,
        region: &str,
        endpoint_url: Option<String>,
        creds: AwsCredentials,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::storage_with_source("failed to build S3 client", e))?;
        Ok(Self {
            bucket: bucket.to_string(),
            region: region.to_string(),
            endpoint_url: endpoint_url.map(|e| e.trim_end_matches('/').to_string()),
            creds,
            client,
        })
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let bucket = config.bucket.as_deref().ok_or_else(|| {
            Error::Configuration("storage.bucket is required for the s3 backend".into())
        })?;
        let region = config.region.as_deref().ok_or_else(|| {
            Error::Configuration("storage.region is required for the s3 backend".into())
        })?;
        Self::new(
            bucket,
            region,
            config.endpoint_url.clone(),
            AwsCredentials::from_env()?,
        )
    }

    /// `(scheme://host, host, canonical path prefix)` for requests.
    fn addressing(&self) -> (String, String, String) {
        match &self.endpoint_url {
            Some(endpoint) => {
                let host = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .to_string();
                (endpoint.clone(), host, format!("/{}", self.bucket))
            }
            None => {
                let host = format!("{}.s3.{}.amazonaws.com", self.bucket, self.region);
                (format!("https://{}", host), host, String::new())
            }
        }
    }

    /// Build, sign and send one request.
    async fn send(
        &self,
        method: Method,
        key: Option<&str>,
        query: &[(&str, String)],
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<reqwest::Response> {
        let (origin, host, path_prefix) = self.addressing();
        let encoded_key = key
            .map(|k| k.split('/').map(uri_encode).collect::<Vec<_>>().join("/"))
            .unwrap_or_default();
        let canonical_uri = format!("{}/{}", path_prefix, encoded_key);

        let mut sorted_params: Vec<(String, String)> = query
            .iter()
            .map(|(k, v)| (uri_encode(k), uri_encode(v)))
            .collect();
        sorted_params.sort();
        let canonical_querystring = sorted_params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(&body);

        let mut headers = vec![
            ("host".to_string(), host),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            canonical_querystring,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let authorization = authorization_header(
            &self.creds,
            &self.region,
            &date_stamp,
            &amz_date,
            &signed_headers,
            &canonical_request,
        );

        let url = if canonical_querystring.is_empty() {
            format!("{}{}", origin, canonical_uri)
        } else {
            format!("{}{}?{}", origin, canonical_uri, canonical_querystring)
        };

        let mut req = self
            .client
            .request(method, &url)
            .header("Authorization", authorization)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date);
        if let Some(ref token) = self.creds.session_token {
            req = req.header("x-amz-security-token", token);
        }
        if let Some(ct) = content_type {
            req = req.header("Content-Type", ct);
        }
        if !body.is_empty() {
            req = req.body(body);
        }

        req.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                Error::TransientInfra(format!("S3 request to {} failed: {}", url, e))
            } else {
                Error::storage_with_source(format!("S3 request to {} failed", url), e)
            }
        })
    }
}

async fn status_error(op: &str, target: &str, resp: reqwest::Response) -> Error {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    let message = format!(
        "S3 {} failed (HTTP {}) for '{}': {}",
        op,
        status,
        target,
        body.chars().take(500).collect::<String>()
    );
    if status == StatusCode::SERVICE_UNAVAILABLE || status == StatusCode::INTERNAL_SERVER_ERROR {
        Error::TransientInfra(message)
    } else {
        Error::storage(message)
    }
}

#[async_trait]
impl BlobStore for S3Store {
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let resp = self
            .send(Method::PUT, Some(path), &[], bytes, Some(content_type))
            .await?;
        if !resp.status().is_success() {
            return Err(status_error("PutObject", path, resp).await);
        }
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let resp = self.send(Method::GET, Some(path), &[], Vec::new(), None).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(path.to_string()));
        }
        if !resp.status().is_success() {
            return Err(status_error("GetObject", path, resp).await);
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Error::storage_with_source(format!("reading s3 object '{}'", path), e))?;
        Ok(bytes.to_vec())
    }

    /// Follows `NextContinuationToken` until the listing is complete.
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type", "2".to_string()),
                ("max-keys", "1000".to_string()),
            ];
            if !prefix.is_empty() {
                query.push(("prefix", prefix.to_string()));
            }
            if let Some(ref token) = continuation_token {
                query.push(("continuation-token", token.clone()));
            }

            let resp = self.send(Method::GET, None, &query, Vec::new(), None).await?;
            if !resp.status().is_success() {
                return Err(status_error("ListObjectsV2", prefix, resp).await);
            }
            let xml = resp
                .text()
                .await
                .map_err(|e| Error::storage_with_source("reading S3 listing", e))?;
            let page = parse_list_objects_response(&xml);
            keys.extend(page.keys);

            match (page.is_truncated, page.next_token) {
                (true, Some(token)) => continuation_token = Some(token),
                _ => break,
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let resp = self
            .send(Method::DELETE, Some(path), &[], Vec::new(), None)
            .await?;
        if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(status_error("DeleteObject", path, resp).await)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let resp = self.send(Method::HEAD, Some(path), &[], Vec::new(), None).await?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(status_error("HeadObject", path, resp).await),
        }
    }

    fn locator(&self, path: &str) -> String {
        format!("s3://{}/{}", self.bucket, path.trim_start_matches('/'))
    }

    fn resolve_locator(&self, reference: &str) -> Result<Option<String>> {
        strip_locator(reference, "s3", &self.bucket)
    }
}

// ============ AWS SigV4 Helpers ============

fn authorization_header(
    creds: &AwsCredentials,
    region: &str,
    date_stamp: &str,
    amz_date: &str,
    signed_headers: &str,
    canonical_request: &str,
) -> String {
    let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        credential_scope,
        hex_sha256(canonical_request.as_bytes())
    );
    let signing_key = derive_signing_key(&creds.secret_access_key, date_stamp, region, "s3");
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

    format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        creds.access_key_id, credential_scope, signed_headers, signature
    )
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding; only `A-Z a-z 0-9 - _ . ~` pass through.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

// ============ XML Parsing ============

struct ListPage {
    keys: Vec<String>,
    is_truncated: bool,
    next_token: Option<String>,
}

fn parse_list_objects_response(xml: &str) -> ListPage {
    let mut keys = Vec::new();
    let is_truncated = extract_xml_value(xml, "IsTruncated")
        .map(|v| v == "true")
        .unwrap_or(false);
    let next_token = extract_xml_value(xml, "NextContinuationToken").map(|t| xml_unescape(&t));

    let mut remaining = xml;
    while let Some(start) = remaining.find("<Contents>") {
        let block_start = start + "<Contents>".len();
        let Some(end) = remaining[block_start..].find("</Contents>") else {
            break;
        };
        let block = &remaining[block_start..block_start + end];
        if let Some(key) = extract_xml_value(block, "Key") {
            let key = xml_unescape(&key);
            if !key.is_empty() && !key.ends_with('/') {
                keys.push(key);
            }
        }
        remaining = &remaining[block_start + end + "</Contents>".len()..];
    }

    ListPage {
        keys,
        is_truncated,
        next_token,
    }
}

fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    Some(xml[start..start + end].to_string())
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
