/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing the Sigv4 websocket url signer, the credentials provider contract, and the
skew-adjusted clock the signer draws its timestamps from.
 */

use crate::error::{IotError, IotResult};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};

type HmacSha256 = Hmac<Sha256>;

const SIGNING_ALGORITHM : &str = "AWS4-HMAC-SHA256";
const SIGNING_SERVICE : &str = "iotdata";
const SIGNING_SCOPE_SUFFIX : &str = "aws4_request";
const WEBSOCKET_SCHEME : &str = "wss://";
const WEBSOCKET_PATH : &str = "/mqtt";

/// A set of credentials used to sign websocket upgrade urls.
#[derive(Clone)]
pub struct Credentials {

    /// Access key id identifying the signing principal.
    pub access_key_id: String,

    /// Secret key the signing key chain is derived from.
    pub secret_access_key: String,

    /// Session token for temporary credentials, if any.
    pub session_token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credentials {{ access_key_id: \"{}\", secret_access_key: <...redacted>", self.access_key_id)?;
        if self.session_token.is_some() {
            write!(f, ", session_token: <...redacted>")?;
        }
        write!(f, " }}")
    }
}

/// Return type for an asynchronous credentials fetch
pub type CredentialsFuture = Pin<Box<dyn Future<Output = IotResult<Credentials>> + Send>>;

/// Contract for the credentials provider collaborator.  The fetch is asynchronous; providers
/// commonly resolve credentials from an identity service or a rotating cache.
pub trait CredentialsProvider: Send + Sync {

    /// Yields a set of credentials, or an error if none could be sourced.
    fn fetch_credentials(&self) -> CredentialsFuture;
}

/// A provider that always yields a fixed set of credentials.  Useful for testing and for
/// environments where rotation is handled externally.
pub struct StaticCredentialsProvider {
    credentials: Credentials
}

impl StaticCredentialsProvider {

    /// Creates a new static provider from a fixed set of credentials.
    pub fn new(credentials: Credentials) -> Self {
        StaticCredentialsProvider {
            credentials
        }
    }
}

impl CredentialsProvider for StaticCredentialsProvider {
    fn fetch_credentials(&self) -> CredentialsFuture {
        let credentials = self.credentials.clone();
        Box::pin(async move { Ok(credentials) })
    }
}

/// A wall clock corrected against the server's advertised time.
///
/// Devices in the field routinely carry skewed clocks, and a skewed timestamp invalidates the
/// request signature.  The websocket transport records the server's advertised time from the
/// `Date` header of every upgrade response it sees, accepted or rejected, so a device whose
/// first handshake is refused over a stale signature retries with a corrected timestamp.
/// `now()` reports local time shifted by the last observed offset.
#[derive(Debug, Default)]
pub struct SkewAdjustedClock {
    offset_millis: AtomicI64
}

impl SkewAdjustedClock {

    /// Creates a new clock with no correction applied.
    pub fn new() -> Self {
        SkewAdjustedClock {
            offset_millis: AtomicI64::new(0)
        }
    }

    /// Records the server's advertised time, updating the correction offset.
    pub fn set_server_time(&self, server_time: DateTime<Utc>) {
        let offset = server_time.signed_duration_since(Utc::now());
        self.offset_millis.store(offset.num_milliseconds(), Ordering::Relaxed);
    }

    /// Current time, corrected by the last observed server offset.
    pub fn now(&self) -> DateTime<Utc> {
        Utc::now() + ChronoDuration::milliseconds(self.offset_millis.load(Ordering::Relaxed))
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> IotResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(IotError::new_signing_failure)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn derive_signing_key(secret_access_key: &str, date_stamp: &str, region: &str) -> IotResult<Vec<u8>> {
    let k_secret = format!("AWS4{}", secret_access_key);
    let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, SIGNING_SERVICE.as_bytes())?;
    hmac_sha256(&k_service, SIGNING_SCOPE_SUFFIX.as_bytes())
}

/// Produces a signed websocket upgrade url for an IoT data-plane endpoint.
///
/// Pure function of its inputs: identical inputs always produce an identical url.  The
/// request time should come from a [`SkewAdjustedClock`] so that device clock skew does not
/// invalidate the signature.  A session token, when present, is appended to the url after the
/// signed query string and is itself excluded from signing.
pub fn sign_websocket_url(host: &str, region: &str, credentials: &Credentials, request_time: DateTime<Utc>) -> IotResult<String> {
    let date_stamp = request_time.format("%Y%m%d").to_string();
    let amz_date = request_time.format("%Y%m%dT%H%M%SZ").to_string();

    let credential_scope = format!("{}%2F{}%2F{}%2F{}", date_stamp, region, SIGNING_SERVICE, SIGNING_SCOPE_SUFFIX);
    let canonical_query = format!(
        "X-Amz-Algorithm={}&X-Amz-Credential={}%2F{}&X-Amz-Date={}&X-Amz-SignedHeaders=host",
        SIGNING_ALGORITHM, credentials.access_key_id, credential_scope, amz_date);

    let canonical_request = format!(
        "GET\n{}\n{}\nhost:{}\n\nhost\n{}",
        WEBSOCKET_PATH, canonical_query, host, sha256_hex(b""));

    let string_to_sign = format!(
        "{}\n{}\n{}/{}/{}/{}\n{}",
        SIGNING_ALGORITHM, amz_date, date_stamp, region, SIGNING_SERVICE, SIGNING_SCOPE_SUFFIX,
        sha256_hex(canonical_request.as_bytes()));

    let signing_key = derive_signing_key(&credentials.secret_access_key, &date_stamp, region)?;
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

    let mut url = format!("{}{}{}?{}", WEBSOCKET_SCHEME, host, WEBSOCKET_PATH, canonical_query);
    if let Some(session_token) = &credentials.session_token {
        url.push_str("&X-Amz-Security-Token=");
        url.push_str(&urlencoding::encode(session_token));
    }
    url.push_str("&X-Amz-Signature=");
    url.push_str(&signature);

    Ok(url)
}
