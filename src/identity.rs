use std::convert::Infallible;
use std::fmt;

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{VaultError, VaultResult};

pub const SUBJECT_HEADER: &str = "x-vault-subject";
pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const TRACE_ID_HEADER: &str = "x-trace-id";

const BEARER_PREFIX: &str = "bearer ";

/// Caller metadata lifted from request headers. Nothing here is trusted until an
/// [`IdentityVerifier`] turns it into an [`Identity`].
#[derive(Clone)]
pub struct CallMetadata {
    pub bearer_token: Option<String>,
    pub subject: Option<String>,
    pub request_id: String,
    pub trace_id: String,
}

impl CallMetadata {
    /// Metadata for an in-process caller presenting `token` as both credential and subject.
    pub fn bearer(token: &str) -> Self {
        Self {
            bearer_token: Some(token.to_string()),
            subject: Some(token.to_string()),
            request_id: new_correlation_id("req"),
            trace_id: new_correlation_id("trace"),
        }
    }

    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            bearer_token: header_value(headers, AUTHORIZATION.as_str())
                .and_then(|value| extract_bearer_token(&value)),
            subject: header_value(headers, SUBJECT_HEADER),
            request_id: header_value(headers, REQUEST_ID_HEADER)
                .unwrap_or_else(|| new_correlation_id("req")),
            trace_id: header_value(headers, TRACE_ID_HEADER)
                .unwrap_or_else(|| new_correlation_id("trace")),
        }
    }

    /// Actor recorded for calls that never authenticated.
    pub fn claimed_actor(&self) -> String {
        self.subject
            .as_deref()
            .map(hash_token_actor)
            .unwrap_or_default()
    }
}

impl fmt::Debug for CallMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallMetadata")
            .field("has_bearer_token", &self.bearer_token.is_some())
            .field("has_subject", &self.subject.is_some())
            .field("request_id", &self.request_id)
            .field("trace_id", &self.trace_id)
            .finish()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for CallMetadata
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(CallMetadata::from_headers(&parts.headers))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthSource {
    Unspecified,
    Header,
    HashedToken,
}

impl AuthSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthSource::Unspecified => "unspecified",
            AuthSource::Header => "header",
            AuthSource::HashedToken => "hashed-token",
        }
    }
}

/// A verified caller. `actor` is the only form of the caller that is persisted or logged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
    pub actor: String,
    pub auth_source: AuthSource,
}

/// Maps request metadata to a verified subject.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, call: &CallMetadata) -> VaultResult<Identity>;
}

/// Accepts a call when the subject header equals the bearer credential.
#[derive(Clone, Copy, Debug, Default)]
pub struct BearerSubjectVerifier;

#[async_trait]
impl IdentityVerifier for BearerSubjectVerifier {
    async fn verify(&self, call: &CallMetadata) -> VaultResult<Identity> {
        let subject = call
            .subject
            .as_deref()
            .ok_or_else(|| VaultError::Unauthenticated("missing actor subject".into()))?;
        match call.bearer_token.as_deref() {
            Some(token) if token == subject => Ok(Identity {
                subject: subject.to_string(),
                actor: hash_token_actor(token),
                auth_source: AuthSource::HashedToken,
            }),
            _ => Err(VaultError::Unauthenticated(
                "subject must match bearer token".into(),
            )),
        }
    }
}

/// `token_sha256:` followed by the first 8 bytes of the credential's SHA-256, hex encoded.
pub fn hash_token_actor(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    format!("token_sha256:{}", hex::encode(&digest[..8]))
}

/// Case-insensitive `Bearer` scheme; an empty credential counts as absent.
pub fn extract_bearer_token(header: &str) -> Option<String> {
    let header = header.trim();
    let prefix = header.get(..BEARER_PREFIX.len())?;
    if !prefix.eq_ignore_ascii_case(BEARER_PREFIX) {
        return None;
    }
    let token = header[BEARER_PREFIX.len()..].trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

pub fn new_correlation_id(prefix: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &id[..16])
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
