//! # Webhook Signature Verification
//!
//! Decides whether an inbound webhook may become a job, before the body is
//! parsed. Order: admission limiter, operator credential, provider signature.
//! All secret comparisons are constant time and nothing secret is logged.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::http::{HeaderMap, StatusCode};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use metrics::counter;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::clock::SharedClock;
use crate::config::AppConfig;
use crate::error::EngineError;

type HmacSha256 = Hmac<Sha256>;

pub const GITHUB_SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const SLACK_SIGNATURE_HEADER: &str = "x-slack-signature";
pub const SLACK_TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";

/// Errors that can occur during webhook verification
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VerificationError {
    #[error("Missing required signature header: {header}")]
    MissingSignature { header: &'static str },

    #[error("Invalid signature format: {header}")]
    InvalidSignatureFormat { header: &'static str },

    #[error("Signature verification failed")]
    VerificationFailed,

    #[error("Missing required timestamp header: {header}")]
    MissingTimestamp { header: &'static str },

    #[error("Invalid timestamp format: {header}")]
    InvalidTimestamp { header: &'static str },

    #[error("Timestamp outside tolerance: {skew_seconds}s skew, max allowed: {max_seconds}s")]
    TimestampOutOfTolerance { skew_seconds: u64, max_seconds: u64 },

    #[error("Webhook verification not configured for provider: {provider}")]
    NotConfigured { provider: String },

    #[error("Webhook admission limit reached ({scope})")]
    RateLimited {
        scope: &'static str,
        retry_after_seconds: u64,
    },
}

impl VerificationError {
    /// Returns the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            VerificationError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::UNAUTHORIZED,
        }
    }

    /// Metric label for `webhook_verification_failure_total`.
    pub fn reason(&self) -> &'static str {
        match self {
            VerificationError::MissingSignature { .. } => "missing_signature",
            VerificationError::InvalidSignatureFormat { .. } => "invalid_format",
            VerificationError::VerificationFailed => "signature_mismatch",
            VerificationError::MissingTimestamp { .. } => "missing_timestamp",
            VerificationError::InvalidTimestamp { .. } => "invalid_timestamp",
            VerificationError::TimestampOutOfTolerance { .. } => "replay",
            VerificationError::NotConfigured { .. } => "not_configured",
            VerificationError::RateLimited { .. } => "rate_limited",
        }
    }
}

impl From<VerificationError> for EngineError {
    fn from(err: VerificationError) -> Self {
        match err {
            VerificationError::TimestampOutOfTolerance { .. } => EngineError::ReplayRejected,
            VerificationError::RateLimited {
                retry_after_seconds,
                ..
            } => EngineError::RateLimited {
                retry_after_seconds,
            },
            other => EngineError::InvalidSignature {
                reason: other.reason().to_string(),
            },
        }
    }
}

/// Result type for webhook verification
pub type VerificationResult<T> = Result<T, VerificationError>;

/// How a provider signs its deliveries.
#[derive(Clone)]
pub enum SignatureScheme {
    /// `x-hub-signature-256: sha256=<hex hmac(body)>`
    DigestOverBody { secret: Zeroizing<String> },
    /// `x-slack-signature: v0=<hex hmac("v0:{ts}:" + body)>` plus a timestamp header.
    Timestamped { secret: Zeroizing<String> },
    /// `Authorization: Bearer <secret>`
    SharedToken { secret: Zeroizing<String> },
}

impl SignatureScheme {
    pub fn method(&self) -> &'static str {
        match self {
            SignatureScheme::DigestOverBody { .. } => "digest",
            SignatureScheme::Timestamped { .. } => "timestamped",
            SignatureScheme::SharedToken { .. } => "shared_token",
        }
    }

    fn verify(
        &self,
        headers: &HeaderMap,
        body: &[u8],
        now: DateTime<Utc>,
        tolerance_seconds: u64,
    ) -> VerificationResult<()> {
        match self {
            SignatureScheme::DigestOverBody { secret } => verify_digest_signature(
                body,
                header_str(headers, GITHUB_SIGNATURE_HEADER),
                secret,
            ),
            SignatureScheme::Timestamped { secret } => verify_timestamped_signature(
                body,
                header_str(headers, SLACK_SIGNATURE_HEADER),
                header_str(headers, SLACK_TIMESTAMP_HEADER),
                secret,
                tolerance_seconds,
                now,
            ),
            SignatureScheme::SharedToken { secret } => {
                verify_shared_token(header_str(headers, "authorization"), secret)
            }
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
}

fn hmac_sha256(secret: &str, parts: &[&[u8]]) -> VerificationResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| VerificationError::VerificationFailed)?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().to_vec())
}

fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    expected.ct_eq(provided).into()
}

/// Verifies a GitHub-style `sha256=<hex>` digest over the raw body.
pub fn verify_digest_signature(
    body: &[u8],
    signature_header: &str,
    secret: &str,
) -> VerificationResult<()> {
    if signature_header.is_empty() {
        return Err(VerificationError::MissingSignature {
            header: GITHUB_SIGNATURE_HEADER,
        });
    }

    let provided_hex = signature_header.strip_prefix("sha256=").ok_or(
        VerificationError::InvalidSignatureFormat {
            header: GITHUB_SIGNATURE_HEADER,
        },
    )?;
    let provided = hex::decode(provided_hex).map_err(|_| {
        VerificationError::InvalidSignatureFormat {
            header: GITHUB_SIGNATURE_HEADER,
        }
    })?;

    let expected = hmac_sha256(secret, &[body])?;
    if constant_time_eq(&expected, &provided) {
        Ok(())
    } else {
        Err(VerificationError::VerificationFailed)
    }
}

/// Verifies a Slack-style timestamped signature. The timestamp must lie within
/// `tolerance_seconds` of `now` in either direction.
pub fn verify_timestamped_signature(
    body: &[u8],
    signature_header: &str,
    timestamp_header: &str,
    secret: &str,
    tolerance_seconds: u64,
    now: DateTime<Utc>,
) -> VerificationResult<()> {
    if signature_header.is_empty() {
        return Err(VerificationError::MissingSignature {
            header: SLACK_SIGNATURE_HEADER,
        });
    }
    if timestamp_header.is_empty() {
        return Err(VerificationError::MissingTimestamp {
            header: SLACK_TIMESTAMP_HEADER,
        });
    }

    let timestamp =
        timestamp_header
            .trim()
            .parse::<i64>()
            .map_err(|_| VerificationError::InvalidTimestamp {
                header: SLACK_TIMESTAMP_HEADER,
            })?;

    let skew_seconds = now.timestamp().abs_diff(timestamp);
    if skew_seconds > tolerance_seconds {
        return Err(VerificationError::TimestampOutOfTolerance {
            skew_seconds,
            max_seconds: tolerance_seconds,
        });
    }

    let provided_hex = signature_header.strip_prefix("v0=").ok_or(
        VerificationError::InvalidSignatureFormat {
            header: SLACK_SIGNATURE_HEADER,
        },
    )?;
    let provided = hex::decode(provided_hex).map_err(|_| {
        VerificationError::InvalidSignatureFormat {
            header: SLACK_SIGNATURE_HEADER,
        }
    })?;

    let prefix = format!("v0:{timestamp}:");
    let expected = hmac_sha256(secret, &[prefix.as_bytes(), body])?;
    if constant_time_eq(&expected, &provided) {
        Ok(())
    } else {
        Err(VerificationError::VerificationFailed)
    }
}

/// Verifies `Authorization: Bearer <secret>`.
pub fn verify_shared_token(authorization: &str, secret: &str) -> VerificationResult<()> {
    let token = authorization
        .strip_prefix("Bearer ")
        .ok_or(VerificationError::MissingSignature {
            header: "authorization",
        })?;
    if constant_time_eq(secret.as_bytes(), token.as_bytes()) {
        Ok(())
    } else {
        Err(VerificationError::VerificationFailed)
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Rejected {
        scope: &'static str,
        retry_after_seconds: u64,
    },
}

/// Cheap request admission run before any cryptographic work.
pub trait AdmissionLimiter: Send + Sync {
    fn admit(&self, source: &str, now: DateTime<Utc>) -> Admission;
}

#[derive(Debug, Default)]
struct WindowState {
    window: i64,
    global: u32,
    per_source: HashMap<String, u32>,
}

/// Fixed one-minute window with a global budget and a per-source budget.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    global_per_minute: u32,
    per_source_per_minute: u32,
    state: Mutex<WindowState>,
}

impl FixedWindowLimiter {
    pub fn new(global_per_minute: u32, per_source_per_minute: u32) -> Self {
        Self {
            global_per_minute,
            per_source_per_minute,
            state: Mutex::new(WindowState::default()),
        }
    }
}

impl AdmissionLimiter for FixedWindowLimiter {
    fn admit(&self, source: &str, now: DateTime<Utc>) -> Admission {
        let window = now.timestamp().div_euclid(60);
        let retry_after_seconds = (60 - now.timestamp().rem_euclid(60)) as u64;

        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.window != window {
            *state = WindowState {
                window,
                ..WindowState::default()
            };
        }

        if state.global >= self.global_per_minute {
            return Admission::Rejected {
                scope: "global",
                retry_after_seconds,
            };
        }
        let used = state.per_source.get(source).copied().unwrap_or(0);
        if used >= self.per_source_per_minute {
            return Admission::Rejected {
                scope: "source",
                retry_after_seconds,
            };
        }

        state.global += 1;
        state.per_source.insert(source.to_string(), used + 1);
        Admission::Admitted
    }
}

/// How a request was authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verified {
    Operator,
    Signature,
}

/// Per-provider webhook verification with operator override and admission control.
#[derive(Clone)]
pub struct WebhookVerifier {
    schemes: HashMap<String, SignatureScheme>,
    operator_tokens: Vec<Zeroizing<String>>,
    tolerance_seconds: u64,
    limiter: Arc<dyn AdmissionLimiter>,
    clock: SharedClock,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut providers: Vec<_> = self.schemes.keys().collect();
        providers.sort();
        f.debug_struct("WebhookVerifier")
            .field("providers", &providers)
            .field("operator_tokens", &self.operator_tokens.len())
            .field("tolerance_seconds", &self.tolerance_seconds)
            .finish()
    }
}

impl WebhookVerifier {
    pub fn new(
        tolerance_seconds: u64,
        limiter: Arc<dyn AdmissionLimiter>,
        clock: SharedClock,
    ) -> Self {
        Self {
            schemes: HashMap::new(),
            operator_tokens: Vec::new(),
            tolerance_seconds,
            limiter,
            clock,
        }
    }

    /// Verifier for the providers with secrets in `config`.
    pub fn from_config(config: &AppConfig, clock: SharedClock) -> Self {
        let webhooks = &config.webhooks;
        let limiter = Arc::new(FixedWindowLimiter::new(
            webhooks.global_rate_limit_per_minute,
            webhooks.rate_limit_per_minute,
        ));
        let mut verifier = Self::new(webhooks.timestamp_tolerance_seconds, limiter, clock)
            .with_operator_tokens(config.operator_tokens.iter().cloned());

        let load = |value: &Option<String>| value.clone().map(Zeroizing::new);
        if let Some(secret) = load(&webhooks.github_secret) {
            verifier = verifier.with_scheme("github", SignatureScheme::DigestOverBody { secret });
        }
        if let Some(secret) = load(&webhooks.slack_signing_secret) {
            verifier = verifier.with_scheme("slack", SignatureScheme::Timestamped { secret });
        }
        if let Some(secret) = load(&webhooks.jira_secret) {
            verifier = verifier.with_scheme("jira", SignatureScheme::SharedToken { secret });
        }
        if let Some(secret) = load(&webhooks.zoho_cliq_token) {
            verifier = verifier.with_scheme("zoho-cliq", SignatureScheme::SharedToken { secret });
        }
        verifier
    }

    pub fn with_scheme(mut self, provider: impl Into<String>, scheme: SignatureScheme) -> Self {
        self.schemes.insert(provider.into(), scheme);
        self
    }

    pub fn with_operator_tokens<I>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.operator_tokens = tokens
            .into_iter()
            .filter(|token| !token.is_empty())
            .map(Zeroizing::new)
            .collect();
        self
    }

    pub fn is_configured(&self, provider: &str) -> bool {
        self.schemes.contains_key(provider)
    }

    /// Accepts or rejects one delivery. `source` identifies the sender for
    /// admission limiting (`provider:tenant`).
    pub fn verify(
        &self,
        provider: &str,
        source: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> VerificationResult<Verified> {
        let now = self.clock.now();

        if let Admission::Rejected {
            scope,
            retry_after_seconds,
        } = self.limiter.admit(source, now)
        {
            counter!("webhook_admission_rejected_total", "scope" => scope).increment(1);
            warn!(provider, source, scope, "webhook admission rejected");
            return Err(VerificationError::RateLimited {
                scope,
                retry_after_seconds,
            });
        }

        if self.is_operator(headers) {
            counter!(
                "webhook_verification_success_total",
                "provider" => provider.to_string(),
                "method" => "operator"
            )
            .increment(1);
            info!(provider, body_size = body.len(), "webhook accepted via operator credential");
            return Ok(Verified::Operator);
        }

        let result = match self.schemes.get(provider) {
            Some(scheme) => scheme
                .verify(headers, body, now, self.tolerance_seconds)
                .map(|_| scheme.method()),
            None => Err(VerificationError::NotConfigured {
                provider: provider.to_string(),
            }),
        };

        match result {
            Ok(method) => {
                counter!(
                    "webhook_verification_success_total",
                    "provider" => provider.to_string(),
                    "method" => method
                )
                .increment(1);
                debug!(provider, method, body_size = body.len(), "webhook signature verified");
                Ok(Verified::Signature)
            }
            Err(err) => {
                if matches!(err, VerificationError::TimestampOutOfTolerance { .. }) {
                    counter!("webhook_verification_replay_rejected_total").increment(1);
                }
                counter!(
                    "webhook_verification_failure_total",
                    "provider" => provider.to_string(),
                    "reason" => err.reason()
                )
                .increment(1);
                warn!(provider, reason = err.reason(), "webhook verification failed");
                Err(err)
            }
        }
    }

    fn is_operator(&self, headers: &HeaderMap) -> bool {
        let Some(token) = header_str(headers, "authorization").strip_prefix("Bearer ") else {
            return false;
        };
        // Compare against every token so timing does not reveal which one matched.
        self.operator_tokens
            .iter()
            .fold(false, |matched, candidate| {
                matched | constant_time_eq(candidate.as_bytes(), token.as_bytes())
            })
    }
}
