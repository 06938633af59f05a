//! Rate limit and backoff policy
//!
//! Turns a provider failure into a retry decision. Rate limits honour the
//! provider's `Retry-After` hint; transient failures back off exponentially with
//! jitter; 401s go to the token refresh path; everything else fails the job.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;

use crate::config::RateLimitPolicyConfig;
use crate::connectors::ConnectorError;

/// OAuth `error` codes that will never succeed on retry.
const PERMANENT_OAUTH_ERRORS: &[&str] = &[
    "invalid_grant",
    "invalid_client",
    "unauthorized_client",
    "unsupported_grant_type",
    "access_denied",
];

/// OAuth `error` codes that mean "slow down".
const RATE_LIMIT_OAUTH_ERRORS: &[&str] = &[
    "rate_limit",
    "rate_limited",
    "too_many_requests",
    "temporarily_unavailable",
    "quota_exceeded",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryReason {
    RateLimited,
    Transient,
}

impl RetryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryReason::RateLimited => "rate_limited",
            RetryReason::Transient => "transient",
        }
    }
}

/// Outcome of classifying a failed provider call.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Retry { after_seconds: u64, reason: RetryReason },
    Permanent { detail: FailureDetail },
    Unauthorized,
}

/// Diagnostic stored in the job's `error` column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureDetail {
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub attempts: u32,
}

impl FailureDetail {
    fn new(kind: &'static str, error: &ConnectorError, attempts: u32) -> Self {
        Self {
            kind,
            message: error.to_string(),
            status: error.status(),
            attempts,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({ "kind": self.kind }))
    }
}

/// How an OAuth token endpoint failure should affect the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthFailure {
    Revoked,
    Permanent,
    RateLimited,
    Transient,
}

impl OAuthFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            OAuthFailure::Revoked => "revoked",
            OAuthFailure::Permanent => "permanent",
            OAuthFailure::RateLimited => "rate_limited",
            OAuthFailure::Transient => "transient",
        }
    }
}

/// Classifies a failed refresh call.
pub fn classify_refresh_error(error: &ConnectorError) -> OAuthFailure {
    match error {
        ConnectorError::AuthenticationError {
            details,
            error_code,
        } => {
            let code = error_code.as_deref().unwrap_or_default().to_ascii_lowercase();
            if code.contains("revoked") || details.to_ascii_lowercase().contains("revoked") {
                OAuthFailure::Revoked
            } else if RATE_LIMIT_OAUTH_ERRORS.contains(&code.as_str()) {
                OAuthFailure::RateLimited
            } else {
                // Unknown codes from a token endpoint are treated as permanent.
                OAuthFailure::Permanent
            }
        }
        ConnectorError::RateLimitError { .. } => OAuthFailure::RateLimited,
        ConnectorError::HttpError { status: 429, .. } => OAuthFailure::RateLimited,
        ConnectorError::HttpError { status, body, .. } if (400..500).contains(status) => {
            let body = body.as_deref().unwrap_or_default().to_ascii_lowercase();
            if body.contains("revoked") {
                OAuthFailure::Revoked
            } else if *status == 401
                || *status == 403
                || PERMANENT_OAUTH_ERRORS.iter().any(|code| body.contains(code))
            {
                OAuthFailure::Permanent
            } else {
                OAuthFailure::Transient
            }
        }
        ConnectorError::ConfigurationError { .. } => OAuthFailure::Permanent,
        _ => OAuthFailure::Transient,
    }
}

/// Effective parameters for one provider.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ProviderPolicy {
    base_seconds: u64,
    max_seconds: u64,
    jitter_factor: f64,
}

/// Backoff policy built from [`RateLimitPolicyConfig`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RateLimitPolicyConfig,
}

impl RetryPolicy {
    pub fn new(config: RateLimitPolicyConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    fn provider_policy(&self, provider_slug: &str) -> ProviderPolicy {
        let overrides = self.config.provider_overrides.get(provider_slug);
        ProviderPolicy {
            base_seconds: overrides
                .and_then(|o| o.base_seconds)
                .unwrap_or(self.config.base_seconds),
            max_seconds: overrides
                .and_then(|o| o.max_seconds)
                .unwrap_or(self.config.max_seconds),
            jitter_factor: overrides
                .and_then(|o| o.jitter_factor)
                .unwrap_or(self.config.jitter_factor),
        }
    }

    /// Exponential backoff for the given number of prior attempts, with jitter.
    pub fn backoff_seconds<R: Rng + ?Sized>(
        &self,
        provider_slug: &str,
        attempts: u32,
        rng: &mut R,
    ) -> u64 {
        let policy = self.provider_policy(provider_slug);
        let exponent = attempts.min(32) as i32;
        let backoff = (policy.base_seconds as f64 * 2_f64.powi(exponent))
            .min(policy.max_seconds as f64);

        let spread = policy.jitter_factor * backoff;
        let jitter = if spread > 0.0 {
            rng.gen_range(0.0..spread)
        } else {
            0.0
        };
        (backoff + jitter).floor() as u64
    }

    /// Classifies a failed sync or webhook call. `attempts` counts the runs made so
    /// far, including the one that just failed.
    pub fn classify<R: Rng + ?Sized>(
        &self,
        provider_slug: &str,
        error: &ConnectorError,
        attempts: u32,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> RetryDecision {
        let rate_limited = match error {
            ConnectorError::HttpError { status: 401, .. } => return RetryDecision::Unauthorized,
            ConnectorError::HttpError { status: 429, .. } => Some(
                error
                    .header("retry-after")
                    .and_then(|value| parse_retry_after(value, now)),
            ),
            ConnectorError::RateLimitError { retry_after } => Some(*retry_after),
            ConnectorError::AuthenticationError { error_code, .. }
                if error_code
                    .as_deref()
                    .is_some_and(|code| RATE_LIMIT_OAUTH_ERRORS.contains(&code)) =>
            {
                Some(None)
            }
            _ => None,
        };

        if attempts >= self.config.max_attempts {
            return RetryDecision::Permanent {
                detail: FailureDetail::new("attempts_exhausted", error, attempts),
            };
        }

        if let Some(hint) = rate_limited {
            return RetryDecision::Retry {
                after_seconds: hint.unwrap_or(self.config.default_retry_after_seconds),
                reason: RetryReason::RateLimited,
            };
        }

        match error {
            ConnectorError::HttpError { status, .. } if *status >= 500 => RetryDecision::Retry {
                after_seconds: self.backoff_seconds(provider_slug, attempts.saturating_sub(1), rng),
                reason: RetryReason::Transient,
            },
            ConnectorError::NetworkError { .. } | ConnectorError::MalformedResponse { .. } => {
                RetryDecision::Retry {
                    after_seconds: self.backoff_seconds(
                        provider_slug,
                        attempts.saturating_sub(1),
                        rng,
                    ),
                    reason: RetryReason::Transient,
                }
            }
            ConnectorError::AuthenticationError { .. } => RetryDecision::Permanent {
                detail: FailureDetail::new("authentication", error, attempts),
            },
            ConnectorError::ConfigurationError { .. } => RetryDecision::Permanent {
                detail: FailureDetail::new("configuration", error, attempts),
            },
            _ => RetryDecision::Permanent {
                detail: FailureDetail::new("client_error", error, attempts),
            },
        }
    }
}

/// Parses a `Retry-After` value: delta-seconds or an HTTP-date. Dates in the past
/// yield zero.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<u64> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }

    let date = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date.with_timezone(&Utc) - now;
    Some(delta.num_seconds().max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitProviderOverride;
    use chrono::TimeZone;
    use rand::{SeedableRng, rngs::StdRng};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(RateLimitPolicyConfig::default())
    }

    #[test]
    fn retry_after_accepts_seconds_and_dates() {
        assert_eq!(parse_retry_after("120", now()), Some(120));
        assert_eq!(
            parse_retry_after("Wed, 01 May 2024 12:01:30 GMT", now()),
            Some(90)
        );
        assert_eq!(
            parse_retry_after("Wed, 01 May 2024 11:00:00 GMT", now()),
            Some(0)
        );
        assert_eq!(parse_retry_after("soon", now()), None);
    }

    #[test]
    fn rate_limit_uses_hint_or_default() {
        let mut rng = StdRng::seed_from_u64(7);
        let with_hint = ConnectorError::http(429).with_header("Retry-After", "42");
        assert_eq!(
            policy().classify("example", &with_hint, 1, now(), &mut rng),
            RetryDecision::Retry {
                after_seconds: 42,
                reason: RetryReason::RateLimited
            }
        );

        let bare = ConnectorError::http(429);
        assert_eq!(
            policy().classify("example", &bare, 1, now(), &mut rng),
            RetryDecision::Retry {
                after_seconds: 60,
                reason: RetryReason::RateLimited
            }
        );
    }

    #[test]
    fn server_errors_back_off_exponentially() {
        let mut rng = StdRng::seed_from_u64(1);
        let policy = policy();
        for (attempts, floor) in [(1, 5), (2, 10), (3, 20)] {
            match policy.classify("example", &ConnectorError::http(503), attempts, now(), &mut rng) {
                RetryDecision::Retry {
                    after_seconds,
                    reason: RetryReason::Transient,
                } => {
                    assert!(after_seconds >= floor);
                    assert!((after_seconds as f64) < floor as f64 * 1.1 + 1.0);
                }
                other => panic!("unexpected decision {other:?}"),
            }
        }
    }

    #[test]
    fn backoff_is_capped_and_overridable() {
        let mut config = RateLimitPolicyConfig {
            jitter_factor: 0.0,
            ..RateLimitPolicyConfig::default()
        };
        config.provider_overrides.insert(
            "github".into(),
            RateLimitProviderOverride {
                base_seconds: Some(10),
                max_seconds: Some(30),
                jitter_factor: None,
            },
        );
        let policy = RetryPolicy::new(config);
        let mut rng = StdRng::seed_from_u64(3);

        assert_eq!(policy.backoff_seconds("github", 0, &mut rng), 10);
        assert_eq!(policy.backoff_seconds("github", 5, &mut rng), 30);
        assert_eq!(policy.backoff_seconds("jira", 20, &mut rng), 900);
    }

    #[test]
    fn exhausted_attempts_become_permanent() {
        let mut rng = StdRng::seed_from_u64(9);
        let err = ConnectorError::NetworkError {
            details: "connection reset".into(),
        };
        match policy().classify("example", &err, 5, now(), &mut rng) {
            RetryDecision::Permanent { detail } => {
                assert_eq!(detail.kind, "attempts_exhausted");
                assert_eq!(detail.attempts, 5);
                assert_eq!(detail.to_json()["kind"], "attempts_exhausted");
            }
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn unauthorized_and_client_errors() {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(
            policy().classify("example", &ConnectorError::http(401), 1, now(), &mut rng),
            RetryDecision::Unauthorized
        );
        assert!(matches!(
            policy().classify("example", &ConnectorError::http(404), 1, now(), &mut rng),
            RetryDecision::Permanent { detail } if detail.status == Some(404)
        ));
    }

    #[test]
    fn refresh_errors_are_classified() {
        let auth = |code: &str, details: &str| ConnectorError::AuthenticationError {
            details: details.into(),
            error_code: Some(code.into()),
        };
        assert_eq!(
            classify_refresh_error(&auth("invalid_grant", "expired")),
            OAuthFailure::Permanent
        );
        assert_eq!(
            classify_refresh_error(&auth("invalid_grant", "Token has been revoked")),
            OAuthFailure::Revoked
        );
        assert_eq!(
            classify_refresh_error(&auth("temporarily_unavailable", "")),
            OAuthFailure::RateLimited
        );
        assert_eq!(
            classify_refresh_error(&ConnectorError::http(502)),
            OAuthFailure::Transient
        );
        assert_eq!(
            classify_refresh_error(&ConnectorError::http(401)),
            OAuthFailure::Permanent
        );
    }
}
