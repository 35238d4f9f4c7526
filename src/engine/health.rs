//! Failure classification and the credential health state machine.
//!
//! Rate-limit responses always suspend, authorization rejections always
//! disable, and every other failure feeds a circuit breaker: after N
//! consecutive failures the credential is suspended for a cooldown window.
//! `disabled` is terminal. Leaving `suspended` only happens through the
//! lazy reset in [`super::selection`], never through a report.

use chrono::{DateTime, Duration, Utc};

use crate::db::models::{CredentialStatus, HealthState};

// =============================================================================
// Constants
// =============================================================================

/// Consecutive non-quota, non-auth failures before the circuit opens.
pub const MAX_CONSECUTIVE_FAILURES: i64 = 5;

/// How long a suspended credential stays out of rotation.
pub const SUSPENSION_MINUTES: i64 = 15;

pub const SUCCESS_STATUS: u16 = 200;

pub fn suspension_window() -> Duration {
    Duration::minutes(SUSPENSION_MINUTES)
}

// =============================================================================
// Error classification
// =============================================================================

/// Coarse tag written to the usage log for every outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Success,
    RateLimit,
    Auth,
    Server,
    Client,
    /// Any code below 400. Callers report transport timeouts this way.
    Timeout,
}

impl ErrorClass {
    pub fn from_status(status_code: u16) -> Self {
        match status_code {
            429 => ErrorClass::RateLimit,
            401 | 403 => ErrorClass::Auth,
            code if code >= 500 => ErrorClass::Server,
            code if code >= 400 => ErrorClass::Client,
            _ => ErrorClass::Timeout,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Success => "success",
            ErrorClass::RateLimit => "rate_limit",
            ErrorClass::Auth => "auth",
            ErrorClass::Server => "server",
            ErrorClass::Client => "client",
            ErrorClass::Timeout => "timeout",
        }
    }
}

/// Map an upstream error message to the status code to report.
///
/// Upstream SDKs often surface failures as strings; this recognises both the
/// numeric code and the gRPC-style status names.
pub fn classify_upstream_error(message: &str) -> u16 {
    if message.contains("429") || message.contains("RESOURCE_EXHAUSTED") {
        429
    } else if message.contains("401") || message.contains("UNAUTHENTICATED") {
        401
    } else if message.contains("403") || message.contains("PERMISSION_DENIED") {
        403
    } else if message.contains("408") {
        408
    } else {
        500
    }
}

// =============================================================================
// State machine
// =============================================================================

/// What a failure report did to the credential, for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    /// Suspended because the upstream signalled a quota / rate limit.
    SuspendedRateLimit { until: DateTime<Utc> },
    /// Suspended because the failure streak hit the threshold.
    SuspendedCircuitBreaker { until: DateTime<Utc>, failures: i64 },
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureOutcome {
    pub next: HealthState,
    pub transition: Transition,
}

/// Apply one failure report with `status_code` observed at `now`.
pub fn on_failure(current: &HealthState, status_code: u16, now: DateTime<Utc>) -> FailureOutcome {
    let unchanged = |next: HealthState| FailureOutcome {
        next,
        transition: Transition::Unchanged,
    };

    match current.status {
        // Terminal: the streak is frozen.
        CredentialStatus::Disabled => unchanged(current.clone()),

        CredentialStatus::Suspended => unchanged(HealthState {
            consecutive_failures: current.consecutive_failures + 1,
            ..current.clone()
        }),

        CredentialStatus::Active => {
            let failures = current.consecutive_failures + 1;
            match ErrorClass::from_status(status_code) {
                ErrorClass::RateLimit => {
                    let until = now + suspension_window();
                    FailureOutcome {
                        next: HealthState {
                            status: CredentialStatus::Suspended,
                            suspended_until: Some(until),
                            consecutive_failures: failures,
                        },
                        transition: Transition::SuspendedRateLimit { until },
                    }
                }
                ErrorClass::Auth => FailureOutcome {
                    next: HealthState {
                        status: CredentialStatus::Disabled,
                        suspended_until: None,
                        consecutive_failures: failures,
                    },
                    transition: Transition::Disabled,
                },
                _ if failures >= MAX_CONSECUTIVE_FAILURES => {
                    let until = now + suspension_window();
                    FailureOutcome {
                        next: HealthState {
                            status: CredentialStatus::Suspended,
                            suspended_until: Some(until),
                            consecutive_failures: failures,
                        },
                        transition: Transition::SuspendedCircuitBreaker { until, failures },
                    }
                }
                _ => unchanged(HealthState {
                    consecutive_failures: failures,
                    ..current.clone()
                }),
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
