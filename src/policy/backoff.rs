use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::BackoffConfig;
use crate::error::{TransportError, TransportErrorKind};

/// Account-restriction indicators; any match pauses until the next work window
pub const FATAL_PATTERNS: &[&str] = &[
    "USER_DEACTIVATED",
    "BANNED",
    "RESTRICTED",
    "SESSION_REVOKED",
    "PEER_FLOOD",
];

/// Flood / session indicators that call for exponential cooldown
pub const DANGEROUS_PATTERNS: &[&str] = &[
    "FLOOD_WAIT",
    "FLOOD",
    "AUTH_KEY_DUPLICATED",
    "CHAT_WRITE_FORBIDDEN",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Unrecoverable without a human; pause until the next work window
    Fatal,
    /// Platform flood control with an explicit wait
    RateLimited(Duration),
    /// Keyword-matched risk signal; exponential cooldown
    Dangerous,
    /// Formatting rejected; recovered locally by resending unformatted
    ContentFormat,
    /// Anything else; short bounded cooldown
    Transient,
}

impl ErrorClass {
    /// Operator hint logged next to every failure
    pub fn advice(&self) -> &'static str {
        match self {
            ErrorClass::Fatal => "account may be restricted; needs a manual check",
            ErrorClass::RateLimited(_) => "stop sending and wait out the flood control",
            ErrorClass::Dangerous => "risk signal from the platform; cooling down",
            ErrorClass::ContentFormat => "formatting rejected; resend as plain text",
            ErrorClass::Transient => "unclassified failure; safe to retry later",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Fatal => write!(f, "fatal"),
            ErrorClass::RateLimited(wait) => write!(f, "rate-limited ({}s)", wait.as_secs()),
            ErrorClass::Dangerous => write!(f, "dangerous"),
            ErrorClass::ContentFormat => write!(f, "content-format"),
            ErrorClass::Transient => write!(f, "transient"),
        }
    }
}

/// Maps a transport failure onto an [`ErrorClass`] through a static
/// (pattern, class) table. Fatal rows come first so they win on overlap.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    table: Vec<(String, ErrorClass)>,
}

impl ErrorClassifier {
    pub fn new(config: &BackoffConfig) -> Self {
        Self::from_keywords(&config.fatal_keywords, &config.dangerous_keywords)
    }

    pub fn from_keywords(fatal: &[String], dangerous: &[String]) -> Self {
        let rows = |keywords: &[String], class: ErrorClass| {
            keywords
                .iter()
                .filter(|k| !k.trim().is_empty())
                .map(move |k| (k.trim().to_uppercase(), class))
                .collect::<Vec<_>>()
        };
        let mut table = rows(fatal, ErrorClass::Fatal);
        table.extend(rows(dangerous, ErrorClass::Dangerous));
        Self { table }
    }

    pub fn classify(&self, error: &TransportError) -> ErrorClass {
        if error.kind == TransportErrorKind::EntityBounds {
            return ErrorClass::ContentFormat;
        }
        if let Some(wait) = error.retry_after {
            return ErrorClass::RateLimited(wait);
        }

        let message = error.message.to_uppercase();
        self.table
            .iter()
            .find(|(pattern, _)| message.contains(pattern.as_str()))
            .map(|(_, class)| *class)
            .unwrap_or(ErrorClass::Transient)
    }
}

/// Consecutive-error counter driving exponential cooldown
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base: Duration,
    cap_exponent: u32,
    consecutive_errors: u32,
}

impl BackoffPolicy {
    pub fn new(config: &BackoffConfig) -> Self {
        Self::with_base(Duration::from_secs(config.cooldown_base_secs), config.cap_exponent)
    }

    pub fn with_base(base: Duration, cap_exponent: u32) -> Self {
        Self {
            base,
            cap_exponent,
            consecutive_errors: 0,
        }
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// Count one more failure and return `base * 2^min(n-1, cap)`
    pub fn record_error(&mut self) -> Duration {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.cooldown_for(self.consecutive_errors)
    }

    pub fn record_success(&mut self) {
        self.consecutive_errors = 0;
    }

    pub fn cooldown_for(&self, errors: u32) -> Duration {
        let exponent = errors.saturating_sub(1).min(self.cap_exponent);
        self.base.saturating_mul(2u32.saturating_pow(exponent))
    }
}

/// Pipeline availability: `Active ⇄ Paused`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Availability {
    #[default]
    Active,
    Paused { until: DateTime<Utc> },
}

impl Availability {
    pub fn is_paused(&self) -> bool {
        matches!(self, Availability::Paused { .. })
    }

    pub fn pause_until(&self) -> Option<DateTime<Utc>> {
        match self {
            Availability::Active => None,
            Availability::Paused { until } => Some(*until),
        }
    }

    /// Resume only once the deadline passed and the clock is in a workable hour
    pub fn may_resume(&self, now: DateTime<Utc>, workable: bool) -> bool {
        match self {
            Availability::Active => false,
            Availability::Paused { until } => now >= *until && workable,
        }
    }
}
