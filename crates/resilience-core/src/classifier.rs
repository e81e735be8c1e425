//! Failure classification
//!
//! Maps a raw [`OperationError`] to a type, a retryability verdict, a severity
//! and the retry strategy to apply. Classification is a pure function of its
//! inputs and never fails: anything unrecognized becomes a retryable,
//! medium-severity `unknown`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::models::{ErrorContext, OperationError, PolicyOverride, RetryPolicy, Severity};

/// Classifier verdict on what kind of failure occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Network,
    Timeout,
    Validation,
    Permission,
    ServerError,
    RateLimit,
    BusinessRule,
    Unknown,
}

impl ErrorType {
    /// Every type, in matching precedence order
    pub const ALL: [ErrorType; 8] = [
        Self::Network,
        Self::Timeout,
        Self::Validation,
        Self::Permission,
        Self::ServerError,
        Self::RateLimit,
        Self::BusinessRule,
        Self::Unknown,
    ];

    /// snake_case name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Validation => "validation",
            Self::Permission => "permission",
            Self::ServerError => "server_error",
            Self::RateLimit => "rate_limit",
            Self::BusinessRule => "business_rule",
            Self::Unknown => "unknown",
        }
    }

    /// Retryability and severity before any strategy table is consulted
    fn intrinsic(self) -> (bool, Severity) {
        match self {
            Self::Network => (true, Severity::Low),
            Self::Timeout => (true, Severity::Medium),
            Self::Validation => (false, Severity::High),
            Self::Permission => (false, Severity::High),
            Self::ServerError => (true, Severity::Medium),
            Self::RateLimit => (true, Severity::High),
            Self::BusinessRule => (false, Severity::Medium),
            Self::Unknown => (true, Severity::Medium),
        }
    }

    /// Tags attached to exception records of this type
    pub fn tags(self) -> &'static [&'static str] {
        match self {
            Self::Network => &["network", "connectivity"],
            Self::Timeout => &["network", "timeout"],
            Self::Validation => &["data-validation", "user-input"],
            Self::Permission => &["security", "authorization"],
            Self::ServerError => &["external-service", "server"],
            Self::RateLimit => &["external-service", "throttling"],
            Self::BusinessRule => &["business-rule", "workflow"],
            Self::Unknown => &[],
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or(())
    }
}

/// Result of classifying one failure
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub error_type: ErrorType,
    pub retryable: bool,
    pub severity: Severity,
    /// Policy for this type: the override table merged over the caller default
    pub strategy: RetryPolicy,
    /// Set when nothing matched and the conservative default was used
    pub fallback: bool,
}

/// Type-keyed strategy overrides
pub type StrategyTable = BTreeMap<ErrorType, PolicyOverride>;

/// Built-in strategy overrides per error type
pub fn default_strategies() -> StrategyTable {
    let mut table = StrategyTable::new();
    table.insert(
        ErrorType::Network,
        PolicyOverride::default()
            .max_attempts(5)
            .initial_delay_ms(500)
            .max_delay_ms(10_000)
            .backoff_multiplier(2.0)
            .recoverable(true),
    );
    table.insert(
        ErrorType::Validation,
        PolicyOverride::default()
            .max_attempts(1)
            .initial_delay_ms(0)
            .recoverable(false),
    );
    table.insert(
        ErrorType::Permission,
        PolicyOverride::default()
            .max_attempts(1)
            .initial_delay_ms(0)
            .recoverable(false),
    );
    table.insert(
        ErrorType::ServerError,
        PolicyOverride::default()
            .max_attempts(3)
            .initial_delay_ms(2_000)
            .max_delay_ms(60_000)
            .backoff_multiplier(3.0)
            .recoverable(true),
    );
    table.insert(
        ErrorType::RateLimit,
        PolicyOverride::default()
            .max_attempts(5)
            .initial_delay_ms(5_000)
            .max_delay_ms(120_000)
            .backoff_multiplier(2.0)
            .recoverable(true),
    );
    table.insert(
        ErrorType::Timeout,
        PolicyOverride::default()
            .max_attempts(3)
            .initial_delay_ms(1_000)
            .max_delay_ms(15_000)
            .backoff_multiplier(1.5)
            .recoverable(true),
    );
    table
}

/// Stateless classifier holding the strategy override table
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    strategies: StrategyTable,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(default_strategies())
    }
}

impl ErrorClassifier {
    /// Create a classifier with a strategy table
    pub fn new(strategies: StrategyTable) -> Self {
        Self { strategies }
    }

    /// The override table
    pub fn strategies(&self) -> &StrategyTable {
        &self.strategies
    }

    /// Override registered for a type, if any
    pub fn override_for(&self, error_type: ErrorType) -> Option<&PolicyOverride> {
        self.strategies.get(&error_type)
    }

    /// Policy for a type: its override merged over `base`, or `base` itself
    pub fn strategy_for(&self, error_type: ErrorType, base: &RetryPolicy) -> RetryPolicy {
        match self.override_for(error_type) {
            Some(over) => base.merge(over),
            None => base.clone(),
        }
    }

    /// Classify a failure
    pub fn classify(
        &self,
        error: &OperationError,
        context: &ErrorContext,
        default_policy: &RetryPolicy,
    ) -> Classification {
        let matched = detect(error);
        let hinted = context
            .category
            .as_deref()
            .and_then(|c| c.parse::<ErrorType>().ok())
            .filter(|t| *t != ErrorType::Unknown);

        let (error_type, fallback) = match (matched, hinted) {
            (Some(t), _) => (t, false),
            (None, Some(t)) => (t, false),
            (None, None) => (ErrorType::Unknown, true),
        };

        let (mut retryable, severity) = error_type.intrinsic();
        if let Some(over) = self.override_for(error_type) {
            retryable = over.recoverable.unwrap_or(true);
        }

        Classification {
            error_type,
            retryable,
            severity,
            strategy: self.strategy_for(error_type, default_policy),
            fallback,
        }
    }
}

/// Keyword and code matching, in precedence order
fn detect(error: &OperationError) -> Option<ErrorType> {
    let message = error.message.to_lowercase();
    let has = |needle: &str| message.contains(needle);
    let named = error.code.as_ref().and_then(|c| c.name());
    let code_is = |codes: &[&str]| named.is_some_and(|n| codes.contains(&n));
    let status = error.code.as_ref().and_then(|c| c.status());

    if has("network") || has("connection") || code_is(&["NETWORK_ERROR", "CONNECTION_FAILED"]) {
        Some(ErrorType::Network)
    } else if has("timeout") || code_is(&["TIMEOUT"]) {
        Some(ErrorType::Timeout)
    } else if has("validation") || has("invalid") || code_is(&["VALIDATION_ERROR", "INVALID_INPUT"])
    {
        Some(ErrorType::Validation)
    } else if has("permission")
        || has("unauthorized")
        || code_is(&["PERMISSION_DENIED", "UNAUTHORIZED"])
    {
        Some(ErrorType::Permission)
    } else if has("server error") || status.is_some_and(|s| s >= 500) {
        Some(ErrorType::ServerError)
    } else if has("rate limit")
        || has("too many requests")
        || code_is(&["RATE_LIMIT_EXCEEDED"])
        || status == Some(429)
    {
        Some(ErrorType::RateLimit)
    } else if has("business rule") || has("not available") {
        Some(ErrorType::BusinessRule)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn classify(error: OperationError) -> Classification {
        ErrorClassifier::default().classify(&error, &ErrorContext::default(), &RetryPolicy::default())
    }

    #[rstest]
    #[case("Network unreachable", ErrorType::Network, true, Severity::Low)]
    #[case("connection reset by peer", ErrorType::Network, true, Severity::Low)]
    #[case("request timeout", ErrorType::Timeout, true, Severity::Medium)]
    #[case("validation failed", ErrorType::Validation, false, Severity::High)]
    #[case("invalid document id", ErrorType::Validation, false, Severity::High)]
    #[case("permission denied", ErrorType::Permission, false, Severity::High)]
    #[case("Unauthorized", ErrorType::Permission, false, Severity::High)]
    #[case("internal server error", ErrorType::ServerError, true, Severity::Medium)]
    #[case("rate limit reached", ErrorType::RateLimit, true, Severity::High)]
    #[case("Too Many Requests", ErrorType::RateLimit, true, Severity::High)]
    #[case("business rule violated", ErrorType::BusinessRule, false, Severity::Medium)]
    #[case("document not available", ErrorType::BusinessRule, false, Severity::Medium)]
    #[case("something odd", ErrorType::Unknown, true, Severity::Medium)]
    fn test_keyword_classification(
        #[case] message: &str,
        #[case] expected: ErrorType,
        #[case] retryable: bool,
        #[case] severity: Severity,
    ) {
        let verdict = classify(OperationError::new(message));
        assert_eq!(verdict.error_type, expected);
        assert_eq!(verdict.retryable, retryable);
        assert_eq!(verdict.severity, severity);
    }

    #[rstest]
    #[case(OperationError::new("boom").with_code("NETWORK_ERROR"), ErrorType::Network)]
    #[case(OperationError::new("boom").with_code("TIMEOUT"), ErrorType::Timeout)]
    #[case(OperationError::new("boom").with_code("INVALID_INPUT"), ErrorType::Validation)]
    #[case(OperationError::new("boom").with_code("PERMISSION_DENIED"), ErrorType::Permission)]
    #[case(OperationError::new("boom").with_code(503u16), ErrorType::ServerError)]
    #[case(OperationError::new("boom").with_code(429u16), ErrorType::RateLimit)]
    #[case(OperationError::new("boom").with_code("RATE_LIMIT_EXCEEDED"), ErrorType::RateLimit)]
    #[case(OperationError::new("boom").with_code(404u16), ErrorType::Unknown)]
    fn test_code_classification(#[case] error: OperationError, #[case] expected: ErrorType) {
        assert_eq!(classify(error).error_type, expected);
    }

    #[test]
    fn test_precedence_network_before_timeout() {
        let verdict = classify(OperationError::new("Network timeout"));
        assert_eq!(verdict.error_type, ErrorType::Network);
    }

    #[test]
    fn test_unknown_is_flagged_fallback() {
        let verdict = classify(OperationError::new(""));
        assert!(verdict.fallback);
        assert!(verdict.retryable);
        assert_eq!(verdict.severity, Severity::Medium);
        assert_eq!(verdict.strategy, RetryPolicy::default());
    }

    #[test]
    fn test_context_hint_used_when_nothing_matches() {
        let classifier = ErrorClassifier::default();
        let context = ErrorContext::new().with_category("rate_limit");
        let verdict = classifier.classify(
            &OperationError::new("upstream said no"),
            &context,
            &RetryPolicy::default(),
        );
        assert_eq!(verdict.error_type, ErrorType::RateLimit);
        assert!(!verdict.fallback);
    }

    #[test]
    fn test_strategy_merges_override_over_default() {
        let verdict = classify(OperationError::new("network down"));
        assert_eq!(verdict.strategy.max_attempts, 5);
        assert_eq!(verdict.strategy.initial_delay_ms, 500);
        assert_eq!(verdict.strategy.jitter_range, RetryPolicy::default().jitter_range);
    }

    #[test]
    fn test_table_recoverable_flag_wins() {
        let mut table = default_strategies();
        table.insert(ErrorType::Network, PolicyOverride::default().recoverable(false));
        let classifier = ErrorClassifier::new(table);

        let verdict = classifier.classify(
            &OperationError::new("network down"),
            &ErrorContext::default(),
            &RetryPolicy::default(),
        );
        assert!(!verdict.retryable);
    }

    #[test]
    fn test_error_type_parses_from_name() {
        assert_eq!("server_error".parse::<ErrorType>(), Ok(ErrorType::ServerError));
        assert_eq!("RATE_LIMIT".parse::<ErrorType>(), Ok(ErrorType::RateLimit));
        assert!("default".parse::<ErrorType>().is_err());
    }

    proptest::proptest! {
        #[test]
        fn classification_is_pure(message in ".{0,40}", status in proptest::option::of(100u16..600)) {
            let mut error = OperationError::new(message);
            if let Some(s) = status {
                error = error.with_code(s);
            }
            let classifier = ErrorClassifier::default();
            let ctx = ErrorContext::default();
            let policy = RetryPolicy::default();

            proptest::prop_assert_eq!(
                classifier.classify(&error, &ctx, &policy),
                classifier.classify(&error, &ctx, &policy)
            );
        }
    }
}
