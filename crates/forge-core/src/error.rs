//! Error taxonomy for the forge.
//!
//! Every category is user-actionable: [`ForgeError::suggestions`] returns
//! concrete remedies, [`ForgeError::is_retryable`] drives the retry policy,
//! and aggregate errors carry the retry statistics of the failed operation.

use crate::tracking::RetryReport;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the forge crates.
pub type ForgeResult<T> = Result<T, ForgeError>;

/// Typed error raised by the orchestration layer.
#[derive(Debug, Error)]
pub enum ForgeError {
    /// The backend returned a response with no usable content.
    #[error("provider '{provider}' returned an empty response")]
    EmptyResponse {
        /// Provider that produced the empty response.
        provider: String,
    },

    /// No structured records could be recovered from the response text.
    #[error("response could not be parsed as test records: {message}")]
    InvalidFormat {
        /// What failed to parse.
        message: String,
        /// Bounded prefix of the offending text, for diagnostics.
        excerpt: Option<String>,
        /// Path to a persisted dump of the full raw response, if one was written.
        dump_path: Option<PathBuf>,
    },

    /// An operation exceeded its time budget.
    #[error("operation timed out after {duration:?}")]
    Timeout {
        /// The budget that was exceeded.
        duration: Duration,
    },

    /// The backend rejected the credential.
    #[error("authentication failed for provider '{provider}': {message}")]
    AuthFailed {
        /// Provider that rejected the credential.
        provider: String,
        /// Backend-supplied detail.
        message: String,
    },

    /// The account has exhausted its quota or balance.
    #[error("quota exceeded for provider '{provider}': {message}")]
    QuotaExceeded {
        /// Provider reporting the exhausted quota.
        provider: String,
        /// Backend-supplied detail.
        message: String,
    },

    /// The backend is rate limiting requests.
    #[error("provider '{provider}' is rate limiting requests")]
    RateLimit {
        /// Provider applying the limit.
        provider: String,
        /// Server-suggested (or locally computed) wait before retrying.
        retry_after: Option<Duration>,
    },

    /// Any other provider-reported failure.
    #[error("provider '{provider}' error: {message}")]
    Provider {
        /// Provider that failed.
        provider: String,
        /// Backend-supplied detail.
        message: String,
        /// HTTP status, when the failure maps to one.
        status_code: Option<u16>,
        /// Whether retrying the same provider may help.
        retryable: bool,
    },

    /// A provider or strategy was configured incorrectly.
    #[error("configuration error: {message}")]
    Configuration {
        /// What is wrong with the configuration.
        message: String,
    },

    /// A provider name was requested that the registry does not know.
    #[error("provider '{name}' is not registered (registered: {})", .registered.join(", "))]
    ProviderNotFound {
        /// The unknown name.
        name: String,
        /// Names the registry currently knows.
        registered: Vec<String>,
    },

    /// A streaming response failed mid-flight.
    #[error("streaming error: {message}")]
    Streaming {
        /// What broke the stream.
        message: String,
    },

    /// Every provider in a fallback chain failed for one endpoint.
    #[error("all providers failed ({}); last error: {last_error}", .providers.join(", "))]
    AllProvidersFailed {
        /// Every provider tried, in order.
        providers: Vec<String>,
        /// The final underlying error.
        last_error: Box<ForgeError>,
        /// Retry statistics for the whole operation.
        retry: Option<RetryReport>,
    },

    /// Invariant violation inside the forge itself.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the violated invariant.
        message: String,
    },
}

impl ForgeError {
    /// The backend returned nothing usable.
    #[must_use]
    pub fn empty_response(provider: impl Into<String>) -> Self {
        Self::EmptyResponse {
            provider: provider.into(),
        }
    }

    /// No records could be recovered; `excerpt` is truncated for display.
    #[must_use]
    pub fn invalid_format(message: impl Into<String>, excerpt: Option<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
            excerpt,
            dump_path: None,
        }
    }

    /// Time budget exceeded.
    #[must_use]
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Credential rejected.
    #[must_use]
    pub fn auth_failed(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AuthFailed {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Quota or balance exhausted.
    #[must_use]
    pub fn quota_exceeded(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::QuotaExceeded {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Backend rate limit hit.
    #[must_use]
    pub fn rate_limit(provider: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::RateLimit {
            provider: provider.into(),
            retry_after,
        }
    }

    /// Generic provider failure.
    #[must_use]
    pub fn provider(
        provider: impl Into<String>,
        message: impl Into<String>,
        status_code: Option<u16>,
        retryable: bool,
    ) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            status_code,
            retryable,
        }
    }

    /// Bad configuration.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Broken stream.
    #[must_use]
    pub fn streaming(message: impl Into<String>) -> Self {
        Self::Streaming {
            message: message.into(),
        }
    }

    /// Internal invariant violation.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Attach a persisted raw-response dump path to a recovery failure.
    ///
    /// No-op for other categories.
    #[must_use]
    pub fn with_dump_path(mut self, path: PathBuf) -> Self {
        if let Self::InvalidFormat { dump_path, .. } = &mut self {
            *dump_path = Some(path);
        }
        self
    }

    /// Whether retrying the *same* provider may succeed.
    ///
    /// Authentication and quota failures are never retryable: repeating the
    /// call cannot fix a bad key or an empty balance.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::RateLimit { .. } | Self::Streaming { .. } => true,
            Self::Provider { retryable, .. } => *retryable,
            Self::EmptyResponse { .. } | Self::InvalidFormat { .. } => true,
            Self::AuthFailed { .. }
            | Self::QuotaExceeded { .. }
            | Self::Configuration { .. }
            | Self::ProviderNotFound { .. }
            | Self::AllProvidersFailed { .. }
            | Self::Internal { .. } => false,
        }
    }

    /// Server-suggested wait before retrying, when the error carries one.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Actionable remedies for the error category.
    #[must_use]
    pub fn suggestions(&self) -> &'static [&'static str] {
        match self {
            Self::EmptyResponse { .. } => &[
                "retry the request; some backends intermittently return empty bodies",
                "reduce the requested test-case count so the response fits the output window",
                "check whether the backend truncates long completions",
            ],
            Self::InvalidFormat { .. } => &[
                "inspect the raw-response dump referenced by this error",
                "lower the temperature so the model emits stricter JSON",
                "enable the backend's JSON output mode if it has one",
            ],
            Self::Timeout { .. } => &[
                "increase the per-provider timeout",
                "reduce max_tokens or the requested test-case count",
                "check backend status for elevated latency",
            ],
            Self::AuthFailed { .. } => &[
                "verify the API key for this provider",
                "check that the key has access to the configured model",
            ],
            Self::QuotaExceeded { .. } => &[
                "top up the account balance or raise the quota",
                "route this provider's share of endpoints to a fallback provider",
            ],
            Self::RateLimit { .. } => &[
                "lower the provider's max_concurrency",
                "configure a rate_limit to pace request starts",
                "spread the batch across more providers",
            ],
            Self::Provider { .. } | Self::Streaming { .. } => &[
                "check the provider's status page",
                "verify the base URL and model name",
            ],
            Self::Configuration { .. } => &[
                "review the provider configuration handed to the engine",
            ],
            Self::ProviderNotFound { .. } => &[
                "register the provider or fix the name in the assignment strategy",
                "the error message lists the names the registry knows",
            ],
            Self::AllProvidersFailed { .. } => &[
                "inspect the last underlying error and the retry report",
                "add more providers to the fallback chain",
            ],
            Self::Internal { .. } => &["this is a bug in the forge; please report it"],
        }
    }

    /// Stable lowercase category name used in logs.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::EmptyResponse { .. } => "empty_response",
            Self::InvalidFormat { .. } => "invalid_format",
            Self::Timeout { .. } => "timeout",
            Self::AuthFailed { .. } => "auth_failed",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::RateLimit { .. } => "rate_limit",
            Self::Provider { .. } => "provider",
            Self::Configuration { .. } => "configuration",
            Self::ProviderNotFound { .. } => "provider_not_found",
            Self::Streaming { .. } => "streaming",
            Self::AllProvidersFailed { .. } => "all_providers_failed",
            Self::Internal { .. } => "internal",
        }
    }
}
