use thiserror::Error;

use crate::types::AdapterIdentifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Lifecycle errors
    InitFailed,
    AdapterNotConfigured,
    AdapterAlreadyConfigured,
    AdapterNotRegistered,
    ReconfigurationConflict,
    CombinedPartialFailure,

    // Cache errors
    CacheReadError,
    CachePersistError,
    CacheInvalidData,

    // Configuration errors
    ConfigMissingRequired,
    ConfigInvalidArgs,
    ConfigInvalidPollingInterval,
    ConfigInvalidUrl,

    // Transport errors
    NetworkError,
    HttpServerError,
    HttpInvalidResponse,
    ProviderError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InitFailed => "INIT_FAILED",
            ErrorCode::AdapterNotConfigured => "ADAPTER_NOT_CONFIGURED",
            ErrorCode::AdapterAlreadyConfigured => "ADAPTER_ALREADY_CONFIGURED",
            ErrorCode::AdapterNotRegistered => "ADAPTER_NOT_REGISTERED",
            ErrorCode::ReconfigurationConflict => "RECONFIGURATION_CONFLICT",
            ErrorCode::CombinedPartialFailure => "COMBINED_PARTIAL_FAILURE",
            ErrorCode::CacheReadError => "CACHE_READ_ERROR",
            ErrorCode::CachePersistError => "CACHE_PERSIST_ERROR",
            ErrorCode::CacheInvalidData => "CACHE_INVALID_DATA",
            ErrorCode::ConfigMissingRequired => "CONFIG_MISSING_REQUIRED",
            ErrorCode::ConfigInvalidArgs => "CONFIG_INVALID_ARGS",
            ErrorCode::ConfigInvalidPollingInterval => "CONFIG_INVALID_POLLING_INTERVAL",
            ErrorCode::ConfigInvalidUrl => "CONFIG_INVALID_URL",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::HttpServerError => "HTTP_SERVER_ERROR",
            ErrorCode::HttpInvalidResponse => "HTTP_INVALID_RESPONSE",
            ErrorCode::ProviderError => "PROVIDER_ERROR",
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorCode::NetworkError
                | ErrorCode::HttpServerError
                | ErrorCode::ReconfigurationConflict
                | ErrorCode::CacheReadError
                | ErrorCode::CachePersistError
                | ErrorCode::CacheInvalidData
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Error, Debug)]
#[error("[{code}] {message}")]
pub struct FlagBridgeError {
    pub code: ErrorCode,
    pub message: String,
    /// Adapters the error is attributed to. Lists every failing constituent
    /// for `CombinedPartialFailure`.
    pub adapter_ids: Vec<AdapterIdentifier>,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl FlagBridgeError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            adapter_ids: Vec::new(),
            source: None,
        }
    }

    pub fn with_source(
        code: ErrorCode,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            adapter_ids: Vec::new(),
            source: Some(Box::new(source)),
        }
    }

    pub fn for_adapter(mut self, id: &AdapterIdentifier) -> Self {
        self.adapter_ids.push(id.clone());
        self
    }

    pub fn config_error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(code, message)
    }

    pub fn network_error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(code, message)
    }

    pub fn provider_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProviderError, message)
    }

    /// The provider handshake of `id` failed.
    pub fn initialization_failed(id: &AdapterIdentifier, cause: FlagBridgeError) -> Self {
        Self::with_source(
            ErrorCode::InitFailed,
            format!("Adapter '{}' failed to initialize: {}", id, cause.message),
            cause,
        )
        .for_adapter(id)
    }

    pub fn not_configured(id: &AdapterIdentifier, operation: &str) -> Self {
        Self::new(
            ErrorCode::AdapterNotConfigured,
            format!(
                "Adapter '{}' must be configured before calling {}",
                id, operation
            ),
        )
        .for_adapter(id)
    }

    pub fn already_configured(id: &AdapterIdentifier) -> Self {
        Self::new(
            ErrorCode::AdapterAlreadyConfigured,
            format!("Adapter '{}' is already configured. Use reconfigure instead.", id),
        )
        .for_adapter(id)
    }

    pub fn reconfiguration_conflict(id: &AdapterIdentifier) -> Self {
        Self::new(
            ErrorCode::ReconfigurationConflict,
            format!(
                "Adapter '{}' received a configuration call while another was pending; queued behind it",
                id
            ),
        )
        .for_adapter(id)
    }

    pub fn not_registered(id: &AdapterIdentifier) -> Self {
        Self::new(
            ErrorCode::AdapterNotRegistered,
            format!("No configured adapter registered as '{}'", id),
        )
        .for_adapter(id)
    }

    pub fn invalid_args(id: &AdapterIdentifier, received: &str) -> Self {
        Self::new(
            ErrorCode::ConfigInvalidArgs,
            format!("Adapter '{}' cannot be configured with {} arguments", id, received),
        )
        .for_adapter(id)
    }

    pub fn cache_persist(key: &str) -> Self {
        Self::new(
            ErrorCode::CachePersistError,
            format!("Failed to persist flags under '{}'", key),
        )
    }

    /// Aggregates the failures of several adapters into one error.
    pub fn combined_partial_failure(failures: Vec<(AdapterIdentifier, FlagBridgeError)>) -> Self {
        let details = failures
            .iter()
            .map(|(id, error)| format!("{}: {}", id, error))
            .collect::<Vec<_>>()
            .join("; ");

        Self {
            code: ErrorCode::CombinedPartialFailure,
            message: format!("{} adapter(s) failed ({})", failures.len(), details),
            adapter_ids: failures.into_iter().map(|(id, _)| id).collect(),
            source: None,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.code.is_recoverable()
    }

    pub fn is_config_error(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::ConfigMissingRequired
                | ErrorCode::ConfigInvalidArgs
                | ErrorCode::ConfigInvalidPollingInterval
                | ErrorCode::ConfigInvalidUrl
        )
    }

    pub fn is_network_error(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::NetworkError | ErrorCode::HttpServerError | ErrorCode::HttpInvalidResponse
        )
    }
}

pub type Result<T> = std::result::Result<T, FlagBridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_code() {
        let error = FlagBridgeError::not_configured(&AdapterIdentifier::memory(), "update_flags");
        let displayed = format!("{}", error);

        assert!(displayed.starts_with("[ADAPTER_NOT_CONFIGURED]"));
        assert!(displayed.contains("memory"));
        assert_eq!(error.adapter_ids, vec![AdapterIdentifier::memory()]);
    }

    #[test]
    fn test_initialization_failed_keeps_source() {
        let cause = FlagBridgeError::network_error(ErrorCode::NetworkError, "connection refused");
        let error = FlagBridgeError::initialization_failed(&AdapterIdentifier::graphql(), cause);

        assert_eq!(error.code, ErrorCode::InitFailed);
        assert!(error.source.is_some());
        assert!(error.message.contains("connection refused"));
    }

    #[test]
    fn test_combined_partial_failure_lists_ids() {
        let error = FlagBridgeError::combined_partial_failure(vec![
            (
                AdapterIdentifier::launchdarkly(),
                FlagBridgeError::provider_error("boom"),
            ),
            (
                AdapterIdentifier::splitio(),
                FlagBridgeError::provider_error("timeout"),
            ),
        ]);

        assert_eq!(error.code, ErrorCode::CombinedPartialFailure);
        assert_eq!(
            error.adapter_ids,
            vec![AdapterIdentifier::launchdarkly(), AdapterIdentifier::splitio()]
        );
        assert!(error.message.contains("2 adapter(s)"));
    }

    #[test]
    fn test_recoverable_codes() {
        assert!(ErrorCode::NetworkError.is_recoverable());
        assert!(ErrorCode::CachePersistError.is_recoverable());
        assert!(!ErrorCode::AdapterNotConfigured.is_recoverable());
        assert!(!ErrorCode::InitFailed.is_recoverable());
    }
}
