/// Error returned by every `Provider` call.
///
/// `retryable` tells the dispatchers whether trying the same call again can succeed
/// (a busy database, a dropped connection) or not (an unknown lock token, a work item
/// that was cancelled underneath a worker, corrupt rows).
///
/// ```rust,no_run
/// use duralane::providers::ProviderError;
///
/// # fn busy() -> Result<(), ProviderError> {
/// Err(ProviderError::retryable("ack_orchestration_item", "database is locked"))
/// # }
/// # fn lost() -> Result<(), ProviderError> {
/// Err(ProviderError::permanent("ack_work_item", "lock token not found"))
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    pub operation: String,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    /// Transient failure; the caller backs off and tries again.
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Failure that repeating the call cannot fix.
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn to_infrastructure_error(&self) -> crate::ErrorDetails {
        crate::ErrorDetails::Infrastructure {
            operation: self.operation.clone(),
            message: self.message.clone(),
            retryable: self.retryable,
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for ProviderError {}

/// Untyped errors are assumed transient.
impl From<String> for ProviderError {
    fn from(message: String) -> Self {
        Self::retryable("unknown", message)
    }
}

impl From<&str> for ProviderError {
    fn from(message: &str) -> Self {
        Self::retryable("unknown", message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_and_display() {
        let busy = ProviderError::retryable("fetch_work_item", "database is locked");
        assert!(busy.is_retryable());
        let lost = ProviderError::permanent("ack_work_item", "lock token not found");
        assert!(!lost.is_retryable());
        assert_eq!(lost.to_string(), "ack_work_item: lock token not found");
        assert_ne!(busy, ProviderError::permanent("fetch_work_item", "database is locked"));
    }

    #[test]
    fn strings_convert_to_retryable_errors() {
        let e: ProviderError = "pool timed out".into();
        assert!(e.is_retryable());
        assert_eq!(e.operation, "unknown");
    }

    #[test]
    fn maps_to_infrastructure_details() {
        let details = ProviderError::permanent("read", "corrupt history row").to_infrastructure_error();
        assert_eq!(details.category(), "infrastructure");
        assert!(!details.is_retryable());
        assert_eq!(details.display_message(), "infrastructure:read: corrupt history row");
    }
}
