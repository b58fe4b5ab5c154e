use thiserror::Error;

/// Coarse classification used to decide whether a session stays usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Capacity,
    Execution,
    Invariant,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("kind mismatch: {0}")]
    KindMismatch(String),

    #[error("failed to load engine: {0}")]
    EngineLoad(String),

    #[error("unknown binding '{0}'")]
    UnknownBinding(String),

    #[error("shape {shape:?} unsupported for binding '{name}': {reason}")]
    ShapeUnsupported {
        name: String,
        shape: Vec<usize>,
        reason: String,
    },

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("session is poisoned by an earlier execution error; call setup again")]
    SessionPoisoned,
}

impl RuntimeError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) | Self::EngineLoad(_) | Self::UnknownBinding(_) => {
                ErrorCategory::Configuration
            }
            Self::OutOfMemory(_) | Self::ShapeUnsupported { .. } => ErrorCategory::Capacity,
            Self::ExecutionFailed(_) | Self::SessionPoisoned => ErrorCategory::Execution,
            Self::ShapeMismatch { .. } | Self::KindMismatch(_) | Self::Invariant(_) => {
                ErrorCategory::Invariant
            }
        }
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }
}

/// Finds the first `RuntimeError` in an error chain and returns its category.
pub fn error_category(err: &anyhow::Error) -> Option<ErrorCategory> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<RuntimeError>())
        .map(RuntimeError::category)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_strings() {
        assert_eq!(
            RuntimeError::UnknownBinding("logits".into()).to_string(),
            "unknown binding 'logits'"
        );
        let err = RuntimeError::ShapeMismatch {
            expected: vec![2, 3],
            actual: vec![6],
        };
        assert_eq!(
            err.to_string(),
            "shape mismatch: expected [2, 3], got [6]"
        );
        assert!(
            RuntimeError::SessionPoisoned
                .to_string()
                .contains("call setup again")
        );
    }

    #[test]
    fn test_category_mapping() {
        assert_eq!(
            RuntimeError::configuration("x").category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            RuntimeError::OutOfMemory("x".into()).category(),
            ErrorCategory::Capacity
        );
        assert_eq!(
            RuntimeError::ExecutionFailed("x".into()).category(),
            ErrorCategory::Execution
        );
        assert_eq!(
            RuntimeError::invariant("x").category(),
            ErrorCategory::Invariant
        );
    }

    #[test]
    fn test_category_through_anyhow_context() {
        let err = anyhow::Error::new(RuntimeError::ExecutionFailed("kernel".into()))
            .context("generation step 3");
        assert_eq!(error_category(&err), Some(ErrorCategory::Execution));

        let plain = anyhow::anyhow!("not typed");
        assert_eq!(error_category(&plain), None);
    }
}
