use thiserror::Error;

/// Reason a transaction was aborted. Conflicts surface as values rather than
/// unwinding; every abort path undoes writes and deregisters reads before the
/// reason reaches the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// A version install was refused because another transaction owns or
    /// already superseded the head.
    WriteWriteConflict,
    /// The serial-safety-net exclusion window closed: `sstamp <= pstamp`.
    SsnExclusionFailure,
    /// A concurrent change invalidated a stable-read attempt on a tuple.
    UnstableRead,
    /// The log refused a commit reservation (full or shutting down).
    Internal,
}

impl AbortReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AbortReason::WriteWriteConflict => "write_write_conflict",
            AbortReason::SsnExclusionFailure => "ssn_exclusion_failure",
            AbortReason::UnstableRead => "unstable_read",
            AbortReason::Internal => "internal",
        }
    }

    /// Whether re-running the transaction from the top is a sensible response.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            AbortReason::WriteWriteConflict
                | AbortReason::SsnExclusionFailure
                | AbortReason::UnstableRead
        )
    }
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Io,
    Encode,
    Decode,
    Validation,
    InvalidConfig,
    Unsupported,
    Corruption,
    Unavailable,
    Abort,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Io => "io",
            ErrorCode::Encode => "encode",
            ErrorCode::Decode => "decode",
            ErrorCode::Validation => "validation",
            ErrorCode::InvalidConfig => "invalid_config",
            ErrorCode::Unsupported => "unsupported",
            ErrorCode::Corruption => "corruption",
            ErrorCode::Unavailable => "unavailable",
            ErrorCode::Abort => "abort",
        }
    }
}

#[derive(Debug, Error)]
pub enum MvoltError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("corruption: {0}")]
    Corruption(String),
    #[error("resource unavailable: {message}")]
    Unavailable { message: String },
    #[error("transaction aborted: {0}")]
    Abort(AbortReason),
}

impl MvoltError {
    pub fn code(&self) -> ErrorCode {
        match self {
            MvoltError::Io(_) => ErrorCode::Io,
            MvoltError::Encode(_) => ErrorCode::Encode,
            MvoltError::Decode(_) => ErrorCode::Decode,
            MvoltError::Validation(_) => ErrorCode::Validation,
            MvoltError::InvalidConfig { .. } => ErrorCode::InvalidConfig,
            MvoltError::Unsupported(_) => ErrorCode::Unsupported,
            MvoltError::Corruption(_) => ErrorCode::Corruption,
            MvoltError::Unavailable { .. } => ErrorCode::Unavailable,
            MvoltError::Abort(_) => ErrorCode::Abort,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// The abort reason, when this error is a transaction abort.
    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            MvoltError::Abort(reason) => Some(*reason),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AbortReason, ErrorCode, MvoltError};

    #[test]
    fn error_code_strings_are_stable() {
        assert_eq!(ErrorCode::InvalidConfig.as_str(), "invalid_config");
        assert_eq!(ErrorCode::Abort.as_str(), "abort");
        assert_eq!(
            AbortReason::SsnExclusionFailure.as_str(),
            "ssn_exclusion_failure"
        );
    }

    #[test]
    fn abort_reasons_map_through_the_error_type() {
        let err = MvoltError::Abort(AbortReason::WriteWriteConflict);
        assert_eq!(err.code(), ErrorCode::Abort);
        assert_eq!(err.abort_reason(), Some(AbortReason::WriteWriteConflict));
        assert!(AbortReason::WriteWriteConflict.is_retryable());
        assert!(!AbortReason::Internal.is_retryable());
    }
}
