use crate::budget::BudgetViolation;
use crate::mailbox::MailboxError;
use crate::subject::SubjectError;

/// Errors surfaced synchronously by [`crate::Relay`] operations.
///
/// Per-target rejections and adapter failures are not errors; they are
/// reported on [`super::PublishResult`].
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid subject '{subject}': {source}")]
    InvalidSubject {
        subject: String,
        #[source]
        source: SubjectError,
    },
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("access denied: {source_namespace} may not publish to {target_namespace}")]
    AccessDenied {
        source_namespace: String,
        target_namespace: String,
    },
    #[error(transparent)]
    BudgetExceeded(#[from] BudgetViolation),
    #[error("endpoint not found: {0}")]
    EndpointNotFound(String),
    #[error("message not found: {0}")]
    MessageNotFound(String),
    #[error("adapter '{0}' is already registered")]
    DuplicateAdapter(String),
    #[error("relay is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Adapter(crate::adapters::AdapterError),
    #[error(transparent)]
    Mailbox(MailboxError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl RelayError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidSubject { .. } => "INVALID_SUBJECT",
            Self::InvalidPayload(_) => "INVALID_PAYLOAD",
            Self::AccessDenied { .. } => "ACCESS_DENIED",
            Self::BudgetExceeded(_) => "BUDGET_EXCEEDED",
            Self::EndpointNotFound(_) => "ENDPOINT_NOT_FOUND",
            Self::MessageNotFound(_) => "MESSAGE_NOT_FOUND",
            Self::DuplicateAdapter(_) => "DUPLICATE_ADAPTER",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::Adapter(_) => "INVALID_ADAPTER",
            Self::Mailbox(_) | Self::Storage(_) => "STORAGE_ERROR",
        }
    }

    pub(crate) fn subject(subject: &str, source: SubjectError) -> Self {
        Self::InvalidSubject {
            subject: subject.to_string(),
            source,
        }
    }
}

impl From<MailboxError> for RelayError {
    fn from(err: MailboxError) -> Self {
        match err {
            MailboxError::EndpointNotFound(hash) => Self::EndpointNotFound(hash),
            MailboxError::MessageNotFound { id, .. } => Self::MessageNotFound(id),
            other => Self::Mailbox(other),
        }
    }
}

impl From<crate::adapters::AdapterError> for RelayError {
    fn from(err: crate::adapters::AdapterError) -> Self {
        match err {
            crate::adapters::AdapterError::Duplicate(id) => Self::DuplicateAdapter(id),
            other => Self::Adapter(other),
        }
    }
}

pub type RelayResult<T> = std::result::Result<T, RelayError>;
