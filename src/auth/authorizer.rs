pub const OBJECT_WILDCARD: &str = "*";
pub const PRODUCE_ACTION: &str = "produce";
pub const CONSUME_ACTION: &str = "consume";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("forbidden: subject {subject}, object {object}, action {action}")]
    Forbidden {
        subject: String,
        object: String,
        action: String,
    },
}

impl AuthError {
    pub(crate) fn forbidden(subject: &str, object: &str, action: &str) -> Self {
        AuthError::Forbidden {
            subject: subject.to_string(),
            object: object.to_string(),
            action: action.to_string(),
        }
    }
}

/// Authorizer decides whether `subject` may perform `action` on `object`. The subject is the
/// common name of the client's TLS certificate, or empty for plaintext clients.
pub trait Authorizer: Send + Sync + 'static {
    fn authorize(&self, subject: &str, object: &str, action: &str) -> Result<(), AuthError>;
}

/// Permits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _subject: &str, _object: &str, _action: &str) -> Result<(), AuthError> {
        Ok(())
    }
}
