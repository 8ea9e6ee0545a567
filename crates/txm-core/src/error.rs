use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum IdentityError {
    #[error("idempotency key cannot be empty")]
    EmptyKey,

    #[error("operation name cannot be empty")]
    EmptyOperation,

    #[error("'{0}' contains ':', which separates lock key segments")]
    Separator(String),
}
