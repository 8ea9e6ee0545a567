use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LockError {
    #[error("lock key cannot be empty")]
    EmptyKey,

    #[error("lock ttl must be greater than zero")]
    ZeroTtl,

    #[error("lock store connection failed")]
    Connection(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl LockError {
    pub fn connection(
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        Self::Connection(source.into())
    }
}
