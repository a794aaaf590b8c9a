use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("store connection error: {0}")]
  Connection(String),

  #[error("subscription closed")]
  SubscriptionClosed,

  #[error("operation against a key holding the wrong kind of value: {0}")]
  WrongType(String),

  #[error("malformed stored value under {key}: {reason}")]
  Malformed { key: String, reason: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;
