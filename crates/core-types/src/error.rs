use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Unknown exchange code: {0}")]
    UnknownExchange(String),
}
