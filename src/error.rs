use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid instance address '{0}': expected host:port")]
    InvalidAddress(String),

    #[error("invalid port in instance address '{0}'")]
    InvalidPort(String),
}

pub type Result<T> = std::result::Result<T, Error>;
