use thiserror::Error as TError;

#[derive(Debug, TError)]
pub enum Error {
    /// Engine refused the request
    #[error("FPB error: {0}")]
    Fpb(#[from] fpb_inject::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Any other error
    #[error("{0}")]
    Custom(#[from] Box<dyn std::error::Error>),
}
