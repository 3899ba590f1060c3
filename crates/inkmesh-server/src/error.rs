use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid value for {key}: {value}")]
    Config { key: &'static str, value: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
