use gasmon_common::PushError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("push transport error: {0}")]
    Transport(#[from] PushError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend returned {status}: {message}")]
    Backend { status: u16, message: String },
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}
