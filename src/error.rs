use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Provider error: {0}")]
    Provider(#[from] crate::provider::Error),

    #[error("History error: {0}")]
    History(#[from] crate::session::HistoryError),

    #[error(transparent)]
    Turn(#[from] crate::session::TurnError),

    #[error("Secret store error: {0}")]
    Secrets(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Session error: {0}")]
    Session(String),
}

impl Error {
    pub(crate) fn secrets(err: &anyhow::Error) -> Self {
        Self::Secrets(format!("{err:#}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
