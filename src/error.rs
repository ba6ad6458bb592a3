use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("{provider} request failed{}: {message}", status_suffix(.status))]
    Transport {
        provider: &'static str,
        status: Option<u16>,
        message: String,
    },

    #[error("storage error while {context}: {source}")]
    Persistence {
        context: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("forecast unavailable: {0}")]
    Forecast(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Keyring(#[from] keyring::Error),

    #[error(transparent)]
    TomlDe(#[from] toml::de::Error),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),
}

fn status_suffix(status: &Option<u16>) -> String {
    status
        .map(|s| format!(" with HTTP status {s}"))
        .unwrap_or_default()
}

impl AppError {
    pub fn is_transport(&self) -> bool {
        matches!(self, AppError::Transport { .. } | AppError::Http(_))
    }
}

/// Attaches the failing store operation to a rusqlite error.
pub trait PersistenceContext<T> {
    fn persist_ctx(self, context: &'static str) -> Result<T, AppError>;
}

impl<T> PersistenceContext<T> for Result<T, rusqlite::Error> {
    fn persist_ctx(self, context: &'static str) -> Result<T, AppError> {
        self.map_err(|source| AppError::Persistence { context, source })
    }
}
