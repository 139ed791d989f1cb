use thiserror::Error;

use crate::app::Unavailable;
use crate::batch::BatchError;
use crate::form::FormError;
use crate::service::ServiceError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Msg(String),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error(transparent)]
    Form(#[from] FormError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Unavailable(#[from] Unavailable),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::Msg(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
