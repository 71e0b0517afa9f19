use crate::mapping::MapError;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("mapping error: {0}")]
    Map(#[from] MapError),
}

pub type Result<T> = std::result::Result<T, Error>;
