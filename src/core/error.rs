use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures raised by the transport link
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// No reader present, or the selected index does not exist
    #[error("Reader error: {0}")]
    Reader(String),

    /// No card in the reader, or waiting for one timed out
    #[error("No card: {0}")]
    NoCard(String),

    /// Connection-layer fault while connecting or transmitting
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<pcsc::Error> for LinkError {
    fn from(err: pcsc::Error) -> Self {
        match err {
            pcsc::Error::NoReadersAvailable
            | pcsc::Error::UnknownReader
            | pcsc::Error::ReaderUnavailable => LinkError::Reader(err.to_string()),
            pcsc::Error::NoSmartcard | pcsc::Error::RemovedCard | pcsc::Error::Timeout => {
                LinkError::NoCard(err.to_string())
            }
            _ => LinkError::Protocol(err.to_string()),
        }
    }
}

/// Conditions that end a script run before its last line
#[derive(Debug, Error)]
pub enum FatalError {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("Failed to read script {}: {source}", path.display())]
    ScriptIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write audit record: {0}")]
    Audit(#[source] io::Error),
}
