// rust/batch-core/src/error.rs

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BatchError {

    #[error("Storage error at '{path}': {message}")]
    Storage {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Dataset '{name}' error: {message}")]
    Dataset {
        name: String,
        message: String,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Checkpoint error: {message}")]
    Checkpoint {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Collective call failed on rank {rank}: {message}")]
    Collective {
        rank: u32,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Checkpoint storage backend '{backend}' is not supported")]
    UnsupportedBackend {
        backend: String,
    },

    #[error("Batch processor failed{}: {message}", batch_suffix(.batch_index))]
    Processor {
        batch_index: Option<u64>,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
    },
}

fn batch_suffix(batch_index: &Option<u64>) -> String {
    match batch_index {
        Some(idx) => format!(" at batch {idx}"),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, BatchError>;

// Convenience constructors
impl BatchError {

    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn dataset(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Dataset {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint {
            message: message.into(),
            source: None,
        }
    }

    pub fn checkpoint_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Checkpoint {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn collective(rank: u32, message: impl Into<String>) -> Self {
        Self::Collective {
            rank,
            message: message.into(),
            source: None,
        }
    }

    pub fn collective_with_source(
        rank: u32,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Collective {
            rank,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn unsupported_backend(backend: impl Into<String>) -> Self {
        Self::UnsupportedBackend {
            backend: backend.into(),
        }
    }

    pub fn processor(message: impl Into<String>) -> Self {
        Self::Processor {
            batch_index: None,
            message: message.into(),
            source: None,
        }
    }

    pub fn processor_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Processor {
            batch_index: None,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Tags a processor error with the batch it failed on. Other variants
    /// pass through untouched.
    pub fn at_batch(self, index: u64) -> Self {
        match self {
            Self::Processor {
                batch_index: None,
                message,
                source,
            } => Self::Processor {
                batch_index: Some(index),
                message,
                source,
            },
            other => other,
        }
    }

    /// Returns true for errors raised while validating configuration.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }
}
