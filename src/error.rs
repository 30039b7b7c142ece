use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or malformed fields in an input artifact or database row.
    #[error("malformed graph data: {0}")]
    DataFormat(String),

    /// The live source could not be reached, or a query against it failed.
    #[error("database {context} failed: {source}")]
    Connection {
        context: &'static str,
        #[source]
        source: sqlx::Error,
    },

    /// Edge filtering left nothing to propagate messages over.
    #[error("no valid edges remain among {node_count} nodes ({dropped} dropped)")]
    GraphIntegrity { node_count: usize, dropped: usize },

    #[error("training diverged at epoch {epoch}: loss = {loss}")]
    TrainingDiverged { epoch: usize, loss: f32 },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start async runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

impl Error {
    pub(crate) fn data_format(msg: impl Into<String>) -> Self {
        Self::DataFormat(msg.into())
    }
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
