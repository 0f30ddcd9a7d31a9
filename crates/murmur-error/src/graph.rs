#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Unknown recommendation algorithm: {name}")]
    UnknownAlgorithm { name: String },

    #[error("Recommendation worker failed: {message}")]
    WorkerFailed { message: String },
}

impl GraphError {
    /// Get the error code for this error
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownAlgorithm { .. } => "graph_unknown_algorithm",
            Self::WorkerFailed { .. } => "graph_worker_failed",
        }
    }
}
