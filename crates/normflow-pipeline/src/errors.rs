use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("usage error: {0}")]
    Usage(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("template error: {0}")]
    Template(String),
    #[error("output collision: {0}")]
    Collision(String),
    #[error("missing input: {0}")]
    MissingInput(String),
    #[error("{stage} failed for {unit} (exit code {exit_code:?}): {stderr_tail}")]
    ToolFailed {
        unit: String,
        stage: String,
        exit_code: Option<i32>,
        stderr_tail: String,
    },
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Errors raised while building the run, before any unit is dispatched.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Usage(_) | Self::InvalidConfig(_) | Self::Template(_) | Self::Collision(_)
        )
    }
}
