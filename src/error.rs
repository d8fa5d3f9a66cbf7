use thiserror::Error;

/// Pipeline phase in which a batch failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Encode,
    Sample,
    Decode,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Encode => write!(f, "encode"),
            Phase::Sample => write!(f, "sample"),
            Phase::Decode => write!(f, "decode"),
        }
    }
}

#[derive(Error, Debug)]
pub enum VsrError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Out of GPU memory: {0}")]
    OutOfMemory(String),

    #[error("Generation cancelled")]
    Cancelled,

    #[error("{phase} failed: {source}")]
    Phase {
        phase: Phase,
        #[source]
        source: Box<VsrError>,
    },

    #[error("Batch {index}: {phase} failed: {source}")]
    Batch {
        index: usize,
        phase: Phase,
        #[source]
        source: Box<VsrError>,
    },

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VsrError {
    /// Tag an error with the pipeline phase it occurred in.
    /// Already-tagged errors and cancellations pass through unchanged.
    pub fn in_phase(self, phase: Phase) -> Self {
        match self {
            VsrError::Phase { .. } | VsrError::Batch { .. } | VsrError::Cancelled => self,
            other => VsrError::Phase {
                phase,
                source: Box::new(other),
            },
        }
    }

    /// Tag an error with the batch index it occurred in, lifting any
    /// existing phase tag into the batch wrapper.
    pub fn in_batch(self, index: usize, default_phase: Phase) -> Self {
        match self {
            VsrError::Batch { .. } | VsrError::Cancelled => self,
            VsrError::Phase { phase, source } => VsrError::Batch {
                index,
                phase,
                source,
            },
            other => VsrError::Batch {
                index,
                phase: default_phase,
                source: Box::new(other),
            },
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, VsrError::Cancelled)
    }

    pub fn is_out_of_memory(&self) -> bool {
        match self {
            VsrError::OutOfMemory(_) => true,
            VsrError::Phase { source, .. } | VsrError::Batch { source, .. } => {
                source.is_out_of_memory()
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, VsrError>;
