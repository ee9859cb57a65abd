use std::path::PathBuf;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy for reservoir construction, graph assembly, linking,
/// compilation, and the preset store. All variants are contract violations:
/// nothing here is transient, and nothing is retried.
#[derive(Debug, Error)]
pub enum Error {
    /// Shape disagreement between inputs, `B`, `x_init`, or a readout.
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// A simulation was requested without a readout matrix.
    #[error("missing readout: the reservoir has no W matrix and none was supplied")]
    MissingReadout,

    /// Structural graph violation: wrong degree on a Var/Output node, a
    /// missing edge endpoint, or an illegal node retyping.
    #[error("malformed graph: {0}")]
    MalformedGraph(String),

    /// A channel index on an edge points outside the source or target
    /// reservoir's current shape, or reuses an already-folded channel.
    #[error("bad connection `{src}` -> `{target}`: {detail}")]
    ConnectionIndex {
        src: String,
        target: String,
        detail: String,
    },

    /// An opcode that exists in neither the library nor the function table
    /// once the resolution fixed point has stabilized.
    #[error("unknown opcode `{opcode}` in function `{function}`")]
    UnknownOpcode { opcode: String, function: String },

    /// The entry function never resolved; `blocked` lists every function
    /// still waiting on an unbound opcode.
    #[error("entry `{entry}` never resolved; blocked functions: [{}]", .blocked.join(", "))]
    Compile { entry: String, blocked: Vec<String> },

    /// A named preset slot does not exist on disk.
    #[error("no preset named `{name}` at {}", .path.display())]
    NotFound { name: String, path: PathBuf },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("preset record error: {0}")]
    Persist(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn dims(context: impl Into<String>, expected: usize, got: usize) -> Self {
        Error::DimensionMismatch(format!(
            "{} (expected {expected}, got {got})",
            context.into()
        ))
    }
}
