/// Errors raised while parsing or applying state-tree ops.
///
/// The `Display` text is what producers see after `error: `.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MachineError {
    // Syntax
    #[error("bad command: {0}")]
    BadCommand(String),
    #[error("{op} - bad syntax: {line}")]
    Syntax { op: char, line: String },
    #[error("bad path: {0}")]
    BadPath(String),
    #[error("E command must be standalone")]
    EmptyNotAlone,

    // Structure
    #[error("no such path: {0}")]
    NoSuchPath(String),
    #[error("not a variable state: {0}")]
    NotVariableParent(String),
    #[error("no such child state: {child} (under {path})")]
    NoSuchChild { path: String, child: String },
    #[error("path is not a leaf: {0}")]
    NotLeaf(String),
    #[error("{0} is not allowed on the root")]
    RootNotAllowed(char),
    #[error("parent has data - cannot add child: {0}")]
    ParentHasData(String),
    #[error("concurrent parent cannot add variable child: {0}")]
    ConcurrentParentVariableChild(String),
    #[error("variable parent cannot add concurrent child: {0}")]
    VariableParentConcurrentChild(String),

    // Listeners
    #[error("no such block listener")]
    NoSuchListener,
}

impl MachineError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::BadCommand(_)
            | Self::Syntax { .. }
            | Self::BadPath(_)
            | Self::EmptyNotAlone => "syntax",
            Self::NoSuchPath(_) | Self::NoSuchChild { .. } => "unknown_path",
            Self::NotVariableParent(_)
            | Self::NotLeaf(_)
            | Self::RootNotAllowed(_)
            | Self::ParentHasData(_)
            | Self::ConcurrentParentVariableChild(_)
            | Self::VariableParentConcurrentChild(_) => "structure",
            Self::NoSuchListener => "listener",
        }
    }
}
