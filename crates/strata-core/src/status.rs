use std::fmt;

/// Broad failure categories surfaced by the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    #[error("i/o error")]
    Io,
    #[error("not found")]
    NotFound,
    #[error("malformed record")]
    Malformed,
    #[error("cancelled")]
    Cancelled,
}

/// Error with a push-style causal trail.
///
/// Each layer that re-reports a failure appends one frame; `Display`
/// prints the innermost cause first so the original failure is never
/// buried by the layers above it.
#[derive(Clone, Debug)]
pub struct Status {
    kind: ErrorKind,
    trail: Vec<String>,
}

impl Status {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            trail: vec![msg.into()],
        }
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, msg)
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Malformed, msg)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "operation cancelled")
    }

    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    /// Append a frame describing the layer currently re-reporting this error.
    pub fn push(mut self, msg: impl Into<String>) -> Self {
        self.trail.push(msg.into());
        self
    }

    /// The original (innermost) message.
    pub fn root_cause(&self) -> &str {
        self.trail.first().map(String::as_str).unwrap_or("")
    }

    /// Frames from innermost to outermost.
    pub fn frames(&self) -> &[String] {
        &self.trail
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for frame in &self.trail {
            write!(f, ": {frame}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Status {}

impl From<std::io::Error> for Status {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            _ => ErrorKind::Io,
        };
        Status::new(kind, err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Status>;

/// Adds a trail frame to an error as it propagates upward.
pub trait StatusExt<T> {
    fn push_ctx(self, f: impl FnOnce() -> String) -> Result<T>;
}

impl<T> StatusExt<T> for Result<T> {
    fn push_ctx(self, f: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|e| e.push(f()))
    }
}

impl<T> StatusExt<T> for std::result::Result<T, std::io::Error> {
    fn push_ctx(self, f: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|e| Status::from(e).push(f()))
    }
}
