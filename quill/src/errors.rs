/// Error types shared across the compiler, VM and natives.
///
/// Two non-resumable error domains:
///   • Compile errors are reported to stderr as they are found, with
///     panic-mode suppression; `interpret` only learns that some occurred.
///   • Runtime errors carry the message plus the call-frame trace captured
///     at the point of failure, and are fatal to the interpretation.

use std::fmt;

use thiserror::Error;

/// One frame of a runtime error trace, innermost first.
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub line: u32,
    /// Function name, or None for top-level script code.
    pub function: Option<String>,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.function {
            Some(name) => write!(f, "[line {}] in {}()", self.line, name),
            None => write!(f, "[line {}] in script", self.line),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl RuntimeError {
    /// Render the message and unwound trace the way the driver prints them.
    pub fn report(&self) -> String {
        let mut out = self.message.clone();
        for frame in &self.trace {
            out.push('\n');
            out.push_str(&frame.to_string());
        }
        out
    }
}

/// Error raised by a native function; the VM attaches the frame trace.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct NativeError(pub String);

impl NativeError {
    pub fn new(message: impl Into<String>) -> Self {
        NativeError(message.into())
    }
}

/// Outcome of `Vm::interpret`.
#[derive(Debug, Error)]
pub enum InterpretError {
    #[error("compile error")]
    Compile,
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}
