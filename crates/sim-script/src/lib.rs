//! Behavior scripting for simlab guest code.
//!
//! Two execution vehicles share one language: `.script` sources are compiled
//! at load and evaluated in a fresh scope per call, while `.interp` sources
//! run inside the [`Interpreter`] runtime with a namespace per file and a
//! state cache flushed after each call.

pub mod ast;
pub mod error;
pub mod eval;
pub mod interp;
pub mod lexer;
pub mod parser;

pub use error::{line_col, ScriptError};
pub use eval::{CompiledScript, HostContext, HostState};
pub use interp::{CallKind, Interpreter};
