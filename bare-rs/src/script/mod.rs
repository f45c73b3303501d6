//! A small line-oriented scripting language.
//!
//! Scripts are parsed once into an immutable [`Script`] and can then be run
//! any number of times, from any thread, each run with its own
//! [`ExecContext`].  The pieces:
//!
//! - [`value`]: dynamically typed runtime values
//! - [`expr`]: expression AST and parser
//! - [`stmt`]: statement AST and the script parser, which flattens `if`,
//!   `while` and `for` into labels and jumps
//! - [`builtins`]: the standard library
//! - [`interp`]: the interpreter and the host-facing execution context
//! - [`lint`]: static analysis
//!
//! # Quick start
//!
//! ```rust
//! use bare::script::{execute_script, parse_script, ExecContext, Value};
//!
//! let script = parse_script("x = 6\nreturn x * 7").unwrap();
//! let mut ctx = ExecContext::new();
//! assert_eq!(execute_script(&script, &mut ctx).unwrap(), Value::Number(42.0));
//! ```

pub mod builtins;
pub mod error;
pub mod expr;
pub mod interp;
pub mod lint;
pub mod stmt;
pub mod value;

// Re-exports for convenience.
pub use error::{CallError, ParseError, RuntimeError, ScriptError};
pub use expr::{parse_expression, Expr};
pub use interp::{
    evaluate_expression, execute_script, run_script, ExecContext, DEFAULT_MAX_CALL_DEPTH, DEFAULT_MAX_STATEMENTS,
};
pub use lint::lint_script;
pub use stmt::{parse_script, parse_script_at, Script, Statement};
pub use value::{Function, Value};
