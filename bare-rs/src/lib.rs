//! Parser, interpreter and standard library for a line-oriented scripting
//! language with labels and jumps.
//!
//! Everything lives under [`script`]; the most used items are re-exported
//! here.

pub mod script;

pub use script::{
    evaluate_expression, execute_script, lint_script, parse_expression, parse_script, run_script, ExecContext,
    ParseError, RuntimeError, Script, ScriptError, Value,
};
