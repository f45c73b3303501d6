//! Parse and runtime error types.

use thiserror::Error;

/// Lines longer than this are clipped around the error column when rendered.
const LINE_LENGTH_MAX: isize = 120;
const LINE_SUFFIX: &str = " ...";
const LINE_PREFIX: &str = "... ";

/// A syntax or structure error from the expression or script parser.
///
/// Renders as:
///
/// ```text
/// Included from "lib.bare"          (optional prefix line)
/// Syntax error, line number 3:
/// a = 1 + foo bar
///            ^
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", self.render())]
pub struct ParseError {
    pub error: String,
    pub line: String,
    /// 1-based, counted in characters.
    pub column_number: usize,
    pub line_number: Option<usize>,
    pub prefix: Option<String>,
}

impl ParseError {
    pub fn new(error: impl Into<String>, line: impl Into<String>, column_number: usize) -> Self {
        ParseError {
            error: error.into(),
            line: line.into(),
            column_number,
            line_number: None,
            prefix: None,
        }
    }

    pub fn with_line_number(mut self, line_number: usize) -> Self {
        self.line_number = Some(line_number);
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    fn render(&self) -> String {
        let chars: Vec<char> = self.line.chars().collect();
        let len = chars.len() as isize;
        let mut column = self.column_number as isize;

        let line_error: String = if len > LINE_LENGTH_MAX {
            let left = column - 1 - LINE_LENGTH_MAX / 2;
            let right = left + LINE_LENGTH_MAX;
            if left < 0 {
                let head: String = chars[..LINE_LENGTH_MAX as usize].iter().collect();
                format!("{head}{LINE_SUFFIX}")
            } else if right > len {
                let tail: String = chars[(len - LINE_LENGTH_MAX) as usize..].iter().collect();
                column -= left - 4 - (right - len);
                format!("{LINE_PREFIX}{tail}")
            } else {
                let mid: String = chars[left as usize..right as usize].iter().collect();
                column -= left - 4;
                format!("{LINE_PREFIX}{mid}{LINE_SUFFIX}")
            }
        } else {
            self.line.clone()
        };

        let mut out = String::new();
        if let Some(prefix) = &self.prefix {
            out.push_str(prefix);
            out.push('\n');
        }
        out.push_str(&self.error);
        if let Some(n) = self.line_number {
            out.push_str(&format!(", line number {n}"));
        }
        out.push_str(":\n");
        out.push_str(&line_error);
        out.push('\n');
        out.push_str(&" ".repeat((column - 1).max(0) as usize));
        out.push('^');
        out
    }
}

/// An error that aborts script execution.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    #[error("Unknown jump label \"{0}\"")]
    UnknownLabel(String),
    #[error("Exceeded maximum script statements ({0})")]
    MaxStatements(i64),
    #[error("Include of \"{0}\" failed")]
    IncludeFailed(String),
    #[error("{0}")]
    IncludeParse(ParseError),
    #[error("Undefined function \"{0}\"")]
    UndefinedFunction(String),
}

/// The result of a failed function call.
///
/// Runtime errors propagate and abort the script.  Faults are caught at the
/// call site and the call evaluates to null.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("{0}")]
    Fault(String),
}

impl CallError {
    pub fn fault(msg: impl Into<String>) -> Self {
        CallError::Fault(msg.into())
    }
}

/// Either kind of top-level failure, for callers that parse and run in one
/// step.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScriptError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_short_line() {
        let err = ParseError::new("Syntax error", "a = 1 + foo bar", 12).with_line_number(1);
        assert_eq!(err.to_string(), "Syntax error, line number 1:\na = 1 + foo bar\n           ^");
    }

    #[test]
    fn render_without_line_number_with_prefix() {
        let err = ParseError::new("Syntax error", "@", 1).with_prefix("Included from \"x.bare\"");
        assert_eq!(err.to_string(), "Included from \"x.bare\"\nSyntax error:\n@\n^");
    }

    #[test]
    fn render_long_line_left() {
        let line = "a".repeat(200);
        let err = ParseError::new("Syntax error", line, 10);
        let expected = format!("Syntax error:\n{} ...\n{}^", "a".repeat(120), " ".repeat(9));
        assert_eq!(err.to_string(), expected);
    }

    #[test]
    fn render_long_line_right() {
        let line = format!("{}b", "a".repeat(199));
        let err = ParseError::new("Syntax error", line, 200);
        // left = 139, right = 259, shown tail starts at 80; column = 200 - 80 + 4
        let expected = format!("Syntax error:\n... {}b\n{}^", "a".repeat(119), " ".repeat(123));
        assert_eq!(err.to_string(), expected);
    }

    #[test]
    fn render_long_line_middle() {
        let line: String = (0..300).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let err = ParseError::new("Syntax error", line.clone(), 151);
        // left = 90; column = 151 - 86 = 65
        let mid: String = line.chars().skip(90).take(120).collect();
        let expected = format!("Syntax error:\n... {mid} ...\n{}^", " ".repeat(64));
        assert_eq!(err.to_string(), expected);
    }

    #[test]
    fn runtime_messages() {
        assert_eq!(RuntimeError::UnknownLabel("x".into()).to_string(), "Unknown jump label \"x\"");
        assert_eq!(RuntimeError::MaxStatements(3).to_string(), "Exceeded maximum script statements (3)");
        assert_eq!(RuntimeError::IncludeFailed("a.bare".into()).to_string(), "Include of \"a.bare\" failed");
        assert_eq!(RuntimeError::UndefinedFunction("f".into()).to_string(), "Undefined function \"f\"");
    }
}
