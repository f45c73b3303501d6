//! Expression AST and parser.
//!
//! The parser reads strictly left to right, one unary operand and one binary
//! operator at a time.  Precedence is applied by re-association: when a new
//! operator binds tighter than the operator at the root of the tree built so
//! far, the new node is pushed down the right spine of that tree.
//!
//! Operator precedence (tightest → loosest):
//!   `**`  →  `* / %`  →  `+ -`  →  `<= < >= >`  →  `== !=`  →  `&&`  →  `||`

use std::fmt;

use super::error::ParseError;
use super::value::number_string;

// ── AST ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Pow,
    Mul,
    Div,
    Mod,
    Add,
    Sub,
    Le,
    Lt,
    Ge,
    Gt,
    Eq,
    Ne,
    And,
    Or,
}

impl BinaryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            BinaryOp::Pow => "**",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Le => "<=",
            BinaryOp::Lt => "<",
            BinaryOp::Ge => ">=",
            BinaryOp::Gt => ">",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }

    /// 0 binds tightest.
    fn level(self) -> u8 {
        match self {
            BinaryOp::Pow => 0,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => 1,
            BinaryOp::Add | BinaryOp::Sub => 2,
            BinaryOp::Le | BinaryOp::Lt | BinaryOp::Ge | BinaryOp::Gt => 3,
            BinaryOp::Eq | BinaryOp::Ne => 4,
            BinaryOp::And => 5,
            BinaryOp::Or => 6,
        }
    }

    fn binds_looser_than(self, other: BinaryOp) -> bool {
        self.level() > other.level()
    }
}

// Longest spellings first so `**` wins over `*` and `<=` over `<`.
const BINARY_OPS: &[(&str, BinaryOp)] = &[
    ("**", BinaryOp::Pow),
    ("*", BinaryOp::Mul),
    ("/", BinaryOp::Div),
    ("%", BinaryOp::Mod),
    ("+", BinaryOp::Add),
    ("-", BinaryOp::Sub),
    ("<=", BinaryOp::Le),
    ("<", BinaryOp::Lt),
    (">=", BinaryOp::Ge),
    (">", BinaryOp::Gt),
    ("==", BinaryOp::Eq),
    ("!=", BinaryOp::Ne),
    ("&&", BinaryOp::And),
    ("||", BinaryOp::Or),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

impl UnaryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            UnaryOp::Not => "!",
            UnaryOp::Neg => "-",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Str(String),
    Variable(String),
    Function { name: String, args: Vec<Expr> },
    Binary { op: BinaryOp, left: Box<Expr>, right: Box<Expr> },
    Unary { op: UnaryOp, expr: Box<Expr> },
    /// Parenthesized sub-expression.  Evaluates exactly like its child.
    Group(Box<Expr>),
}

impl Expr {
    pub fn variable(name: impl Into<String>) -> Expr {
        Expr::Variable(name.into())
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::Function { name: name.into(), args }
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary { op, left: Box::new(left), right: Box::new(right) }
    }

    pub fn unary(op: UnaryOp, expr: Expr) -> Expr {
        Expr::Unary { op, expr: Box::new(expr) }
    }
}

/// Renders source text that parses back to the same tree.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(x) => f.write_str(&number_string(*x)),
            Expr::Str(s) => write!(f, "'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            Expr::Variable(name) => {
                if is_identifier(name) {
                    f.write_str(name)
                } else {
                    write!(f, "[{}]", name.replace('\\', "\\\\").replace(']', "\\]"))
                }
            }
            Expr::Function { name, args } => {
                write!(f, "{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(")")
            }
            Expr::Binary { op, left, right } => write!(f, "{left} {} {right}", op.as_str()),
            Expr::Unary { op, expr } => write!(f, "{}{expr}", op.as_str()),
            Expr::Group(inner) => write!(f, "({inner})"),
        }
    }
}

/// `[A-Za-z_]\w*`
pub fn is_identifier(s: &str) -> bool {
    identifier_len(s) == Some(s.len())
}

/// Byte length of the identifier at the start of `s`, if any.
pub(crate) fn identifier_len(s: &str) -> Option<usize> {
    let mut chars = s.char_indices();
    match chars.next() {
        Some((_, c)) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return None,
    }
    let end = chars
        .find(|&(_, c)| !(c.is_alphanumeric() || c == '_'))
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    Some(end)
}

// ── Parser ────────────────────────────────────────────────────────────────────

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Parser { src, pos: 0 }
    }

    /// Byte offset of the first non-whitespace character at or after `pos`.
    fn ws_end(&self) -> usize {
        let rest = &self.src[self.pos..];
        self.pos + (rest.len() - rest.trim_start().len())
    }

    fn error(&self, msg: &str, at: usize) -> ParseError {
        let column = self.src[..at].chars().count() + 1;
        ParseError::new(msg, self.src, column)
    }

    /// Consume optional whitespace then `tok`.
    fn eat(&mut self, tok: &str) -> bool {
        let at = self.ws_end();
        if self.src[at..].starts_with(tok) {
            self.pos = at + tok.len();
            true
        } else {
            false
        }
    }

    fn binary_op(&mut self) -> Option<BinaryOp> {
        let at = self.ws_end();
        let rest = &self.src[at..];
        let &(tok, op) = BINARY_OPS.iter().find(|(tok, _)| rest.starts_with(tok))?;
        self.pos = at + tok.len();
        Some(op)
    }

    fn parse_binary(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;
        while let Some(op) = self.binary_op() {
            let right = self.parse_unary()?;
            left = reassociate(left, op, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let start = self.pos;
        let at = self.ws_end();
        let rest = &self.src[at..];

        // Group
        if rest.starts_with('(') {
            self.pos = at + 1;
            let inner = self.parse_binary()?;
            if !self.eat(")") {
                return Err(self.error("Unmatched parenthesis", start));
            }
            return Ok(Expr::Group(Box::new(inner)));
        }

        // Unary operator
        if let Some(op) = match rest.chars().next() {
            Some('!') => Some(UnaryOp::Not),
            Some('-') => Some(UnaryOp::Neg),
            _ => None,
        } {
            self.pos = at + 1;
            let operand = self.parse_unary()?;
            return Ok(Expr::unary(op, operand));
        }

        // Function call
        if let Some(name_len) = identifier_len(rest) {
            let after_name = &rest[name_len..];
            let paren = after_name.len() - after_name.trim_start().len();
            if after_name[paren..].starts_with('(') {
                let name = rest[..name_len].to_owned();
                self.pos = at + name_len + paren + 1;
                let args = self.parse_args()?;
                return Ok(Expr::Function { name, args });
            }
        }

        // Number
        if let Some(len) = number_len(rest) {
            let text = &rest[..len];
            let x: f64 = text.parse().map_err(|_| self.error("Syntax error", start))?;
            self.pos = at + len;
            return Ok(Expr::Number(x));
        }

        // String
        for quote in ['\'', '"'] {
            if rest.starts_with(quote) {
                if let Some((body, len)) = scan_quoted(&rest[1..], quote) {
                    self.pos = at + 1 + len;
                    return Ok(Expr::Str(unescape(body, &[quote, '\\'])));
                }
            }
        }

        // Variable
        if let Some(len) = identifier_len(rest) {
            self.pos = at + len;
            return Ok(Expr::Variable(rest[..len].to_owned()));
        }

        // Bracketed variable
        if let Some(inner) = rest.strip_prefix('[') {
            if let Some((name, len)) = scan_bracketed(inner) {
                self.pos = at + 1 + len;
                return Ok(Expr::Variable(unescape(name, &[']', '\\'])));
            }
        }

        Err(self.error("Syntax error", start))
    }

    /// Arguments after the opening parenthesis, through the closing one.
    fn parse_args(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();
        loop {
            if self.eat(")") {
                return Ok(args);
            }
            if !args.is_empty() && !self.eat(",") {
                return Err(self.error("Syntax error", self.pos));
            }
            args.push(self.parse_binary()?);
        }
    }
}

/// Attach `left op right`, pushing the new node down the right spine of
/// `left` past every operator that binds looser than `op`.
fn reassociate(left: Expr, op: BinaryOp, right: Expr) -> Expr {
    match left {
        Expr::Binary { op: left_op, left: ll, right: lr } if left_op.binds_looser_than(op) => Expr::Binary {
            op: left_op,
            left: ll,
            right: Box::new(reassociate(*lr, op, right)),
        },
        left => Expr::binary(op, left, right),
    }
}

/// `[+-]?\d+(\.\d*)?(e[+-]\d+)?`
fn number_len(s: &str) -> Option<usize> {
    let b = s.as_bytes();
    let digits = |from: usize| b[from..].iter().take_while(|c| c.is_ascii_digit()).count();
    let mut i = 0;
    if matches!(b.first(), Some(b'+' | b'-')) {
        i += 1;
    }
    let int = digits(i);
    if int == 0 {
        return None;
    }
    i += int;
    if b.get(i) == Some(&b'.') {
        i += 1;
        i += digits(i);
    }
    if b.get(i) == Some(&b'e') && matches!(b.get(i + 1), Some(b'+' | b'-')) {
        let exp = digits(i + 2);
        if exp > 0 {
            i += 2 + exp;
        }
    }
    Some(i)
}

/// Scan a quoted string body (after the opening quote).  Returns the raw
/// body and the byte length consumed including the closing quote.
fn scan_quoted(s: &str, quote: char) -> Option<(&str, usize)> {
    // An escaped quote may turn out to be the closing one when nothing
    // follows it.
    let mut last_escaped = None;
    let mut chars = s.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '\\' {
            if let Some(&(j, next)) = chars.peek() {
                if next == '\\' || next == quote {
                    chars.next();
                    if next == quote {
                        last_escaped = Some(j);
                    }
                }
            }
        } else if c == quote {
            return Some((&s[..i], i + c.len_utf8()));
        }
    }
    last_escaped.map(|j| (&s[..j], j + quote.len_utf8()))
}

/// Scan a bracketed variable body (after `[`).  Leading whitespace is
/// skipped; everything else up to the first unescaped `]` is the name.
fn scan_bracketed(s: &str) -> Option<(&str, usize)> {
    let scan = |from: usize| -> Option<(usize, usize)> {
        let body = &s[from..];
        let mut last_escaped = None;
        let mut chars = body.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' if matches!(chars.peek(), Some((_, ']'))) => {
                    last_escaped = chars.next().map(|(j, _)| from + j);
                }
                ']' => return Some((from + i, from + i + 1)),
                _ => {}
            }
        }
        last_escaped.map(|j| (j, j + 1))
    };
    let lead = s.len() - s.trim_start().len();
    let (end, consumed) = scan(lead)?;
    if end > lead {
        return Some((&s[lead..end], consumed));
    }
    // All-whitespace name: only the last whitespace character is the name.
    let last = s[..end].chars().next_back()?;
    Some((&s[end - last.len_utf8()..end], consumed))
}

/// Drop the backslash before any character in `escaped`.
pub(crate) fn unescape(s: &str, escaped: &[char]) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(&next) = chars.peek() {
                if escaped.contains(&next) {
                    out.push(next);
                    chars.next();
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

/// Parse an expression string into an AST.
///
/// Error columns are 1-based character offsets into `src`.
pub fn parse_expression(src: &str) -> Result<Expr, ParseError> {
    let mut p = Parser::new(src);
    let expr = p.parse_binary()?;
    if !src[p.pos..].trim().is_empty() {
        return Err(p.error("Syntax error", p.pos));
    }
    Ok(expr)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
