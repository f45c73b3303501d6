//! Statement AST and script-level parser.
//!
//! A script is a sequence of lines.  Each logical line is one statement:
//! an assignment, a label, a jump, a return, an include, a function
//! boundary, a structured control keyword, or a bare expression.
//!
//! Structured control flow (`if`/`elif`/`else`, `while`, `for`, `break`,
//! `continue`) is desugared here into flat [`Statement::Label`] and
//! [`Statement::Jump`] statements, so the interpreter only ever executes a
//! flat list with an instruction pointer.  Generated names are numbered by a
//! per-parse counter:
//!
//! | construct | labels / variables                                        |
//! |-----------|-----------------------------------------------------------|
//! | `if`      | `__bareIf{n}` per branch, `__bareDone{n}`                 |
//! | `while`   | `__bareLoop{n}`, `__bareContinue{n}`, `__bareDone{n}`     |
//! | `for`     | as `while`, plus `__bareIndex{n}`, `__bareValues{n}`, `__bareLength{n}` |

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, LazyLock, OnceLock};

use regex::{Match, Regex};

use super::error::ParseError;
use super::expr::{parse_expression, unescape, BinaryOp, Expr, UnaryOp};

// ── AST ───────────────────────────────────────────────────────────────────────

/// A parsed statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// `[name =] expr`
    Expr { name: Option<String>, expr: Expr },
    /// `jump label` or `jumpif (expr) label`
    Jump { label: String, expr: Option<Expr> },
    /// `return [expr]`
    Return { expr: Option<Expr> },
    /// `name:`
    Label(String),
    /// `function name(args):` … `endfunction`
    Function(Arc<FunctionDef>),
    /// One or more consecutive `include` lines.
    Include(Vec<Include>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Include {
    pub url: String,
    /// `include <url>` rather than `include 'url'`.
    pub system: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub args: Option<Vec<String>>,
    /// The last argument collects all remaining call arguments as an array.
    pub last_arg_array: bool,
    pub is_async: bool,
    pub statements: Block,
}

/// A flat statement list with a lazily built label index.
#[derive(Debug, Clone, Default)]
pub struct Block {
    statements: Vec<Statement>,
    labels: OnceLock<HashMap<String, usize>>,
}

impl Block {
    pub fn new(statements: Vec<Statement>) -> Self {
        Block { statements, labels: OnceLock::new() }
    }

    /// Position of the first `label:` statement with this name.
    ///
    /// The index is built on first use and cached for the life of the block.
    pub fn label_index(&self, label: &str) -> Option<usize> {
        self.labels
            .get_or_init(|| {
                let mut map = HashMap::new();
                for (ix, stmt) in self.statements.iter().enumerate() {
                    if let Statement::Label(name) = stmt {
                        map.entry(name.clone()).or_insert(ix);
                    }
                }
                map
            })
            .get(label)
            .copied()
    }
}

impl Deref for Block {
    type Target = [Statement];

    fn deref(&self) -> &[Statement] {
        &self.statements
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Block) -> bool {
        self.statements == other.statements
    }
}

/// A parsed script.  Immutable once built and safe to share between threads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Script {
    pub statements: Block,
}

// ── Line patterns ─────────────────────────────────────────────────────────────

macro_rules! line_regex {
    ($name:ident, $pat:expr) => {
        static $name: LazyLock<Regex> =
            LazyLock::new(|| Regex::new($pat).expect("line pattern compiles"));
    };
}

line_regex!(CONTINUATION, r"\\\s*$");
line_regex!(COMMENT, r"^\s*(?:#.*)?$");
line_regex!(ASSIGNMENT, r"^\s*(?P<name>[A-Za-z_]\w*)\s*=\s*(?P<expr>.+)$");
line_regex!(
    FUNCTION_BEGIN,
    r"^(?P<async>\s*async)?\s*function\s+(?P<name>[A-Za-z_]\w*)\s*\(\s*(?P<args>[A-Za-z_]\w*(?:\s*,\s*[A-Za-z_]\w*)*)?(?P<rest>\s*\.\.\.)?\s*\)\s*:\s*$"
);
line_regex!(ARG_SPLIT, r"\s*,\s*");
line_regex!(FUNCTION_END, r"^\s*endfunction\s*$");
line_regex!(LABEL, r"^\s*(?P<name>[A-Za-z_]\w*)\s*:\s*$");
line_regex!(
    JUMP,
    r"^(?P<jump>\s*(?:jump|jumpif\s*\((?P<expr>.+)\)))\s+(?P<name>[A-Za-z_]\w*)\s*$"
);
line_regex!(RETURN, r"^(?P<return>\s*return(?:\s+(?P<expr>.+))?)\s*$");
line_regex!(INCLUDE, r"^\s*include\s+'(?P<url>(?:\\'|[^'])*)'\s*$");
line_regex!(INCLUDE_SYSTEM, r"^\s*include\s+<(?P<url>[^>]*)>\s*$");
line_regex!(IF_BEGIN, r"^\s*if\s+(?P<expr>.+)\s*:\s*$");
line_regex!(IF_ELIF, r"^\s*elif\s+(?P<expr>.+)\s*:\s*$");
line_regex!(IF_ELSE, r"^\s*else\s*:\s*$");
line_regex!(IF_END, r"^\s*endif\s*$");
line_regex!(
    FOR_BEGIN,
    r"^\s*for\s+(?P<value>[A-Za-z_]\w*)(?:\s*,\s*(?P<index>[A-Za-z_]\w*))?\s+in\s+(?P<values>.+)\s*:\s*$"
);
line_regex!(FOR_END, r"^\s*endfor\s*$");
line_regex!(WHILE_BEGIN, r"^\s*while\s+(?P<expr>.+)\s*:\s*$");
line_regex!(WHILE_END, r"^\s*endwhile\s*$");
line_regex!(BREAK, r"^\s*break\s*$");
line_regex!(CONTINUE, r"^\s*continue\s*$");

// ── Parser state ──────────────────────────────────────────────────────────────

/// An open control construct awaiting its `end` keyword.
#[derive(Debug)]
enum Construct {
    If(IfDef),
    Loop(LoopDef),
}

#[derive(Debug)]
struct IfDef {
    /// Position of the current branch's guard jump in the enclosing list.
    jump: usize,
    label: String,
    done: String,
    has_else: bool,
    line: String,
    line_number: usize,
}

#[derive(Debug)]
struct LoopDef {
    keyword: &'static str,
    loop_label: String,
    continue_label: String,
    done: String,
    has_continue: bool,
    /// `while` re-checks this at the bottom of the loop.
    cond: Option<Expr>,
    /// `for` bookkeeping variables.
    index: String,
    length: String,
    line: String,
    line_number: usize,
}

impl Construct {
    fn keyword(&self) -> &'static str {
        match self {
            Construct::If(_) => "if",
            Construct::Loop(l) => l.keyword,
        }
    }

    fn origin(&self) -> (&str, usize) {
        match self {
            Construct::If(d) => (&d.line, d.line_number),
            Construct::Loop(l) => (&l.line, l.line_number),
        }
    }
}

struct FunctionBuilder {
    name: String,
    args: Option<Vec<String>>,
    last_arg_array: bool,
    is_async: bool,
    statements: Vec<Statement>,
    /// Construct-stack depth when the function began.
    depth: usize,
    line: String,
    line_number: usize,
}

struct ScriptParser {
    top: Vec<Statement>,
    function: Option<FunctionBuilder>,
    constructs: Vec<Construct>,
    label_index: usize,
}

fn error_at(msg: impl Into<String>, line: &str, column: usize, line_number: usize) -> ParseError {
    ParseError::new(msg, line, column).with_line_number(line_number)
}

/// Parse the expression captured by `m`, re-basing any error column onto the
/// whole line.
fn parse_expr_in(line: &str, m: Option<Match<'_>>, line_number: usize) -> Result<Expr, ParseError> {
    let (text, start) = m.map_or(("", line.len()), |m| (m.as_str(), m.start()));
    parse_expression(text).map_err(|e| {
        let column = line[..start].chars().count() + e.column_number;
        error_at(e.error, line, column, line_number)
    })
}

fn not(expr: Expr) -> Expr {
    Expr::unary(UnaryOp::Not, expr)
}

impl ScriptParser {
    fn new() -> Self {
        ScriptParser { top: Vec::new(), function: None, constructs: Vec::new(), label_index: 0 }
    }

    fn statements(&mut self) -> &mut Vec<Statement> {
        match &mut self.function {
            Some(f) => &mut f.statements,
            None => &mut self.top,
        }
    }

    /// Constructs at or below this depth belong to an enclosing scope.
    fn depth(&self) -> usize {
        self.function.as_ref().map_or(0, |f| f.depth)
    }

    fn next_index(&mut self) -> usize {
        let n = self.label_index;
        self.label_index += 1;
        n
    }

    /// The innermost open `if` in the current scope.
    fn open_if(&mut self, line: &str, line_number: usize) -> Result<&mut IfDef, ParseError> {
        let in_scope = self.constructs.len() > self.depth();
        match self.constructs.last_mut() {
            Some(Construct::If(d)) if in_scope => Ok(d),
            _ => Err(error_at("No matching if statement", line, 1, line_number)),
        }
    }

    /// The innermost open loop in the current scope, skipping `if`s.
    fn open_loop(&mut self, what: &str, line: &str, line_number: usize) -> Result<&mut LoopDef, ParseError> {
        let depth = self.depth();
        let found = self
            .constructs
            .iter()
            .rposition(|c| matches!(c, Construct::Loop(_)))
            .filter(|&ix| ix >= depth);
        match found.map(|ix| &mut self.constructs[ix]) {
            Some(Construct::Loop(l)) => Ok(l),
            _ => Err(error_at(format!("{what} statement outside of loop"), line, 1, line_number)),
        }
    }

    /// Pop the innermost construct in scope; it must be a `keyword` loop.
    fn close_loop(&mut self, keyword: &str, line: &str, line_number: usize) -> Result<LoopDef, ParseError> {
        let no_match = || error_at(format!("No matching {keyword} statement"), line, 1, line_number);
        if self.constructs.len() <= self.depth() {
            return Err(no_match());
        }
        match self.constructs.pop() {
            Some(Construct::Loop(l)) if l.keyword == keyword => Ok(l),
            _ => Err(no_match()),
        }
    }

    fn missing_end(construct: &Construct) -> ParseError {
        let (line, line_number) = construct.origin();
        error_at(format!("Missing end{} statement", construct.keyword()), line, 1, line_number)
    }

    fn parse_line(&mut self, line: &str, line_number: usize) -> Result<(), ParseError> {
        // Assignment
        if let Some(c) = ASSIGNMENT.captures(line) {
            let expr = parse_expr_in(line, c.name("expr"), line_number)?;
            let name = Some(c["name"].to_owned());
            self.statements().push(Statement::Expr { name, expr });
            return Ok(());
        }

        // Function definition
        if let Some(c) = FUNCTION_BEGIN.captures(line) {
            if self.function.is_some() {
                return Err(error_at("Nested function definition", line, 1, line_number));
            }
            self.function = Some(FunctionBuilder {
                name: c["name"].to_owned(),
                args: c.name("args").map(|m| ARG_SPLIT.split(m.as_str()).map(str::to_owned).collect()),
                last_arg_array: c.name("rest").is_some(),
                is_async: c.name("async").is_some(),
                statements: Vec::new(),
                depth: self.constructs.len(),
                line: line.to_owned(),
                line_number,
            });
            return Ok(());
        }
        if FUNCTION_END.is_match(line) {
            let Some(depth) = self.function.as_ref().map(|f| f.depth) else {
                return Err(error_at("No matching function definition", line, 1, line_number));
            };
            if self.constructs.len() > depth {
                if let Some(open) = self.constructs.pop() {
                    return Err(Self::missing_end(&open));
                }
            }
            if let Some(f) = self.function.take() {
                self.top.push(Statement::Function(Arc::new(FunctionDef {
                    name: f.name,
                    args: f.args,
                    last_arg_array: f.last_arg_array,
                    is_async: f.is_async,
                    statements: Block::new(f.statements),
                })));
            }
            return Ok(());
        }

        // if / elif / else / endif
        if let Some(c) = IF_BEGIN.captures(line) {
            let cond = parse_expr_in(line, c.name("expr"), line_number)?;
            let n = self.next_index();
            let label = format!("__bareIf{n}");
            let stmts = self.statements();
            stmts.push(Statement::Jump { label: label.clone(), expr: Some(not(cond)) });
            let jump = stmts.len() - 1;
            self.constructs.push(Construct::If(IfDef {
                jump,
                label,
                done: format!("__bareDone{n}"),
                has_else: false,
                line: line.to_owned(),
                line_number,
            }));
            return Ok(());
        }
        if let Some(c) = IF_ELIF.captures(line) {
            let open = self.open_if(line, line_number)?;
            if open.has_else {
                return Err(error_at("Elif statement following else statement", line, 1, line_number));
            }
            let (prev_label, done) = (open.label.clone(), open.done.clone());
            let cond = parse_expr_in(line, c.name("expr"), line_number)?;
            let label = format!("__bareIf{}", self.next_index());
            let stmts = self.statements();
            stmts.push(Statement::Jump { label: done, expr: None });
            stmts.push(Statement::Label(prev_label));
            stmts.push(Statement::Jump { label: label.clone(), expr: Some(not(cond)) });
            let jump = stmts.len() - 1;
            let open = self.open_if(line, line_number)?;
            open.jump = jump;
            open.label = label;
            return Ok(());
        }
        if IF_ELSE.is_match(line) {
            let open = self.open_if(line, line_number)?;
            if open.has_else {
                return Err(error_at("Multiple else statements", line, 1, line_number));
            }
            open.has_else = true;
            let (label, done) = (open.label.clone(), open.done.clone());
            let stmts = self.statements();
            stmts.push(Statement::Jump { label: done, expr: None });
            stmts.push(Statement::Label(label));
            return Ok(());
        }
        if IF_END.is_match(line) {
            self.open_if(line, line_number)?;
            let Some(Construct::If(closed)) = self.constructs.pop() else {
                return Err(error_at("No matching if statement", line, 1, line_number));
            };
            let stmts = self.statements();
            if !closed.has_else {
                // The last branch's guard skips straight to the end.
                if let Some(Statement::Jump { label, .. }) = stmts.get_mut(closed.jump) {
                    *label = closed.done.clone();
                }
            }
            stmts.push(Statement::Label(closed.done));
            return Ok(());
        }

        // while / endwhile
        if let Some(c) = WHILE_BEGIN.captures(line) {
            let cond = parse_expr_in(line, c.name("expr"), line_number)?;
            let n = self.next_index();
            let def = LoopDef {
                keyword: "while",
                loop_label: format!("__bareLoop{n}"),
                continue_label: format!("__bareContinue{n}"),
                done: format!("__bareDone{n}"),
                has_continue: false,
                cond: Some(cond.clone()),
                index: String::new(),
                length: String::new(),
                line: line.to_owned(),
                line_number,
            };
            let stmts = self.statements();
            stmts.push(Statement::Jump { label: def.done.clone(), expr: Some(not(cond)) });
            stmts.push(Statement::Label(def.loop_label.clone()));
            self.constructs.push(Construct::Loop(def));
            return Ok(());
        }
        if WHILE_END.is_match(line) {
            let def = self.close_loop("while", line, line_number)?;
            let stmts = self.statements();
            if def.has_continue {
                stmts.push(Statement::Label(def.continue_label));
            }
            stmts.push(Statement::Jump { label: def.loop_label, expr: def.cond });
            stmts.push(Statement::Label(def.done));
            return Ok(());
        }

        // for / endfor
        if let Some(c) = FOR_BEGIN.captures(line) {
            let values_expr = parse_expr_in(line, c.name("values"), line_number)?;
            let n = self.next_index();
            let value = c["value"].to_owned();
            let index = c.name("index").map_or_else(|| format!("__bareIndex{n}"), |m| m.as_str().to_owned());
            let values = format!("__bareValues{n}");
            let length = format!("__bareLength{n}");
            let def = LoopDef {
                keyword: "for",
                loop_label: format!("__bareLoop{n}"),
                continue_label: format!("__bareContinue{n}"),
                done: format!("__bareDone{n}"),
                has_continue: false,
                cond: None,
                index: index.clone(),
                length: length.clone(),
                line: line.to_owned(),
                line_number,
            };
            let stmts = self.statements();
            stmts.extend([
                Statement::Expr { name: Some(values.clone()), expr: values_expr },
                Statement::Expr {
                    name: Some(length.clone()),
                    expr: Expr::call("arrayLength", vec![Expr::variable(&values)]),
                },
                Statement::Jump { label: def.done.clone(), expr: Some(not(Expr::variable(&length))) },
                Statement::Expr { name: Some(index.clone()), expr: Expr::Number(0.0) },
                Statement::Label(def.loop_label.clone()),
                Statement::Expr {
                    name: Some(value),
                    expr: Expr::call("arrayGet", vec![Expr::variable(&values), Expr::variable(&index)]),
                },
            ]);
            self.constructs.push(Construct::Loop(def));
            return Ok(());
        }
        if FOR_END.is_match(line) {
            let def = self.close_loop("for", line, line_number)?;
            let stmts = self.statements();
            if def.has_continue {
                stmts.push(Statement::Label(def.continue_label));
            }
            stmts.extend([
                Statement::Expr {
                    name: Some(def.index.clone()),
                    expr: Expr::binary(BinaryOp::Add, Expr::variable(&def.index), Expr::Number(1.0)),
                },
                Statement::Jump {
                    label: def.loop_label,
                    expr: Some(Expr::binary(BinaryOp::Lt, Expr::variable(&def.index), Expr::variable(&def.length))),
                },
                Statement::Label(def.done),
            ]);
            return Ok(());
        }

        // break / continue
        if BREAK.is_match(line) {
            let done = self.open_loop("Break", line, line_number)?.done.clone();
            self.statements().push(Statement::Jump { label: done, expr: None });
            return Ok(());
        }
        if CONTINUE.is_match(line) {
            let open = self.open_loop("Continue", line, line_number)?;
            open.has_continue = true;
            let label = open.continue_label.clone();
            self.statements().push(Statement::Jump { label, expr: None });
            return Ok(());
        }

        // Label
        if let Some(c) = LABEL.captures(line) {
            self.statements().push(Statement::Label(c["name"].to_owned()));
            return Ok(());
        }

        // jump / jumpif
        if let Some(c) = JUMP.captures(line) {
            let expr = match c.name("expr") {
                Some(m) => Some(parse_expr_in(line, Some(m), line_number)?),
                None => None,
            };
            self.statements().push(Statement::Jump { label: c["name"].to_owned(), expr });
            return Ok(());
        }

        // return
        if let Some(c) = RETURN.captures(line) {
            let expr = match c.name("expr") {
                Some(m) => Some(parse_expr_in(line, Some(m), line_number)?),
                None => None,
            };
            self.statements().push(Statement::Return { expr });
            return Ok(());
        }

        // include
        let include = if let Some(c) = INCLUDE.captures(line) {
            Some(Include { url: unescape(&c["url"], &['\\', '\'']), system: false })
        } else {
            INCLUDE_SYSTEM.captures(line).map(|c| Include { url: c["url"].to_owned(), system: true })
        };
        if let Some(include) = include {
            let stmts = self.statements();
            match stmts.last_mut() {
                Some(Statement::Include(list)) => list.push(include),
                _ => stmts.push(Statement::Include(vec![include])),
            }
            return Ok(());
        }

        // Bare expression
        let expr = parse_expression(line).map_err(|e| e.with_line_number(line_number))?;
        self.statements().push(Statement::Expr { name: None, expr });
        Ok(())
    }

    fn finish(mut self) -> Result<Script, ParseError> {
        if let Some(open) = self.constructs.pop() {
            return Err(Self::missing_end(&open));
        }
        if let Some(f) = &self.function {
            return Err(error_at("Missing endfunction statement", &f.line, 1, f.line_number));
        }
        Ok(Script { statements: Block::new(self.top) })
    }
}

/// Join `\`-continued lines into logical lines, dropping blank and comment
/// lines.  Each logical line carries the 0-based index of its first
/// physical line.
///
/// Comment lines are skipped without ending a continuation sequence.
fn join_continuations(src: &str) -> Vec<(usize, String)> {
    let mut lines = Vec::new();
    let mut parts: Vec<&str> = Vec::new();
    let mut first = 0;
    for (ix, raw) in src.split('\n').enumerate() {
        let part = raw.strip_suffix('\r').unwrap_or(raw);
        if COMMENT.is_match(part) {
            continue;
        }
        if parts.is_empty() {
            first = ix;
        }
        let continued = !parts.is_empty();
        match CONTINUATION.find(part) {
            Some(m) => {
                let head = &part[..m.start()];
                parts.push(if continued { head.trim() } else { head.trim_end() });
            }
            None if continued => {
                parts.push(part.trim());
                lines.push((first, parts.join(" ")));
                parts.clear();
            }
            None => lines.push((ix, part.to_owned())),
        }
    }
    if !parts.is_empty() {
        lines.push((first, parts.join(" ")));
    }
    lines
}

/// Parse script source, numbering lines from 1.
pub fn parse_script(src: &str) -> Result<Script, ParseError> {
    parse_script_at(src, 1)
}

/// Parse script source whose first line is `start_line_number`.
pub fn parse_script_at(src: &str, start_line_number: usize) -> Result<Script, ParseError> {
    let mut parser = ScriptParser::new();
    for (ix, line) in join_continuations(src) {
        parser.parse_line(&line, start_line_number + ix)?;
    }
    parser.finish()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
