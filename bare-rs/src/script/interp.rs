//! Script interpreter.
//!
//! [`execute_script`] runs a parsed [`Script`] against an [`ExecContext`].
//! Statement lists are flat: the interpreter keeps one instruction pointer
//! per list and jumps by label position.  Calling a script function runs its
//! body as a nested list with a fresh local scope.
//!
//! The context carries everything the host supplies: the global variables,
//! the statement budget, and the fetch, log and URL-resolution callbacks.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{debug, trace};

use super::builtins::{call_builtin, expression_function, SCRIPT_FUNCTIONS};
use super::error::{CallError, RuntimeError, ScriptError};
use super::expr::{BinaryOp, Expr, UnaryOp};
use super::lint::lint_script;
use super::stmt::{parse_script, Block, FunctionDef, Include, Script, Statement};
use super::value::{Function, Value};

/// Default statement budget for one [`execute_script`] call.
pub const DEFAULT_MAX_STATEMENTS: i64 = 1_000_000_000;

/// Default limit on nested script function calls.  Sized for an 8 MiB
/// main-thread stack; lower it for scripts run on smaller threads.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 200;

pub type Globals = HashMap<String, Value>;
pub type Locals = HashMap<String, Value>;

/// Fetch the text of a URL.
pub type FetchFn = Arc<dyn Fn(&str) -> Result<String, String> + Send + Sync>;
/// Receive a diagnostic message.
pub type LogFn = Arc<dyn Fn(&str) + Send + Sync>;
/// Rewrite a URL before it is fetched.
pub type UrlFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

// ── ExecContext ───────────────────────────────────────────────────────────────

/// Execution state and host configuration.
///
/// All callbacks are optional; a missing callback disables the feature.
pub struct ExecContext {
    /// Global variables.  Library functions are added by [`execute_script`].
    pub globals: Globals,
    /// Statement budget; zero or negative disables the check.
    pub max_statements: i64,
    /// Script function calls nested deeper than this fault and give null.
    pub max_call_depth: usize,
    /// Log function failures and include lint warnings.
    pub debug: bool,
    pub fetch: Option<FetchFn>,
    pub log: Option<LogFn>,
    pub url_resolve: Option<UrlFn>,
    /// Prepended to relative `include <url>` URLs.
    pub system_prefix: Option<String>,
    statement_count: i64,
    call_depth: usize,
}

impl Default for ExecContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExecContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecContext")
            .field("globals", &self.globals.len())
            .field("max_statements", &self.max_statements)
            .field("max_call_depth", &self.max_call_depth)
            .field("debug", &self.debug)
            .field("fetch", &self.fetch.is_some())
            .field("log", &self.log.is_some())
            .field("url_resolve", &self.url_resolve.is_some())
            .field("system_prefix", &self.system_prefix)
            .field("statement_count", &self.statement_count)
            .field("call_depth", &self.call_depth)
            .finish()
    }
}

impl ExecContext {
    pub fn new() -> Self {
        ExecContext {
            globals: Globals::new(),
            max_statements: DEFAULT_MAX_STATEMENTS,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            debug: false,
            fetch: None,
            log: None,
            url_resolve: None,
            system_prefix: None,
            statement_count: 0,
            call_depth: 0,
        }
    }

    pub fn with_globals(mut self, globals: Globals) -> Self {
        self.globals = globals;
        self
    }

    pub fn with_max_statements(mut self, max_statements: i64) -> Self {
        self.max_statements = max_statements;
        self
    }

    pub fn with_max_call_depth(mut self, max_call_depth: usize) -> Self {
        self.max_call_depth = max_call_depth;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_fetch<F>(mut self, fetch: F) -> Self
    where
        F: Fn(&str) -> Result<String, String> + Send + Sync + 'static,
    {
        self.fetch = Some(Arc::new(fetch));
        self
    }

    pub fn with_log<F>(mut self, log: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.log = Some(Arc::new(log));
        self
    }

    pub fn with_url_resolve<F>(mut self, url_resolve: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.url_resolve = Some(Arc::new(url_resolve));
        self
    }

    pub fn with_system_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.system_prefix = Some(prefix.into());
        self
    }

    /// Statements executed so far by the current [`execute_script`] call.
    pub fn statement_count(&self) -> i64 {
        self.statement_count
    }

    /// Send a message to the log callback, if any.
    pub fn log(&self, msg: &str) {
        if let Some(log) = &self.log {
            log(msg);
        }
    }

    /// Apply the URL-resolution callback, if any.
    pub fn resolve_url(&self, url: &str) -> String {
        match &self.url_resolve {
            Some(resolve) => resolve(url),
            None => url.to_owned(),
        }
    }

    /// Fetch a URL with the fetch callback.
    pub fn fetch_text(&self, url: &str) -> Result<String, String> {
        match &self.fetch {
            Some(fetch) => fetch(url),
            None => Err(format!("no fetch function for \"{url}\"")),
        }
    }

    fn count_statement(&mut self) -> Result<(), RuntimeError> {
        if self.max_statements > 0 {
            self.statement_count += 1;
            if self.statement_count > self.max_statements {
                debug!(max = self.max_statements, "statement budget exceeded");
                return Err(RuntimeError::MaxStatements(self.max_statements));
            }
        }
        Ok(())
    }
}

// ── Execution ─────────────────────────────────────────────────────────────────

/// Execute a script and return its result (null without a `return`).
///
/// Library functions are installed into the globals under their full names,
/// leaving any existing global of the same name alone.  The statement
/// counter restarts at zero.
pub fn execute_script(script: &Script, ctx: &mut ExecContext) -> Result<Value, RuntimeError> {
    for &name in SCRIPT_FUNCTIONS {
        ctx.globals
            .entry(name.to_owned())
            .or_insert(Value::Function(Function::Native(name)));
    }
    ctx.statement_count = 0;
    run_block(&script.statements, ctx, None)
}

/// Parse and execute script text.
pub fn run_script(src: &str, ctx: &mut ExecContext) -> Result<Value, ScriptError> {
    let script = parse_script(src)?;
    Ok(execute_script(&script, ctx)?)
}

#[tracing::instrument(level = "debug", skip_all, fields(statements = statements.len()))]
fn run_block(statements: &Block, ctx: &mut ExecContext, mut locals: Option<&mut Locals>) -> Result<Value, RuntimeError> {
    let mut ix = 0;
    while ix < statements.len() {
        ctx.count_statement()?;

        match &statements[ix] {
            Statement::Expr { name, expr } => {
                let value = evaluate_expression(expr, ctx, locals.as_deref(), false)?;
                if let Some(name) = name {
                    match locals.as_deref_mut() {
                        Some(locals) => locals.insert(name.clone(), value),
                        None => ctx.globals.insert(name.clone(), value),
                    };
                }
            }
            Statement::Jump { label, expr } => {
                let taken = match expr {
                    Some(expr) => evaluate_expression(expr, ctx, locals.as_deref(), false)?.as_bool(),
                    None => true,
                };
                if taken {
                    ix = statements
                        .label_index(label)
                        .ok_or_else(|| RuntimeError::UnknownLabel(label.clone()))?;
                }
            }
            Statement::Return { expr } => {
                return match expr {
                    Some(expr) => evaluate_expression(expr, ctx, locals.as_deref(), false),
                    None => Ok(Value::Null),
                };
            }
            Statement::Label(_) => {}
            Statement::Function(def) => {
                ctx.globals.insert(def.name.clone(), Value::Function(Function::Script(Arc::clone(def))));
            }
            Statement::Include(includes) => run_includes(includes, ctx)?,
        }

        ix += 1;
    }
    Ok(Value::Null)
}

// ── Includes ──────────────────────────────────────────────────────────────────

static NOT_RELATIVE_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[a-z]+:|/|\?|#)").expect("url pattern compiles"));

fn is_relative_url(url: &str) -> bool {
    !NOT_RELATIVE_URL.is_match(url)
}

/// The URL up to and including its last `/`.
fn base_url(url: &str) -> &str {
    url.rfind('/').map_or("", |ix| &url[..=ix])
}

/// Fetch, parse and run each included script in the global scope.
///
/// While an include runs, relative URLs (in nested includes and
/// `systemFetch`) resolve against the include's own location.
fn run_includes(includes: &[Include], ctx: &mut ExecContext) -> Result<(), RuntimeError> {
    for include in includes {
        let url = match &ctx.system_prefix {
            Some(prefix) if include.system && is_relative_url(&include.url) => format!("{prefix}{}", include.url),
            _ => ctx.resolve_url(&include.url),
        };
        debug!(%url, system = include.system, "include");

        let text = ctx.fetch_text(&url).map_err(|err| {
            debug!(%url, %err, "include fetch failed");
            RuntimeError::IncludeFailed(url.clone())
        })?;
        let script = parse_script(&text)
            .map_err(|err| RuntimeError::IncludeParse(err.with_prefix(format!("Included from \"{url}\""))))?;

        if ctx.debug && ctx.log.is_some() {
            let warnings = lint_script(&script);
            if !warnings.is_empty() {
                let plural = if warnings.len() > 1 { "s" } else { "" };
                ctx.log(&format!(
                    "bare: Include \"{url}\" static analysis... {} warning{plural}:",
                    warnings.len()
                ));
                for warning in &warnings {
                    ctx.log(&format!("bare:     {warning}"));
                }
            }
        }

        let base = base_url(&url).to_owned();
        let include_resolve: UrlFn = Arc::new(move |url: &str| {
            if is_relative_url(url) {
                format!("{base}{url}")
            } else {
                url.to_owned()
            }
        });
        let saved = ctx.url_resolve.replace(include_resolve);
        let result = run_block(&script.statements, ctx, None);
        ctx.url_resolve = saved;
        result?;
    }
    Ok(())
}

// ── Function calls ────────────────────────────────────────────────────────────

impl Function {
    /// Call the function.
    ///
    /// A [`CallError::Fault`] means the call failed in a way the caller
    /// should treat as null; a [`CallError::Runtime`] aborts the script.
    pub fn call(&self, args: Vec<Value>, ctx: &mut ExecContext) -> Result<Value, CallError> {
        match self {
            Function::Native(name) => call_builtin(name, &args, ctx)
                .unwrap_or_else(|| Err(RuntimeError::UndefinedFunction((*name).to_owned()).into())),
            Function::Script(def) => {
                if ctx.call_depth >= ctx.max_call_depth {
                    debug!(function = %def.name, depth = ctx.call_depth, "call depth exceeded");
                    return Err(CallError::fault("maximum recursion depth exceeded"));
                }
                ctx.call_depth += 1;
                let result = call_script_function(def, args, ctx);
                ctx.call_depth -= 1;
                Ok(result?)
            }
            Function::Host(host) => host(&args, ctx),
            Function::Partial(func, bound) => {
                let mut all = bound.to_vec();
                all.extend(args);
                func.call(all, ctx)
            }
        }
    }
}

/// Bind arguments to a fresh local scope and run the function body.
///
/// Missing arguments are null.  With `last_arg_array`, the last parameter
/// collects every remaining argument into an array (empty if there are
/// none).
fn call_script_function(def: &FunctionDef, args: Vec<Value>, ctx: &mut ExecContext) -> Result<Value, RuntimeError> {
    trace!(function = %def.name, args = args.len(), "call");
    let mut locals = Locals::new();
    if let Some(names) = &def.args {
        let rest = if def.last_arg_array { names.len().checked_sub(1) } else { None };
        let mut args = args.into_iter();
        for (ix, name) in names.iter().enumerate() {
            let value = if Some(ix) == rest {
                Value::array(args.by_ref().collect())
            } else {
                args.next().unwrap_or_default()
            };
            locals.insert(name.clone(), value);
        }
    }
    run_block(&def.statements, ctx, Some(&mut locals))
}

// ── Expression evaluation ─────────────────────────────────────────────────────

/// Evaluate an expression.
///
/// Variables resolve against `locals` first, then the globals.  With
/// `builtins`, function names not found in either scope fall back to the
/// short expression-function names (`abs`, `len`, `date`, ...).
pub fn evaluate_expression(
    expr: &Expr,
    ctx: &mut ExecContext,
    locals: Option<&Locals>,
    builtins: bool,
) -> Result<Value, RuntimeError> {
    Ok(match expr {
        Expr::Number(x) => Value::Number(*x),
        Expr::Str(s) => Value::Str(s.clone()),
        Expr::Variable(name) => match name.as_str() {
            "null" => Value::Null,
            "false" => Value::Bool(false),
            "true" => Value::Bool(true),
            _ => lookup(name, ctx, locals).cloned().unwrap_or_default(),
        },

        // `if(test, then, else)` evaluates only the selected branch.
        Expr::Function { name, args } if name == "if" => {
            let test = match args.first() {
                Some(test) => evaluate_expression(test, ctx, locals, builtins)?.as_bool(),
                None => false,
            };
            match args.get(if test { 1 } else { 2 }) {
                Some(branch) => evaluate_expression(branch, ctx, locals, builtins)?,
                None => Value::Null,
            }
        }

        Expr::Function { name, args } => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(evaluate_expression(arg, ctx, locals, builtins)?);
            }
            let callee = match lookup(name, ctx, locals) {
                Some(value) => value.clone(),
                None if builtins => expression_function(name).map(Value::Function).unwrap_or_default(),
                None => Value::Null,
            };
            match callee {
                Value::Null => return Err(RuntimeError::UndefinedFunction(name.clone())),
                Value::Function(func) => call_guarded(name, func.call(values, ctx), ctx)?,
                other => {
                    let fault = CallError::fault(format!("{} is not callable", other.type_name()));
                    call_guarded(name, Err(fault), ctx)?
                }
            }
        }

        Expr::Binary { op: BinaryOp::And, left, right } => {
            let left = evaluate_expression(left, ctx, locals, builtins)?;
            if left.as_bool() {
                evaluate_expression(right, ctx, locals, builtins)?
            } else {
                left
            }
        }
        Expr::Binary { op: BinaryOp::Or, left, right } => {
            let left = evaluate_expression(left, ctx, locals, builtins)?;
            if left.as_bool() {
                left
            } else {
                evaluate_expression(right, ctx, locals, builtins)?
            }
        }
        Expr::Binary { op, left, right } => {
            let left = evaluate_expression(left, ctx, locals, builtins)?;
            let right = evaluate_expression(right, ctx, locals, builtins)?;
            binary_value(*op, &left, &right)
        }

        Expr::Unary { op, expr } => {
            let value = evaluate_expression(expr, ctx, locals, builtins)?;
            match op {
                UnaryOp::Not => Value::Bool(!value.as_bool()),
                UnaryOp::Neg => value.as_number().map_or(Value::Null, |x| Value::Number(-x)),
            }
        }

        Expr::Group(inner) => evaluate_expression(inner, ctx, locals, builtins)?,
    })
}

/// A name bound in `locals` hides any global of the same name, even when the
/// local is null.
fn lookup<'a>(name: &str, ctx: &'a ExecContext, locals: Option<&'a Locals>) -> Option<&'a Value> {
    match locals.and_then(|locals| locals.get(name)) {
        Some(value) => Some(value),
        None => ctx.globals.get(name),
    }
}

/// The single point where function faults become null.
fn call_guarded(name: &str, result: Result<Value, CallError>, ctx: &ExecContext) -> Result<Value, RuntimeError> {
    match result {
        Ok(value) => Ok(value),
        Err(CallError::Runtime(err)) => Err(err),
        Err(CallError::Fault(msg)) => {
            debug!(function = name, error = %msg, "function failed");
            if ctx.debug {
                ctx.log(&format!("bare: Function \"{name}\" failed with error: {msg}"));
            }
            Ok(Value::Null)
        }
    }
}

fn binary_value(op: BinaryOp, left: &Value, right: &Value) -> Value {
    match op {
        BinaryOp::Add => match (left, right) {
            (Value::Number(a), Value::Number(b)) => Value::Number(a + b),
            (Value::Str(a), Value::Str(b)) => Value::Str(format!("{a}{b}")),
            (Value::Str(a), _) => Value::Str(format!("{a}{right}")),
            (_, Value::Str(b)) => Value::Str(format!("{left}{b}")),
            _ => Value::Null,
        },
        BinaryOp::Eq => Value::Bool(left.compare(right) == Ordering::Equal),
        BinaryOp::Ne => Value::Bool(left.compare(right) != Ordering::Equal),
        BinaryOp::Le => Value::Bool(left.compare(right) != Ordering::Greater),
        BinaryOp::Lt => Value::Bool(left.compare(right) == Ordering::Less),
        BinaryOp::Ge => Value::Bool(left.compare(right) != Ordering::Less),
        BinaryOp::Gt => Value::Bool(left.compare(right) == Ordering::Greater),
        BinaryOp::And => if left.as_bool() { right.clone() } else { left.clone() },
        BinaryOp::Or => if left.as_bool() { left.clone() } else { right.clone() },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod | BinaryOp::Pow => {
            match (left.as_number(), right.as_number()) {
                (Some(a), Some(b)) => Value::Number(arithmetic(op, a, b)),
                _ => Value::Null,
            }
        }
    }
}

fn arithmetic(op: BinaryOp, a: f64, b: f64) -> f64 {
    match op {
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        // Floored: the result takes the sign of the divisor.
        BinaryOp::Mod => {
            let m = a % b;
            if m != 0.0 && (m < 0.0) != (b < 0.0) {
                m + b
            } else {
                m
            }
        }
        BinaryOp::Pow => a.powf(b),
        _ => f64::NAN,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;
    use std::sync::Mutex;

    use super::*;
    use crate::script::expr::parse_expression;

    fn run(src: &str) -> Result<Value, RuntimeError> {
        run_with(src, &mut ExecContext::new())
    }

    fn run_with(src: &str, ctx: &mut ExecContext) -> Result<Value, RuntimeError> {
        let script = parse_script(src).expect("script parses");
        execute_script(&script, ctx)
    }

    fn value(src: &str) -> String {
        run(src).expect("script runs").to_string()
    }

    fn logging() -> (Arc<Mutex<Vec<String>>>, ExecContext) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let ctx = ExecContext::new().with_log(move |msg: &str| {
            if let Ok(mut lines) = sink.lock() {
                lines.push(msg.to_owned());
            }
        });
        (lines, ctx)
    }

    fn eval(src: &str, builtins: bool) -> Result<Value, RuntimeError> {
        let expr = parse_expression(src).expect("expression parses");
        evaluate_expression(&expr, &mut ExecContext::new(), None, builtins)
    }

    const FIB: &str = "\
n = 10
i = 0
a = 0
b = 1
fib:
jumpif (i >= n) fibend
tmp = b
b = a + b
a = tmp
i = i + 1
jump fib
fibend:
return a
";

    #[test]
    fn fibonacci_with_labels() {
        assert_eq!(run(FIB), Ok(Value::Number(55.0)));
    }

    #[test]
    fn no_return_gives_null() {
        assert_eq!(run("a = 1"), Ok(Value::Null));
        assert_eq!(run(""), Ok(Value::Null));
        assert_eq!(run("return"), Ok(Value::Null));
    }

    #[test]
    fn statement_budget() {
        let src = "function fn():\n    a\n    b\nendfunction\nfn()\n";
        let script = parse_script(src).expect("parses");
        let mut ctx = ExecContext::new().with_max_statements(3);
        let err = execute_script(&script, &mut ctx).unwrap_err();
        assert_eq!(err, RuntimeError::MaxStatements(3));
        assert_eq!(err.to_string(), "Exceeded maximum script statements (3)");

        let mut ctx = ExecContext::new().with_max_statements(4);
        assert_eq!(execute_script(&script, &mut ctx), Ok(Value::Null));
        assert_eq!(ctx.statement_count(), 4);

        let mut ctx = ExecContext::new().with_max_statements(0);
        assert_eq!(execute_script(&script, &mut ctx), Ok(Value::Null));
    }

    #[test]
    fn budget_stops_infinite_loop() {
        let mut ctx = ExecContext::new().with_max_statements(1000);
        let err = run_with("top:\njump top", &mut ctx).unwrap_err();
        assert_eq!(err, RuntimeError::MaxStatements(1000));
    }

    #[test]
    fn call_depth_limit_faults_to_null() {
        let src = "\
function down(n):
    return if(n <= 0, 'bottom', down(n - 1))
endfunction
return arrayNew(down(5), down(50), down(5))
";
        let (lines, ctx) = logging();
        let mut ctx = ctx.with_debug(true).with_max_call_depth(10);
        assert_eq!(run_with(src, &mut ctx).map(|v| v.to_string()), Ok(r#"["bottom",null,"bottom"]"#.to_owned()));
        assert_eq!(
            *lines.lock().unwrap(),
            vec!["bare: Function \"down\" failed with error: maximum recursion depth exceeded"]
        );
    }

    #[test]
    fn last_arg_array_binding() {
        let src = "\
function test(a, b...):
    return arrayNew(a, b)
endfunction
return arrayNew(test(1, 2, 3), test(1), test())
";
        assert_eq!(value(src), "[[1,[2,3]],[1,[]],[null,[]]]");
    }

    #[test]
    fn missing_arguments_are_null() {
        let src = "function f(a, b):\n    return arrayNew(a, b)\nendfunction\nreturn f(1)";
        assert_eq!(value(src), "[1,null]");
    }

    #[test]
    fn functions_see_globals_not_caller_locals() {
        let src = "\
g = 'global'
function inner():
    return arrayNew(g, x)
endfunction
function outer(x):
    return inner()
endfunction
return outer(5)
";
        assert_eq!(value(src), r#"["global",null]"#);
    }

    #[test]
    fn function_assignments_are_local() {
        let src = "x = 1\nfunction f():\n    x = 2\n    return x\nendfunction\nreturn arrayNew(f(), x)";
        assert_eq!(value(src), "[2,1]");
    }

    #[test]
    fn keywords_ignore_variables() {
        assert_eq!(run("true = 5\nreturn true"), Ok(Value::Bool(true)));
        assert_eq!(run("null = 5\nreturn null"), Ok(Value::Null));
    }

    #[test]
    fn unknown_label() {
        assert_eq!(run("jump nowhere"), Err(RuntimeError::UnknownLabel("nowhere".into())));
        // A false condition never resolves the label.
        assert_eq!(run("jumpif (false) nowhere\nreturn 1"), Ok(Value::Number(1.0)));
    }

    #[test]
    fn undefined_function() {
        assert_eq!(run("return nope()"), Err(RuntimeError::UndefinedFunction("nope".into())));
        // Script statements do not see the expression aliases.
        assert_eq!(run("return abs(-1)"), Err(RuntimeError::UndefinedFunction("abs".into())));
    }

    #[test]
    fn null_local_hides_global_function() {
        let src = "function g(mathAbs):\n    return mathAbs(-1)\nendfunction\nreturn g()";
        assert_eq!(run(src), Err(RuntimeError::UndefinedFunction("mathAbs".into())));
    }

    #[test]
    fn calling_a_non_function_is_null() {
        assert_eq!(run("x = 1\nreturn x()"), Ok(Value::Null));
    }

    #[test]
    fn structured_control_flow() {
        let src = "\
i = 0
s = 0
while i < 5:
    i = i + 1
    if i == 3:
        continue
    endif
    s = s + i
endwhile
return s
";
        assert_eq!(value(src), "12");

        let src = "\
s = 0
for v, i in arrayNew(5, 6, 7):
    s = s + v * i
endfor
return s
";
        assert_eq!(value(src), "20");

        let src = "\
x = 7
if x < 5:
    r = 'small'
elif x < 10:
    r = 'medium'
else:
    r = 'large'
endif
return r
";
        assert_eq!(value(src), "medium");
    }

    #[test]
    fn for_over_empty_array_skips_body() {
        assert_eq!(value("n = 0\nfor v in arrayNew():\n    n = n + 1\nendfor\nreturn n"), "0");
    }

    #[test]
    fn library_is_installed_without_overwriting() {
        let mut globals = Globals::new();
        globals.insert("mathAbs".into(), Value::Number(5.0));
        let mut ctx = ExecContext::new().with_globals(globals);
        assert_eq!(run_with("return mathMax(1, 2)", &mut ctx), Ok(Value::Number(2.0)));
        assert_eq!(ctx.globals.get("mathAbs"), Some(&Value::Number(5.0)));
        assert!(matches!(ctx.globals.get("stringSplit"), Some(Value::Function(_))));
    }

    #[test]
    fn globals_persist_in_context() {
        let mut ctx = ExecContext::new();
        run_with("x = 41", &mut ctx).expect("runs");
        assert_eq!(run_with("return x + 1", &mut ctx), Ok(Value::Number(42.0)));
    }

    #[test]
    fn script_type_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Script>();
    }

    #[test]
    fn concurrent_execution_of_one_script() {
        let script = parse_script(FIB).expect("parses");
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        let mut ctx = ExecContext::new();
                        execute_script(&script, &mut ctx).map(|v| v.to_string())
                    })
                })
                .collect();
            for handle in handles {
                assert_eq!(handle.join().expect("thread"), Ok("55".to_owned()));
            }
        });
    }

    // ── Expressions ──────────────────────────────────────────────────────────

    #[test]
    fn arithmetic_and_concatenation() {
        assert_eq!(eval("7 + 3 * 2", false), Ok(Value::Number(13.0)));
        assert_eq!(eval("2 ** 10", false), Ok(Value::Number(1024.0)));
        assert_eq!(eval("7 % -3", false), Ok(Value::Number(-2.0)));
        assert_eq!(eval("-7 % 3", false), Ok(Value::Number(2.0)));
        assert_eq!(eval("1 / 0", false), Ok(Value::Number(f64::INFINITY)));
        assert_eq!(eval("'a' + 1", false), Ok(Value::from("a1")));
        assert_eq!(eval("1 + 'a'", false), Ok(Value::from("1a")));
        assert_eq!(eval("'n: ' + null", false), Ok(Value::from("n: null")));
        assert_eq!(eval("1 - 'a'", false), Ok(Value::Null));
        assert_eq!(eval("true + 1", false), Ok(Value::Null));
        assert_eq!(eval("-'a'", false), Ok(Value::Null));
        assert_eq!(eval("!0", false), Ok(Value::Bool(true)));
        assert_eq!(eval("(1 + 2) * 3", false), Ok(Value::Number(9.0)));
    }

    #[test]
    fn comparisons_use_total_order() {
        assert_eq!(eval("1 < 2", false), Ok(Value::Bool(true)));
        assert_eq!(eval("'b' >= 'a'", false), Ok(Value::Bool(true)));
        assert_eq!(eval("null < 0", false), Ok(Value::Bool(true)));
        assert_eq!(eval("1 == 1.0", false), Ok(Value::Bool(true)));
        assert_eq!(eval("1 != '1'", false), Ok(Value::Bool(true)));
    }

    #[test]
    fn logical_operators_return_operand_values() {
        assert_eq!(eval("0 && 5", false), Ok(Value::Number(0.0)));
        assert_eq!(eval("'a' || 5", false), Ok(Value::from("a")));
        assert_eq!(eval("'' || 5", false), Ok(Value::Number(5.0)));
        assert_eq!(eval("1 && 'x'", false), Ok(Value::from("x")));
    }

    fn counting_context() -> (Rc<Cell<u32>>, ExecContext) {
        let calls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&calls);
        let mut ctx = ExecContext::new();
        ctx.globals.insert(
            "sideEffect".into(),
            Value::Function(Function::host(move |_, _| {
                counter.set(counter.get() + 1);
                Ok(Value::Bool(true))
            })),
        );
        (calls, ctx)
    }

    #[test]
    fn short_circuit_skips_right_side() {
        let (calls, mut ctx) = counting_context();
        for src in ["false && sideEffect()", "true || sideEffect()", "if(true, 1, sideEffect())", "if(0, sideEffect())"] {
            let expr = parse_expression(src).expect("parses");
            evaluate_expression(&expr, &mut ctx, None, false).expect("evaluates");
        }
        assert_eq!(calls.get(), 0);

        let expr = parse_expression("true && sideEffect()").expect("parses");
        assert_eq!(evaluate_expression(&expr, &mut ctx, None, false), Ok(Value::Bool(true)));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn if_function_branches() {
        assert_eq!(eval("if(1, 'yes', 'no')", false), Ok(Value::from("yes")));
        assert_eq!(eval("if(0, 'yes', 'no')", false), Ok(Value::from("no")));
        assert_eq!(eval("if(0, 'yes')", false), Ok(Value::Null));
        assert_eq!(eval("if()", false), Ok(Value::Null));
    }

    #[test]
    fn expression_aliases_need_builtins() {
        assert_eq!(eval("abs(-3)", true), Ok(Value::Number(3.0)));
        assert_eq!(eval("rept('ab', 2)", true), Ok(Value::from("abab")));
        assert_eq!(eval("len('héllo')", true), Ok(Value::Number(5.0)));
        assert_eq!(eval("abs(-3)", false), Err(RuntimeError::UndefinedFunction("abs".into())));
    }

    #[test]
    fn locals_shadow_globals() {
        let mut ctx = ExecContext::new();
        ctx.globals.insert("x".into(), Value::Number(1.0));
        let mut locals = Locals::new();
        locals.insert("x".into(), Value::Number(2.0));
        let expr = parse_expression("x").expect("parses");
        assert_eq!(evaluate_expression(&expr, &mut ctx, Some(&locals), false), Ok(Value::Number(2.0)));
        assert_eq!(evaluate_expression(&expr, &mut ctx, None, false), Ok(Value::Number(1.0)));
    }

    // ── Faults ───────────────────────────────────────────────────────────────

    #[test]
    fn faults_become_null_and_log_in_debug() {
        let (lines, mut ctx) = logging();
        ctx.globals.insert(
            "broken".into(),
            Value::Function(Function::host(|_, _| Err(CallError::fault("bad input")))),
        );
        assert_eq!(run_with("return broken()", &mut ctx), Ok(Value::Null));
        assert!(lines.lock().unwrap().is_empty());

        ctx.debug = true;
        assert_eq!(run_with("return broken()", &mut ctx), Ok(Value::Null));
        assert_eq!(
            *lines.lock().unwrap(),
            vec![r#"bare: Function "broken" failed with error: bad input"#]
        );
    }

    #[test]
    fn runtime_errors_from_functions_propagate() {
        let mut ctx = ExecContext::new();
        ctx.globals.insert(
            "fatal".into(),
            Value::Function(Function::host(|_, _| Err(RuntimeError::UnknownLabel("x".into()).into()))),
        );
        assert_eq!(run_with("y = fatal()", &mut ctx), Err(RuntimeError::UnknownLabel("x".into())));

        // Runtime errors inside script functions are not swallowed either.
        let src = "function f():\n    jump missing\nendfunction\nreturn f()";
        assert_eq!(run(src), Err(RuntimeError::UnknownLabel("missing".into())));
    }

    #[test]
    fn library_faults_are_swallowed() {
        assert_eq!(run("return numberParseInt('x')"), Ok(Value::Null));
        assert_eq!(run("return stringSplit(null, ', ')"), Ok(Value::Null));
        assert_eq!(run("return jsonParse('{')"), Ok(Value::Null));
    }

    #[test]
    fn host_functions_can_call_back() {
        let mut ctx = ExecContext::new();
        ctx.globals.insert(
            "twice".into(),
            Value::Function(Function::host(|args, ctx| match args.first() {
                Some(Value::Function(f)) => {
                    let once = f.call(vec![Value::Number(1.0)], ctx)?;
                    f.call(vec![once], ctx)
                }
                _ => Ok(Value::Null),
            })),
        );
        let src = "function inc(x):\n    return x + 1\nendfunction\nreturn twice(inc)";
        assert_eq!(run_with(src, &mut ctx), Ok(Value::Number(3.0)));
    }

    #[test]
    fn partial_application() {
        let src = "\
function add(a, b):
    return a + b
endfunction
add10 = systemPartial(add, 10)
return add10(5)
";
        assert_eq!(value(src), "15");
    }

    #[test]
    fn array_sort_with_script_comparator() {
        let src = "\
function desc(a, b):
    return b - a
endfunction
return arraySort(arrayNew(3, 1, 2), desc)
";
        assert_eq!(value(src), "[3,2,1]");
    }

    #[test]
    fn system_log_reaches_host() {
        let (lines, mut ctx) = logging();
        run_with("systemLog('hello ' + 1)\nsystemLogDebug('hidden')", &mut ctx).expect("runs");
        assert_eq!(*lines.lock().unwrap(), vec!["hello 1"]);
    }

    // ── Includes ─────────────────────────────────────────────────────────────

    fn fetching(files: &'static [(&'static str, &'static str)]) -> (Arc<Mutex<Vec<String>>>, ExecContext) {
        let fetched = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&fetched);
        let ctx = ExecContext::new().with_fetch(move |url: &str| {
            if let Ok(mut urls) = record.lock() {
                urls.push(url.to_owned());
            }
            files
                .iter()
                .find(|(name, _)| *name == url)
                .map(|(_, text)| (*text).to_owned())
                .ok_or_else(|| format!("not found: {url}"))
        });
        (fetched, ctx)
    }

    #[test]
    fn include_shares_globals() {
        let (_, mut ctx) = fetching(&[("lib.bare", "x = 41\nfunction double(n):\n    return n * 2\nendfunction")]);
        assert_eq!(run_with("include 'lib.bare'\nreturn double(x + 1)", &mut ctx), Ok(Value::Number(84.0)));
    }

    #[test]
    fn nested_include_resolves_relative_to_includer() {
        let (fetched, mut ctx) = fetching(&[
            ("lib/a.bare", "include 'b.bare'\ninclude '/root.bare'\na = b + 1"),
            ("lib/b.bare", "b = 1"),
            ("/root.bare", "r = 'root'"),
        ]);
        assert_eq!(run_with("include 'lib/a.bare'\nreturn arrayNew(a, r)", &mut ctx).map(|v| v.to_string()), Ok(r#"[2,"root"]"#.to_owned()));
        assert_eq!(*fetched.lock().unwrap(), vec!["lib/a.bare", "lib/b.bare", "/root.bare"]);
        // The host resolver is restored after the include.
        assert!(ctx.url_resolve.is_none());
    }

    #[test]
    fn system_include_uses_prefix() {
        let (fetched, ctx) = fetching(&[("https://sys/util.bare", "u = 1"), ("/abs.bare", "v = 2")]);
        let mut ctx = ctx.with_system_prefix("https://sys/");
        assert_eq!(run_with("include <util.bare>\ninclude </abs.bare>\nreturn u + v", &mut ctx), Ok(Value::Number(3.0)));
        assert_eq!(*fetched.lock().unwrap(), vec!["https://sys/util.bare", "/abs.bare"]);
    }

    #[test]
    fn host_resolver_applies_to_includes() {
        let (fetched, ctx) = fetching(&[("http://x/lib.bare", "y = 1")]);
        let mut ctx = ctx.with_url_resolve(|url: &str| format!("http://x/{url}"));
        assert_eq!(run_with("include 'lib.bare'\nreturn y", &mut ctx), Ok(Value::Number(1.0)));
        assert_eq!(*fetched.lock().unwrap(), vec!["http://x/lib.bare"]);
    }

    #[test]
    fn include_failures() {
        let (_, mut ctx) = fetching(&[("bad.bare", "a = 1 +")]);
        assert_eq!(
            run_with("include 'missing.bare'", &mut ctx),
            Err(RuntimeError::IncludeFailed("missing.bare".into()))
        );
        let err = run_with("include 'bad.bare'", &mut ctx).unwrap_err();
        let RuntimeError::IncludeParse(parse) = &err else {
            panic!("expected include parse error, got {err:?}");
        };
        assert_eq!(parse.prefix.as_deref(), Some("Included from \"bad.bare\""));
        assert!(err.to_string().starts_with("Included from \"bad.bare\"\nSyntax error, line number 1:"));

        let mut ctx = ExecContext::new();
        assert_eq!(run_with("include 'x.bare'", &mut ctx), Err(RuntimeError::IncludeFailed("x.bare".into())));
    }

    #[test]
    fn include_lint_warnings_logged_in_debug() {
        let (_, ctx) = fetching(&[("lib.bare", "x = 1\nx")]);
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let mut ctx = ctx.with_debug(true).with_log(move |msg: &str| {
            if let Ok(mut lines) = sink.lock() {
                lines.push(msg.to_owned());
            }
        });
        run_with("include 'lib.bare'", &mut ctx).expect("runs");
        assert_eq!(
            *lines.lock().unwrap(),
            vec![
                r#"bare: Include "lib.bare" static analysis... 1 warning:"#.to_owned(),
                "bare:     Pointless global statement (index 1)".to_owned(),
            ]
        );
    }

    #[test]
    fn include_statements_count_toward_budget() {
        let (_, ctx) = fetching(&[("lib.bare", "a = 1\nb = 2\nc = 3")]);
        let mut ctx = ctx.with_max_statements(3);
        assert_eq!(run_with("include 'lib.bare'", &mut ctx), Err(RuntimeError::MaxStatements(3)));
    }

    #[test]
    fn run_script_reports_both_error_kinds() {
        let mut ctx = ExecContext::new();
        assert!(matches!(run_script("a = (", &mut ctx), Err(ScriptError::Parse(_))));
        assert!(matches!(run_script("jump x", &mut ctx), Err(ScriptError::Runtime(_))));
        assert_eq!(run_script("return 6 * 7", &mut ctx), Ok(Value::Number(42.0)));
    }

    #[test]
    fn url_helpers() {
        assert!(is_relative_url("lib.bare"));
        assert!(is_relative_url("dir/lib.bare"));
        assert!(!is_relative_url("/lib.bare"));
        assert!(!is_relative_url("https://x/lib.bare"));
        assert!(!is_relative_url("?q"));
        assert!(!is_relative_url("#frag"));
        assert_eq!(base_url("a/b/c.bare"), "a/b/");
        assert_eq!(base_url("c.bare"), "");
    }
}
