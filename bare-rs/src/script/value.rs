//! Runtime value type for the scripting language.
//!
//! Values are dynamically typed.  Arrays and objects are reference types:
//! library functions such as `arrayPush` mutate them in place, and every
//! variable holding the same array observes the change.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, SecondsFormat};
use indexmap::IndexMap;

use super::error::CallError;
use super::interp::ExecContext;
use super::stmt::FunctionDef;

pub type Array = Rc<RefCell<Vec<Value>>>;
pub type Object = Rc<RefCell<IndexMap<String, Value>>>;

/// Signature of a host-provided function value.
pub type HostFn = dyn Fn(&[Value], &mut ExecContext) -> Result<Value, CallError>;

/// A script runtime value.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Datetime(DateTime<FixedOffset>),
    Array(Array),
    Object(Object),
    Function(Function),
    /// Regular expressions are not implemented; the variant exists so the
    /// type tag is reserved.
    Regex,
}

/// A callable value.
#[derive(Clone)]
pub enum Function {
    /// A standard library function, dispatched by name.
    Native(&'static str),
    /// A function defined by a script `function` statement.
    Script(Arc<FunctionDef>),
    /// A function supplied by the host application.
    Host(Rc<HostFn>),
    /// A function with leading arguments already bound (`systemPartial`).
    Partial(Rc<Function>, Rc<[Value]>),
}

impl Function {
    /// Wrap a host closure as a function value.
    pub fn host<F>(f: F) -> Function
    where
        F: Fn(&[Value], &mut ExecContext) -> Result<Value, CallError> + 'static,
    {
        Function::Host(Rc::new(f))
    }

    fn same(&self, other: &Function) -> bool {
        match (self, other) {
            (Function::Native(a), Function::Native(b)) => a == b,
            (Function::Script(a), Function::Script(b)) => Arc::ptr_eq(a, b),
            (Function::Host(a), Function::Host(b)) => Rc::ptr_eq(a, b),
            (Function::Partial(fa, aa), Function::Partial(fb, ab)) => {
                fa.same(fb) && aa.len() == ab.len() && aa.iter().zip(ab.iter()).all(|(x, y)| x == y)
            }
            _ => false,
        }
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Function::Native(name) => write!(f, "Native({name})"),
            Function::Script(def) => write!(f, "Script({})", def.name),
            Function::Host(_) => f.write_str("Host"),
            Function::Partial(func, args) => write!(f, "Partial({func:?}, {} args)", args.len()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Number(x) => write!(f, "Number({x})"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::Datetime(dt) => write!(f, "Datetime({})", dt.to_rfc3339()),
            Value::Array(a) => f.debug_tuple("Array").field(&*a.borrow()).finish(),
            Value::Object(o) => f.debug_tuple("Object").field(&*o.borrow()).finish(),
            Value::Function(func) => write!(f, "Function({func:?})"),
            Value::Regex => f.write_str("Regex"),
        }
    }
}

/// Structural equality: arrays and objects compare by contents, functions by
/// identity.  This is stricter than [`Value::compare`], which treats all
/// objects as equal.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) | (Value::Regex, Value::Regex) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Datetime(a), Value::Datetime(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Value::Function(a), Value::Function(b)) => a.same(b),
            _ => false,
        }
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Number(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(values: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(values)))
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(map: IndexMap<String, Value>) -> Self {
        Value::Object(Rc::new(RefCell::new(map)))
    }
}

impl From<Function> for Value {
    fn from(func: Function) -> Self {
        Value::Function(func)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(x) => f.write_str(&number_string(*x)),
            Value::Str(s) => f.write_str(s),
            Value::Datetime(dt) => f.write_str(&datetime_string(dt)),
            Value::Array(_) | Value::Object(_) => {
                let json = to_json(self, false).unwrap_or(serde_json::Value::Null);
                f.write_str(&json.to_string())
            }
            Value::Function(_) => f.write_str("<function>"),
            Value::Regex => f.write_str("<regex>"),
        }
    }
}

impl Value {
    /// Create an array value.
    pub fn array(values: Vec<Value>) -> Value {
        values.into()
    }

    /// Create an object value.
    pub fn object(map: IndexMap<String, Value>) -> Value {
        map.into()
    }

    /// Coerce to boolean.  Empty arrays are false but empty objects are
    /// true.
    pub fn as_bool(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(x) => *x != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Array(a) => !a.borrow().is_empty(),
            Value::Datetime(_) | Value::Object(_) | Value::Function(_) | Value::Regex => true,
        }
    }

    /// The number, if this is a number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(x) => Some(*x),
            _ => None,
        }
    }

    /// The number, if this is an integral number.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Number(x) if x.is_finite() && x.fract() == 0.0 => Some(*x as i64),
            _ => None,
        }
    }

    /// The string slice, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Name of the type, as returned by `systemType()`.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Datetime(_) => "datetime",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
            Value::Regex => "regex",
        }
    }

    /// Total ordering used by comparison operators and `arraySort`.
    ///
    /// Null sorts first.  Values of different types order by type name, so
    /// objects, functions and regexes of any content compare equal to others
    /// of the same type.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => {
                if a < b {
                    Ordering::Less
                } else if a == b {
                    Ordering::Equal
                } else {
                    Ordering::Greater
                }
            }
            (Value::Datetime(a), Value::Datetime(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => {
                // Clone out so a comparison never holds two borrows of the
                // same cell.
                let a = a.borrow().clone();
                let b = b.borrow().clone();
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.compare(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => self.type_name().cmp(other.type_name()),
        }
    }
}

/// Format a number the shortest way that round-trips, without a trailing
/// `.0`.
///
/// Decimal exponents below -4 or from 16 up use exponent form with a signed,
/// at least two-digit exponent: `1e+21`, `1.5e-07`.
pub fn number_string(x: f64) -> String {
    if x.is_nan() {
        return "NaN".to_owned();
    }
    if x.is_infinite() {
        return if x > 0.0 { "Infinity" } else { "-Infinity" }.to_owned();
    }
    let sci = format!("{x:e}");
    if let Some((mantissa, exp)) = sci.split_once('e') {
        if let Ok(exp) = exp.parse::<i32>() {
            if x != 0.0 && !(-4..16).contains(&exp) {
                let sign = if exp < 0 { '-' } else { '+' };
                return format!("{mantissa}e{sign}{:02}", exp.abs());
            }
        }
    }
    format!("{x}")
}

/// ISO-8601 with the value's own UTC offset.
pub fn datetime_string(dt: &DateTime<FixedOffset>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::AutoSi, false)
}

// ── JSON bridge ───────────────────────────────────────────────────────────────

/// Convert a value to JSON with object keys sorted.
///
/// With `strict`, values that have no JSON form (functions, regexes,
/// non-finite numbers) are an error.  Otherwise they become `null`.
pub fn to_json(value: &Value, strict: bool) -> Result<serde_json::Value, String> {
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Number(x) => match json_number(*x) {
            Some(n) => n,
            None if strict => return Err(format!("{} is not JSON serializable", number_string(*x))),
            None => serde_json::Value::Null,
        },
        Value::Str(s) => serde_json::Value::String(s.clone()),
        Value::Datetime(dt) => serde_json::Value::String(datetime_string(dt)),
        Value::Array(a) => {
            let items = a.borrow().clone();
            serde_json::Value::Array(items.iter().map(|v| to_json(v, strict)).collect::<Result<_, _>>()?)
        }
        Value::Object(o) => {
            let mut entries: Vec<(String, Value)> =
                o.borrow().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut map = serde_json::Map::new();
            for (k, v) in entries {
                map.insert(k, to_json(&v, strict)?);
            }
            serde_json::Value::Object(map)
        }
        Value::Function(_) | Value::Regex if strict => {
            return Err(format!("{} is not JSON serializable", value.type_name()));
        }
        Value::Function(_) | Value::Regex => serde_json::Value::Null,
    })
}

fn json_number(x: f64) -> Option<serde_json::Value> {
    if x.fract() == 0.0 && x.abs() < 9.007_199_254_740_992e15 {
        Some(serde_json::Value::from(x as i64))
    } else {
        serde_json::Number::from_f64(x).map(serde_json::Value::Number)
    }
}

/// Convert parsed JSON to a value, preserving object key order.
pub fn from_json(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::String(s) => Value::Str(s),
        serde_json::Value::Array(items) => Value::array(items.into_iter().map(from_json).collect()),
        serde_json::Value::Object(map) => {
            Value::object(map.into_iter().map(|(k, v)| (k, from_json(v))).collect())
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
