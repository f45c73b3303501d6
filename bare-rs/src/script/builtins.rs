//! Standard library functions.
//!
//! Each function receives a slice of already-evaluated arguments and the
//! execution context.  Functions are total over malformed input: a wrong
//! argument type or an out-of-range index gives null (or -1 for the search
//! functions).  A [`CallError::Fault`] is swallowed at the call site and also
//! gives null.  The dispatcher is called from [`Function::call`].

use std::cmp::Ordering;
use std::rc::Rc;

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, Local, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc,
};
use indexmap::IndexMap;
use serde::Serialize;
use tracing::trace;

use super::error::CallError;
use super::interp::ExecContext;
use super::value::{from_json, number_string, to_json, Array, Function, Object, Value};

/// Library function names.  Each is installed into script globals under this
/// name when a script executes.
pub const SCRIPT_FUNCTIONS: &[&str] = &[
    // Array
    "arrayCopy",
    "arrayExtend",
    "arrayGet",
    "arrayIndexOf",
    "arrayJoin",
    "arrayLastIndexOf",
    "arrayLength",
    "arrayNew",
    "arrayNewSize",
    "arrayPop",
    "arrayPush",
    "arraySet",
    "arrayShift",
    "arraySlice",
    "arraySort",
    // Datetime
    "datetimeAdd",
    "datetimeDay",
    "datetimeDiff",
    "datetimeHour",
    "datetimeISOFormat",
    "datetimeISOParse",
    "datetimeMillisecond",
    "datetimeMinute",
    "datetimeMonth",
    "datetimeNew",
    "datetimeNewUTC",
    "datetimeNow",
    "datetimeSecond",
    "datetimeToday",
    "datetimeYear",
    // JSON
    "jsonParse",
    "jsonStringify",
    // Math
    "mathAbs",
    "mathAcos",
    "mathAsin",
    "mathAtan",
    "mathAtan2",
    "mathCeil",
    "mathCos",
    "mathFloor",
    "mathLn",
    "mathLog",
    "mathMax",
    "mathMin",
    "mathPi",
    "mathRandom",
    "mathRound",
    "mathSign",
    "mathSin",
    "mathSqrt",
    "mathTan",
    // Number
    "numberParseFloat",
    "numberParseInt",
    "numberToFixed",
    // Object
    "objectCopy",
    "objectDelete",
    "objectGet",
    "objectHas",
    "objectKeys",
    "objectNew",
    "objectSet",
    // Regex
    "regexNew",
    // String
    "stringCharCodeAt",
    "stringEndsWith",
    "stringFromCharCode",
    "stringIndexOf",
    "stringLastIndexOf",
    "stringLength",
    "stringLower",
    "stringNew",
    "stringRepeat",
    "stringReplace",
    "stringSlice",
    "stringSplit",
    "stringStartsWith",
    "stringTrim",
    "stringUpper",
    // System
    "systemFetch",
    "systemGlobalGet",
    "systemGlobalSet",
    "systemLog",
    "systemLogDebug",
    "systemPartial",
    "systemType",
];

/// Short names available to expressions evaluated with builtins enabled,
/// paired with the library function each one calls.
pub const EXPRESSION_FUNCTIONS: &[(&str, &str)] = &[
    ("abs", "mathAbs"),
    ("acos", "mathAcos"),
    ("asin", "mathAsin"),
    ("atan", "mathAtan"),
    ("atan2", "mathAtan2"),
    ("ceil", "mathCeil"),
    ("charCodeAt", "stringCharCodeAt"),
    ("cos", "mathCos"),
    ("date", "datetimeNew"),
    ("dateAdd", "datetimeAdd"),
    ("dateDiff", "datetimeDiff"),
    ("day", "datetimeDay"),
    ("endsWith", "stringEndsWith"),
    ("indexOf", "stringIndexOf"),
    ("fixed", "numberToFixed"),
    ("floor", "mathFloor"),
    ("fromCharCode", "stringFromCharCode"),
    ("hour", "datetimeHour"),
    ("lastIndexOf", "stringLastIndexOf"),
    ("len", "stringLength"),
    ("lower", "stringLower"),
    ("ln", "mathLn"),
    ("log", "mathLog"),
    ("max", "mathMax"),
    ("min", "mathMin"),
    ("millisecond", "datetimeMillisecond"),
    ("minute", "datetimeMinute"),
    ("month", "datetimeMonth"),
    ("now", "datetimeNow"),
    ("parseInt", "numberParseInt"),
    ("parseFloat", "numberParseFloat"),
    ("pi", "mathPi"),
    ("rand", "mathRandom"),
    ("replace", "stringReplace"),
    ("rept", "stringRepeat"),
    ("round", "mathRound"),
    ("second", "datetimeSecond"),
    ("sign", "mathSign"),
    ("sin", "mathSin"),
    ("slice", "stringSlice"),
    ("sqrt", "mathSqrt"),
    ("startsWith", "stringStartsWith"),
    ("text", "stringNew"),
    ("tan", "mathTan"),
    ("today", "datetimeToday"),
    ("trim", "stringTrim"),
    ("upper", "stringUpper"),
    ("year", "datetimeYear"),
];

/// Look up a library function by its full name.
pub fn script_function(name: &str) -> Option<Function> {
    SCRIPT_FUNCTIONS.iter().find(|&&n| n == name).map(|&n| Function::Native(n))
}

/// Look up a library function by its expression alias.
pub fn expression_function(name: &str) -> Option<Function> {
    EXPRESSION_FUNCTIONS
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|&(_, n)| Function::Native(n))
}

/// Dispatch a library function call.
///
/// Returns `None` if `name` is not a library function.
pub fn call_builtin(name: &str, args: &[Value], ctx: &mut ExecContext) -> Option<Result<Value, CallError>> {
    trace!(name, args = args.len(), "builtin");
    Some(match name {
        // ── Array ────────────────────────────────────────────────────────────
        "arrayCopy" => total(array_copy(args)),
        "arrayExtend" => total(array_extend(args)),
        "arrayGet" => total(array_get(args)),
        "arrayIndexOf" => array_index_of(args, ctx, false),
        "arrayJoin" => total(array_join(args)),
        "arrayLastIndexOf" => array_index_of(args, ctx, true),
        "arrayLength" => total(array(args, 0).map(|a| len_value(a.borrow().len()))),
        "arrayNew" => Ok(Value::array(args.to_vec())),
        "arrayNewSize" => array_new_size(args),
        "arrayPop" => total(array(args, 0).and_then(|a| a.borrow_mut().pop())),
        "arrayPush" => total(array_push(args)),
        "arraySet" => total(array_set(args)),
        "arrayShift" => total(array_shift(args)),
        "arraySlice" => total(array_slice(args)),
        "arraySort" => array_sort(args, ctx),

        // ── Datetime ─────────────────────────────────────────────────────────
        "datetimeAdd" => total(datetime_add(args)),
        "datetimeDay" => datetime_field(args, |dt| dt.day().into()),
        "datetimeDiff" => total(datetime_diff(args)),
        "datetimeHour" => datetime_field(args, |dt| dt.hour().into()),
        "datetimeISOFormat" => total(datetime_iso_format(args)),
        "datetimeISOParse" => total(string(args, 0).and_then(parse_iso_datetime).map(Value::Datetime)),
        "datetimeMillisecond" => datetime_field(args, |dt| {
            round_helper(f64::from(dt.nanosecond() % 1_000_000_000) / 1_000_000.0, 0)
        }),
        "datetimeMinute" => datetime_field(args, |dt| dt.minute().into()),
        "datetimeMonth" => datetime_field(args, |dt| dt.month().into()),
        "datetimeNew" => total(datetime_new(args, false)),
        "datetimeNewUTC" => total(datetime_new(args, true)),
        "datetimeNow" => Ok(Value::Datetime(Local::now().fixed_offset())),
        "datetimeSecond" => datetime_field(args, |dt| dt.second().into()),
        "datetimeToday" => total(datetime_today()),
        "datetimeYear" => datetime_field(args, |dt| dt.year().into()),

        // ── JSON ─────────────────────────────────────────────────────────────
        "jsonParse" => json_parse(args),
        "jsonStringify" => json_stringify(args),

        // ── Math ─────────────────────────────────────────────────────────────
        "mathAbs" => math1(args, f64::abs),
        "mathAcos" => math1(args, f64::acos),
        "mathAsin" => math1(args, f64::asin),
        "mathAtan" => math1(args, f64::atan),
        "mathAtan2" => total(number(args, 0).zip(number(args, 1)).map(|(y, x)| y.atan2(x).into())),
        "mathCeil" => math1(args, f64::ceil),
        "mathCos" => math1(args, f64::cos),
        "mathFloor" => math1(args, f64::floor),
        "mathLn" => total(number(args, 0).filter(|&x| x > 0.0).map(|x| x.ln().into())),
        "mathLog" => total(math_log(args)),
        "mathMax" => total(math_extreme(args, Ordering::Greater)),
        "mathMin" => total(math_extreme(args, Ordering::Less)),
        "mathPi" => Ok(Value::Number(std::f64::consts::PI)),
        "mathRandom" => Ok(Value::Number(rand::random::<f64>())),
        "mathRound" => total(math_round(args)),
        "mathSign" => total(number(args, 0).map(math_sign)),
        "mathSin" => math1(args, f64::sin),
        "mathSqrt" => math1(args, f64::sqrt),
        "mathTan" => math1(args, f64::tan),

        // ── Number ───────────────────────────────────────────────────────────
        "numberParseFloat" => number_parse_float(args),
        "numberParseInt" => number_parse_int(args),
        "numberToFixed" => number_to_fixed(args),

        // ── Object ───────────────────────────────────────────────────────────
        "objectCopy" => total(object(args, 0).map(|o| Value::object(o.borrow().clone()))),
        "objectDelete" => {
            if let (Some(o), Some(key)) = (object(args, 0), string(args, 1)) {
                o.borrow_mut().shift_remove(key);
            }
            Ok(Value::Null)
        }
        "objectGet" => Ok(object_get(args)),
        "objectHas" => total(object(args, 0).zip(string(args, 1)).map(|(o, key)| o.borrow().contains_key(key).into())),
        "objectKeys" => total(object(args, 0).map(|o| {
            Value::array(o.borrow().keys().map(|k| Value::from(k.as_str())).collect())
        })),
        "objectNew" => Ok(object_new(args)),
        "objectSet" => total(object_set(args)),

        // ── Regex ────────────────────────────────────────────────────────────
        "regexNew" => Ok(Value::Null),

        // ── String ───────────────────────────────────────────────────────────
        "stringCharCodeAt" => total(string_char_code_at(args)),
        "stringEndsWith" => total(string(args, 0).zip(string(args, 1)).map(|(s, x)| s.ends_with(x).into())),
        "stringFromCharCode" => string_from_char_code(args),
        "stringIndexOf" => Ok(string_index_of(args)),
        "stringLastIndexOf" => Ok(string_last_index_of(args)),
        "stringLength" => total(string(args, 0).map(|s| len_value(s.chars().count()))),
        "stringLower" => total(string(args, 0).map(|s| s.to_lowercase().into())),
        "stringNew" => Ok(Value::Str(arg(args, 0).to_string())),
        "stringRepeat" => string_repeat(args),
        "stringReplace" => total(string_replace(args)),
        "stringSlice" => total(string_slice(args)),
        "stringSplit" => string_split(args),
        "stringStartsWith" => total(string(args, 0).zip(string(args, 1)).map(|(s, x)| s.starts_with(x).into())),
        "stringTrim" => total(string(args, 0).map(|s| s.trim().into())),
        "stringUpper" => total(string(args, 0).map(|s| s.to_uppercase().into())),

        // ── System ───────────────────────────────────────────────────────────
        "systemFetch" => Ok(system_fetch(args, ctx)),
        "systemGlobalGet" => Ok(string(args, 0)
            .and_then(|name| ctx.globals.get(name).cloned())
            .unwrap_or_default()),
        "systemGlobalSet" => {
            let value = arg(args, 1);
            if let Some(name) = string(args, 0) {
                ctx.globals.insert(name.to_owned(), value.clone());
            }
            Ok(value)
        }
        "systemLog" => {
            ctx.log(&arg(args, 0).to_string());
            Ok(Value::Null)
        }
        "systemLogDebug" => {
            if ctx.debug {
                ctx.log(&arg(args, 0).to_string());
            }
            Ok(Value::Null)
        }
        "systemPartial" => system_partial(args),
        "systemType" => Ok(Value::from(arg(args, 0).type_name())),

        _ => return None,
    })
}

// ── Argument helpers ──────────────────────────────────────────────────────────

/// Largest string or array, in bytes, that one library call will build.
const MAX_BUILD_BYTES: usize = 1 << 28;

/// Most fraction digits `numberToFixed` will format.
const MAX_FIXED_DIGITS: usize = 100;

fn total(value: Option<Value>) -> Result<Value, CallError> {
    Ok(value.unwrap_or_default())
}

/// Bytes needed for `count` items of `item_size` bytes, faulting past
/// [`MAX_BUILD_BYTES`].
fn build_size(item_size: usize, count: usize) -> Result<usize, CallError> {
    item_size
        .checked_mul(count)
        .filter(|&bytes| bytes <= MAX_BUILD_BYTES)
        .ok_or_else(|| CallError::fault(format!("result of {count} items is too large")))
}

/// A string of `count` copies of `s`, built without aborting on allocation
/// failure.
fn repeat_str(s: &str, count: usize) -> Result<String, CallError> {
    let bytes = build_size(s.len(), count)?;
    let mut out = String::new();
    out.try_reserve_exact(bytes).map_err(|err| CallError::fault(err.to_string()))?;
    if !s.is_empty() {
        for _ in 0..count {
            out.push_str(s);
        }
    }
    Ok(out)
}

fn arg(args: &[Value], ix: usize) -> Value {
    args.get(ix).cloned().unwrap_or_default()
}

fn is_missing(args: &[Value], ix: usize) -> bool {
    args.get(ix).map_or(true, Value::is_null)
}

fn number(args: &[Value], ix: usize) -> Option<f64> {
    args.get(ix)?.as_number()
}

fn integer(args: &[Value], ix: usize) -> Option<i64> {
    args.get(ix)?.as_integer()
}

/// An optional integer argument: absent or null gives `default`, anything
/// else must be integral.
fn integer_or(args: &[Value], ix: usize, default: i64) -> Option<i64> {
    if is_missing(args, ix) {
        Some(default)
    } else {
        integer(args, ix)
    }
}

fn string(args: &[Value], ix: usize) -> Option<&str> {
    args.get(ix)?.as_str()
}

fn array(args: &[Value], ix: usize) -> Option<&Array> {
    match args.get(ix)? {
        Value::Array(a) => Some(a),
        _ => None,
    }
}

fn object(args: &[Value], ix: usize) -> Option<&Object> {
    match args.get(ix)? {
        Value::Object(o) => Some(o),
        _ => None,
    }
}

fn datetime(args: &[Value], ix: usize) -> Option<DateTime<FixedOffset>> {
    match args.get(ix)? {
        Value::Datetime(dt) => Some(*dt),
        _ => None,
    }
}

fn len_value(len: usize) -> Value {
    Value::Number(len as f64)
}

/// `ix` as a position in a sequence of length `len`.
fn index_in(ix: i64, len: usize) -> Option<usize> {
    usize::try_from(ix).ok().filter(|&ix| ix < len)
}

// ── Array ─────────────────────────────────────────────────────────────────────

fn array_copy(args: &[Value]) -> Option<Value> {
    Some(Value::array(array(args, 0)?.borrow().clone()))
}

fn array_extend(args: &[Value]) -> Option<Value> {
    let target = array(args, 0)?;
    // Clone first: extending an array with itself must not double-borrow.
    let extra = array(args, 1)?.borrow().clone();
    target.borrow_mut().extend(extra);
    Some(args[0].clone())
}

fn array_get(args: &[Value]) -> Option<Value> {
    let a = array(args, 0)?.borrow();
    let ix = index_in(integer(args, 1)?, a.len())?;
    Some(a[ix].clone())
}

/// `arrayIndexOf` and `arrayLastIndexOf`.  The search value may be a
/// predicate function, called with each element.
fn array_index_of(args: &[Value], ctx: &mut ExecContext, last: bool) -> Result<Value, CallError> {
    let not_found = Ok(Value::Number(-1.0));
    let Some(a) = array(args, 0) else {
        return not_found;
    };
    let len = a.borrow().len();
    let default = if last { len as i64 - 1 } else { 0 };
    let Some(start) = integer_or(args, 2, default).and_then(|ix| index_in(ix, len)) else {
        return not_found;
    };
    let needle = arg(args, 1);
    let positions: Box<dyn Iterator<Item = usize>> = if last {
        Box::new((0..=start).rev())
    } else {
        Box::new(start..len)
    };
    for ix in positions {
        // The predicate may resize the array.
        let Some(item) = a.borrow().get(ix).cloned() else {
            continue;
        };
        let found = match &needle {
            Value::Function(f) => f.call(vec![item], ctx)?.as_bool(),
            _ => item.compare(&needle) == Ordering::Equal,
        };
        if found {
            return Ok(len_value(ix));
        }
    }
    not_found
}

fn array_join(args: &[Value]) -> Option<Value> {
    let separator = string(args, 1)?;
    let items = array(args, 0)?.borrow();
    let parts: Vec<String> = items.iter().map(Value::to_string).collect();
    Some(parts.join(separator).into())
}

fn array_new_size(args: &[Value]) -> Result<Value, CallError> {
    let Some(size) = integer_or(args, 0, 0).and_then(|n| usize::try_from(n).ok()) else {
        return Ok(Value::Null);
    };
    build_size(std::mem::size_of::<Value>(), size)?;
    let mut items = Vec::new();
    items.try_reserve_exact(size).map_err(|err| CallError::fault(err.to_string()))?;
    items.resize(size, args.get(1).cloned().unwrap_or(Value::Number(0.0)));
    Ok(Value::array(items))
}

fn array_push(args: &[Value]) -> Option<Value> {
    array(args, 0)?.borrow_mut().extend(args[1..].iter().cloned());
    Some(args[0].clone())
}

fn array_set(args: &[Value]) -> Option<Value> {
    let mut a = array(args, 0)?.borrow_mut();
    let ix = index_in(integer(args, 1)?, a.len())?;
    let value = arg(args, 2);
    a[ix] = value.clone();
    Some(value)
}

fn array_shift(args: &[Value]) -> Option<Value> {
    let mut a = array(args, 0)?.borrow_mut();
    if a.is_empty() {
        None
    } else {
        Some(a.remove(0))
    }
}

fn array_slice(args: &[Value]) -> Option<Value> {
    let a = array(args, 0)?.borrow();
    let len = a.len();
    let start = index_in(integer_or(args, 1, 0)?, len)?;
    let end = usize::try_from(integer_or(args, 2, len as i64)?).ok().filter(|&end| end <= len)?;
    Some(Value::array(a.get(start..end).map(<[Value]>::to_vec).unwrap_or_default()))
}

/// Sort in place with an optional comparator function and return the array.
fn array_sort(args: &[Value], ctx: &mut ExecContext) -> Result<Value, CallError> {
    let Some(a) = array(args, 0) else {
        return Ok(Value::Null);
    };
    let compare_fn = match args.get(1) {
        None | Some(Value::Null) => None,
        Some(Value::Function(f)) => Some(f.clone()),
        Some(_) => return Ok(Value::Null),
    };
    let items = a.borrow().clone();
    let sorted = match compare_fn {
        None => merge_sort(items, &mut |x: &Value, y: &Value| Ok(x.compare(y))),
        Some(f) => merge_sort(items, &mut |x: &Value, y: &Value| {
            let result = f.call(vec![x.clone(), y.clone()], ctx)?;
            let n = result
                .as_number()
                .ok_or_else(|| CallError::fault(format!("comparison returned {}", result.type_name())))?;
            Ok(n.partial_cmp(&0.0).unwrap_or(Ordering::Equal))
        }),
    }?;
    *a.borrow_mut() = sorted;
    Ok(args[0].clone())
}

/// Stable merge sort with a fallible comparator.  A script comparator may be
/// inconsistent or fail part-way, so the standard library sort is not used.
fn merge_sort<F>(mut items: Vec<Value>, cmp: &mut F) -> Result<Vec<Value>, CallError>
where
    F: FnMut(&Value, &Value) -> Result<Ordering, CallError>,
{
    if items.len() <= 1 {
        return Ok(items);
    }
    let right = items.split_off(items.len() / 2);
    let left = merge_sort(items, cmp)?;
    let right = merge_sort(right, cmp)?;

    let mut out = Vec::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();
    while let (Some(l), Some(r)) = (left.peek(), right.peek()) {
        let take_right = cmp(r, l)? == Ordering::Less;
        let next = if take_right { right.next() } else { left.next() };
        out.extend(next);
    }
    out.extend(left);
    out.extend(right);
    Ok(out)
}

// ── Datetime ──────────────────────────────────────────────────────────────────

fn datetime_field(args: &[Value], field: fn(DateTime<FixedOffset>) -> f64) -> Result<Value, CallError> {
    total(datetime(args, 0).map(|dt| Value::Number(field(dt))))
}

fn datetime_add(args: &[Value]) -> Option<Value> {
    let dt = datetime(args, 0)?;
    let ms = integer(args, 1)?;
    dt.checked_add_signed(Duration::try_milliseconds(ms)?).map(Value::Datetime)
}

fn datetime_diff(args: &[Value]) -> Option<Value> {
    let delta = datetime(args, 0)? - datetime(args, 1)?;
    let ms = match delta.num_microseconds() {
        Some(us) => us as f64 / 1000.0,
        None => delta.num_milliseconds() as f64,
    };
    Some(round_helper(ms, 0).into())
}

fn datetime_iso_format(args: &[Value]) -> Option<Value> {
    let dt = datetime(args, 0)?;
    let text = if arg(args, 1).as_bool() {
        dt.format("%Y-%m-%d").to_string()
    } else {
        dt.with_timezone(&Utc).fixed_offset().to_rfc3339_opts(chrono::SecondsFormat::AutoSi, false)
    };
    Some(text.into())
}

/// Parse an ISO-8601 date or datetime.  A trailing `Z` means UTC and values
/// without an offset are local time.
fn parse_iso_datetime(text: &str) -> Option<DateTime<FixedOffset>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt);
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%dT%H:%M%:z"] {
        if let Ok(dt) = DateTime::parse_from_str(text, format) {
            return Some(dt);
        }
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return local(naive);
        }
    }
    let date = NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()?;
    local(date.and_hms_opt(0, 0, 0)?)
}

fn local(naive: NaiveDateTime) -> Option<DateTime<FixedOffset>> {
    Local.from_local_datetime(&naive).earliest().map(|dt| dt.fixed_offset())
}

/// `datetimeNew(year, month, day, hour, minute, second, millisecond)`.
/// Out-of-range fields roll over into the next larger one, so month 13 is
/// January of the following year and day 0 is the last day of the previous
/// month.
fn datetime_new(args: &[Value], utc: bool) -> Option<Value> {
    let year = integer(args, 0)?;
    let month = integer(args, 1)?;
    let day = integer(args, 2)?;
    let hour = integer_or(args, 3, 0)?;
    let minute = integer_or(args, 4, 0)?;
    let second = integer_or(args, 5, 0)?;
    let millisecond = integer_or(args, 6, 0)?;
    if !(-10000..=10000).contains(&day) {
        return None;
    }

    let month0 = month.checked_sub(1)?;
    let year = i32::try_from(year.checked_add(month0.div_euclid(12))?).ok()?;
    let month = u32::try_from(month0.rem_euclid(12) + 1).ok()?;
    let offset = Duration::try_days(day - 1)?
        .checked_add(&Duration::try_hours(hour)?)?
        .checked_add(&Duration::try_minutes(minute)?)?
        .checked_add(&Duration::try_seconds(second)?)?
        .checked_add(&Duration::try_milliseconds(millisecond)?)?;
    let naive = NaiveDate::from_ymd_opt(year, month, 1)?
        .and_hms_opt(0, 0, 0)?
        .checked_add_signed(offset)?;

    let dt = if utc {
        Utc.from_utc_datetime(&naive).fixed_offset()
    } else {
        local(naive)?
    };
    Some(Value::Datetime(dt))
}

fn datetime_today() -> Option<Value> {
    local(Local::now().date_naive().and_hms_opt(0, 0, 0)?).map(Value::Datetime)
}

// ── JSON ──────────────────────────────────────────────────────────────────────

fn json_parse(args: &[Value]) -> Result<Value, CallError> {
    let Some(text) = string(args, 0) else {
        return Ok(Value::Null);
    };
    let json: serde_json::Value = serde_json::from_str(text).map_err(|e| CallError::fault(e.to_string()))?;
    Ok(from_json(json))
}

/// `jsonStringify(value, indent)`: compact without an indent, otherwise
/// pretty-printed with `indent` spaces.  Object keys are sorted.
fn json_stringify(args: &[Value]) -> Result<Value, CallError> {
    let indent = if is_missing(args, 1) {
        None
    } else {
        match integer(args, 1).and_then(|n| usize::try_from(n).ok()) {
            Some(n) => Some(n),
            None => return Ok(Value::Null),
        }
    };
    let json = to_json(&arg(args, 0), true).map_err(CallError::Fault)?;
    let text = match indent {
        None => json.to_string(),
        Some(n) => {
            let indent = repeat_str(" ", n)?;
            let mut buf = Vec::new();
            let formatter = serde_json::ser::PrettyFormatter::with_indent(indent.as_bytes());
            let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
            json.serialize(&mut serializer).map_err(|e| CallError::fault(e.to_string()))?;
            String::from_utf8(buf).map_err(|e| CallError::fault(e.to_string()))?
        }
    };
    Ok(text.into())
}

// ── Math ──────────────────────────────────────────────────────────────────────

/// A one-argument math function.  A NaN result from a non-NaN argument is a
/// domain error.
fn math1(args: &[Value], f: fn(f64) -> f64) -> Result<Value, CallError> {
    let Some(x) = number(args, 0) else {
        return Ok(Value::Null);
    };
    let y = f(x);
    if y.is_nan() && !x.is_nan() {
        return Err(CallError::fault("math domain error"));
    }
    Ok(y.into())
}

fn math_log(args: &[Value]) -> Option<Value> {
    let x = number(args, 0).filter(|&x| x > 0.0)?;
    let base = if is_missing(args, 1) { 10.0 } else { number(args, 1)? };
    if base <= 0.0 || base == 1.0 {
        return None;
    }
    let y = if base == 10.0 { x.log10() } else { x.ln() / base.ln() };
    Some(y.into())
}

/// `mathMax` / `mathMin`: the first argument that is not beaten by any other.
/// Every argument must be a number.
fn math_extreme(args: &[Value], want: Ordering) -> Option<Value> {
    let mut best: Option<f64> = None;
    for value in args {
        let x = value.as_number()?;
        best = match best {
            Some(b) if x.partial_cmp(&b) != Some(want) => Some(b),
            _ => Some(x),
        };
    }
    best.map(Value::Number)
}

fn math_round(args: &[Value]) -> Option<Value> {
    let x = number(args, 0)?;
    let digits = integer_or(args, 1, 0).filter(|&d| d >= 0)?;
    Some(round_helper(x, i32::try_from(digits).ok()?).into())
}

/// Round half away from zero to `digits` decimal places.
fn round_helper(x: f64, digits: i32) -> f64 {
    let multiplier = 10f64.powi(digits);
    let shifted = x * multiplier;
    let rounded = if shifted >= 0.0 { (shifted + 0.5).trunc() } else { (shifted - 0.5).trunc() };
    rounded / multiplier
}

fn math_sign(x: f64) -> Value {
    Value::Number(if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    })
}

// ── Number ────────────────────────────────────────────────────────────────────

fn number_parse_float(args: &[Value]) -> Result<Value, CallError> {
    match args.first() {
        Some(Value::Str(s)) => s
            .trim()
            .parse::<f64>()
            .map(Value::Number)
            .map_err(|_| CallError::fault(format!("could not convert string to float: '{s}'"))),
        Some(Value::Number(x)) => Ok(Value::Number(*x)),
        Some(other) => Err(CallError::fault(format!("cannot parse {} as float", other.type_name()))),
        None => Err(CallError::fault("missing argument")),
    }
}

fn number_parse_int(args: &[Value]) -> Result<Value, CallError> {
    let Some(text) = string(args, 0) else {
        return Err(CallError::fault(format!("cannot parse {} as int", arg(args, 0).type_name())));
    };
    let radix = integer_or(args, 1, 10)
        .and_then(|r| u32::try_from(r).ok())
        .filter(|r| (2..=36).contains(r))
        .ok_or_else(|| CallError::fault("int() base must be >= 2 and <= 36"))?;
    i64::from_str_radix(text.trim(), radix)
        .map(|n| Value::Number(n as f64))
        .map_err(|_| CallError::fault(format!("invalid literal for int() with base {radix}: '{text}'")))
}

/// `numberToFixed(x, digits=2, trim)`: fixed-point text, optionally with an
/// all-zero fraction removed.
fn number_to_fixed(args: &[Value]) -> Result<Value, CallError> {
    let (Some(x), Some(digits)) = (number(args, 0), integer_or(args, 1, 2).and_then(|n| usize::try_from(n).ok()))
    else {
        return Ok(Value::Null);
    };
    if digits > MAX_FIXED_DIGITS {
        return Err(CallError::fault(format!("precision {digits} is out of range")));
    }
    if !x.is_finite() {
        return Ok(number_string(x).into());
    }
    let mut text = format!("{x:.digits$}");
    if arg(args, 2).as_bool() {
        if let Some(dot) = text.find('.') {
            if text[dot + 1..].bytes().all(|b| b == b'0') {
                text.truncate(dot);
            }
        }
    }
    Ok(text.into())
}

// ── Object ────────────────────────────────────────────────────────────────────

fn object_get(args: &[Value]) -> Value {
    object(args, 0)
        .zip(string(args, 1))
        .and_then(|(o, key)| o.borrow().get(key).cloned())
        .unwrap_or_else(|| arg(args, 2))
}

/// `objectNew(key1, value1, key2, value2, ...)`.
fn object_new(args: &[Value]) -> Value {
    let mut map = IndexMap::new();
    for pair in args.chunks(2) {
        let key = pair[0].to_string();
        map.insert(key, pair.get(1).cloned().unwrap_or_default());
    }
    Value::object(map)
}

fn object_set(args: &[Value]) -> Option<Value> {
    let o = object(args, 0)?;
    let key = string(args, 1)?;
    let value = arg(args, 2);
    o.borrow_mut().insert(key.to_owned(), value.clone());
    Some(value)
}

// ── String ────────────────────────────────────────────────────────────────────

fn string_char_code_at(args: &[Value]) -> Option<Value> {
    let s = string(args, 0)?;
    let ix = integer(args, 1)?;
    let len = s.chars().count() as i64;
    let ix = if ix < 0 { ix + len } else { ix };
    let c = s.chars().nth(usize::try_from(ix).ok()?)?;
    Some(f64::from(u32::from(c)).into())
}

fn string_from_char_code(args: &[Value]) -> Result<Value, CallError> {
    let mut out = String::new();
    for code in args {
        let c = code
            .as_integer()
            .and_then(|n| u32::try_from(n).ok())
            .and_then(char::from_u32)
            .ok_or_else(|| CallError::fault(format!("invalid character code {code}")))?;
        out.push(c);
    }
    Ok(out.into())
}

/// Clamp a possibly negative character index into `0..=len`.
fn clamp_index(ix: i64, len: usize) -> usize {
    let len = len as i64;
    let ix = if ix < 0 { (ix + len).max(0) } else { ix.min(len) };
    ix as usize
}

fn char_count(s: &str, byte_ix: usize) -> usize {
    s[..byte_ix].chars().count()
}

fn byte_offset(s: &str, char_ix: usize) -> usize {
    s.char_indices().nth(char_ix).map_or(s.len(), |(b, _)| b)
}

fn string_index_of(args: &[Value]) -> Value {
    find_first(args).map_or(Value::Number(-1.0), len_value)
}

fn string_last_index_of(args: &[Value]) -> Value {
    find_last(args).map_or(Value::Number(-1.0), len_value)
}

/// First index of the search string at or after `index`.
fn find_first(args: &[Value]) -> Option<usize> {
    let s = string(args, 0)?;
    let search = string(args, 1)?;
    let len = s.chars().count();
    let raw = integer_or(args, 2, 0)?;
    if raw > len as i64 {
        return None;
    }
    let start = byte_offset(s, clamp_index(raw, len));
    let at = s[start..].find(search)?;
    Some(char_count(s, start + at))
}

/// Last index of the search string starting at or before `index`.
fn find_last(args: &[Value]) -> Option<usize> {
    let s = string(args, 0)?;
    let search = string(args, 1)?;
    let chars: Vec<char> = s.chars().collect();
    let needle: Vec<char> = search.chars().collect();
    let last_start = chars.len().checked_sub(needle.len())?;
    let start = match integer_or(args, 2, last_start as i64)? {
        ix if ix < 0 => 0,
        ix => (ix as usize).min(last_start),
    };
    (0..=start).rev().find(|&ix| chars[ix..ix + needle.len()] == needle[..])
}

fn string_repeat(args: &[Value]) -> Result<Value, CallError> {
    let (Some(s), Some(count)) = (string(args, 0), integer(args, 1).and_then(|n| usize::try_from(n).ok())) else {
        return Ok(Value::Null);
    };
    Ok(repeat_str(s, count)?.into())
}

fn string_replace(args: &[Value]) -> Option<Value> {
    let s = string(args, 0)?;
    let from = string(args, 1)?;
    let to = string(args, 2)?;
    Some(s.replace(from, to).into())
}

/// `stringSlice(string, begin, end)` with negative indices counted from the
/// end.
fn string_slice(args: &[Value]) -> Option<Value> {
    let s = string(args, 0)?;
    let len = s.chars().count();
    let begin = clamp_index(integer_or(args, 1, 0)?, len);
    let end = clamp_index(integer_or(args, 2, len as i64)?, len);
    Some(s.chars().skip(begin).take(end.saturating_sub(begin)).collect::<String>().into())
}

/// `stringSplit(string, separator, maxsplit)`.  A null separator splits on
/// runs of whitespace.
fn string_split(args: &[Value]) -> Result<Value, CallError> {
    let Some(s) = string(args, 0) else {
        return Ok(Value::Null);
    };
    let Some(limit) = integer_or(args, 2, -1) else {
        return Ok(Value::Null);
    };
    let max_split = usize::try_from(limit).ok();
    let parts: Vec<String> = match args.get(1) {
        None | Some(Value::Null) => split_whitespace(s, max_split),
        Some(Value::Str(sep)) if sep.is_empty() => return Err(CallError::fault("empty separator")),
        Some(Value::Str(sep)) => match max_split {
            Some(n) => s.splitn(n + 1, sep.as_str()).map(str::to_owned).collect(),
            None => s.split(sep.as_str()).map(str::to_owned).collect(),
        },
        Some(_) => return Ok(Value::Null),
    };
    Ok(Value::array(parts.into_iter().map(Value::Str).collect()))
}

fn split_whitespace(s: &str, max_split: Option<usize>) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = s.trim_start();
    while !rest.is_empty() {
        if max_split.is_some_and(|n| out.len() >= n) {
            out.push(rest.to_owned());
            break;
        }
        match rest.find(char::is_whitespace) {
            Some(end) => {
                out.push(rest[..end].to_owned());
                rest = rest[end..].trim_start();
            }
            None => {
                out.push(rest.to_owned());
                break;
            }
        }
    }
    out
}

// ── System ────────────────────────────────────────────────────────────────────

/// `systemFetch(url, options, isText)`.  `url` may be an array of URLs, in
/// which case an array of results is returned.  Failed fetches give null.
fn system_fetch(args: &[Value], ctx: &ExecContext) -> Value {
    let is_text = arg(args, 2).as_bool();
    let (urls, is_array) = match args.first() {
        Some(Value::Array(a)) => (a.borrow().clone(), true),
        other => (vec![other.cloned().unwrap_or_default()], false),
    };

    let mut values = Vec::with_capacity(urls.len());
    for url in urls {
        let url = ctx.resolve_url(&url.to_string());
        let value = match ctx.fetch_text(&url) {
            Ok(text) if is_text => Value::Str(text),
            Ok(text) => serde_json::from_str(&text).map(from_json).unwrap_or_default(),
            Err(_) => Value::Null,
        };
        if value.is_null() && ctx.debug {
            let kind = if is_text { "text" } else { "JSON" };
            ctx.log(&format!("bare: Function \"systemFetch\" failed for {kind} resource \"{url}\""));
        }
        values.push(value);
    }

    if is_array {
        Value::array(values)
    } else {
        values.pop().unwrap_or_default()
    }
}

fn system_partial(args: &[Value]) -> Result<Value, CallError> {
    match args.first() {
        Some(Value::Function(f)) => {
            let bound: Rc<[Value]> = args[1..].iter().cloned().collect();
            Ok(Value::Function(Function::Partial(Rc::new(f.clone()), bound)))
        }
        _ => Err(CallError::fault("systemPartial requires a function")),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
