//! Built-in functions and the per-query [`Executor`] that dispatches them.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::types::ErrorCode;

use super::errors::QueryError;
use super::value::Value;

type Implementation = fn(&[Value]) -> Result<Value, QueryError>;

/// Signature and implementation of a built-in function.
pub struct FunctionDef {
    /// Upper-case name.
    pub name: &'static str,
    /// Minimum argument count.
    pub min_args: usize,
    /// Maximum argument count; `usize::MAX` for variadic functions.
    pub max_args: usize,
    /// Whether equal arguments always give equal results. Only deterministic
    /// calls with constant arguments are folded.
    pub deterministic: bool,
    implementation: Implementation,
}

impl FunctionDef {
    /// Whether `count` arguments are acceptable.
    pub fn accepts(&self, count: usize) -> bool {
        (self.min_args..=self.max_args).contains(&count)
    }

    /// Error reported when the argument count is wrong.
    pub fn arity_error(&self) -> QueryError {
        let max = if self.max_args == usize::MAX {
            "unlimited".to_owned()
        } else {
            self.max_args.to_string()
        };
        QueryError::Application {
            code: ErrorCode::FunctionArgumentNumberMismatch,
            message: format!(
                "invalid number of arguments for function '{}()', expected number of arguments: minimum: {}, maximum: {}",
                self.name, self.min_args, max
            ),
        }
    }
}

const VARIADIC: usize = usize::MAX;

macro_rules! function {
    ($name:literal, $min:expr, $max:expr, $det:expr, $imp:expr) => {
        FunctionDef {
            name: $name,
            min_args: $min,
            max_args: $max,
            deterministic: $det,
            implementation: $imp,
        }
    };
}

static FUNCTIONS: &[FunctionDef] = &[
    function!("LENGTH", 1, 1, true, length),
    function!("CONCAT", 1, VARIADIC, true, concat),
    function!("UPPER", 1, 1, true, upper),
    function!("LOWER", 1, 1, true, lower),
    function!("SUBSTRING", 2, 3, true, substring),
    function!("CONTAINS", 2, 2, true, contains),
    function!("ABS", 1, 1, true, abs),
    function!("FLOOR", 1, 1, true, floor),
    function!("CEIL", 1, 1, true, ceil),
    function!("ROUND", 1, 1, true, round),
    function!("SQRT", 1, 1, true, sqrt),
    function!("TO_NUMBER", 1, 1, true, to_number),
    function!("TO_STRING", 1, 1, true, to_string),
    function!("TO_BOOL", 1, 1, true, to_bool),
    function!("IS_NULL", 1, 1, true, is_null),
    function!("IS_BOOL", 1, 1, true, is_bool),
    function!("IS_NUMBER", 1, 1, true, is_number),
    function!("IS_STRING", 1, 1, true, is_string),
    function!("IS_ARRAY", 1, 1, true, is_array),
    function!("IS_OBJECT", 1, 1, true, is_object),
    function!("ATTRIBUTES", 1, 1, true, attributes),
    function!("FIRST", 1, 1, true, first),
    function!("LAST", 1, 1, true, last),
    function!("SUM", 1, 1, true, sum),
    function!("MIN", 1, 1, true, min),
    function!("MAX", 1, 1, true, max),
    function!("AVERAGE", 1, 1, true, average),
    function!("UNIQUE", 1, 1, true, unique),
    function!("RANGE", 2, 3, true, range),
    function!("RAND", 0, 0, false, rand_number),
];

/// Looks up a built-in by (case-insensitive) name.
pub fn lookup(name: &str) -> Option<&'static FunctionDef> {
    FUNCTIONS
        .iter()
        .find(|def| def.name.eq_ignore_ascii_case(name))
}

/// Dispatch table for function calls, created lazily once per query.
pub struct Executor {
    table: FxHashMap<&'static str, &'static FunctionDef>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    /// Builds the dispatch table.
    pub fn new() -> Self {
        let mut table = FxHashMap::default();
        table.reserve(FUNCTIONS.len());
        for def in FUNCTIONS {
            table.insert(def.name, def);
        }
        trace!(functions = table.len(), "function executor created");
        Self { table }
    }

    /// Definition for an upper-case function name.
    pub fn function(&self, name: &str) -> Option<&'static FunctionDef> {
        self.table.get(name).copied()
    }

    /// Whether a call to `name` may be folded at optimization time.
    pub fn is_deterministic(&self, name: &str) -> bool {
        self.function(name).is_some_and(|def| def.deterministic)
    }

    /// Calls `name` with evaluated arguments.
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, QueryError> {
        let def = self.function(name).ok_or_else(|| QueryError::Application {
            code: ErrorCode::FunctionNameUnknown,
            message: format!("usage of unknown function '{name}()'"),
        })?;
        if !def.accepts(args.len()) {
            return Err(def.arity_error());
        }
        (def.implementation)(args)
    }
}

/// Shared executor handle stored on a query.
pub type SharedExecutor = Arc<Executor>;

fn type_error(function: &str, expected: &str) -> QueryError {
    QueryError::application(
        ErrorCode::BadParameter,
        format!("function '{function}()' expects {expected}"),
    )
}

fn list<'a>(value: &'a Value, function: &str) -> Result<&'a [Value], QueryError> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(&[]),
        _ => Err(type_error(function, "an array")),
    }
}

fn length(args: &[Value]) -> Result<Value, QueryError> {
    let len = match &args[0] {
        Value::Empty | Value::Null => 0,
        Value::Bool(b) => usize::from(*b),
        Value::Number(n) => n.to_string().chars().count(),
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
    };
    Ok(Value::Number(len as f64))
}

fn concat(args: &[Value]) -> Result<Value, QueryError> {
    let mut out = String::new();
    for arg in args {
        match arg {
            Value::Array(items) => items
                .iter()
                .for_each(|item| out.push_str(&item.to_display_string())),
            other => out.push_str(&other.to_display_string()),
        }
    }
    Ok(Value::string(out))
}

fn upper(args: &[Value]) -> Result<Value, QueryError> {
    Ok(Value::string(args[0].to_display_string().to_uppercase()))
}

fn lower(args: &[Value]) -> Result<Value, QueryError> {
    Ok(Value::string(args[0].to_display_string().to_lowercase()))
}

fn substring(args: &[Value]) -> Result<Value, QueryError> {
    let text = args[0].to_display_string();
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len() as i64;
    let mut start = args[1].to_number() as i64;
    if start < 0 {
        start = (len + start).max(0);
    }
    let start = start.min(len) as usize;
    let end = match args.get(2) {
        Some(count) => (start as i64 + (count.to_number() as i64).max(0)).min(len) as usize,
        None => len as usize,
    };
    Ok(Value::string(chars[start..end].iter().collect::<String>()))
}

fn contains(args: &[Value]) -> Result<Value, QueryError> {
    let haystack = args[0].to_display_string();
    let needle = args[1].to_display_string();
    Ok(Value::Bool(haystack.contains(&needle)))
}

fn abs(args: &[Value]) -> Result<Value, QueryError> {
    Ok(Value::Number(args[0].to_number().abs()))
}

fn floor(args: &[Value]) -> Result<Value, QueryError> {
    Ok(Value::Number(args[0].to_number().floor()))
}

fn ceil(args: &[Value]) -> Result<Value, QueryError> {
    Ok(Value::Number(args[0].to_number().ceil()))
}

fn round(args: &[Value]) -> Result<Value, QueryError> {
    Ok(Value::Number(args[0].to_number().round()))
}

fn to_number(args: &[Value]) -> Result<Value, QueryError> {
    Ok(Value::Number(args[0].to_number()))
}

fn to_string(args: &[Value]) -> Result<Value, QueryError> {
    Ok(Value::string(args[0].to_display_string()))
}

fn to_bool(args: &[Value]) -> Result<Value, QueryError> {
    Ok(Value::Bool(args[0].is_truthy()))
}

fn is_null(args: &[Value]) -> Result<Value, QueryError> {
    Ok(Value::Bool(args[0].is_null()))
}

fn is_bool(args: &[Value]) -> Result<Value, QueryError> {
    Ok(Value::Bool(matches!(args[0], Value::Bool(_))))
}

fn is_number(args: &[Value]) -> Result<Value, QueryError> {
    Ok(Value::Bool(matches!(args[0], Value::Number(_))))
}

fn is_string(args: &[Value]) -> Result<Value, QueryError> {
    Ok(Value::Bool(matches!(args[0], Value::String(_))))
}

fn is_array(args: &[Value]) -> Result<Value, QueryError> {
    Ok(Value::Bool(matches!(args[0], Value::Array(_))))
}

fn is_object(args: &[Value]) -> Result<Value, QueryError> {
    Ok(Value::Bool(matches!(args[0], Value::Object(_))))
}

fn rand_number(_: &[Value]) -> Result<Value, QueryError> {
    Ok(Value::Number(rand::random::<f64>()))
}

fn sqrt(args: &[Value]) -> Result<Value, QueryError> {
    let n = args[0].to_number();
    if n < 0.0 {
        return Ok(Value::Null);
    }
    Ok(Value::Number(n.sqrt()))
}

fn attributes(args: &[Value]) -> Result<Value, QueryError> {
    match &args[0] {
        Value::Object(map) => Ok(Value::Array(
            map.keys().map(|k| Value::string(k.as_str())).collect(),
        )),
        _ => Err(type_error("ATTRIBUTES", "an object")),
    }
}

fn numbers<'a>(items: &'a [Value]) -> impl Iterator<Item = f64> + 'a {
    items.iter().filter_map(Value::as_number)
}

fn first(args: &[Value]) -> Result<Value, QueryError> {
    let items = list(&args[0], "FIRST")?;
    Ok(items.first().cloned().unwrap_or(Value::Null))
}

fn last(args: &[Value]) -> Result<Value, QueryError> {
    let items = list(&args[0], "LAST")?;
    Ok(items.last().cloned().unwrap_or(Value::Null))
}

fn min(args: &[Value]) -> Result<Value, QueryError> {
    extreme(&args[0], "MIN", Ordering::Less)
}

fn max(args: &[Value]) -> Result<Value, QueryError> {
    extreme(&args[0], "MAX", Ordering::Greater)
}

fn sum(args: &[Value]) -> Result<Value, QueryError> {
    let items = list(&args[0], "SUM")?;
    Ok(Value::Number(numbers(items).sum()))
}

fn average(args: &[Value]) -> Result<Value, QueryError> {
    let items = list(&args[0], "AVERAGE")?;
    let values: Vec<f64> = numbers(items).collect();
    if values.is_empty() {
        return Ok(Value::Null);
    }
    Ok(Value::Number(values.iter().sum::<f64>() / values.len() as f64))
}

fn extreme(value: &Value, function: &str, wanted: Ordering) -> Result<Value, QueryError> {
    let items = list(value, function)?;
    let mut best: Option<&Value> = None;
    for item in items.iter().filter(|item| !item.is_null()) {
        match best {
            Some(current) if item.compare(current) != wanted => {}
            _ => best = Some(item),
        }
    }
    Ok(best.cloned().unwrap_or(Value::Null))
}

fn unique(args: &[Value]) -> Result<Value, QueryError> {
    let items = list(&args[0], "UNIQUE")?;
    let mut seen = BTreeSet::new();
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        if seen.insert(item.to_json().to_string()) {
            out.push(item.clone());
        }
    }
    Ok(Value::Array(out))
}

fn range(args: &[Value]) -> Result<Value, QueryError> {
    let start = args[0].to_number();
    let end = args[1].to_number();
    let step = match args.get(2) {
        Some(step) => step.to_number(),
        None if start <= end => 1.0,
        None => -1.0,
    };
    if step == 0.0 || (step > 0.0 && start > end) || (step < 0.0 && start < end) {
        return Err(QueryError::application(
            ErrorCode::BadParameter,
            "function 'RANGE()' received an invalid step",
        ));
    }
    let count = ((end - start) / step).floor() as usize + 1;
    if count > 10_000_000 {
        return Err(QueryError::application(
            ErrorCode::BadParameter,
            "function 'RANGE()' would produce too many values",
        ));
    }
    let mut out = Vec::new();
    out.try_reserve(count)?;
    for i in 0..count {
        out.push(Value::Number(start + step * i as f64));
    }
    Ok(Value::Array(out))
}
