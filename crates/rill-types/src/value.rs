//! Host-side dynamic value model.
//!
//! [`Value`] mirrors the shapes a guest can hand across the boundary:
//! JSON-like data plus the exotic built-ins the codec has dedicated rules for
//! (functions, dates, regexps, errors, maps, sets and promises).
//!
//! Containers are shared (`Rc<RefCell<..>>`) so that object graphs, including
//! cyclic ones, can be represented faithfully. All host-side components run on
//! a single control-flow thread, so values are intentionally `!Send`.

use std::cell::RefCell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;

/// Insertion-ordered property map of a plain object.
pub type ObjectMap = IndexMap<String, Value>;

/// A host-side dynamic value.
#[derive(Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Rc<RefCell<Vec<Value>>>),
    Object(Rc<RefCell<ObjectMap>>),
    Function(Callable),
    Date(DateTime<Utc>),
    RegExp(RegExpValue),
    Error(ErrorValue),
    Map(Rc<RefCell<Vec<(Value, Value)>>>),
    Set(Rc<RefCell<Vec<Value>>>),
    Promise(JsPromise),
    /// Raw bytes of an `ArrayBuffer` or typed array view.
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegExpValue {
    pub source: String,
    pub flags: String,
}

/// A structured error value (`Error`, `TypeError`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorValue {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl ErrorValue {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn array(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(items.into_iter().collect())))
    }

    pub fn object<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Object(Rc::new(RefCell::new(
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        )))
    }

    pub fn empty_object() -> Self {
        Value::Object(Rc::new(RefCell::new(ObjectMap::new())))
    }

    pub fn map(entries: impl IntoIterator<Item = (Value, Value)>) -> Self {
        Value::Map(Rc::new(RefCell::new(entries.into_iter().collect())))
    }

    pub fn set(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Set(Rc::new(RefCell::new(items.into_iter().collect())))
    }

    pub fn regexp(source: impl Into<String>, flags: impl Into<String>) -> Self {
        Value::RegExp(RegExpValue {
            source: source.into(),
            flags: flags.into(),
        })
    }

    pub fn function(f: impl Fn(Vec<Value>) -> anyhow::Result<Value> + 'static) -> Self {
        Value::Function(Callable::new(f))
    }

    /// JS `typeof`-style name, with the exotic built-ins spelled out.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
            Value::Date(_) => "date",
            Value::RegExp(_) => "regexp",
            Value::Error(_) => "error",
            Value::Map(_) => "map",
            Value::Set(_) => "set",
            Value::Promise(_) => "promise",
            Value::Bytes(_) => "arraybuffer",
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_callable(&self) -> Option<&Callable> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_promise(&self) -> Option<&JsPromise> {
        match self {
            Value::Promise(p) => Some(p),
            _ => None,
        }
    }

    /// Property lookup on a plain object. Returns `None` for other shapes.
    pub fn get(&self, key: &str) -> Option<Value> {
        match self {
            Value::Object(map) => map.borrow().get(key).cloned(),
            _ => None,
        }
    }

    /// Element lookup on an array.
    pub fn index(&self, idx: usize) -> Option<Value> {
        match self {
            Value::Array(items) => items.borrow().get(idx).cloned(),
            _ => None,
        }
    }

    /// Identity of a shared container, used for cycle detection.
    pub fn container_id(&self) -> Option<usize> {
        match self {
            Value::Array(rc) => Some(Rc::as_ptr(rc) as *const () as usize),
            Value::Object(rc) => Some(Rc::as_ptr(rc) as *const () as usize),
            Value::Map(rc) => Some(Rc::as_ptr(rc) as *const () as usize),
            Value::Set(rc) => Some(Rc::as_ptr(rc) as *const () as usize),
            _ => None,
        }
    }

    /// Plain structural conversion from JSON. No tags are interpreted; that is
    /// the codec's job.
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => Value::array(items.iter().map(Value::from_json)),
            serde_json::Value::Object(map) => {
                Value::object(map.iter().map(|(k, v)| (k.clone(), Value::from_json(v))))
            }
        }
    }

    /// Human/diagnostic JSON rendering. Functions and promises become marker
    /// strings and back-edges become `"[Circular]"`. Not a transport encoding.
    pub fn to_json_lossy(&self) -> serde_json::Value {
        let mut stack = Vec::new();
        self.to_json_lossy_inner(&mut stack)
    }

    fn to_json_lossy_inner(&self, stack: &mut Vec<usize>) -> serde_json::Value {
        use serde_json::Value as Json;

        if let Some(id) = self.container_id() {
            if stack.contains(&id) {
                return Json::String("[Circular]".to_string());
            }
            stack.push(id);
        }
        let out = match self {
            Value::Undefined | Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(Json::Number)
                .unwrap_or_else(|| Json::String(format_number(*n))),
            Value::String(s) => Json::String(s.clone()),
            Value::Array(items) => Json::Array(
                items
                    .borrow()
                    .iter()
                    .map(|v| v.to_json_lossy_inner(stack))
                    .collect(),
            ),
            Value::Object(map) => Json::Object(
                map.borrow()
                    .iter()
                    .filter(|(_, v)| !v.is_undefined())
                    .map(|(k, v)| (k.clone(), v.to_json_lossy_inner(stack)))
                    .collect(),
            ),
            Value::Function(f) => Json::String(match f.name() {
                Some(name) => format!("[Function {name}]"),
                None => "[Function]".to_string(),
            }),
            Value::Date(d) => Json::String(d.to_rfc3339_opts(SecondsFormat::Millis, true)),
            Value::RegExp(re) => Json::String(format!("/{}/{}", re.source, re.flags)),
            Value::Error(e) => Json::String(e.to_string()),
            Value::Map(entries) => Json::Array(
                entries
                    .borrow()
                    .iter()
                    .map(|(k, v)| {
                        Json::Array(vec![k.to_json_lossy_inner(stack), v.to_json_lossy_inner(stack)])
                    })
                    .collect(),
            ),
            Value::Set(items) => Json::Array(
                items
                    .borrow()
                    .iter()
                    .map(|v| v.to_json_lossy_inner(stack))
                    .collect(),
            ),
            Value::Promise(_) => Json::String("[Promise]".to_string()),
            Value::Bytes(b) => Json::String(format!("[ArrayBuffer {}]", b.len())),
        };
        if self.container_id().is_some() {
            stack.pop();
        }
        out
    }

    /// Best-effort string form, used when nothing better is available.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::String(s) => s.clone(),
            other => other.to_json_lossy().to_string(),
        }
    }
}

/// JS-flavoured number formatting (`1` not `1.0`, `NaN`, `Infinity`).
fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

// Structural equality. Shared containers compare equal by identity first, which
// also keeps comparisons of a cyclic value with itself from recursing forever.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::RegExp(a), Value::RegExp(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Value::Set(a), Value::Set(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Value::Promise(a), Value::Promise(b)) => a.ptr_eq(b),
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            _ => false,
        }
    }
}

const DEBUG_DEPTH: usize = 6;

struct DebugAt<'a>(&'a Value, usize);

impl fmt::Debug for DebugAt<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let DebugAt(value, depth) = *self;
        if depth >= DEBUG_DEPTH && value.container_id().is_some() {
            return write!(f, "{}(..)", value.type_name());
        }
        match value {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Array(items) => f
                .debug_list()
                .entries(items.borrow().iter().map(|v| DebugAt(v, depth + 1)))
                .finish(),
            Value::Object(map) => f
                .debug_map()
                .entries(map.borrow().iter().map(|(k, v)| (k, DebugAt(v, depth + 1))))
                .finish(),
            Value::Function(c) => write!(f, "{c:?}"),
            Value::Date(d) => write!(f, "Date({})", d.to_rfc3339_opts(SecondsFormat::Millis, true)),
            Value::RegExp(re) => write!(f, "/{}/{}", re.source, re.flags),
            Value::Error(e) => write!(f, "{}({:?})", e.name, e.message),
            Value::Map(entries) => {
                write!(f, "Map")?;
                f.debug_map()
                    .entries(
                        entries
                            .borrow()
                            .iter()
                            .map(|(k, v)| (DebugAt(k, depth + 1), DebugAt(v, depth + 1))),
                    )
                    .finish()
            }
            Value::Set(items) => {
                write!(f, "Set")?;
                f.debug_set()
                    .entries(items.borrow().iter().map(|v| DebugAt(v, depth + 1)))
                    .finish()
            }
            Value::Promise(p) => write!(f, "{p:?}"),
            Value::Bytes(b) => write!(f, "ArrayBuffer({})", b.len()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        DebugAt(self, 0).fmt(f)
    }
}

// ============================================================================
// Callable
// ============================================================================

type CallableFn = dyn Fn(Vec<Value>) -> anyhow::Result<Value>;

/// A host-callable function.
///
/// Either a real host closure, or a proxy produced by decoding a
/// `{__type:'function'}` tag that forwards the call across the boundary.
#[derive(Clone)]
pub struct Callable {
    inner: Rc<CallableFn>,
    name: Option<Rc<str>>,
}

impl Callable {
    pub fn new(f: impl Fn(Vec<Value>) -> anyhow::Result<Value> + 'static) -> Self {
        Self {
            inner: Rc::new(f),
            name: None,
        }
    }

    pub fn named(
        name: impl Into<String>,
        f: impl Fn(Vec<Value>) -> anyhow::Result<Value> + 'static,
    ) -> Self {
        Self {
            inner: Rc::new(f),
            name: Some(Rc::from(name.into())),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn call(&self, args: Vec<Value>) -> anyhow::Result<Value> {
        (self.inner)(args)
    }

    pub fn ptr_eq(&self, other: &Callable) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Address of the shared closure. Stable while any clone is alive.
    pub fn addr(&self) -> usize {
        Rc::as_ptr(&self.inner) as *const () as usize
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "Callable({name})"),
            None => write!(f, "Callable"),
        }
    }
}

// ============================================================================
// Promises
// ============================================================================

/// Final outcome of a promise.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Fulfilled(Value),
    Rejected(Value),
}

impl Settlement {
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Settlement::Fulfilled(_))
    }

    pub fn value(&self) -> &Value {
        match self {
            Settlement::Fulfilled(v) | Settlement::Rejected(v) => v,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PromiseState {
    Pending,
    Fulfilled(Value),
    Rejected(Value),
}

/// Reaction run once when a promise settles. Errors (and panics) are collected
/// and handed back to whoever settled the promise.
pub type Reaction = Box<dyn FnOnce(&Settlement) -> anyhow::Result<()>>;

struct PromiseInner {
    state: PromiseState,
    reactions: Vec<Reaction>,
}

/// A single-assignment, host-side promise.
///
/// Settling is exactly-once: the first `settle` wins and later calls return
/// `None` without touching state or reactions.
#[derive(Clone)]
pub struct JsPromise {
    inner: Rc<RefCell<PromiseInner>>,
}

impl Default for JsPromise {
    fn default() -> Self {
        Self::new()
    }
}

impl JsPromise {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(PromiseInner {
                state: PromiseState::Pending,
                reactions: Vec::new(),
            })),
        }
    }

    pub fn resolved(value: Value) -> Self {
        let p = Self::new();
        p.inner.borrow_mut().state = PromiseState::Fulfilled(value);
        p
    }

    pub fn rejected(reason: Value) -> Self {
        let p = Self::new();
        p.inner.borrow_mut().state = PromiseState::Rejected(reason);
        p
    }

    pub fn state(&self) -> PromiseState {
        self.inner.borrow().state.clone()
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.inner.borrow().state, PromiseState::Pending)
    }

    pub fn settlement(&self) -> Option<Settlement> {
        match &self.inner.borrow().state {
            PromiseState::Pending => None,
            PromiseState::Fulfilled(v) => Some(Settlement::Fulfilled(v.clone())),
            PromiseState::Rejected(v) => Some(Settlement::Rejected(v.clone())),
        }
    }

    pub fn ptr_eq(&self, other: &JsPromise) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Settle the promise. Returns `None` if it was already settled, otherwise
    /// the errors raised by reactions (empty on a clean run).
    pub fn settle(&self, outcome: Settlement) -> Option<Vec<anyhow::Error>> {
        let reactions = {
            let mut inner = self.inner.borrow_mut();
            if !matches!(inner.state, PromiseState::Pending) {
                return None;
            }
            inner.state = match &outcome {
                Settlement::Fulfilled(v) => PromiseState::Fulfilled(v.clone()),
                Settlement::Rejected(v) => PromiseState::Rejected(v.clone()),
            };
            std::mem::take(&mut inner.reactions)
        };
        Some(
            reactions
                .into_iter()
                .filter_map(|reaction| run_reaction(reaction, &outcome).err())
                .collect(),
        )
    }

    pub fn resolve(&self, value: Value) -> Option<Vec<anyhow::Error>> {
        self.settle(Settlement::Fulfilled(value))
    }

    pub fn reject(&self, reason: Value) -> Option<Vec<anyhow::Error>> {
        self.settle(Settlement::Rejected(reason))
    }

    /// Register a reaction. Runs immediately if the promise already settled.
    pub fn on_settle(
        &self,
        reaction: impl FnOnce(&Settlement) -> anyhow::Result<()> + 'static,
    ) -> anyhow::Result<()> {
        match self.settlement() {
            Some(outcome) => run_reaction(Box::new(reaction), &outcome),
            None => {
                self.inner.borrow_mut().reactions.push(Box::new(reaction));
                Ok(())
            }
        }
    }
}

fn run_reaction(reaction: Reaction, outcome: &Settlement) -> anyhow::Result<()> {
    match catch_unwind(AssertUnwindSafe(|| reaction(outcome))) {
        Ok(result) => result,
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "reaction panicked".to_string());
            Err(anyhow::anyhow!("promise reaction panicked: {msg}"))
        }
    }
}

impl fmt::Debug for JsPromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner.borrow().state {
            PromiseState::Pending => write!(f, "Promise(<pending>)"),
            PromiseState::Fulfilled(v) => write!(f, "Promise(fulfilled: {v:?})"),
            PromiseState::Rejected(v) => write!(f, "Promise(rejected: {v:?})"),
        }
    }
}
