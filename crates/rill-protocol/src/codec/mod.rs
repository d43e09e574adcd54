//! Type-rule value codec.
//!
//! Values crossing the boundary are turned into JSON by an ordered list of
//! [`TypeRule`]s. The first rule whose [`TypeRule::matches`] accepts a value
//! encodes it; rule order is significant. The built-in order is:
//!
//! | # | rule        | wire form                                             |
//! |---|-------------|-------------------------------------------------------|
//! | 1 | `function`  | `{__type:'function', __fnId}`                          |
//! | 2 | `date`      | `{__type:'date', __value: ISO-8601}`                   |
//! | 3 | `regexp`    | `{__type:'regexp', __source, __flags}`                 |
//! | 4 | `error`     | `{__type:'error', __name, __message, __stack?}`        |
//! | 5 | `map`       | `{__type:'map', __entries: [[k, v], ...]}`             |
//! | 6 | `set`       | `{__type:'set', __values: [...]}`                      |
//! | 7 | `arraybuffer` | `{__type:'arraybuffer', __data: base64}`             |
//! | 8 | `promise`   | `{__type:'promise', __promiseId}`                      |
//! | 9 | `undefined` | `{__type:'undefined'}`                                 |
//!
//! Values no rule claims are plain arrays and objects (encoded field by field)
//! or primitives (passed through). A container revisited while it is still on
//! the active encode stack becomes `{__type:'circular'}`. The stack lives in
//! the per-call [`EncodeCx`], so nothing leaks between top-level calls.
//!
//! Decoding never fails. Unknown or malformed tags come back as the raw
//! tagged object.
//!
//! Functions and promises need the surrounding session to allocate ids; the
//! codec reaches it through [`CodecHooks`].

mod loopback;
mod rules;

use rill_types::{Callable, FnId, JsPromise, PromiseId, Value};
use serde_json::{Map, Value as Json};

pub use loopback::LoopbackHooks;
pub use rules::{
    ArrayBufferRule, DateRule, ErrorRule, FunctionRule, MapRule, PromiseRule, RegExpRule, SetRule,
    UndefinedRule,
};

/// Key carrying the tag of a special form.
pub const TYPE_KEY: &str = "__type";

/// Tag emitted for back-edges in cyclic graphs.
pub const CIRCULAR_TAG: &str = "circular";

/// Session services the codec needs for by-reference values.
pub trait CodecHooks {
    /// Allocate (or reuse) an id for a local function about to cross.
    fn register_function(&self, callable: &Callable) -> FnId;

    /// Build a local stand-in for a function that lives on the other side.
    fn function_proxy(&self, fn_id: FnId) -> Callable;

    /// Allocate an id for a local promise and arrange for its settlement to be
    /// forwarded.
    fn export_promise(&self, promise: &JsPromise) -> PromiseId;

    /// Placeholder for a promise that will be settled by the other side.
    fn import_promise(&self, promise_id: PromiseId) -> JsPromise;
}

/// One entry in the codec's rule list.
pub trait TypeRule {
    /// Tag written to `__type` and matched on decode.
    fn tag(&self) -> &'static str;

    fn matches(&self, value: &Value) -> bool;

    fn encode(&self, value: &Value, cx: &mut EncodeCx<'_>) -> Json;

    /// Rebuild a value from its tagged form. `None` means malformed; the
    /// caller then passes the raw object through.
    fn decode(&self, tagged: &Map<String, Json>, cx: &DecodeCx<'_>) -> Option<Value>;
}

/// Ordered set of type rules.
pub struct Codec {
    rules: Vec<Box<dyn TypeRule>>,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec")
            .field("rules", &self.rule_tags())
            .finish()
    }
}

impl Codec {
    /// Codec with the built-in rules in their documented order.
    pub fn new() -> Self {
        Self {
            rules: vec![
                Box::new(FunctionRule),
                Box::new(DateRule),
                Box::new(RegExpRule),
                Box::new(ErrorRule),
                Box::new(MapRule),
                Box::new(SetRule),
                Box::new(ArrayBufferRule),
                Box::new(PromiseRule),
                Box::new(UndefinedRule),
            ],
        }
    }

    /// Codec with no rules: only plain data survives.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a rule after the existing ones.
    pub fn with_rule(mut self, rule: impl TypeRule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    /// Insert a rule at `index`, ahead of everything after it.
    pub fn insert_rule(&mut self, index: usize, rule: impl TypeRule + 'static) {
        let index = index.min(self.rules.len());
        self.rules.insert(index, Box::new(rule));
    }

    pub fn rule_tags(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.tag()).collect()
    }

    pub fn encode(&self, value: &Value, hooks: &dyn CodecHooks) -> Json {
        EncodeCx {
            codec: self,
            hooks,
            stack: Vec::new(),
        }
        .encode(value)
    }

    pub fn decode(&self, json: &Json, hooks: &dyn CodecHooks) -> Value {
        DecodeCx { codec: self, hooks }.decode(json)
    }
}

/// State of one top-level encode call.
pub struct EncodeCx<'a> {
    codec: &'a Codec,
    hooks: &'a dyn CodecHooks,
    /// Containers currently being encoded, by identity.
    stack: Vec<usize>,
}

impl<'a> EncodeCx<'a> {
    pub fn hooks(&self) -> &'a dyn CodecHooks {
        self.hooks
    }

    pub fn encode(&mut self, value: &Value) -> Json {
        let container = value.container_id();
        if let Some(id) = container {
            if self.stack.contains(&id) {
                return tagged(CIRCULAR_TAG, Map::new());
            }
            self.stack.push(id);
        }

        let codec = self.codec;
        let out = match codec.rules.iter().find(|r| r.matches(value)) {
            Some(rule) => rule.encode(value, self),
            None => self.encode_plain(value),
        };

        if container.is_some() {
            self.stack.pop();
        }
        out
    }

    fn encode_plain(&mut self, value: &Value) -> Json {
        match value {
            Value::Null | Value::Undefined => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Number(n) => encode_number(*n),
            Value::String(s) => Json::String(s.clone()),
            Value::Array(items) => {
                let items = items.borrow().clone();
                Json::Array(items.iter().map(|v| self.encode(v)).collect())
            }
            Value::Object(map) => {
                let entries: Vec<(String, Value)> = map
                    .borrow()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                Json::Object(
                    entries
                        .into_iter()
                        .map(|(k, v)| {
                            let encoded = self.encode(&v);
                            (k, encoded)
                        })
                        .collect(),
                )
            }
            // Only reachable with a reduced rule set.
            other => Json::String(other.to_display_string()),
        }
    }
}

/// State of one top-level decode call.
pub struct DecodeCx<'a> {
    codec: &'a Codec,
    hooks: &'a dyn CodecHooks,
}

impl<'a> DecodeCx<'a> {
    pub fn hooks(&self) -> &'a dyn CodecHooks {
        self.hooks
    }

    pub fn decode(&self, json: &Json) -> Value {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            Json::String(s) => Value::String(s.clone()),
            Json::Array(items) => Value::array(items.iter().map(|v| self.decode(v))),
            Json::Object(map) => match map.get(TYPE_KEY).and_then(Json::as_str) {
                Some(CIRCULAR_TAG) => Value::Undefined,
                Some(tag) => self
                    .codec
                    .rules
                    .iter()
                    .find(|r| r.tag() == tag)
                    .and_then(|r| r.decode(map, self))
                    .unwrap_or_else(|| self.decode_raw(map)),
                None => self.decode_raw(map),
            },
        }
    }

    fn decode_raw(&self, map: &Map<String, Json>) -> Value {
        Value::object(map.iter().map(|(k, v)| (k.clone(), self.decode(v))))
    }
}

/// `{__type: tag, ...fields}`.
pub fn tagged(tag: &str, fields: Map<String, Json>) -> Json {
    let mut out = Map::with_capacity(fields.len() + 1);
    out.insert(TYPE_KEY.to_string(), Json::String(tag.to_string()));
    out.extend(fields);
    Json::Object(out)
}

/// Integral numbers go out as integers; non-finite ones degrade to strings.
/// Negative zero stays a float so the sign survives.
fn encode_number(n: f64) -> Json {
    let negative_zero = n == 0.0 && n.is_sign_negative();
    if !negative_zero && n.is_finite() && n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
        Json::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Json::Number)
            .unwrap_or_else(|| Json::String(Value::Number(n).to_display_string()))
    }
}
