//! Built-in type rules.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use rill_types::{ErrorValue, Value};
use serde_json::{Map, Value as Json};

use super::{tagged, DecodeCx, EncodeCx, TypeRule};

fn fields<const N: usize>(entries: [(&str, Json); N]) -> Map<String, Json> {
    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn str_field<'a>(tagged: &'a Map<String, Json>, key: &str) -> Option<&'a str> {
    tagged.get(key).and_then(Json::as_str)
}

pub struct FunctionRule;

impl TypeRule for FunctionRule {
    fn tag(&self) -> &'static str {
        "function"
    }

    fn matches(&self, value: &Value) -> bool {
        matches!(value, Value::Function(_))
    }

    fn encode(&self, value: &Value, cx: &mut EncodeCx<'_>) -> Json {
        match value {
            Value::Function(f) => {
                let fn_id = cx.hooks().register_function(f);
                tagged("function", fields([("__fnId", Json::from(fn_id))]))
            }
            _ => Json::Null,
        }
    }

    fn decode(&self, tagged: &Map<String, Json>, cx: &DecodeCx<'_>) -> Option<Value> {
        let fn_id = tagged.get("__fnId")?.as_u64()?;
        Some(Value::Function(cx.hooks().function_proxy(fn_id)))
    }
}

pub struct DateRule;

impl TypeRule for DateRule {
    fn tag(&self) -> &'static str {
        "date"
    }

    fn matches(&self, value: &Value) -> bool {
        matches!(value, Value::Date(_))
    }

    fn encode(&self, value: &Value, _cx: &mut EncodeCx<'_>) -> Json {
        match value {
            Value::Date(d) => tagged(
                "date",
                fields([(
                    "__value",
                    Json::String(d.to_rfc3339_opts(SecondsFormat::Millis, true)),
                )]),
            ),
            _ => Json::Null,
        }
    }

    fn decode(&self, tagged: &Map<String, Json>, _cx: &DecodeCx<'_>) -> Option<Value> {
        let raw = str_field(tagged, "__value")?;
        let parsed = DateTime::parse_from_rfc3339(raw).ok()?;
        Some(Value::Date(parsed.with_timezone(&Utc)))
    }
}

pub struct RegExpRule;

impl TypeRule for RegExpRule {
    fn tag(&self) -> &'static str {
        "regexp"
    }

    fn matches(&self, value: &Value) -> bool {
        matches!(value, Value::RegExp(_))
    }

    fn encode(&self, value: &Value, _cx: &mut EncodeCx<'_>) -> Json {
        match value {
            Value::RegExp(re) => tagged(
                "regexp",
                fields([
                    ("__source", Json::String(re.source.clone())),
                    ("__flags", Json::String(re.flags.clone())),
                ]),
            ),
            _ => Json::Null,
        }
    }

    fn decode(&self, tagged: &Map<String, Json>, _cx: &DecodeCx<'_>) -> Option<Value> {
        let source = str_field(tagged, "__source")?;
        let flags = str_field(tagged, "__flags").unwrap_or("");
        Some(Value::regexp(source, flags))
    }
}

pub struct ErrorRule;

impl TypeRule for ErrorRule {
    fn tag(&self) -> &'static str {
        "error"
    }

    fn matches(&self, value: &Value) -> bool {
        matches!(value, Value::Error(_))
    }

    fn encode(&self, value: &Value, _cx: &mut EncodeCx<'_>) -> Json {
        match value {
            Value::Error(e) => {
                let mut out = fields([
                    ("__name", Json::String(e.name.clone())),
                    ("__message", Json::String(e.message.clone())),
                ]);
                if let Some(stack) = &e.stack {
                    out.insert("__stack".to_string(), Json::String(stack.clone()));
                }
                tagged("error", out)
            }
            _ => Json::Null,
        }
    }

    fn decode(&self, tagged: &Map<String, Json>, _cx: &DecodeCx<'_>) -> Option<Value> {
        Some(Value::Error(ErrorValue {
            name: str_field(tagged, "__name").unwrap_or("Error").to_string(),
            message: str_field(tagged, "__message")?.to_string(),
            stack: str_field(tagged, "__stack").map(str::to_string),
        }))
    }
}

pub struct MapRule;

impl TypeRule for MapRule {
    fn tag(&self) -> &'static str {
        "map"
    }

    fn matches(&self, value: &Value) -> bool {
        matches!(value, Value::Map(_))
    }

    fn encode(&self, value: &Value, cx: &mut EncodeCx<'_>) -> Json {
        let Value::Map(entries) = value else {
            return Json::Null;
        };
        let entries = entries.borrow().clone();
        let encoded = entries
            .iter()
            .map(|(k, v)| Json::Array(vec![cx.encode(k), cx.encode(v)]))
            .collect();
        tagged("map", fields([("__entries", Json::Array(encoded))]))
    }

    fn decode(&self, tagged: &Map<String, Json>, cx: &DecodeCx<'_>) -> Option<Value> {
        let entries = tagged.get("__entries")?.as_array()?;
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry.as_array().map(Vec::as_slice) {
                Some([k, v]) => out.push((cx.decode(k), cx.decode(v))),
                _ => return None,
            }
        }
        Some(Value::map(out))
    }
}

pub struct SetRule;

impl TypeRule for SetRule {
    fn tag(&self) -> &'static str {
        "set"
    }

    fn matches(&self, value: &Value) -> bool {
        matches!(value, Value::Set(_))
    }

    fn encode(&self, value: &Value, cx: &mut EncodeCx<'_>) -> Json {
        let Value::Set(items) = value else {
            return Json::Null;
        };
        let items = items.borrow().clone();
        let encoded = items.iter().map(|v| cx.encode(v)).collect();
        tagged("set", fields([("__values", Json::Array(encoded))]))
    }

    fn decode(&self, tagged: &Map<String, Json>, cx: &DecodeCx<'_>) -> Option<Value> {
        let items = tagged.get("__values")?.as_array()?;
        Some(Value::set(items.iter().map(|v| cx.decode(v))))
    }
}

/// `ArrayBuffer` and typed array views, as standard padded base64.
pub struct ArrayBufferRule;

impl TypeRule for ArrayBufferRule {
    fn tag(&self) -> &'static str {
        "arraybuffer"
    }

    fn matches(&self, value: &Value) -> bool {
        matches!(value, Value::Bytes(_))
    }

    fn encode(&self, value: &Value, _cx: &mut EncodeCx<'_>) -> Json {
        match value {
            Value::Bytes(bytes) => tagged(
                "arraybuffer",
                fields([("__data", Json::String(STANDARD.encode(bytes)))]),
            ),
            _ => Json::Null,
        }
    }

    fn decode(&self, tagged: &Map<String, Json>, _cx: &DecodeCx<'_>) -> Option<Value> {
        let data = str_field(tagged, "__data")?;
        STANDARD.decode(data).ok().map(Value::Bytes)
    }
}

pub struct PromiseRule;

impl TypeRule for PromiseRule {
    fn tag(&self) -> &'static str {
        "promise"
    }

    fn matches(&self, value: &Value) -> bool {
        matches!(value, Value::Promise(_))
    }

    fn encode(&self, value: &Value, cx: &mut EncodeCx<'_>) -> Json {
        match value {
            Value::Promise(p) => {
                let promise_id = cx.hooks().export_promise(p);
                tagged("promise", fields([("__promiseId", Json::from(promise_id))]))
            }
            _ => Json::Null,
        }
    }

    fn decode(&self, tagged: &Map<String, Json>, cx: &DecodeCx<'_>) -> Option<Value> {
        let promise_id = tagged.get("__promiseId")?.as_u64()?;
        Some(Value::Promise(cx.hooks().import_promise(promise_id)))
    }
}

/// JSON has no `undefined`, so it travels as a tag.
pub struct UndefinedRule;

impl TypeRule for UndefinedRule {
    fn tag(&self) -> &'static str {
        "undefined"
    }

    fn matches(&self, value: &Value) -> bool {
        value.is_undefined()
    }

    fn encode(&self, _value: &Value, _cx: &mut EncodeCx<'_>) -> Json {
        tagged("undefined", Map::new())
    }

    fn decode(&self, _tagged: &Map<String, Json>, _cx: &DecodeCx<'_>) -> Option<Value> {
        Some(Value::Undefined)
    }
}
