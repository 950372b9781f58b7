//! Conversion between engine values and `serde_json::Value`.

use rquickjs::{Array, Ctx, IntoJs, Object, Type, Value as JsValue};
use serde_json::{Map, Number, Value};

use crate::error::RuntimeError;

/// Guards against cyclic object graphs.
const MAX_DEPTH: usize = 64;

/// Largest integer a double represents exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

fn conversion(e: rquickjs::Error) -> RuntimeError {
    RuntimeError::Conversion(e.to_string())
}

/// Convert an engine value to JSON.
///
/// Follows `JSON.stringify` where it matters to callers: functions and
/// `undefined` object members are dropped, typed arrays and array buffers
/// become byte arrays.
pub fn js_to_json(js: &JsValue<'_>) -> Result<Value, RuntimeError> {
    js_to_json_at(js, 0)
}

fn js_to_json_at(js: &JsValue<'_>, depth: usize) -> Result<Value, RuntimeError> {
    if depth > MAX_DEPTH {
        return Err(RuntimeError::Conversion("value nested too deeply".into()));
    }

    match js.type_of() {
        Type::Bool => Ok(Value::Bool(js.as_bool().unwrap_or(false))),
        Type::Int => Ok(Value::from(js.as_int().unwrap_or(0))),
        Type::Float => Ok(float_to_json(js.as_float().unwrap_or(f64::NAN))),
        Type::String => {
            let s: String = js.get().map_err(conversion)?;
            Ok(Value::String(s))
        }
        Type::Array => {
            let arr: Array = js.get().map_err(conversion)?;
            let mut values = Vec::with_capacity(arr.len());
            for i in 0..arr.len() {
                let item: JsValue = arr.get(i).map_err(conversion)?;
                values.push(js_to_json_at(&item, depth + 1)?);
            }
            Ok(Value::Array(values))
        }
        Type::Object | Type::Exception => {
            let obj: Object = js.get().map_err(conversion)?;

            if let Some(bytes) = obj.as_typed_array::<u8>().and_then(|t| t.as_bytes()) {
                return Ok(bytes_to_json(bytes));
            }
            if let Some(bytes) = obj.as_array_buffer().and_then(|b| b.as_bytes()) {
                return Ok(bytes_to_json(bytes));
            }

            let mut fields = Map::new();
            for prop in obj.props::<String, JsValue>() {
                let (key, val) = prop.map_err(conversion)?;
                if matches!(val.type_of(), Type::Undefined | Type::Function | Type::Constructor) {
                    continue;
                }
                fields.insert(key, js_to_json_at(&val, depth + 1)?);
            }
            Ok(Value::Object(fields))
        }
        _ => Ok(Value::Null),
    }
}

fn float_to_json(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() <= MAX_SAFE_INTEGER {
        return Value::from(f as i64);
    }
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn bytes_to_json(bytes: &[u8]) -> Value {
    Value::Array(bytes.iter().map(|b| Value::from(*b)).collect())
}

/// Convert JSON to an engine value.
pub fn json_to_js<'js>(ctx: &Ctx<'js>, json: &Value) -> Result<JsValue<'js>, RuntimeError> {
    match json {
        Value::Null => Ok(JsValue::new_null(ctx.clone())),
        Value::Bool(b) => Ok(JsValue::new_bool(ctx.clone(), *b)),
        Value::Number(n) => match n.as_i64().and_then(|i| i32::try_from(i).ok()) {
            Some(i) => Ok(JsValue::new_int(ctx.clone(), i)),
            None => Ok(JsValue::new_number(ctx.clone(), n.as_f64().unwrap_or(f64::NAN))),
        },
        Value::String(s) => s.as_str().into_js(ctx).map_err(conversion),
        Value::Array(items) => {
            let arr = Array::new(ctx.clone()).map_err(conversion)?;
            for (i, item) in items.iter().enumerate() {
                arr.set(i, json_to_js(ctx, item)?).map_err(conversion)?;
            }
            Ok(arr.into_value())
        }
        Value::Object(fields) => {
            let obj = Object::new(ctx.clone()).map_err(conversion)?;
            for (key, val) in fields {
                obj.set(key.as_str(), json_to_js(ctx, val)?).map_err(conversion)?;
            }
            Ok(obj.into_value())
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};
    use serde_json::json;

    fn eval_json(source: &str) -> Value {
        let runtime = Runtime::new().unwrap();
        let ctx = Context::full(&runtime).unwrap();
        ctx.with(|ctx| {
            let value: JsValue = ctx.eval(source).unwrap();
            js_to_json(&value).unwrap()
        })
    }

    #[test]
    fn test_primitives() {
        assert_eq!(eval_json("42"), json!(42));
        assert_eq!(eval_json("2.5"), json!(2.5));
        assert_eq!(eval_json("4.0 / 2"), json!(2));
        assert_eq!(eval_json("'hi'"), json!("hi"));
        assert_eq!(eval_json("true"), json!(true));
        assert_eq!(eval_json("undefined"), Value::Null);
        assert_eq!(eval_json("0/0"), Value::Null);
    }

    #[test]
    fn test_structures_follow_json_rules() {
        assert_eq!(
            eval_json("({ a: [1, 'x', null], f() {}, u: undefined, nested: { b: false } })"),
            json!({ "a": [1, "x", null], "nested": { "b": false } })
        );
    }

    #[test]
    fn test_typed_arrays_become_bytes() {
        assert_eq!(eval_json("new Uint8Array([72, 105])"), json!([72, 105]));
        assert_eq!(eval_json("new Uint8Array([1, 2, 3]).buffer"), json!([1, 2, 3]));
    }

    #[test]
    fn test_cycles_are_rejected() {
        let runtime = Runtime::new().unwrap();
        let ctx = Context::full(&runtime).unwrap();
        ctx.with(|ctx| {
            let value: JsValue = ctx.eval("var o = {}; o.self = o; o").unwrap();
            assert!(matches!(js_to_json(&value), Err(RuntimeError::Conversion(_))));
        });
    }

    #[test]
    fn test_json_to_js_round_trip() {
        let runtime = Runtime::new().unwrap();
        let ctx = Context::full(&runtime).unwrap();
        ctx.with(|ctx| {
            let input = json!({ "big": 5_000_000_000i64, "list": [true, null, "s"], "n": -3 });
            let js = json_to_js(&ctx, &input).unwrap();
            ctx.globals().set("input", js).unwrap();

            let big: f64 = ctx.eval("input.big").unwrap();
            assert_eq!(big, 5_000_000_000.0);
            let is_null: bool = ctx.eval("input.list[1] === null").unwrap();
            assert!(is_null);

            let back: JsValue = ctx.eval("input").unwrap();
            assert_eq!(js_to_json(&back).unwrap(), input);
        });
    }
}
