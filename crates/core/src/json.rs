//! JSON bindings for annotations
//!
//! Import is deliberately forgiving: integers parse from JSON
//! numbers and numeric strings, floats accept "Infinity" / "-Infinity" /
//! "NaN", unknown struct fields are warned and ignored, an unrecognized
//! interval shape warns and coerces to missing. A null for a required field
//! is fatal. Warnings are rate-limited through `WarnCounter` so a bad
//! million-row partition does not flood the log.

use crate::annotation::Annotation;
use crate::error::EngineError;
use crate::types::{Kind, VType};
use base64::{Engine, engine::general_purpose::STANDARD};
use serde_json::Value;
use tracing::warn;

/// Per-partition rate limiter for import warnings.
#[derive(Debug)]
pub struct WarnCounter {
    context: String,
    cap: usize,
    count: usize,
}

impl WarnCounter {
    pub fn new(context: impl Into<String>, cap: usize) -> WarnCounter {
        WarnCounter {
            context: context.into(),
            cap,
            count: 0,
        }
    }

    pub fn warn(&mut self, msg: &str) {
        self.count += 1;
        if self.count <= self.cap {
            warn!("{}: {}", self.context, msg);
        } else if self.count == self.cap + 1 {
            warn!("{}: further warnings suppressed", self.context);
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

/// Export a non-missing annotation of type `typ` as JSON. Missing exports
/// as null.
pub fn export_annotation(typ: &VType, a: &Annotation) -> Value {
    match (&typ.kind, a) {
        (_, Annotation::Missing) => Value::Null,
        (Kind::Bool, Annotation::Bool(v)) => Value::Bool(*v),
        (Kind::Int32 | Kind::Call, Annotation::Int32(v)) => Value::from(*v),
        (Kind::Int64, Annotation::Int64(v)) => Value::from(*v),
        (Kind::Float32, Annotation::Float32(v)) => export_float(*v as f64),
        (Kind::Float64, Annotation::Float64(v)) => export_float(*v),
        (Kind::Str, Annotation::Str(s)) => Value::String(s.clone()),
        (Kind::Binary, Annotation::Binary(b)) => Value::String(STANDARD.encode(b)),
        (Kind::Locus, Annotation::Struct(fields)) => {
            let mut obj = serde_json::Map::new();
            obj.insert(
                "contig".to_string(),
                export_annotation(&VType::str().required(), &fields[0]),
            );
            obj.insert(
                "position".to_string(),
                export_annotation(&VType::int32().required(), &fields[1]),
            );
            Value::Object(obj)
        }
        (Kind::Interval(point), Annotation::Struct(fields)) => {
            let mut obj = serde_json::Map::new();
            obj.insert("start".to_string(), export_annotation(point, &fields[0]));
            obj.insert("end".to_string(), export_annotation(point, &fields[1]));
            obj.insert("includeStart".to_string(), fields[2].as_bool().into());
            obj.insert("includeEnd".to_string(), fields[3].as_bool().into());
            Value::Object(obj)
        }
        (Kind::Struct(_) | Kind::Tuple(_), Annotation::Struct(values)) => {
            match &typ.kind {
                Kind::Struct(fields) => {
                    let mut obj = serde_json::Map::new();
                    for (field, value) in fields.iter().zip(values) {
                        obj.insert(field.name.clone(), export_annotation(&field.typ, value));
                    }
                    Value::Object(obj)
                }
                // tuples export positionally
                Kind::Tuple(types) => Value::Array(
                    types
                        .iter()
                        .zip(values)
                        .map(|(t, v)| export_annotation(t, v))
                        .collect(),
                ),
                _ => unreachable!(),
            }
        }
        (Kind::Array(_) | Kind::Set(_) | Kind::Dict(_, _), Annotation::Array(values)) => {
            let elem = typ.array_element().expect("array-shaped kind");
            Value::Array(values.iter().map(|v| export_annotation(&elem, v)).collect())
        }
        (kind, a) => panic!("annotation {:?} does not fit type kind {:?}", a, kind),
    }
}

fn export_float(v: f64) -> Value {
    if v.is_finite() {
        serde_json::Number::from_f64(v)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    } else if v.is_nan() {
        Value::String("NaN".to_string())
    } else if v > 0.0 {
        Value::String("Infinity".to_string())
    } else {
        Value::String("-Infinity".to_string())
    }
}

/// Import a JSON value as an annotation of type `typ`.
pub fn import_annotation(
    typ: &VType,
    v: &Value,
    warns: &mut WarnCounter,
) -> Result<Annotation, EngineError> {
    imp(typ, v, warns, "<root>")
}

fn imp(
    typ: &VType,
    v: &Value,
    warns: &mut WarnCounter,
    path: &str,
) -> Result<Annotation, EngineError> {
    if v.is_null() {
        if typ.required {
            return Err(EngineError::user(format!(
                "at {}: null for required type {}",
                path, typ
            )));
        }
        return Ok(Annotation::Missing);
    }
    match &typ.kind {
        Kind::Bool => match v.as_bool() {
            Some(b) => Ok(Annotation::Bool(b)),
            None => Err(bad(path, "boolean", v)),
        },
        Kind::Int32 | Kind::Call => import_i64(v, path).and_then(|n| {
            i32::try_from(n)
                .map(Annotation::Int32)
                .map_err(|_| EngineError::Json(format!("at {}: {} out of Int32 range", path, n)))
        }),
        Kind::Int64 => import_i64(v, path).map(Annotation::Int64),
        Kind::Float32 => import_f64(v, path).map(|f| Annotation::Float32(f as f32)),
        Kind::Float64 => import_f64(v, path).map(Annotation::Float64),
        Kind::Str => match v.as_str() {
            Some(s) => Ok(Annotation::Str(s.to_string())),
            None => Err(bad(path, "string", v)),
        },
        Kind::Binary => match v.as_str() {
            Some(s) => STANDARD
                .decode(s)
                .map(Annotation::Binary)
                .map_err(|e| EngineError::Json(format!("at {}: bad base64: {}", path, e))),
            None => Err(bad(path, "base64 string", v)),
        },
        Kind::Locus => {
            let obj = v.as_object().ok_or_else(|| bad(path, "locus object", v))?;
            let contig = obj
                .get("contig")
                .ok_or_else(|| EngineError::Json(format!("at {}: locus without contig", path)))?;
            let position = obj
                .get("position")
                .ok_or_else(|| EngineError::Json(format!("at {}: locus without position", path)))?;
            Ok(Annotation::Struct(vec![
                imp(&VType::str().required(), contig, warns, &format!("{}.contig", path))?,
                imp(
                    &VType::int32().required(),
                    position,
                    warns,
                    &format!("{}.position", path),
                )?,
            ]))
        }
        Kind::Interval(point) => {
            let shape = v.as_object().and_then(|obj| {
                let start = obj.get("start")?;
                let end = obj.get("end")?;
                let is = obj.get("includeStart").and_then(Value::as_bool)?;
                let ie = obj.get("includeEnd").and_then(Value::as_bool)?;
                Some((start, end, is, ie))
            });
            match shape {
                Some((start, end, is, ie)) => Ok(Annotation::Struct(vec![
                    imp(point, start, warns, &format!("{}.start", path))?,
                    imp(point, end, warns, &format!("{}.end", path))?,
                    Annotation::Bool(is),
                    Annotation::Bool(ie),
                ])),
                None => {
                    warns.warn(&format!("at {}: unrecognized interval shape, treating as missing", path));
                    if typ.required {
                        return Err(EngineError::user(format!(
                            "at {}: unrecognized interval shape for required type {}",
                            path, typ
                        )));
                    }
                    Ok(Annotation::Missing)
                }
            }
        }
        Kind::Struct(fields) => {
            let obj = v.as_object().ok_or_else(|| bad(path, "object", v))?;
            for key in obj.keys() {
                if !fields.iter().any(|f| f.name == *key) {
                    warns.warn(&format!("at {}: unknown field `{}` ignored", path, key));
                }
            }
            let mut out = Vec::with_capacity(fields.len());
            for field in fields {
                let sub_path = format!("{}.{}", path, field.name);
                match obj.get(&field.name) {
                    Some(fv) => out.push(imp(&field.typ, fv, warns, &sub_path)?),
                    None => {
                        if field.typ.required {
                            return Err(EngineError::user(format!(
                                "at {}: missing required field `{}`",
                                path, field.name
                            )));
                        }
                        out.push(Annotation::Missing);
                    }
                }
            }
            Ok(Annotation::Struct(out))
        }
        Kind::Tuple(types) => {
            let arr = v.as_array().ok_or_else(|| bad(path, "array", v))?;
            if arr.len() != types.len() {
                return Err(EngineError::Json(format!(
                    "at {}: tuple arity mismatch: expected {}, got {}",
                    path,
                    types.len(),
                    arr.len()
                )));
            }
            let mut out = Vec::with_capacity(types.len());
            for (i, (t, item)) in types.iter().zip(arr).enumerate() {
                out.push(imp(t, item, warns, &format!("{}.{}", path, i))?);
            }
            Ok(Annotation::Struct(out))
        }
        Kind::Array(_) | Kind::Set(_) | Kind::Dict(_, _) => {
            let elem = typ.array_element().expect("array-shaped kind");
            let arr = v.as_array().ok_or_else(|| bad(path, "array", v))?;
            let mut out = Vec::with_capacity(arr.len());
            for (i, item) in arr.iter().enumerate() {
                out.push(imp(&elem, item, warns, &format!("{}[{}]", path, i))?);
            }
            Ok(Annotation::Array(out))
        }
    }
}

fn import_i64(v: &Value, path: &str) -> Result<i64, EngineError> {
    if let Some(n) = v.as_i64() {
        return Ok(n);
    }
    if let Some(s) = v.as_str() {
        if let Ok(n) = s.parse::<i64>() {
            return Ok(n);
        }
    }
    Err(bad(path, "integer", v))
}

fn import_f64(v: &Value, path: &str) -> Result<f64, EngineError> {
    if let Some(f) = v.as_f64() {
        return Ok(f);
    }
    if let Some(s) = v.as_str() {
        return match s {
            "Infinity" => Ok(f64::INFINITY),
            "-Infinity" => Ok(f64::NEG_INFINITY),
            "NaN" => Ok(f64::NAN),
            _ => s
                .parse::<f64>()
                .map_err(|_| bad(path, "float", v)),
        };
    }
    Err(bad(path, "float", v))
}

fn bad(path: &str, expected: &str, got: &Value) -> EngineError {
    EngineError::Json(format!("at {}: expected {}, got {}", path, expected, got))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn counter() -> WarnCounter {
        WarnCounter::new("test", 10)
    }

    fn roundtrip(typ: &VType, a: &Annotation) {
        let v = export_annotation(typ, a);
        let back = import_annotation(typ, &v, &mut counter()).unwrap();
        assert_eq!(&back, a, "json round-trip for {}", typ);
    }

    #[test]
    fn test_json_roundtrip() {
        roundtrip(&VType::int32(), &Annotation::Int32(5));
        roundtrip(&VType::int64(), &Annotation::Int64(-9));
        roundtrip(&VType::float64(), &Annotation::Float64(1.25));
        roundtrip(&VType::str(), &Annotation::Str("abc".into()));
        roundtrip(&VType::binary(), &Annotation::Binary(vec![0, 255, 7]));
        roundtrip(
            &VType::struct_of(vec![("a", VType::int32()), ("b", VType::str())]),
            &Annotation::Struct(vec![Annotation::Missing, Annotation::Str("x".into())]),
        );
        roundtrip(
            &VType::array_of(VType::int32()),
            &Annotation::Array(vec![Annotation::Int32(1), Annotation::Missing]),
        );
        roundtrip(
            &VType::locus(),
            &Annotation::Struct(vec![Annotation::Str("1".into()), Annotation::Int32(100)]),
        );
        roundtrip(
            &VType::interval_of(VType::int32().required()),
            &Annotation::Struct(vec![
                Annotation::Int32(1),
                Annotation::Int32(2),
                Annotation::Bool(true),
                Annotation::Bool(false),
            ]),
        );
    }

    #[test]
    fn test_infinity_round_trips() {
        let v = export_annotation(&VType::float64(), &Annotation::Float64(f64::INFINITY));
        assert_eq!(v, json!("Infinity"));
        roundtrip(&VType::float64(), &Annotation::Float64(f64::NEG_INFINITY));
    }

    #[test]
    fn test_int_parses_from_numeric_string() {
        let got = import_annotation(&VType::int32(), &json!("42"), &mut counter()).unwrap();
        assert_eq!(got, Annotation::Int32(42));
    }

    #[test]
    fn test_unknown_field_warned_and_ignored() {
        let typ = VType::struct_of(vec![("a", VType::int32())]);
        let mut warns = counter();
        let got = import_annotation(&typ, &json!({"a": 1, "zzz": true}), &mut warns).unwrap();
        assert_eq!(got, Annotation::Struct(vec![Annotation::Int32(1)]));
        assert_eq!(warns.count(), 1);
    }

    #[test]
    fn test_null_for_required_is_fatal() {
        let typ = VType::struct_of(vec![("a", VType::int32().required())]);
        let err = import_annotation(&typ, &json!({"a": null}), &mut counter()).unwrap_err();
        assert!(matches!(err, EngineError::User(_)));
    }

    #[test]
    fn test_unrecognized_interval_shape_coerces_to_missing() {
        let typ = VType::interval_of(VType::int32().required());
        let mut warns = counter();
        let got = import_annotation(&typ, &json!({"lo": 1, "hi": 2}), &mut warns).unwrap();
        assert_eq!(got, Annotation::Missing);
        assert_eq!(warns.count(), 1);
    }
}
