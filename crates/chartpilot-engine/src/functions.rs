//! Global template functions

use minijinja::{Error, ErrorKind, Value};

/// `{{ fail("unsupported storage class") }}`
pub fn fail(message: String) -> Result<Value, Error> {
    Err(Error::new(ErrorKind::InvalidOperation, message))
}

/// `{{ dict("app", release.name, "tier", "web") }}`
pub fn dict(args: Vec<Value>) -> Result<Value, Error> {
    if args.len() % 2 != 0 {
        return Err(Error::new(
            ErrorKind::InvalidOperation,
            "dict requires key-value pairs",
        ));
    }

    let mut map = serde_json::Map::new();
    for pair in args.chunks(2) {
        let key = pair[0].as_str().ok_or_else(|| {
            Error::new(ErrorKind::InvalidOperation, "dict keys must be strings")
        })?;
        let value = serde_json::to_value(&pair[1])
            .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))?;
        map.insert(key.to_string(), value);
    }
    Ok(Value::from_serialize(serde_json::Value::Object(map)))
}

/// First argument that is neither undefined, none nor an empty string
pub fn coalesce(args: Vec<Value>) -> Value {
    args.into_iter()
        .find(|v| !v.is_undefined() && !v.is_none() && v.as_str() != Some(""))
        .unwrap_or(Value::UNDEFINED)
}

/// `{{ ternary("yes", "no", values.enabled) }}`
pub fn ternary(when_true: Value, when_false: Value, condition: Value) -> Value {
    if condition.is_true() {
        when_true
    } else {
        when_false
    }
}

pub fn tostring(value: Value) -> String {
    value
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| value.to_string())
}

pub fn toint(value: Value) -> Result<i64, Error> {
    if let Some(s) = value.as_str() {
        return s.trim().parse::<i64>().map_err(|e| {
            Error::new(ErrorKind::InvalidOperation, format!("cannot convert '{}' to int: {}", s, e))
        });
    }
    i64::try_from(value.clone()).map_err(|_| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("cannot convert {} to int", value),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dict() {
        let v = dict(vec![Value::from("a"), Value::from(1)]).unwrap();
        assert_eq!(v.get_attr("a").unwrap(), Value::from(1));
        assert!(dict(vec![Value::from("a")]).is_err());
    }

    #[test]
    fn test_coalesce() {
        let v = coalesce(vec![Value::UNDEFINED, Value::from(""), Value::from("x")]);
        assert_eq!(v, Value::from("x"));
    }

    #[test]
    fn test_ternary() {
        assert_eq!(
            ternary(Value::from("a"), Value::from("b"), Value::from(false)),
            Value::from("b")
        );
    }

    #[test]
    fn test_toint() {
        assert_eq!(toint(Value::from("42")).unwrap(), 42);
        assert_eq!(toint(Value::from(7)).unwrap(), 7);
        assert!(toint(Value::from("x")).is_err());
    }
}
