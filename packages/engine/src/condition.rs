use serde_json::Value;
use toolgrid_types::{Condition, ConditionOperator};

use crate::template::lookup_path;

/// Evaluates a condition against the execution context root. A missing
/// path is falsy for every operator except `not_equals`.
pub fn evaluate(condition: &Condition, root: &Value) -> bool {
    let path: Vec<String> = condition
        .path
        .split('.')
        .map(|s| s.trim().to_string())
        .collect();
    let actual = lookup_path(root, &path);
    let expected = condition.value.as_ref();

    match condition.operator {
        ConditionOperator::Exists => actual.is_some_and(|v| !v.is_null()),
        ConditionOperator::Equals => match (actual, expected) {
            (Some(a), Some(e)) => json_eq(a, e),
            _ => false,
        },
        ConditionOperator::NotEquals => match (actual, expected) {
            (Some(a), Some(e)) => !json_eq(a, e),
            (None, Some(_)) => true,
            _ => false,
        },
        ConditionOperator::Contains => match (actual, expected) {
            (Some(Value::String(haystack)), Some(Value::String(needle))) => {
                haystack.contains(needle.as_str())
            }
            (Some(Value::Array(items)), Some(needle)) => items.iter().any(|i| json_eq(i, needle)),
            (Some(Value::Object(map)), Some(Value::String(key))) => map.contains_key(key),
            _ => false,
        },
        ConditionOperator::Gt => compare(actual, expected).is_some_and(|ord| ord.is_gt()),
        ConditionOperator::Lt => compare(actual, expected).is_some_and(|ord| ord.is_lt()),
    }
}

fn json_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        // numeric comparison so 15 == 15.0
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(actual: Option<&Value>, expected: Option<&Value>) -> Option<std::cmp::Ordering> {
    let a = actual?.as_f64()?;
    let e = expected?.as_f64()?;
    a.partial_cmp(&e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cond(operator: ConditionOperator, path: &str, value: Option<Value>) -> Condition {
        Condition {
            operator,
            path: path.to_string(),
            value,
        }
    }

    fn root() -> Value {
        json!({
            "input": {"city": "Paris", "count": 3},
            "steps": {"fetch": {"output": {"temp": 15, "tags": ["cold", "wet"]}}}
        })
    }

    #[test]
    fn equals_and_not_equals() {
        assert!(evaluate(
            &cond(ConditionOperator::Equals, "input.city", Some(json!("Paris"))),
            &root()
        ));
        assert!(evaluate(
            &cond(
                ConditionOperator::NotEquals,
                "input.city",
                Some(json!("Lyon"))
            ),
            &root()
        ));
        // missing path is "not equal" to any value
        assert!(evaluate(
            &cond(ConditionOperator::NotEquals, "input.nope", Some(json!(1))),
            &root()
        ));
    }

    #[test]
    fn exists() {
        assert!(evaluate(
            &cond(ConditionOperator::Exists, "steps.fetch.output", None),
            &root()
        ));
        assert!(!evaluate(
            &cond(ConditionOperator::Exists, "steps.missing.output", None),
            &root()
        ));
    }

    #[test]
    fn contains_on_strings_and_arrays() {
        assert!(evaluate(
            &cond(
                ConditionOperator::Contains,
                "input.city",
                Some(json!("ari"))
            ),
            &root()
        ));
        assert!(evaluate(
            &cond(
                ConditionOperator::Contains,
                "steps.fetch.output.tags",
                Some(json!("wet"))
            ),
            &root()
        ));
    }

    #[test]
    fn numeric_ordering() {
        assert!(evaluate(
            &cond(
                ConditionOperator::Gt,
                "steps.fetch.output.temp",
                Some(json!(10))
            ),
            &root()
        ));
        assert!(evaluate(
            &cond(ConditionOperator::Lt, "input.count", Some(json!(5.5))),
            &root()
        ));
        // non-numeric operands never satisfy an ordering
        assert!(!evaluate(
            &cond(ConditionOperator::Gt, "input.city", Some(json!(1))),
            &root()
        ));
    }
}
