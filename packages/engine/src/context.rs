use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Mutable state threaded through one workflow execution. Steps read
/// earlier outputs through the template language (`steps.<name>.output`)
/// and each completed step writes its record here before the next starts.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub input: Value,
    pub steps: BTreeMap<String, StepRecord>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct StepRecord {
    pub output: Option<Value>,
    pub error: Option<String>,
}

impl ExecutionContext {
    pub fn new(input: Value, env: BTreeMap<String, String>) -> Self {
        Self {
            input,
            steps: BTreeMap::new(),
            env,
        }
    }

    pub fn record_output(&mut self, step: &str, output: Value) {
        self.steps.insert(
            step.to_string(),
            StepRecord {
                output: Some(output),
                error: None,
            },
        );
    }

    pub fn record_error(&mut self, step: &str, error: impl Into<String>) {
        self.steps.insert(
            step.to_string(),
            StepRecord {
                output: None,
                error: Some(error.into()),
            },
        );
    }

    /// The JSON root templates and conditions resolve against:
    /// `{input, steps: {name: {output, error}}, env}`.
    pub fn as_root(&self) -> Value {
        let mut steps = Map::new();
        for (name, record) in &self.steps {
            let mut entry = Map::new();
            if let Some(output) = &record.output {
                entry.insert("output".to_string(), output.clone());
            }
            if let Some(error) = &record.error {
                entry.insert("error".to_string(), Value::String(error.clone()));
            }
            steps.insert(name.clone(), Value::Object(entry));
        }

        let mut env = Map::new();
        for (key, value) in &self.env {
            env.insert(key.clone(), Value::String(value.clone()));
        }

        let mut root = Map::new();
        root.insert("input".to_string(), self.input.clone());
        root.insert("steps".to_string(), Value::Object(steps));
        root.insert("env".to_string(), Value::Object(env));
        Value::Object(root)
    }

    /// Outputs of all completed steps, the terminal execution output.
    pub fn outputs(&self) -> Value {
        let mut map = Map::new();
        for (name, record) in &self.steps {
            if let Some(output) = &record.output {
                map.insert(name.clone(), output.clone());
            }
        }
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn root_exposes_input_steps_env() {
        let mut ctx = ExecutionContext::new(
            json!({"city": "Paris"}),
            BTreeMap::from([("REGION".to_string(), "eu".to_string())]),
        );
        ctx.record_output("fetch", json!({"temp": 15}));
        ctx.record_error("broken", "boom");

        let root = ctx.as_root();
        assert_eq!(root["input"]["city"], "Paris");
        assert_eq!(root["steps"]["fetch"]["output"]["temp"], 15);
        assert_eq!(root["steps"]["broken"]["error"], "boom");
        assert_eq!(root["env"]["REGION"], "eu");
    }
}
