//! The step-config template language: `{{ path.segments }}` placeholders
//! resolved against the execution context, nothing more. A tiny evaluator
//! is deliberate here; a general-purpose engine would let helpers and
//! partials reach outside the execution context.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_CACHE_SIZE: usize = 1000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Unterminated placeholder starting at byte {0}")]
    Unterminated(usize),
    #[error("Empty placeholder at byte {0}")]
    EmptyPlaceholder(usize),
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    /// Dotted path split into parts, e.g. `steps.fetch.output`.
    Placeholder(Vec<String>),
}

/// A parsed template. Compilation is cheap but not free; compiled
/// templates are shared through [`TemplateCache`] across executions.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn compile(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = source;
        let mut offset = 0;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or(TemplateError::Unterminated(offset + start))?;
            let expr = after[..end].trim();
            if expr.is_empty() {
                return Err(TemplateError::EmptyPlaceholder(offset + start));
            }
            segments.push(Segment::Placeholder(
                expr.split('.').map(|s| s.trim().to_string()).collect(),
            ));
            offset += start + 2 + end + 2;
            rest = &after[end + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self { segments })
    }

    /// Renders against a context root. Unresolvable paths render as the
    /// empty string; non-string leaf values render as compact JSON.
    pub fn render(&self, root: &Value) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(path) => {
                    if let Some(value) = lookup_path(root, path) {
                        match value {
                            Value::String(s) => out.push_str(s),
                            Value::Null => {}
                            other => out.push_str(&other.to_string()),
                        }
                    }
                }
            }
        }
        out
    }
}

/// Walks a dotted path through objects and array indexes.
pub fn lookup_path<'a>(root: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut current = root;
    for part in path {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Bounded cache of compiled templates, keyed by source text. Shared
/// across concurrent executions behind a single mutex.
pub struct TemplateCache {
    cache: Mutex<LruCache<String, Arc<Template>>>,
}

impl TemplateCache {
    pub fn new(size: usize) -> Self {
        let size = NonZeroUsize::new(size)
            .unwrap_or_else(|| NonZeroUsize::new(DEFAULT_CACHE_SIZE).unwrap());
        Self {
            cache: Mutex::new(LruCache::new(size)),
        }
    }

    pub fn get(&self, source: &str) -> Result<Arc<Template>, TemplateError> {
        {
            let mut cache = self.cache.lock().unwrap();
            if let Some(template) = cache.get(source) {
                return Ok(template.clone());
            }
        }

        let template = Arc::new(Template::compile(source)?);
        self.cache
            .lock()
            .unwrap()
            .put(source.to_string(), template.clone());
        Ok(template)
    }

    pub fn len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TemplateCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE)
    }
}

/// Renders a single string and then — WARNING, surprising but kept for
/// compatibility with existing workflow definitions — if the rendered
/// result begins with `{` or `[`, attempts to parse it as JSON and
/// returns the parsed value on success. A template that renders to
/// something that merely *looks* like JSON will therefore come back as
/// structured data, not a string.
pub fn render_auto(cache: &TemplateCache, source: &str, root: &Value) -> Result<Value, TemplateError> {
    let rendered = cache.get(source)?.render(root);
    let trimmed = rendered.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(parsed) = serde_json::from_str::<Value>(&rendered) {
            return Ok(parsed);
        }
    }
    Ok(Value::String(rendered))
}

/// Recursively interpolates a step config: strings containing `{{` are
/// rendered (with JSON auto-parse, see [`render_auto`]); arrays and
/// objects recurse; everything else passes through untouched.
pub fn interpolate(
    cache: &TemplateCache,
    config: &Value,
    root: &Value,
) -> Result<Value, TemplateError> {
    Ok(match config {
        Value::String(s) if s.contains("{{") => render_auto(cache, s, root)?,
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| interpolate(cache, item, root))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), interpolate(cache, v, root)?)))
                .collect::<Result<_, TemplateError>>()?,
        ),
        other => other.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Value {
        json!({
            "input": {"city": "Paris", "count": 3},
            "steps": {
                "fetch": {"output": {"temp": 15}}
            },
            "env": {"REGION": "eu-west"}
        })
    }

    #[test]
    fn renders_plain_paths() {
        let t = Template::compile("city={{ input.city }} region={{env.REGION}}").unwrap();
        assert_eq!(t.render(&ctx()), "city=Paris region=eu-west");
    }

    #[test]
    fn missing_paths_render_empty() {
        let t = Template::compile("[{{ input.nope }}]").unwrap();
        assert_eq!(t.render(&ctx()), "[]");
    }

    #[test]
    fn non_string_values_render_as_json() {
        let t = Template::compile("{{ steps.fetch.output }}").unwrap();
        assert_eq!(t.render(&ctx()), r#"{"temp":15}"#);
    }

    #[test]
    fn unterminated_placeholder_fails() {
        assert!(matches!(
            Template::compile("oops {{ input.city"),
            Err(TemplateError::Unterminated(_))
        ));
    }

    #[test]
    fn auto_parse_returns_structured_value() {
        let cache = TemplateCache::default();
        let value = render_auto(&cache, "{{ steps.fetch.output }}", &ctx()).unwrap();
        assert_eq!(value, json!({"temp": 15}));

        // a non-JSON rendering stays a string
        let value = render_auto(&cache, "temp is {{ steps.fetch.output.temp }}", &ctx()).unwrap();
        assert_eq!(value, json!("temp is 15"));
    }

    #[test]
    fn interpolate_recurses_and_preserves_non_templates() {
        let cache = TemplateCache::default();
        let config = json!({
            "params": {"city": "{{ input.city }}", "limit": 5},
            "tags": ["{{ env.REGION }}", "static"]
        });
        let out = interpolate(&cache, &config, &ctx()).unwrap();
        assert_eq!(
            out,
            json!({
                "params": {"city": "Paris", "limit": 5},
                "tags": ["eu-west", "static"]
            })
        );
    }

    #[test]
    fn cache_is_bounded() {
        let cache = TemplateCache::new(2);
        cache.get("{{ input.city }} a").unwrap();
        cache.get("{{ input.city }} b").unwrap();
        cache.get("{{ input.city }} c").unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn array_index_paths() {
        let root = json!({"steps": {"list": {"output": ["a", "b", "c"]}}});
        let t = Template::compile("{{ steps.list.output.1 }}").unwrap();
        assert_eq!(t.render(&root), "b");
    }
}
