//! Job parameters and `#name#` substitution.
//!
//! A job's parameters are assembled from several layers (runnable defaults,
//! pipeline-wide params, analysis params, job input, accumulated fan-in data) and
//! then resolved lazily: a string value `"#name#"` is replaced by the value of
//! parameter `name` (keeping its JSON type), and any other string has each
//! `#name#` pair replaced by the stringified value.

use std::collections::HashMap;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::ApiaryError;

/// Errors raised while resolving parameters
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamError {
    #[error("parameter '{0}' is not defined")]
    Missing(String),

    #[error("parameter '{0}' is null")]
    Null(String),

    #[error("substitution loop detected on '{name}' (stack: {stack:?})")]
    InfiniteLoop { name: String, stack: Vec<String> },

    #[error("unmatched '#' in \"{0}\"")]
    Unmatched(String),

    #[error("invalid parameter name {0:?}")]
    InvalidName(String),
}

impl From<ParamError> for ApiaryError {
    fn from(err: ParamError) -> Self {
        ApiaryError::Param(err.to_string())
    }
}

/// Parameters of one job, substituted on first access.
#[derive(Debug, Clone, Default)]
pub struct ParamContainer {
    unsubstituted: Map<String, Value>,
    substituted: HashMap<String, Value>,
    in_progress: Vec<String>,
}

impl ParamContainer {
    pub fn new(unsubstituted: Map<String, Value>) -> Self {
        Self {
            unsubstituted,
            substituted: HashMap::new(),
            in_progress: Vec::new(),
        }
    }

    /// Build from layers, later layers overriding earlier ones.
    pub fn from_layers<'a>(layers: impl IntoIterator<Item = &'a Value>) -> Self {
        let mut merged = Map::new();
        for layer in layers {
            if let Some(obj) = layer.as_object() {
                for (k, v) in obj {
                    merged.insert(k.clone(), v.clone());
                }
            }
        }
        Self::new(merged)
    }

    /// Set a parameter. Set values are never substituted.
    pub fn set(&mut self, name: &str, value: Value) -> Result<(), ParamError> {
        validate_name(name)?;
        self.substituted.insert(name.to_string(), value);
        Ok(())
    }

    /// Whether the parameter exists, substituted or not.
    pub fn has(&self, name: &str) -> bool {
        self.substituted.contains_key(name) || self.unsubstituted.contains_key(name)
    }

    /// Get the substituted value of a parameter.
    pub fn get(&mut self, name: &str) -> Result<Value, ParamError> {
        validate_name(name)?;
        self.in_progress.clear();
        self.internal_get(name)
    }

    /// Get a parameter, failing if it is missing or null.
    pub fn required(&mut self, name: &str) -> Result<Value, ParamError> {
        match self.get(name)? {
            Value::Null => Err(ParamError::Null(name.to_string())),
            value => Ok(value),
        }
    }

    /// Get a parameter, `None` when missing.
    pub fn optional(&mut self, name: &str) -> Result<Option<Value>, ParamError> {
        match self.get(name) {
            Ok(value) => Ok(Some(value)),
            Err(ParamError::Missing(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Substitute every parameter reference in an arbitrary structure.
    pub fn substitute(&mut self, structure: &Value) -> Result<Value, ParamError> {
        self.in_progress.clear();
        self.substitute_value(structure)
    }

    /// All parameters, fully substituted.
    pub fn resolved(&mut self) -> Result<Map<String, Value>, ParamError> {
        let mut names: Vec<String> = self.unsubstituted.keys().cloned().collect();
        names.extend(self.substituted.keys().cloned());
        names.sort();
        names.dedup();

        let mut out = Map::new();
        for name in names {
            let value = self.get(&name)?;
            out.insert(name, value);
        }
        Ok(out)
    }

    fn internal_get(&mut self, name: &str) -> Result<Value, ParamError> {
        if let Some(value) = self.substituted.get(name) {
            return Ok(value.clone());
        }
        let raw = self
            .unsubstituted
            .get(name)
            .cloned()
            .ok_or_else(|| ParamError::Missing(name.to_string()))?;
        let value = self.substitute_value(&raw)?;
        self.substituted.insert(name.to_string(), value.clone());
        Ok(value)
    }

    fn substitute_value(&mut self, structure: &Value) -> Result<Value, ParamError> {
        match structure {
            Value::Array(items) => items
                .iter()
                .map(|item| self.substitute_value(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(obj) => {
                let mut out = Map::new();
                for (k, v) in obj {
                    let key = self.substitute_string(k)?;
                    let key = match key {
                        Value::String(s) => s,
                        other => stringify(&other),
                    };
                    out.insert(key, self.substitute_value(v)?);
                }
                Ok(Value::Object(out))
            }
            Value::String(s) => self.substitute_string(s),
            other => Ok(other.clone()),
        }
    }

    fn substitute_string(&mut self, s: &str) -> Result<Value, ParamError> {
        // A single reference keeps the referenced value's type.
        if s.len() > 2 && s.starts_with('#') && s.ends_with('#') && !s[1..s.len() - 1].contains('#') {
            return self.subst_one(&s[1..s.len() - 1]);
        }
        if s.matches('#').count() < 2 {
            return Ok(Value::String(s.to_string()));
        }

        let mut result = String::new();
        let mut rest = s;
        while let Some(start) = rest.find('#') {
            result.push_str(&rest[..start]);
            let tail = &rest[start + 1..];
            let end = tail.find('#').ok_or_else(|| ParamError::Unmatched(s.to_string()))?;
            let middle = &tail[..end];
            if middle.is_empty() {
                result.push_str("##");
            } else {
                let value = self.subst_one(middle)?;
                result.push_str(&stringify(&value));
            }
            rest = &tail[end + 1..];
        }
        result.push_str(rest);
        Ok(Value::String(result))
    }

    fn subst_one(&mut self, name: &str) -> Result<Value, ParamError> {
        if self.in_progress.iter().any(|n| n == name) {
            return Err(ParamError::InfiniteLoop {
                name: name.to_string(),
                stack: self.in_progress.clone(),
            });
        }
        self.in_progress.push(name.to_string());
        let value = self.internal_get(name);
        self.in_progress.pop();
        value
    }
}

fn validate_name(name: &str) -> Result<(), ParamError> {
    if name.is_empty() {
        return Err(ParamError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Strings are inserted bare, everything else as compact JSON.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn container(value: Value) -> ParamContainer {
        ParamContainer::new(value.as_object().cloned().unwrap())
    }

    #[test]
    fn test_plain_values() {
        let mut p = container(json!({"alpha": 2, "name": "x"}));
        assert_eq!(p.get("alpha").unwrap(), json!(2));
        assert_eq!(p.get("name").unwrap(), json!("x"));
    }

    #[test]
    fn test_single_reference_keeps_type() {
        let mut p = container(json!({"gamma": [10, 20], "ref": "#gamma#"}));
        assert_eq!(p.get("ref").unwrap(), json!([10, 20]));
    }

    #[test]
    fn test_interpolation_in_string() {
        let mut p = container(json!({"alpha": 2, "beta": 5, "s": "#alpha# and #beta#"}));
        assert_eq!(p.get("s").unwrap(), json!("2 and 5"));
    }

    #[test]
    fn test_single_hash_is_literal() {
        let mut p = container(json!({"s": "issue #12"}));
        assert_eq!(p.get("s").unwrap(), json!("issue #12"));
    }

    #[test]
    fn test_null_reference() {
        let mut p = container(json!({"null": null, "ref_null": "#null#", "mixed": "a#null#b"}));
        assert_eq!(p.get("ref_null").unwrap(), Value::Null);
        assert_eq!(p.get("mixed").unwrap(), json!("ab"));
    }

    #[test]
    fn test_missing_parameter() {
        let mut p = container(json!({"c": "#other#"}));
        assert_eq!(p.get("d"), Err(ParamError::Missing("d".into())));
        assert_eq!(p.get("c"), Err(ParamError::Missing("other".into())));
        assert_eq!(p.optional("d").unwrap(), None);
    }

    #[test]
    fn test_infinite_loop_detected() {
        let mut p = container(json!({"a": "#b#", "b": "#a#", "e": "#e#"}));
        assert!(matches!(p.get("a"), Err(ParamError::InfiniteLoop { .. })));
        assert!(matches!(p.get("e"), Err(ParamError::InfiniteLoop { .. })));
    }

    #[test]
    fn test_required_rejects_null() {
        let mut p = container(json!({"a": 3, "b": null}));
        assert_eq!(p.required("a").unwrap(), json!(3));
        assert_eq!(p.required("b"), Err(ParamError::Null("b".into())));
    }

    #[test]
    fn test_set_overrides_and_is_not_substituted() {
        let mut p = container(json!({"a": 1}));
        p.set("a", json!("#literal#")).unwrap();
        assert_eq!(p.get("a").unwrap(), json!("#literal#"));
        assert!(p.set("", json!(1)).is_err());
    }

    #[test]
    fn test_unmatched_hash() {
        let mut p = container(json!({"a": 1, "s": "#a# and #b"}));
        assert!(matches!(p.get("s"), Err(ParamError::Unmatched(_))));
    }

    #[test]
    fn test_layers_override_in_order() {
        let defaults = json!({"take_time": 0, "x": "default"});
        let input = json!({"x": "input"});
        let mut p = ParamContainer::from_layers([&defaults, &input]);
        assert_eq!(p.get("x").unwrap(), json!("input"));
        assert_eq!(p.get("take_time").unwrap(), json!(0));
    }

    #[test]
    fn test_substitute_template() {
        let mut p = container(json!({"a_multiplier": "9650", "digit": 3}));
        let template = json!({"a": "#a_multiplier#", "d": "#digit#", "label": "x#digit#"});
        assert_eq!(
            p.substitute(&template).unwrap(),
            json!({"a": "9650", "d": 3, "label": "x3"})
        );
    }

    #[test]
    fn test_resolved_returns_everything() {
        let mut p = container(json!({"a": 1, "b": "#a#"}));
        p.set("c", json!(true)).unwrap();
        let all = p.resolved().unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all["b"], json!(1));
    }
}
