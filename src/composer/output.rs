//! Typed construction of a workflow's result from its output config

use std::collections::BTreeMap;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{Number, Value};
use tracing::debug;

use super::{TemplateExpander, WorkflowContext, WorkflowError};
use crate::config::composite::{OutputConfig, OutputProperty};
use crate::context::CallContext;
use crate::vmcp::JsonMap;

const NO_VALUE: &str = "<no value>";

/// Build the workflow output described by `config`.
///
/// A `format` template takes precedence over `properties`. Property values
/// are rendered as templates and coerced to the declared type; `default` is
/// used when the value renders as `<no value>` or fails to render.
pub async fn construct_output(
    ctx: &CallContext,
    expander: &dyn TemplateExpander,
    config: &OutputConfig,
    workflow: &WorkflowContext,
) -> Result<JsonMap, WorkflowError> {
    if let Some(format) = config.format.as_deref().filter(|f| !f.is_empty()) {
        return expander
            .expand_output_format(ctx, format, workflow, workflow.start_time(), Utc::now())
            .await
            .map_err(|e| WorkflowError::OutputConstruction(e.to_string()));
    }

    for name in &config.required {
        if !config.properties.contains_key(name) {
            return Err(WorkflowError::OutputConstruction(format!(
                "required output field {name:?} is not defined in properties"
            )));
        }
    }

    build_properties(ctx, expander, &config.properties, workflow, "").await
}

fn build_properties<'a>(
    ctx: &'a CallContext,
    expander: &'a dyn TemplateExpander,
    properties: &'a BTreeMap<String, OutputProperty>,
    workflow: &'a WorkflowContext,
    prefix: &'a str,
) -> BoxFuture<'a, Result<JsonMap, WorkflowError>> {
    Box::pin(async move {
        let mut output = JsonMap::new();
        for (name, property) in properties {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}.{name}")
            };

            let value = if property.property_type == "object" && !property.properties.is_empty() {
                build_properties(ctx, expander, &property.properties, workflow, &path)
                    .await
                    .map(Value::Object)?
            } else {
                build_value(ctx, expander, property, workflow, &path).await?
            };
            output.insert(name.clone(), value);
        }
        Ok(output)
    })
}

async fn build_value(
    ctx: &CallContext,
    expander: &dyn TemplateExpander,
    property: &OutputProperty,
    workflow: &WorkflowContext,
    path: &str,
) -> Result<Value, WorkflowError> {
    let mut template = JsonMap::new();
    template.insert("value".into(), Value::String(property.value.clone()));

    let rendered = match expander.expand(ctx, &template, workflow).await {
        Ok(mut expanded) => match expanded.remove("value") {
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => NO_VALUE.to_string(),
        },
        Err(e) => {
            return match &property.default {
                Some(default) => {
                    debug!(field = path, error = %e, "Output value failed to expand, using default");
                    coerce_default(default, &property.property_type, path)
                }
                None => Err(WorkflowError::OutputConstruction(format!(
                    "failed to expand field {path:?}: {e}"
                ))),
            };
        }
    };

    if rendered == NO_VALUE {
        return match &property.default {
            Some(default) => coerce_default(default, &property.property_type, path),
            None => Ok(Value::String(rendered)),
        };
    }

    coerce(&rendered, &property.property_type, path)
}

fn coerce_default(default: &Value, property_type: &str, path: &str) -> Result<Value, WorkflowError> {
    match default {
        Value::String(s) => coerce(s, property_type, path),
        other => Ok(other.clone()),
    }
}

/// Convert a rendered string to the declared JSON type
fn coerce(rendered: &str, property_type: &str, path: &str) -> Result<Value, WorkflowError> {
    if rendered.is_empty() {
        return Ok(Value::String(String::new()));
    }

    let fail = |what: &str| {
        WorkflowError::OutputConstruction(format!(
            "field {path:?}: cannot coerce {rendered:?} to {what}"
        ))
    };

    match property_type {
        "integer" => {
            let trimmed = rendered.trim();
            if let Ok(n) = trimmed.parse::<i64>() {
                return Ok(Value::Number(n.into()));
            }
            match trimmed.parse::<f64>() {
                #[allow(clippy::cast_possible_truncation)]
                Ok(f) if f.fract() == 0.0 && f.is_finite() => Ok(Value::Number((f as i64).into())),
                _ => Err(fail("integer")),
            }
        }
        "number" => rendered
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| fail("number")),
        "boolean" => match rendered.trim() {
            "true" | "True" | "TRUE" | "t" | "T" | "1" => Ok(Value::Bool(true)),
            "false" | "False" | "FALSE" | "f" | "F" | "0" => Ok(Value::Bool(false)),
            _ => Err(fail("boolean")),
        },
        "object" => match serde_json::from_str::<Value>(rendered) {
            Ok(value @ Value::Object(_)) => Ok(value),
            Ok(_) => Err(fail("object")),
            Err(e) => Err(WorkflowError::OutputConstruction(format!(
                "field {path:?}: failed to deserialize JSON object: {e}"
            ))),
        },
        "array" => match serde_json::from_str::<Value>(rendered) {
            Ok(value @ Value::Array(_)) => Ok(value),
            Ok(_) => Err(fail("array")),
            Err(e) => Err(WorkflowError::OutputConstruction(format!(
                "field {path:?}: failed to deserialize JSON array: {e}"
            ))),
        },
        _ => Ok(Value::String(rendered.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::composer::DefaultTemplateExpander;

    fn prop(property_type: &str, value: &str) -> OutputProperty {
        OutputProperty {
            property_type: property_type.into(),
            value: value.into(),
            ..OutputProperty::default()
        }
    }

    fn workflow() -> WorkflowContext {
        let mut params = JsonMap::new();
        params.insert("name".into(), json!("ada"));
        let wf = WorkflowContext::new("wf-1", params);
        let output = json!({
            "count": 42,
            "ratio": 2.5,
            "ok": true,
            "empty": "",
            "payload": {"a": 1},
            "items": [1, 2],
            "maybe": "maybe"
        });
        let Value::Object(output) = output else {
            unreachable!()
        };
        wf.record_step_success("fetch", output, 0);
        wf
    }

    async fn build(config: OutputConfig) -> Result<JsonMap, WorkflowError> {
        construct_output(
            &CallContext::new(),
            &DefaultTemplateExpander::new(),
            &config,
            &workflow(),
        )
        .await
    }

    fn config(props: Vec<(&str, OutputProperty)>) -> OutputConfig {
        OutputConfig {
            properties: props.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            ..OutputConfig::default()
        }
    }

    #[tokio::test]
    async fn coerces_declared_types() {
        let out = build(config(vec![
            ("name", prop("string", "{{.params.name}}")),
            ("count", prop("integer", "{{.steps.fetch.output.count}}")),
            ("ratio", prop("number", "{{.steps.fetch.output.ratio}}")),
            ("ok", prop("boolean", "{{.steps.fetch.output.ok}}")),
            ("payload", prop("object", "{{json .steps.fetch.output.payload}}")),
            ("items", prop("array", "{{json .steps.fetch.output.items}}")),
            ("empty", prop("string", "{{.steps.fetch.output.empty}}")),
        ]))
        .await
        .unwrap();

        assert_eq!(out["name"], "ada");
        assert_eq!(out["count"], 42);
        assert_eq!(out["ratio"], 2.5);
        assert_eq!(out["ok"], true);
        assert_eq!(out["payload"], json!({"a": 1}));
        assert_eq!(out["items"], json!([1, 2]));
        assert_eq!(out["empty"], "");
    }

    #[tokio::test]
    async fn invalid_coercions_fail() {
        let err = build(config(vec![(
            "ok",
            prop("boolean", "{{.steps.fetch.output.maybe}}"),
        )]))
        .await
        .unwrap_err();
        assert!(err.to_string().contains("boolean"));

        let err = build(config(vec![("obj", prop("object", "not json"))]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to deserialize JSON"));
    }

    #[tokio::test]
    async fn defaults_fill_missing_values() {
        let mut with_default = prop("integer", "{{.steps.missing.output.count}}");
        with_default.default = Some(json!("7"));
        let mut null_default = prop("string", "{{.params.nothing}}");
        null_default.default = Some(Value::Null);
        let mut broken = prop("string", "{{.params.name.first}}");
        broken.default = Some(json!("fallback"));

        let out = build(config(vec![
            ("count", with_default),
            ("nothing", null_default),
            ("broken", broken),
            ("bare", prop("string", "{{.params.absent}}")),
        ]))
        .await
        .unwrap();

        assert_eq!(out["count"], 7);
        assert_eq!(out["nothing"], Value::Null);
        assert_eq!(out["broken"], "fallback");
        assert_eq!(out["bare"], "<no value>");
    }

    #[tokio::test]
    async fn nested_objects() {
        let mut stats = prop("object", "");
        stats
            .properties
            .insert("count".into(), prop("integer", "{{.steps.fetch.output.count}}"));
        stats
            .properties
            .insert("who".into(), prop("string", "{{.params.name}}"));

        let out = build(config(vec![("stats", stats)])).await.unwrap();
        assert_eq!(out["stats"], json!({"count": 42, "who": "ada"}));
    }

    #[tokio::test]
    async fn required_fields_must_be_declared() {
        let mut cfg = config(vec![("name", prop("string", "{{.params.name}}"))]);
        cfg.required = vec!["name".into(), "missing".into()];
        let err = build(cfg).await.unwrap_err();
        assert!(err.to_string().contains("required output field"));
    }

    #[tokio::test]
    async fn format_template_wins() {
        let cfg = OutputConfig {
            format: Some(r#"{"who": "{{.params.name}}", "n": {{.steps.fetch.output.count}}}"#.into()),
            ..config(vec![("ignored", prop("string", "x"))])
        };
        let out = build(cfg).await.unwrap();
        assert_eq!(out, json!({"who": "ada", "n": 42}).as_object().cloned().unwrap());
    }
}
