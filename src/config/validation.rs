//! Static validation of composite tool definitions.
//!
//! Every problem found at the top level is collected and reported together as
//! `validation failed: a; b`. Step-level checks stop at the first problem.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde_json::Value;

use super::composite::{
    CompositeToolConfig, ELICITATION_ACTION_ABORT, ELICITATION_ACTION_CONTINUE,
    ELICITATION_ACTION_SKIP_REMAINING, ERROR_ACTION_ABORT, ERROR_ACTION_CONTINUE,
    ERROR_ACTION_RETRY, ElicitationResponseConfig, OUTPUT_TYPES, OutputConfig, OutputProperty,
    STEP_TYPE_ELICITATION, STEP_TYPE_TOOL, StepErrorHandling, WorkflowStepConfig,
};
use crate::composer::MAX_WORKFLOW_STEPS;
use crate::composer::template::{extract_references, validate_template};
use crate::{Error, Result};

type StepResult = std::result::Result<(), String>;

/// Validate a composite tool definition.
///
/// `path` prefixes every message (`compositeTools[0]`).
///
/// # Errors
///
/// Returns [`Error::Validation`] listing every problem found.
pub fn validate_composite_tool_config(path: &str, tool: &CompositeToolConfig) -> Result<()> {
    let mut errors = Vec::new();

    if tool.name.is_empty() {
        errors.push(format!("{path}.name is required"));
    }
    if tool.description.is_empty() {
        errors.push(format!("{path}.description is required"));
    }
    if tool.steps.is_empty() {
        errors.push(format!("{path}.steps must have at least one step"));
    }
    if tool.steps.len() > MAX_WORKFLOW_STEPS {
        errors.push(format!(
            "{path}.steps: too many steps ({} > {MAX_WORKFLOW_STEPS})",
            tool.steps.len()
        ));
    }
    if let Some(mode) = tool.failure_mode.as_deref()
        && !matches!(mode, "" | "abort" | "continue")
    {
        errors.push(format!("{path}.failureMode must be one of: abort, continue"));
    }

    if let Err(e) = validate_parameters(path, tool.parameters.as_ref()) {
        errors.push(e);
    }

    if !tool.steps.is_empty() {
        let steps_path = format!("{path}.steps");
        if let Err(e) = validate_steps(&steps_path, &tool.steps) {
            errors.push(e);
        }
        if let Err(e) = validate_default_results(&steps_path, &tool.steps, tool.output.as_ref()) {
            errors.push(e);
        }
    }

    if let Some(output) = &tool.output
        && let Err(e) = validate_output(&format!("{path}.output"), output)
    {
        errors.push(e);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "validation failed: {}",
            errors.join("; ")
        )))
    }
}

/// Whether `tool` is a usable tool reference (`workload.tool`, `workload_tool`, `tool`)
#[must_use]
pub fn is_valid_tool_reference(tool: &str) -> bool {
    let mut chars = tool.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn validate_parameters(path: &str, parameters: Option<&Value>) -> StepResult {
    let Some(params) = parameters else {
        return Ok(());
    };
    if params.is_null() || params.as_object().is_some_and(serde_json::Map::is_empty) {
        return Ok(());
    }
    let Some(map) = params.as_object() else {
        return Err(format!("{path}.parameters: must be a JSON object"));
    };
    match map.get("type") {
        None => Err(format!(
            "{path}.parameters: must have 'type' field (should be 'object' for JSON Schema)"
        )),
        Some(Value::String(t)) if t == "object" => validate_json_schema(params)
            .map_err(|e| format!("{path}.parameters: invalid JSON Schema: {e}")),
        Some(Value::String(t)) => Err(format!(
            "{path}.parameters: 'type' must be 'object' (got '{t}')"
        )),
        Some(_) => Err(format!("{path}.parameters: 'type' field must be a string")),
    }
}

fn validate_json_schema(schema: &Value) -> StepResult {
    jsonschema::options()
        .build(schema)
        .map(|_| ())
        .map_err(|e| e.to_string())
}

fn validate_steps(path: &str, steps: &[WorkflowStepConfig]) -> StepResult {
    let mut ids = HashSet::new();
    for (i, step) in steps.iter().enumerate() {
        if step.id.is_empty() {
            return Err(format!("{path}[{i}].id is required"));
        }
        if !ids.insert(step.id.as_str()) {
            return Err(format!("{path}[{i}].id {:?} is duplicated", step.id));
        }
    }

    for (i, step) in steps.iter().enumerate() {
        validate_step(path, i, step, &ids)?;
    }

    validate_dependency_cycles(path, steps)
}

fn validate_step(path: &str, i: usize, step: &WorkflowStepConfig, ids: &HashSet<&str>) -> StepResult {
    validate_step_type(path, i, step)?;
    validate_step_templates(path, i, step)?;

    for dep in &step.depends_on {
        if !ids.contains(dep.as_str()) {
            return Err(format!("{path}[{i}].dependsOn references unknown step {dep:?}"));
        }
    }

    if let Some(on_error) = &step.on_error {
        validate_error_handling(path, i, on_error)?;
    }

    if step.effective_type() == STEP_TYPE_ELICITATION {
        if let Some(handler) = &step.on_decline {
            validate_response_handler(path, i, "onDecline", handler)?;
        }
        if let Some(handler) = &step.on_cancel {
            validate_response_handler(path, i, "onCancel", handler)?;
        }
    }
    Ok(())
}

fn validate_step_type(path: &str, i: usize, step: &WorkflowStepConfig) -> StepResult {
    if step.step_type.is_empty() && !step.tool.is_empty() && !step.message.is_empty() {
        return Err(format!(
            "{path}[{i}] cannot have both tool and message fields - use explicit type to clarify intent"
        ));
    }

    match step.effective_type() {
        STEP_TYPE_TOOL => {
            if step.tool.is_empty() {
                return Err(format!("{path}[{i}].tool is required when type is tool"));
            }
            if !is_valid_tool_reference(&step.tool) {
                return Err(format!("{path}[{i}].tool must be a valid tool name"));
            }
            Ok(())
        }
        STEP_TYPE_ELICITATION if step.message.is_empty() => Err(format!(
            "{path}[{i}].message is required when type is elicitation"
        )),
        STEP_TYPE_ELICITATION => Ok(()),
        _ => Err(format!("{path}[{i}].type must be one of: tool, elicitation")),
    }
}

fn validate_step_templates(path: &str, i: usize, step: &WorkflowStepConfig) -> StepResult {
    if let Some(args) = &step.arguments {
        for (name, value) in args {
            for_each_template(value, &mut |template| {
                validate_template(template)
                    .map_err(|e| format!("{path}[{i}].arguments[{name}]: invalid template: {e}"))
            })?;
        }
    }
    if !step.condition.is_empty() {
        validate_template(&step.condition)
            .map_err(|e| format!("{path}[{i}].condition: invalid template: {e}"))?;
    }
    if !step.message.is_empty() {
        validate_template(&step.message)
            .map_err(|e| format!("{path}[{i}].message: invalid template: {e}"))?;
    }
    if let Some(schema) = step.schema.as_ref().filter(|s| !s.is_null()) {
        validate_json_schema(schema)
            .map_err(|e| format!("{path}[{i}].schema: invalid JSON Schema: {e}"))?;
    }
    Ok(())
}

fn validate_error_handling(path: &str, i: usize, on_error: &StepErrorHandling) -> StepResult {
    match on_error.action.as_str() {
        "" | ERROR_ACTION_ABORT | ERROR_ACTION_CONTINUE => Ok(()),
        ERROR_ACTION_RETRY if on_error.retry_count < 1 => Err(format!(
            "{path}[{i}].onError.retryCount must be at least 1 when action is retry"
        )),
        ERROR_ACTION_RETRY => Ok(()),
        _ => Err(format!(
            "{path}[{i}].onError.action must be one of: abort, continue, retry"
        )),
    }
}

fn validate_response_handler(
    path: &str,
    i: usize,
    name: &str,
    handler: &ElicitationResponseConfig,
) -> StepResult {
    match handler.action.as_str() {
        "" => Err(format!("{path}[{i}].{name}.action is required")),
        ELICITATION_ACTION_ABORT | ELICITATION_ACTION_CONTINUE | ELICITATION_ACTION_SKIP_REMAINING => {
            Ok(())
        }
        _ => Err(format!(
            "{path}[{i}].{name}.action must be one of: abort, continue, skip_remaining"
        )),
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

fn visit<'a>(
    id: &'a str,
    graph: &HashMap<&'a str, &'a [String]>,
    marks: &mut HashMap<&'a str, Mark>,
) -> bool {
    marks.insert(id, Mark::InProgress);
    for dep in graph.get(id).copied().unwrap_or_default() {
        match marks.get(dep.as_str()) {
            Some(Mark::InProgress) => return true,
            Some(Mark::Done) => {}
            None => {
                if visit(dep, graph, marks) {
                    return true;
                }
            }
        }
    }
    marks.insert(id, Mark::Done);
    false
}

fn validate_dependency_cycles(path: &str, steps: &[WorkflowStepConfig]) -> StepResult {
    let graph: HashMap<&str, &[String]> = steps
        .iter()
        .map(|s| (s.id.as_str(), s.depends_on.as_slice()))
        .collect();
    let mut marks: HashMap<&str, Mark> = HashMap::new();

    for step in steps {
        if !marks.contains_key(step.id.as_str()) && visit(&step.id, &graph, &mut marks) {
            return Err(format!(
                "{path}: dependency cycle detected involving step {:?}",
                step.id
            ));
        }
    }
    Ok(())
}

/// `.steps.<id>.output.<field>` reference
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct StepFieldRef {
    step_id: String,
    field: String,
}

/// Skippable steps must supply defaults for every output field referenced downstream.
fn validate_default_results(
    path: &str,
    steps: &[WorkflowStepConfig],
    output: Option<&OutputConfig>,
) -> StepResult {
    let defaults: HashMap<&str, HashSet<&str>> = steps
        .iter()
        .filter(|s| s.may_be_skipped())
        .map(|s| {
            let fields = s
                .default_results
                .as_ref()
                .map(|d| d.keys().map(String::as_str).collect())
                .unwrap_or_default();
            (s.id.as_str(), fields)
        })
        .collect();
    if defaults.is_empty() {
        return Ok(());
    }

    let check = |refs: BTreeSet<StepFieldRef>, referrer: &str| -> StepResult {
        for r in refs {
            let Some(fields) = defaults.get(r.step_id.as_str()) else {
                continue;
            };
            if !fields.contains(r.field.as_str()) {
                return Err(format!(
                    "{path}[{id}].defaultResults[{field}] is required: step {id:?} may be skipped and field {field:?} is referenced by {referrer}",
                    id = r.step_id,
                    field = r.field,
                ));
            }
        }
        Ok(())
    };

    for step in steps {
        let refs = step_refs(step)
            .map_err(|e| format!("failed to extract step references from step {}: {e}", step.id))?;
        check(refs, &format!("step {}", step.id))?;
    }

    if let Some(output) = output {
        let mut refs = BTreeSet::new();
        output_refs(&output.properties, &mut refs)
            .map_err(|e| format!("failed to extract step references from output: {e}"))?;
        if let Some(format) = &output.format {
            template_refs(format, &mut refs)
                .map_err(|e| format!("failed to extract step references from output: {e}"))?;
        }
        check(refs, "output")?;
    }
    Ok(())
}

fn step_refs(step: &WorkflowStepConfig) -> std::result::Result<BTreeSet<StepFieldRef>, String> {
    let mut refs = BTreeSet::new();
    if !step.condition.is_empty() {
        template_refs(&step.condition, &mut refs)?;
    }
    if let Some(args) = &step.arguments {
        for value in args.values() {
            for_each_template(value, &mut |template| template_refs(template, &mut refs))?;
        }
    }
    if !step.message.is_empty() {
        template_refs(&step.message, &mut refs)?;
    }
    Ok(refs)
}

/// Every string leaf of an argument tree, nested objects and arrays included
fn for_each_template<F>(value: &Value, f: &mut F) -> StepResult
where
    F: FnMut(&str) -> StepResult,
{
    match value {
        Value::String(template) => f(template),
        Value::Object(map) => map.values().try_for_each(|v| for_each_template(v, f)),
        Value::Array(items) => items.iter().try_for_each(|v| for_each_template(v, f)),
        _ => Ok(()),
    }
}

fn output_refs(
    properties: &BTreeMap<String, OutputProperty>,
    refs: &mut BTreeSet<StepFieldRef>,
) -> std::result::Result<(), String> {
    for property in properties.values() {
        if !property.value.is_empty() {
            template_refs(&property.value, refs)?;
        }
        output_refs(&property.properties, refs)?;
    }
    Ok(())
}

fn template_refs(template: &str, refs: &mut BTreeSet<StepFieldRef>) -> std::result::Result<(), String> {
    for reference in extract_references(template).map_err(|e| e.to_string())? {
        let Some(rest) = reference.strip_prefix(".steps.") else {
            continue;
        };
        let mut parts = rest.splitn(4, '.');
        if let (Some(step_id), Some("output"), Some(field)) = (parts.next(), parts.next(), parts.next()) {
            refs.insert(StepFieldRef {
                step_id: step_id.to_string(),
                field: field.to_string(),
            });
        }
    }
    Ok(())
}

fn validate_output(path: &str, output: &OutputConfig) -> StepResult {
    if let Some(format) = output.format.as_deref().filter(|f| !f.is_empty()) {
        return validate_template(format).map_err(|e| format!("{path}.format: invalid template: {e}"));
    }
    for required in &output.required {
        if !output.properties.contains_key(required) {
            return Err(format!(
                "{path}.required: field {required:?} is not defined in properties"
            ));
        }
    }
    validate_output_properties(&format!("{path}.properties"), &output.properties)
}

fn validate_output_properties(path: &str, properties: &BTreeMap<String, OutputProperty>) -> StepResult {
    for (name, property) in properties {
        let prop_path = format!("{path}.{name}");
        if !OUTPUT_TYPES.contains(&property.property_type.as_str()) {
            return Err(format!(
                "{prop_path}.type must be one of: {}",
                OUTPUT_TYPES.join(", ")
            ));
        }
        if property.property_type == "object" && !property.properties.is_empty() {
            validate_output_properties(&format!("{prop_path}.properties"), &property.properties)?;
            continue;
        }
        if property.value.is_empty() {
            return Err(format!("{prop_path}.value is required"));
        }
        validate_template(&property.value)
            .map_err(|e| format!("{prop_path}.value: invalid template: {e}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::vmcp::JsonMap;

    fn tool_step(id: &str, tool: &str, deps: &[&str]) -> WorkflowStepConfig {
        WorkflowStepConfig {
            id: id.into(),
            tool: tool.into(),
            depends_on: deps.iter().map(|d| (*d).to_string()).collect(),
            ..WorkflowStepConfig::default()
        }
    }

    fn composite(steps: Vec<WorkflowStepConfig>) -> CompositeToolConfig {
        CompositeToolConfig {
            name: "wf".into(),
            description: "test workflow".into(),
            steps,
            ..CompositeToolConfig::default()
        }
    }

    fn args(pairs: &[(&str, &str)]) -> Option<JsonMap> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), Value::String((*v).to_string())))
                .collect(),
        )
    }

    fn err(tool: &CompositeToolConfig) -> String {
        validate_composite_tool_config("tool", tool)
            .unwrap_err()
            .to_string()
    }

    #[test]
    fn collects_top_level_errors() {
        let msg = err(&CompositeToolConfig::default());
        assert!(msg.starts_with("validation failed: "), "{msg}");
        assert!(msg.contains("tool.name is required"));
        assert!(msg.contains("tool.description is required"));
        assert!(msg.contains("tool.steps must have at least one step"));
    }

    #[test]
    fn linear_and_diamond_graphs_pass() {
        let linear = composite(vec![
            tool_step("a", "x", &[]),
            tool_step("b", "x", &["a"]),
            tool_step("c", "x", &["b"]),
        ]);
        validate_composite_tool_config("tool", &linear).unwrap();

        let diamond = composite(vec![
            tool_step("a", "x", &[]),
            tool_step("b", "x", &["a"]),
            tool_step("c", "x", &["a"]),
            tool_step("d", "x", &["b", "c"]),
        ]);
        validate_composite_tool_config("tool", &diamond).unwrap();
    }

    #[test]
    fn cycles_of_one_two_and_three_fail() {
        let cases = [
            vec![tool_step("a", "x", &["a"])],
            vec![tool_step("a", "x", &["b"]), tool_step("b", "x", &["a"])],
            vec![
                tool_step("a", "x", &["c"]),
                tool_step("b", "x", &["a"]),
                tool_step("c", "x", &["b"]),
            ],
        ];
        for steps in cases {
            let msg = err(&composite(steps));
            assert!(msg.contains("dependency cycle detected"), "{msg}");
        }
    }

    #[test]
    fn step_structure_errors() {
        let msg = err(&composite(vec![tool_step("a", "x", &[]), tool_step("a", "y", &[])]));
        assert!(msg.contains("tool.steps[1].id \"a\" is duplicated"), "{msg}");

        let msg = err(&composite(vec![tool_step("a", "x", &["ghost"])]));
        assert!(msg.contains("dependsOn references unknown step \"ghost\""), "{msg}");

        let msg = err(&composite(vec![tool_step("a", "bad tool!", &[])]));
        assert!(msg.contains("tool.steps[0].tool must be a valid tool name"), "{msg}");

        let msg = err(&composite(vec![WorkflowStepConfig {
            id: "a".into(),
            tool: "x".into(),
            message: "hi".into(),
            ..WorkflowStepConfig::default()
        }]));
        assert!(msg.contains("cannot have both tool and message"), "{msg}");

        let msg = err(&composite(vec![WorkflowStepConfig {
            id: "ask".into(),
            step_type: "elicitation".into(),
            ..WorkflowStepConfig::default()
        }]));
        assert!(msg.contains("message is required when type is elicitation"), "{msg}");
    }

    #[test]
    fn error_handling_rules() {
        let mut step = tool_step("a", "x", &[]);
        step.on_error = Some(StepErrorHandling {
            action: "retry".into(),
            retry_count: 0,
            retry_delay: None,
        });
        let msg = err(&composite(vec![step.clone()]));
        assert!(msg.contains("retryCount must be at least 1"), "{msg}");

        step.on_error = Some(StepErrorHandling {
            action: "explode".into(),
            ..StepErrorHandling::default()
        });
        let msg = err(&composite(vec![step]));
        assert!(msg.contains("onError.action must be one of"), "{msg}");
    }

    #[test]
    fn elicitation_handlers_need_known_actions() {
        let step = WorkflowStepConfig {
            id: "ask".into(),
            step_type: "elicitation".into(),
            message: "Proceed?".into(),
            on_decline: Some(ElicitationResponseConfig {
                action: "shrug".into(),
            }),
            ..WorkflowStepConfig::default()
        };
        let msg = err(&composite(vec![step]));
        assert!(msg.contains("onDecline.action must be one of"), "{msg}");
    }

    #[test]
    fn parameters_must_be_object_schema() {
        let mut tool = composite(vec![tool_step("a", "x", &[])]);
        tool.parameters = Some(json!({"properties": {}}));
        assert!(err(&tool).contains("must have 'type' field"));

        tool.parameters = Some(json!({"type": "array"}));
        assert!(err(&tool).contains("'type' must be 'object' (got 'array')"));

        tool.parameters = Some(json!({"type": "object", "properties": {"n": {"type": 5}}}));
        assert!(err(&tool).contains("invalid JSON Schema"));

        tool.parameters = Some(json!({"type": "object", "properties": {"n": {"type": "integer"}}}));
        validate_composite_tool_config("tool", &tool).unwrap();
    }

    #[test]
    fn invalid_templates_are_rejected() {
        let mut step = tool_step("a", "x", &[]);
        step.arguments = args(&[("q", "{{.params.q")]);
        let msg = err(&composite(vec![step]));
        assert!(msg.contains("arguments[q]: invalid template"), "{msg}");
    }

    #[test]
    fn skippable_step_needs_default_for_referenced_field() {
        let mut conditional = tool_step("b", "x", &["a"]);
        conditional.condition = "{{.params.enabled}}".into();
        let mut consumer = tool_step("c", "x", &["b"]);
        consumer.arguments = args(&[("text", "{{.steps.b.output.summary}}")]);

        let mut tool = composite(vec![tool_step("a", "x", &[]), conditional, consumer]);
        let msg = err(&tool);
        assert!(
            msg.contains("tool.steps[b].defaultResults[summary] is required"),
            "{msg}"
        );
        assert!(msg.contains("referenced by step c"));

        let mut defaults = JsonMap::new();
        defaults.insert("summary".into(), Value::Null);
        tool.steps[1].default_results = Some(defaults);
        validate_composite_tool_config("tool", &tool).unwrap();
    }

    #[test]
    fn nested_argument_references_are_checked() {
        let mut conditional = tool_step("b", "x", &[]);
        conditional.condition = "{{.params.enabled}}".into();
        let mut consumer = tool_step("c", "x", &["b"]);
        let nested = json!({
            "filter": {"q": "{{.steps.b.output.summary}}"},
            "tags": ["static", {"label": "{{.steps.b.output.label}}"}]
        });
        consumer.arguments = nested.as_object().cloned();

        let tool = composite(vec![conditional, consumer]);
        let msg = err(&tool);
        assert!(msg.contains("defaultResults[label] is required"), "{msg}");

        let mut broken = tool_step("d", "x", &[]);
        broken.arguments = json!({"filter": {"q": "{{.params.q"}}).as_object().cloned();
        let msg = err(&composite(vec![broken]));
        assert!(msg.contains("arguments[filter]: invalid template"), "{msg}");
    }

    #[test]
    fn retry_steps_never_need_defaults() {
        let mut retrying = tool_step("a", "x", &[]);
        retrying.on_error = Some(StepErrorHandling {
            action: "retry".into(),
            retry_count: 3,
            retry_delay: None,
        });
        let mut consumer = tool_step("b", "x", &["a"]);
        consumer.arguments = args(&[("v", "{{.steps.a.output.value}}")]);
        validate_composite_tool_config("tool", &composite(vec![retrying, consumer])).unwrap();
    }

    #[test]
    fn output_references_count() {
        let mut continuing = tool_step("a", "x", &[]);
        continuing.on_error = Some(StepErrorHandling {
            action: "continue".into(),
            ..StepErrorHandling::default()
        });
        let mut tool = composite(vec![continuing]);
        let mut properties = BTreeMap::new();
        properties.insert(
            "count".to_string(),
            OutputProperty {
                property_type: "integer".into(),
                value: "{{.steps.a.output.count}}".into(),
                ..OutputProperty::default()
            },
        );
        tool.output = Some(OutputConfig {
            properties,
            ..OutputConfig::default()
        });

        let msg = err(&tool);
        assert!(msg.contains("defaultResults[count] is required"), "{msg}");
        assert!(msg.contains("referenced by output"));
    }

    #[test]
    fn output_property_types_checked() {
        let mut tool = composite(vec![tool_step("a", "x", &[])]);
        let mut properties = BTreeMap::new();
        properties.insert(
            "when".to_string(),
            OutputProperty {
                property_type: "date".into(),
                value: "{{.steps.a.output.when}}".into(),
                ..OutputProperty::default()
            },
        );
        tool.output = Some(OutputConfig {
            properties,
            ..OutputConfig::default()
        });
        assert!(err(&tool).contains("output.properties.when.type must be one of"));
    }

    #[test]
    fn too_many_steps() {
        let steps = (0..=MAX_WORKFLOW_STEPS)
            .map(|i| tool_step(&format!("s{i}"), "x", &[]))
            .collect();
        assert!(err(&composite(steps)).contains("too many steps"));
    }

    #[test]
    fn tool_reference_formats() {
        assert!(is_valid_tool_reference("github.get_issue"));
        assert!(is_valid_tool_reference("github_get-issue"));
        assert!(is_valid_tool_reference("echo"));
        assert!(!is_valid_tool_reference(""));
        assert!(!is_valid_tool_reference(".hidden"));
        assert!(!is_valid_tool_reference("a b"));
    }
}
