// Step input resolution against run inputs and dependency outputs

use crate::error::{EngineError, EngineResult};
use crate::types::{InputValue, Step, StepId, ValueMap};
use serde_json::Value;
use std::collections::BTreeMap;

/// Piece of a template string
#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
    Text(&'a str),
    Placeholder(&'a str),
}

/// Parsed `{{...}}` placeholder
#[derive(Debug, PartialEq, Eq)]
enum Placeholder<'a> {
    Input(&'a str),
    StepOutput(&'a str, &'a str),
}

/// Split a template into literal text and placeholders.
/// An unterminated `{{` is kept as text.
fn segments(template: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            break;
        };
        if start > 0 {
            segments.push(Segment::Text(&rest[..start]));
        }
        segments.push(Segment::Placeholder(after[..end].trim()));
        rest = &after[end + 2..];
    }

    if !rest.is_empty() {
        segments.push(Segment::Text(rest));
    }

    segments
}

fn parse_placeholder(raw: &str) -> Option<Placeholder<'_>> {
    if let Some(key) = raw.strip_prefix("input.") {
        return (!key.is_empty()).then_some(Placeholder::Input(key));
    }
    if let Some(rest) = raw.strip_prefix("steps.") {
        let (step, key) = rest.split_once('.')?;
        if step.is_empty() || key.is_empty() {
            return None;
        }
        return Some(Placeholder::StepOutput(step, key));
    }
    None
}

/// Extract placeholder expressions from a template string
pub fn extract_placeholders(template: &str) -> Vec<String> {
    segments(template)
        .into_iter()
        .filter_map(|s| match s {
            Segment::Placeholder(p) => Some(p.to_string()),
            Segment::Text(_) => None,
        })
        .collect()
}

/// Check that every placeholder in a step's inputs is well formed and only reads
/// outputs of steps the step declares as dependencies.
pub(crate) fn validate_references(step: &Step) -> EngineResult<()> {
    let invalid = |reference: String, reason: String| EngineError::InvalidInputReference {
        step: step.id.clone(),
        reference,
        reason,
    };

    for value in step.inputs.values() {
        match value {
            InputValue::Literal { .. } | InputValue::RunInput { .. } => {}
            InputValue::StepOutput { step: source, key } => {
                if !step.depends_on.contains(source) {
                    return Err(invalid(
                        format!("{}.{}", source, key),
                        format!("{} is not a declared dependency", source),
                    ));
                }
            }
            InputValue::Template { template } => {
                for raw in extract_placeholders(template) {
                    match parse_placeholder(&raw) {
                        Some(Placeholder::Input(_)) => {}
                        Some(Placeholder::StepOutput(source, _)) => {
                            if !step.depends_on.contains(source) {
                                return Err(invalid(
                                    raw.clone(),
                                    format!("{} is not a declared dependency", source),
                                ));
                            }
                        }
                        None => {
                            return Err(invalid(
                                raw.clone(),
                                "expected input.KEY or steps.STEP.KEY".to_string(),
                            ))
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

/// Resolve a step's declared inputs.
///
/// `dependency_outputs` must only contain outputs of succeeded dependencies.
pub fn resolve_inputs(
    step: &Step,
    run_inputs: &ValueMap,
    dependency_outputs: &BTreeMap<StepId, ValueMap>,
) -> EngineResult<ValueMap> {
    let mut resolved = ValueMap::new();

    for (name, value) in &step.inputs {
        let value = match value {
            InputValue::Literal { value } => value.clone(),
            InputValue::RunInput { key } => lookup_run_input(run_inputs, key)
                .cloned()
                .map_err(|reason| resolution_error(step, reason))?,
            InputValue::StepOutput { step: source, key } => {
                lookup_output(dependency_outputs, source.as_str(), key)
                    .cloned()
                    .map_err(|reason| resolution_error(step, reason))?
            }
            InputValue::Template { template } => {
                Value::String(
                    render_template(template, run_inputs, dependency_outputs)
                        .map_err(|reason| resolution_error(step, reason))?,
                )
            }
        };
        resolved.insert(name.clone(), value);
    }

    Ok(resolved)
}

/// Substitute `{{input.KEY}}` and `{{steps.STEP.KEY}}` placeholders
pub fn render_template(
    template: &str,
    run_inputs: &ValueMap,
    dependency_outputs: &BTreeMap<StepId, ValueMap>,
) -> Result<String, String> {
    let mut rendered = String::with_capacity(template.len());

    for segment in segments(template) {
        match segment {
            Segment::Text(text) => rendered.push_str(text),
            Segment::Placeholder(raw) => {
                let value = match parse_placeholder(raw) {
                    Some(Placeholder::Input(key)) => lookup_run_input(run_inputs, key)?,
                    Some(Placeholder::StepOutput(source, key)) => {
                        lookup_output(dependency_outputs, source, key)?
                    }
                    None => return Err(format!("unsupported placeholder '{{{{{}}}}}'", raw)),
                };
                rendered.push_str(&value_text(value));
            }
        }
    }

    Ok(rendered)
}

/// Substitute bare `{{name}}` placeholders from a flat map
pub fn render_named(template: &str, values: &ValueMap) -> Result<String, String> {
    let mut rendered = String::with_capacity(template.len());

    for segment in segments(template) {
        match segment {
            Segment::Text(text) => rendered.push_str(text),
            Segment::Placeholder(name) => {
                let value = values
                    .get(name)
                    .ok_or_else(|| format!("no value for placeholder '{}'", name))?;
                rendered.push_str(&value_text(value));
            }
        }
    }

    Ok(rendered)
}

/// Strings render unquoted, everything else as compact JSON
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn lookup_run_input<'a>(run_inputs: &'a ValueMap, key: &str) -> Result<&'a Value, String> {
    run_inputs
        .get(key)
        .ok_or_else(|| format!("run input '{}' was not supplied", key))
}

fn lookup_output<'a>(
    dependency_outputs: &'a BTreeMap<StepId, ValueMap>,
    step: &str,
    key: &str,
) -> Result<&'a Value, String> {
    dependency_outputs
        .get(step)
        .ok_or_else(|| format!("step {} has no outputs available", step))?
        .get(key)
        .ok_or_else(|| format!("step {} produced no output '{}'", step, key))
}

fn resolution_error(step: &Step, reason: String) -> EngineError {
    EngineError::InputResolution {
        step: step.id.clone(),
        reason,
    }
}
