// Trigger inputs
// Checks caller-provided inputs against the manual trigger's schema

use crate::definition::job::{InputSpec, InputType, Trigger, TriggerKind};
use crate::error::{EngineError, EngineResult};

use indexmap::IndexMap;

/// Resolve the inputs of a run started by `event`.
///
/// Unknown names, missing required inputs and values of the wrong type are
/// rejected. Absent optional inputs take their declared default (or the
/// empty string, which is what an unset input renders as).
pub fn resolve_inputs(
    triggers: &[Trigger],
    event: TriggerKind,
    provided: &IndexMap<String, String>,
) -> EngineResult<IndexMap<String, String>> {
    let Some(trigger) = triggers.iter().find(|trigger| trigger.kind == event) else {
        return Err(EngineError::InvalidInput(format!(
            "workflow does not declare a '{}' trigger",
            event
        )));
    };

    if let Some(unknown) = provided
        .keys()
        .find(|name| !trigger.inputs.iter().any(|input| &input.name == *name))
    {
        return Err(EngineError::InvalidInput(if trigger.inputs.is_empty() {
            format!("'{}' runs take no inputs (got '{}')", event, unknown)
        } else {
            format!("unknown input '{}'", unknown)
        }));
    }

    let mut resolved = IndexMap::new();
    for input in &trigger.inputs {
        let value = match provided.get(&input.name) {
            Some(value) => value.clone(),
            None => match &input.default {
                Some(default) => default.clone(),
                None if input.required => {
                    return Err(EngineError::InvalidInput(format!(
                        "missing required input '{}'",
                        input.name
                    )))
                }
                None => String::new(),
            },
        };

        check_type(input, &value)?;
        resolved.insert(input.name.clone(), value);
    }

    Ok(resolved)
}

fn check_type(input: &InputSpec, value: &str) -> EngineResult<()> {
    // Unset optional inputs are allowed to be empty whatever their type
    if value.is_empty() && !input.required {
        return Ok(());
    }

    let ok = match &input.input_type {
        InputType::String => true,
        InputType::Boolean => matches!(value, "true" | "false"),
        InputType::Number => value.parse::<f64>().is_ok(),
        InputType::Choice(options) => options.iter().any(|option| option == value),
    };

    if ok {
        return Ok(());
    }

    let expected = match &input.input_type {
        InputType::String => "a string".to_string(),
        InputType::Boolean => "true or false".to_string(),
        InputType::Number => "a number".to_string(),
        InputType::Choice(options) => format!("one of: {}", options.join(", ")),
    };
    Err(EngineError::InvalidInput(format!(
        "input '{}' must be {}, got '{}'",
        input.name, expected, value
    )))
}
