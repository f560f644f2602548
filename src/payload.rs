use crate::error::ValidationError;
use crate::types::{CommandPayload, RiskClass};
use serde_json::Value;

/// Models wrap JSON in prose or code fences, so the first JSON value that
/// starts at a `{` is taken and whatever follows it is ignored.
fn first_json_value(response: &str) -> Result<Value, ValidationError> {
    let response = response.trim();
    let mut first_error = None;
    for (start, _) in response.match_indices('{') {
        let mut values =
            serde_json::Deserializer::from_str(&response[start..]).into_iter::<Value>();
        match values.next() {
            Some(Ok(value)) => return Ok(value),
            Some(Err(e)) => {
                first_error.get_or_insert_with(|| e.to_string());
            }
            None => {}
        }
    }
    if let Some(error) = first_error {
        return Err(ValidationError::NotJson(error));
    }
    serde_json::from_str(response).map_err(|e| ValidationError::NotJson(e.to_string()))
}

pub fn validate(raw: &str) -> Result<CommandPayload, ValidationError> {
    validate_value(&first_json_value(raw)?)
}

pub fn validate_value(value: &Value) -> Result<CommandPayload, ValidationError> {
    let object = value.as_object().ok_or(ValidationError::NotObject)?;

    let cmd = object
        .get("cmd")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|cmd| !cmd.is_empty())
        .ok_or(ValidationError::MissingCmd)?;

    let risk = object
        .get("risk")
        .and_then(Value::as_str)
        .and_then(RiskClass::parse)
        .ok_or(ValidationError::InvalidRisk)?;

    Ok(CommandPayload {
        cmd: cmd.to_string(),
        risk,
    })
}
