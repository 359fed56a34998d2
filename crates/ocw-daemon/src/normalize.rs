// SPDX-License-Identifier: MIT OR Apache-2.0
//! Inbound payload normalization.
//!
//! Webhook senders wrap their payloads in a handful of well-known shapes
//! and spell commands inconsistently. Everything is normalized here, before
//! any validation logic sees it.

use ocw_core::{CallbackDescriptor, ErrorKind, InputValue, OcwError};
use serde_json::Value;
use std::collections::BTreeMap;

/// A normalized submission body.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedBody {
    /// Target template.
    pub template_id: String,
    /// Typed inputs.
    pub inputs: BTreeMap<String, InputValue>,
    /// Declared callback, if any.
    pub callback: Option<CallbackDescriptor>,
    /// Idempotency key embedded in the body (header wins over this).
    pub idempotency_key: Option<String>,
}

/// Normalize a raw webhook/bridge body into a [`NormalizedBody`].
///
/// Handles wrapper unwrapping (`payload`/`data`/`event`), `/command`-style
/// template selection, and type coercion of the input map.
///
/// # Errors
///
/// Returns a `validation_error` when the shape cannot be normalized.
pub fn normalize_body(raw: &Value) -> Result<NormalizedBody, OcwError> {
    let body = unwrap_wrappers(raw);

    let template_id = match (
        body.get("template_id").and_then(Value::as_str),
        body.get("command").and_then(Value::as_str),
    ) {
        (Some(id), _) => id.trim().to_string(),
        (None, Some(command)) => template_from_command(command)?,
        (None, None) => {
            return Err(OcwError::new(
                ErrorKind::ValidationError,
                "field 'template_id': missing",
            ));
        }
    };
    if template_id.is_empty() {
        return Err(OcwError::new(
            ErrorKind::ValidationError,
            "field 'template_id': empty",
        ));
    }

    let mut inputs = BTreeMap::new();
    let input_obj = body
        .get("inputs")
        .or_else(|| body.get("args"))
        .or_else(|| body.get("params"));
    if let Some(obj) = input_obj {
        let Some(map) = obj.as_object() else {
            return Err(OcwError::new(
                ErrorKind::ValidationError,
                "field 'inputs': must be an object",
            ));
        };
        for (key, value) in map {
            let Some(typed) = InputValue::from_json(value) else {
                return Err(OcwError::new(
                    ErrorKind::ValidationError,
                    format!("field '{key}': unsupported value shape"),
                ));
            };
            inputs.insert(key.clone(), typed);
        }
    }

    let callback = match body.get("callback") {
        None | Some(Value::Null) => None,
        Some(value) => Some(serde_json::from_value::<CallbackDescriptor>(value.clone()).map_err(
            |e| OcwError::new(ErrorKind::ValidationError, format!("field 'callback': {e}")),
        )?),
    };

    let idempotency_key = body
        .get("idempotency_key")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string);

    Ok(NormalizedBody {
        template_id,
        inputs,
        callback,
        idempotency_key,
    })
}

/// Unwrap the well-known single-key wrapper shapes, one level deep each.
fn unwrap_wrappers(raw: &Value) -> &Value {
    let mut body = raw;
    for key in ["payload", "data", "event"] {
        if let Some(inner) = body.get(key)
            && inner.is_object()
            && body.as_object().map(|o| o.len() == 1).unwrap_or(false)
        {
            body = inner;
        }
    }
    body
}

/// `"/Render sdxl_basic"` → `"sdxl_basic"`; commands are lowercased and a
/// missing leading slash is tolerated.
fn template_from_command(command: &str) -> Result<String, OcwError> {
    let command = command.trim().to_ascii_lowercase();
    let command = command.strip_prefix('/').unwrap_or(&command);
    let mut parts = command.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("render" | "generate" | "submit"), Some(template)) => Ok(template.to_string()),
        (Some(template), None) if !template.is_empty() => Ok(template.to_string()),
        _ => Err(OcwError::new(
            ErrorKind::ValidationError,
            "field 'command': unrecognized",
        )),
    }
}
