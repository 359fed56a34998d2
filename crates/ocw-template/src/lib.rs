// SPDX-License-Identifier: MIT OR Apache-2.0
//! Allowlisted render templates.
//!
//! A template is a pre-validated workflow skeleton plus a field schema.
//! Rendering is pure substitution — no code execution, no file access.
//! Skeletons are pinned by content hash at registration and rechecked at
//! every render.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use ocw_core::InputValue;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Maximum items accepted in a list-typed input.
pub const MAX_LIST_ITEMS: usize = 64;

/// Maximum length of a string-typed input, in bytes.
pub const MAX_STRING_BYTES: usize = 8192;

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Primitive type of a template field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Boolean flag.
    Bool,
    /// Signed integer.
    Int,
    /// Floating-point number.
    Float,
    /// UTF-8 string.
    Str,
    /// Bounded list of scalars.
    List,
}

/// Declared constraints for one template field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSchema {
    /// Expected primitive type.
    pub kind: FieldType,
    /// Whether the field must be supplied.
    #[serde(default)]
    pub required: bool,
    /// Inclusive numeric lower bound (Int/Float only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Inclusive numeric upper bound (Int/Float only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Closed value set (Str only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_of: Option<Vec<String>>,
    /// Default injected when the field is absent and not required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<InputValue>,
}

impl FieldSchema {
    /// A required field of the given type.
    #[must_use]
    pub fn required(kind: FieldType) -> Self {
        Self {
            kind,
            required: true,
            min: None,
            max: None,
            one_of: None,
            default: None,
        }
    }

    /// An optional field with a default.
    #[must_use]
    pub fn optional(kind: FieldType, default: InputValue) -> Self {
        Self {
            kind,
            required: false,
            min: None,
            max: None,
            one_of: None,
            default: Some(default),
        }
    }

    /// Attach numeric bounds.
    #[must_use]
    pub fn bounded(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Template lookup, validation, and render failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TemplateError {
    /// The template id is not on the allowlist.
    #[error("template not allowed: {template_id}")]
    Denied {
        /// Requested id.
        template_id: String,
    },
    /// An input failed schema validation.
    #[error("validation failed: field '{field}': {reason}")]
    Validation {
        /// Offending field.
        field: String,
        /// Stable reason tag.
        reason: String,
    },
    /// The registered skeleton no longer matches its pinned hash.
    #[error("skeleton hash mismatch for {template_id}")]
    HashMismatch {
        /// Affected template.
        template_id: String,
    },
}

// ---------------------------------------------------------------------------
// Template + registry
// ---------------------------------------------------------------------------

/// An allowlisted template: schema, skeleton, and its pinned hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    /// Stable identifier.
    pub template_id: String,
    /// Free-form labels for listing surfaces.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Field schemas keyed by field name (deterministic order).
    pub schema: BTreeMap<String, FieldSchema>,
    /// Render-engine workflow document with `{{field}}` placeholders.
    pub skeleton: Value,
    /// Hex SHA-256 of the canonical skeleton, pinned at registration.
    pub skeleton_sha256: String,
}

/// Hex SHA-256 of a skeleton's canonical JSON serialization.
#[must_use]
pub fn skeleton_hash(skeleton: &Value) -> String {
    let bytes = serde_json::to_vec(skeleton).unwrap_or_default();
    format!("{:x}", Sha256::digest(&bytes))
}

/// The template allowlist.
///
/// Templates register at startup; there is no dynamic load path. Anything
/// not in the registry is denied.
#[derive(Debug, Default)]
pub struct TemplateRegistry {
    templates: BTreeMap<String, Template>,
}

impl TemplateRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with the built-in templates.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(builtin_sdxl_basic());
        registry.register(builtin_sdxl_img2img());
        registry.register(builtin_upscale());
        registry
    }

    /// Register a template, pinning its skeleton hash.
    pub fn register(&mut self, mut template: Template) {
        template.skeleton_sha256 = skeleton_hash(&template.skeleton);
        self.templates.insert(template.template_id.clone(), template);
    }

    /// Look up a template by id.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::Denied`] for unknown ids.
    pub fn get(&self, template_id: &str) -> Result<&Template, TemplateError> {
        self.templates
            .get(template_id)
            .ok_or_else(|| TemplateError::Denied {
                template_id: template_id.to_string(),
            })
    }

    /// All registered template ids.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.templates.keys().cloned().collect()
    }

    /// Validate inputs against a template's schema and fill defaults.
    ///
    /// Unknown fields are rejected, required fields must be present, and
    /// typed constraints (bounds, value sets, size caps) are enforced.
    ///
    /// # Errors
    ///
    /// Returns the first failure as [`TemplateError::Validation`].
    pub fn validate(
        &self,
        template_id: &str,
        inputs: &BTreeMap<String, InputValue>,
    ) -> Result<BTreeMap<String, InputValue>, TemplateError> {
        let template = self.get(template_id)?;

        for field in inputs.keys() {
            if !template.schema.contains_key(field) {
                return Err(TemplateError::Validation {
                    field: field.clone(),
                    reason: "unknown_field".into(),
                });
            }
        }

        let mut normalized = BTreeMap::new();
        for (field, schema) in &template.schema {
            let value = match inputs.get(field) {
                Some(value) => value.clone(),
                None if schema.required => {
                    return Err(TemplateError::Validation {
                        field: field.clone(),
                        reason: "missing_required".into(),
                    });
                }
                None => match &schema.default {
                    Some(default) => default.clone(),
                    None => continue,
                },
            };
            check_field(field, schema, &value)?;
            normalized.insert(field.clone(), value);
        }
        Ok(normalized)
    }

    /// Render a template with pre-validated inputs.
    ///
    /// The skeleton hash is rechecked before substitution; a mismatch means
    /// the registry was tampered with in memory and rendering refuses.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::HashMismatch`] or a lookup failure.
    pub fn render(
        &self,
        template_id: &str,
        inputs: &BTreeMap<String, InputValue>,
    ) -> Result<Value, TemplateError> {
        let template = self.get(template_id)?;
        if skeleton_hash(&template.skeleton) != template.skeleton_sha256 {
            return Err(TemplateError::HashMismatch {
                template_id: template_id.to_string(),
            });
        }
        Ok(substitute(&template.skeleton, inputs))
    }
}

fn check_field(field: &str, schema: &FieldSchema, value: &InputValue) -> Result<(), TemplateError> {
    let fail = |reason: &str| TemplateError::Validation {
        field: field.to_string(),
        reason: reason.to_string(),
    };

    match (schema.kind, value) {
        (FieldType::Bool, InputValue::Bool(_)) => Ok(()),
        (FieldType::Int, InputValue::Int(i)) => {
            let v = *i as f64;
            if schema.min.is_some_and(|min| v < min) || schema.max.is_some_and(|max| v > max) {
                return Err(fail("out_of_range"));
            }
            Ok(())
        }
        (FieldType::Float, InputValue::Float(f)) => {
            if !f.is_finite() {
                return Err(fail("not_finite"));
            }
            if schema.min.is_some_and(|min| *f < min) || schema.max.is_some_and(|max| *f > max) {
                return Err(fail("out_of_range"));
            }
            Ok(())
        }
        // Integers are acceptable where floats are declared.
        (FieldType::Float, InputValue::Int(i)) => {
            let v = *i as f64;
            if schema.min.is_some_and(|min| v < min) || schema.max.is_some_and(|max| v > max) {
                return Err(fail("out_of_range"));
            }
            Ok(())
        }
        (FieldType::Str, InputValue::Str(s)) => {
            if s.len() > MAX_STRING_BYTES {
                return Err(fail("string_too_long"));
            }
            if let Some(allowed) = &schema.one_of
                && !allowed.contains(s)
            {
                return Err(fail("not_in_enum"));
            }
            Ok(())
        }
        (FieldType::List, InputValue::List(items)) => {
            if items.len() > MAX_LIST_ITEMS {
                return Err(fail("list_too_long"));
            }
            Ok(())
        }
        _ => Err(fail("wrong_type")),
    }
}

/// Replace `{{field}}` markers in the skeleton with input values.
///
/// A string that is exactly one marker is replaced by the typed value;
/// markers embedded in longer strings are interpolated as text.
fn substitute(skeleton: &Value, inputs: &BTreeMap<String, InputValue>) -> Value {
    match skeleton {
        Value::String(s) => {
            if let Some(name) = exact_marker(s)
                && let Some(value) = inputs.get(name)
            {
                return value.to_json();
            }
            let mut out = s.clone();
            for (name, value) in inputs {
                let marker = format!("{{{{{name}}}}}");
                if out.contains(&marker) {
                    out = out.replace(&marker, &value.render_string());
                }
            }
            Value::String(out)
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| substitute(v, inputs)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, inputs)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn exact_marker(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.is_empty() || inner.contains('{') || inner.contains('}') {
        return None;
    }
    Some(inner)
}

// ---------------------------------------------------------------------------
// Built-ins
// ---------------------------------------------------------------------------

fn builtin_sdxl_basic() -> Template {
    let mut schema = BTreeMap::new();
    schema.insert("prompt".into(), FieldSchema::required(FieldType::Str));
    schema.insert(
        "negative_prompt".into(),
        FieldSchema::optional(FieldType::Str, InputValue::Str(String::new())),
    );
    schema.insert(
        "seed".into(),
        FieldSchema::optional(FieldType::Int, InputValue::Int(0)).bounded(0.0, u32::MAX as f64),
    );
    schema.insert(
        "steps".into(),
        FieldSchema::optional(FieldType::Int, InputValue::Int(20)).bounded(1.0, 150.0),
    );
    schema.insert(
        "cfg".into(),
        FieldSchema::optional(FieldType::Float, InputValue::Float(7.0)).bounded(1.0, 30.0),
    );
    schema.insert(
        "width".into(),
        FieldSchema::optional(FieldType::Int, InputValue::Int(1024)).bounded(64.0, 4096.0),
    );
    schema.insert(
        "height".into(),
        FieldSchema::optional(FieldType::Int, InputValue::Int(1024)).bounded(64.0, 4096.0),
    );

    Template {
        template_id: "sdxl_basic".into(),
        labels: vec!["text-to-image".into()],
        schema,
        skeleton: serde_json::json!({
            "3": {
                "class_type": "KSampler",
                "inputs": {
                    "seed": "{{seed}}",
                    "steps": "{{steps}}",
                    "cfg": "{{cfg}}",
                    "sampler_name": "euler",
                    "scheduler": "normal",
                    "denoise": 1.0,
                    "model": ["4", 0],
                    "positive": ["6", 0],
                    "negative": ["7", 0],
                    "latent_image": ["5", 0]
                }
            },
            "4": {
                "class_type": "CheckpointLoaderSimple",
                "inputs": {"ckpt_name": "sd_xl_base_1.0.safetensors"}
            },
            "5": {
                "class_type": "EmptyLatentImage",
                "inputs": {"width": "{{width}}", "height": "{{height}}", "batch_size": 1}
            },
            "6": {
                "class_type": "CLIPTextEncode",
                "inputs": {"text": "{{prompt}}", "clip": ["4", 1]}
            },
            "7": {
                "class_type": "CLIPTextEncode",
                "inputs": {"text": "{{negative_prompt}}", "clip": ["4", 1]}
            },
            "8": {
                "class_type": "VAEDecode",
                "inputs": {"samples": ["3", 0], "vae": ["4", 2]}
            },
            "9": {
                "class_type": "SaveImage",
                "inputs": {"filename_prefix": "openclaw", "images": ["8", 0]}
            }
        }),
        skeleton_sha256: String::new(),
    }
}

fn builtin_sdxl_img2img() -> Template {
    let mut schema = BTreeMap::new();
    schema.insert("prompt".into(), FieldSchema::required(FieldType::Str));
    schema.insert("image".into(), FieldSchema::required(FieldType::Str));
    schema.insert(
        "denoise".into(),
        FieldSchema::optional(FieldType::Float, InputValue::Float(0.6)).bounded(0.0, 1.0),
    );
    schema.insert(
        "seed".into(),
        FieldSchema::optional(FieldType::Int, InputValue::Int(0)).bounded(0.0, u32::MAX as f64),
    );

    Template {
        template_id: "sdxl_img2img".into(),
        labels: vec!["image-to-image".into()],
        schema,
        skeleton: serde_json::json!({
            "1": {"class_type": "LoadImage", "inputs": {"image": "{{image}}"}},
            "3": {
                "class_type": "KSampler",
                "inputs": {
                    "seed": "{{seed}}",
                    "steps": 24,
                    "cfg": 7.0,
                    "sampler_name": "euler",
                    "scheduler": "normal",
                    "denoise": "{{denoise}}",
                    "model": ["4", 0],
                    "positive": ["6", 0],
                    "negative": ["7", 0],
                    "latent_image": ["2", 0]
                }
            },
            "2": {"class_type": "VAEEncode", "inputs": {"pixels": ["1", 0], "vae": ["4", 2]}},
            "4": {
                "class_type": "CheckpointLoaderSimple",
                "inputs": {"ckpt_name": "sd_xl_base_1.0.safetensors"}
            },
            "6": {"class_type": "CLIPTextEncode", "inputs": {"text": "{{prompt}}", "clip": ["4", 1]}},
            "7": {"class_type": "CLIPTextEncode", "inputs": {"text": "", "clip": ["4", 1]}},
            "8": {"class_type": "VAEDecode", "inputs": {"samples": ["3", 0], "vae": ["4", 2]}},
            "9": {"class_type": "SaveImage", "inputs": {"filename_prefix": "openclaw", "images": ["8", 0]}}
        }),
        skeleton_sha256: String::new(),
    }
}

fn builtin_upscale() -> Template {
    let mut schema = BTreeMap::new();
    schema.insert("image".into(), FieldSchema::required(FieldType::Str));
    schema.insert(
        "scale".into(),
        FieldSchema::optional(FieldType::Float, InputValue::Float(2.0)).bounded(1.0, 4.0),
    );

    Template {
        template_id: "upscale".into(),
        labels: vec!["post-process".into()],
        schema,
        skeleton: serde_json::json!({
            "1": {"class_type": "LoadImage", "inputs": {"image": "{{image}}"}},
            "2": {
                "class_type": "ImageScaleBy",
                "inputs": {"upscale_method": "lanczos", "scale_by": "{{scale}}", "image": ["1", 0]}
            },
            "3": {"class_type": "SaveImage", "inputs": {"filename_prefix": "openclaw_up", "images": ["2", 0]}}
        }),
        skeleton_sha256: String::new(),
    }
}
