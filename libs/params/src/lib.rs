//! Launch parameter library.
//!
//! A game config declares typed parameters; a server game config and the
//! session request each supply overrides. The host manager merges them, checks
//! them against the declarations and substitutes them into the launch
//! templates.
//!
//! # Template syntax
//!
//! ```text
//! --port={{port}} --motd "{{ motd }}"
//! ```
//!
//! Placeholder names may be padded with spaces. A placeholder whose name is
//! not a known parameter is left in the output untouched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Parameter values by name, sorted for deterministic rendering and logging.
pub type ParamValues = BTreeMap<String, String>;

/// Replacement shown instead of secret values.
pub const REDACTED: &str = "***";

/// Parameter errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParamError {
    /// A required parameter has no value after merging.
    #[error("missing required parameter '{0}'")]
    MissingRequired(String),

    /// A value does not parse as the declared type.
    #[error("invalid value for parameter '{name}': expected {expected}")]
    InvalidValue { name: String, expected: ParamType },
}

/// Declared type of a parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    #[default]
    String,
    Int,
    Bool,
    /// A string that must never be logged or republished.
    Secret,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Bool => "bool",
            Self::Secret => "secret",
        }
    }

    fn accepts(&self, value: &str) -> bool {
        match self {
            Self::String | Self::Secret => true,
            Self::Int => value.trim().parse::<i64>().is_ok(),
            Self::Bool => matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "false"),
        }
    }
}

impl std::fmt::Display for ParamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parameter declared by a game config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamDefinition {
    pub name: String,
    #[serde(rename = "type", default)]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ParamDefinition {
    pub fn new(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: false,
            default: None,
            description: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<String>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// Merges declared defaults with override layers.
///
/// Layers are applied in order, so a later layer wins over an earlier one and
/// every layer wins over the declared defaults. Values for undeclared names
/// are kept.
pub fn merge_params(definitions: &[ParamDefinition], overrides: &[&ParamValues]) -> ParamValues {
    let mut merged: ParamValues = definitions
        .iter()
        .filter_map(|def| def.default.as_ref().map(|v| (def.name.clone(), v.clone())))
        .collect();

    for layer in overrides {
        for (name, value) in layer.iter() {
            merged.insert(name.clone(), value.clone());
        }
    }

    merged
}

/// Checks values against their declarations.
///
/// Definitions are checked in declaration order and the first violation is
/// returned.
pub fn validate_params(
    definitions: &[ParamDefinition],
    values: &ParamValues,
) -> Result<(), ParamError> {
    for def in definitions {
        match values.get(&def.name) {
            None if def.required => return Err(ParamError::MissingRequired(def.name.clone())),
            None => {}
            Some(value) if !def.param_type.accepts(value) => {
                return Err(ParamError::InvalidValue {
                    name: def.name.clone(),
                    expected: def.param_type,
                })
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Substitutes `{{name}}` placeholders.
pub fn render_template(template: &str, params: &ParamValues) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];

        let Some(end) = after_open.find("}}") else {
            // Unterminated placeholder, keep the remainder verbatim.
            out.push_str(&rest[start..]);
            return out;
        };

        let name = after_open[..end].trim();
        match params.get(name) {
            Some(value) => out.push_str(value),
            None => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after_open[end + 2..];
    }

    out.push_str(rest);
    out
}

/// Returns a copy of `values` with every secret replaced by [`REDACTED`].
pub fn redact(definitions: &[ParamDefinition], values: &ParamValues) -> ParamValues {
    values
        .iter()
        .map(|(name, value)| {
            let secret = definitions
                .iter()
                .any(|d| d.name == *name && d.param_type == ParamType::Secret);
            let shown = if secret { REDACTED.to_string() } else { value.clone() };
            (name.clone(), shown)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn values(pairs: &[(&str, &str)]) -> ParamValues {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_merge_later_override_wins() {
        let defs = vec![
            ParamDefinition::new("port", ParamType::Int).with_default("25565"),
            ParamDefinition::new("motd", ParamType::String).with_default("hello"),
        ];
        let sgc = values(&[("port", "25570"), ("motd", "sgc")]);
        let session = values(&[("motd", "session")]);

        let merged = merge_params(&defs, &[&sgc, &session]);
        assert_eq!(merged["port"], "25570");
        assert_eq!(merged["motd"], "session");
    }

    #[test]
    fn test_merge_keeps_undeclared_values() {
        let merged = merge_params(&[], &[&values(&[("extra", "1")])]);
        assert_eq!(merged["extra"], "1");
    }

    #[rstest]
    #[case(ParamType::Int, "42", true)]
    #[case(ParamType::Int, "-7", true)]
    #[case(ParamType::Int, "4.2", false)]
    #[case(ParamType::Bool, "true", true)]
    #[case(ParamType::Bool, "FALSE", true)]
    #[case(ParamType::Bool, "yes", false)]
    #[case(ParamType::String, "", true)]
    #[case(ParamType::Secret, "hunter2", true)]
    fn test_validate_types(#[case] ty: ParamType, #[case] value: &str, #[case] ok: bool) {
        let defs = vec![ParamDefinition::new("p", ty)];
        let result = validate_params(&defs, &values(&[("p", value)]));
        assert_eq!(result.is_ok(), ok, "{ty} {value:?}");
    }

    #[test]
    fn test_validate_rejects_missing_required() {
        let defs = vec![ParamDefinition::new("rcon_password", ParamType::Secret).required()];
        assert_eq!(
            validate_params(&defs, &ParamValues::new()),
            Err(ParamError::MissingRequired("rcon_password".to_string()))
        );
    }

    #[test]
    fn test_validate_optional_may_be_absent() {
        let defs = vec![ParamDefinition::new("seed", ParamType::Int)];
        assert!(validate_params(&defs, &ParamValues::new()).is_ok());
    }

    #[rstest]
    #[case("--port={{port}}", "--port=25565")]
    #[case("{{ port }}:{{port}}", "25565:25565")]
    #[case("{{unknown}} stays", "{{unknown}} stays")]
    #[case("open {{port", "open {{port")]
    #[case("no placeholders", "no placeholders")]
    #[case("", "")]
    fn test_render_template(#[case] template: &str, #[case] expected: &str) {
        let params = values(&[("port", "25565")]);
        assert_eq!(render_template(template, &params), expected);
    }

    #[test]
    fn test_redact_hides_secrets_only() {
        let defs = vec![
            ParamDefinition::new("rcon_password", ParamType::Secret),
            ParamDefinition::new("port", ParamType::Int),
        ];
        let redacted = redact(&defs, &values(&[("rcon_password", "x"), ("port", "1")]));
        assert_eq!(redacted["rcon_password"], REDACTED);
        assert_eq!(redacted["port"], "1");
    }

    #[test]
    fn test_definition_json_uses_type_key() {
        let def: ParamDefinition =
            serde_json::from_str(r#"{"name":"port","type":"int","required":true}"#).unwrap();
        assert_eq!(def.param_type, ParamType::Int);
        assert!(def.required);
    }
}
