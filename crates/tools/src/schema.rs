//! Argument validation against a tool's JSON Schema.

use jsonschema::Validator;

/// Errors reported per call are capped at this many.
const MAX_REPORTED_ERRORS: usize = 3;

/// A compiled parameter schema.
pub struct ArgumentValidator {
    validator: Validator,
    primary_argument: Option<String>,
}

impl ArgumentValidator {
    /// Compile a schema. Fails if the schema itself is malformed.
    pub fn compile(schema: &serde_json::Value) -> Result<Self, String> {
        let validator = jsonschema::validator_for(schema).map_err(|e| e.to_string())?;
        Ok(Self {
            validator,
            primary_argument: primary_argument(schema),
        })
    }

    /// Check arguments, returning a readable summary of what's wrong.
    pub fn validate(&self, arguments: &serde_json::Value) -> Result<(), String> {
        let errors: Vec<String> = self
            .validator
            .iter_errors(arguments)
            .take(MAX_REPORTED_ERRORS)
            .map(|e| {
                let location = e.instance_path.to_string();
                if location.is_empty() {
                    e.to_string()
                } else {
                    format!("{location}: {e}")
                }
            })
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }

    /// The first required string property, used by approval rules that
    /// don't name an argument.
    pub fn primary_argument(&self) -> Option<&str> {
        self.primary_argument.as_deref()
    }
}

fn primary_argument(schema: &serde_json::Value) -> Option<String> {
    let properties = schema.get("properties")?.as_object()?;
    let is_string = |name: &str| {
        properties
            .get(name)
            .and_then(|p| p.get("type"))
            .and_then(|t| t.as_str())
            == Some("string")
    };
    schema
        .get("required")?
        .as_array()?
        .iter()
        .filter_map(|v| v.as_str())
        .find(|name| is_string(name))
        .map(str::to_string)
}
