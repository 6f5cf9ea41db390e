//! Structured-output validation against caller-supplied JSON Schemas.
//!
//! Validation is synchronous and CPU-only. A failed validation is not an
//! error here: [`ValidationOutcome`] carries `valid = false`, the messages
//! and the untouched response, and the dispatcher decides what to do.

use serde_json::Value;

use crate::canonical::CanonicalResponse;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("invalid JSON schema: {message}")]
    InvalidSchema { message: String },
}

/// Result of checking one response.
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub valid: bool,
    /// Human-readable violations, empty when `valid`.
    pub errors: Vec<String>,
    pub raw_response: CanonicalResponse,
}

/// A schema compiled once and checked against many responses.
#[derive(Debug)]
pub struct CompiledSchema {
    validator: jsonschema::Validator,
}

impl CompiledSchema {
    pub fn new(schema: &Value) -> Result<Self, SchemaError> {
        let validator = jsonschema::options()
            .build(schema)
            .map_err(|e| SchemaError::InvalidSchema {
                message: e.to_string(),
            })?;
        Ok(Self { validator })
    }

    /// Check the structured payload of `response`.
    pub fn check(&self, response: CanonicalResponse) -> ValidationOutcome {
        let errors = match response.structured_payload() {
            Some(payload) => self
                .validator
                .iter_errors(&payload)
                .map(|e| e.to_string())
                .collect(),
            None => vec!["response does not contain a JSON payload".to_string()],
        };

        ValidationOutcome {
            valid: errors.is_empty(),
            errors,
            raw_response: response,
        }
    }
}

/// Stateless validator facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct SchemaValidator;

impl SchemaValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate `response` against `schema`.
    pub fn validate(
        &self,
        response: CanonicalResponse,
        schema: &Value,
    ) -> Result<ValidationOutcome, SchemaError> {
        Ok(CompiledSchema::new(schema)?.check(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::{Choice, Message};
    use serde_json::json;

    fn response_with(content: &str) -> CanonicalResponse {
        CanonicalResponse {
            id: "r1".to_string(),
            model: "m".to_string(),
            choices: vec![Choice {
                index: 0,
                message: Message::assistant(content),
                finish_reason: Some("stop".to_string()),
            }],
            ..Default::default()
        }
    }

    fn person_schema() -> Value {
        json!({
            "type": "object",
            "required": ["name", "age"],
            "properties": {
                "name": { "type": "string" },
                "age": { "type": "integer" },
                "tags": { "type": "array", "items": { "type": "string" } },
                "role": { "enum": ["admin", "user"] }
            }
        })
    }

    #[test]
    fn test_conforming_payload_is_valid() {
        let outcome = SchemaValidator::new()
            .validate(
                response_with(r#"{"name":"Ada","age":36,"tags":["x"],"role":"admin"}"#),
                &person_schema(),
            )
            .unwrap();
        assert!(outcome.valid);
        assert!(outcome.errors.is_empty());
    }

    #[test]
    fn test_missing_required_and_wrong_type() {
        let outcome = SchemaValidator::new()
            .validate(response_with(r#"{"age":"old"}"#), &person_schema())
            .unwrap();
        assert!(!outcome.valid);
        assert_eq!(outcome.errors.len(), 2, "errors: {:?}", outcome.errors);
    }

    #[test]
    fn test_enum_and_items_checked() {
        let outcome = SchemaValidator::new()
            .validate(
                response_with(r#"{"name":"a","age":1,"tags":[1],"role":"root"}"#),
                &person_schema(),
            )
            .unwrap();
        assert!(!outcome.valid);
        assert_eq!(outcome.errors.len(), 2, "errors: {:?}", outcome.errors);
    }

    #[test]
    fn test_raw_response_returned_untouched() {
        let response = response_with(r#"{"name": 5}"#);
        let outcome = SchemaValidator::new()
            .validate(response.clone(), &person_schema())
            .unwrap();
        assert!(!outcome.valid);
        assert_eq!(outcome.raw_response, response);
    }

    #[test]
    fn test_non_json_output_is_invalid() {
        let outcome = SchemaValidator::new()
            .validate(response_with("Sure! Here is the JSON you asked for"), &person_schema())
            .unwrap();
        assert!(!outcome.valid);
        assert_eq!(outcome.errors.len(), 1);
    }

    #[test]
    fn test_invalid_schema_rejected() {
        let err = SchemaValidator::new()
            .validate(response_with("{}"), &json!({"type": 12}))
            .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidSchema { .. }));
    }
}
