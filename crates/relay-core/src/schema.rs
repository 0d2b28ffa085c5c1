use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// What the backend is told about the expected structured output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchemaSpec {
    pub name: String,
    pub schema: serde_json::Value,
    pub strict: bool,
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("output is not valid JSON for {schema}: {message}")]
    NotJson { schema: String, message: String },
    #[error("output does not match {schema}: {message}")]
    Mismatch { schema: String, message: String },
}

/// A structured-output contract the final payload must satisfy.
///
/// The engine never defines schemas; callers hand one in and the engine
/// forwards its [`SchemaSpec`] to the backend and validates the answer.
pub trait OutputSchema: Send + Sync {
    fn name(&self) -> &str;
    fn json_schema(&self) -> &serde_json::Value;

    /// Check an already-parsed value against the contract.
    fn validate(&self, value: &serde_json::Value) -> Result<(), String>;

    fn spec(&self) -> SchemaSpec {
        SchemaSpec {
            name: self.name().to_string(),
            schema: self.json_schema().clone(),
            strict: true,
        }
    }

    /// Parse final text and validate it.
    fn parse(&self, text: &str) -> Result<serde_json::Value, SchemaError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| SchemaError::NotJson {
                schema: self.name().to_string(),
                message: e.to_string(),
            })?;
        self.check(&value)?;
        Ok(value)
    }

    fn check(&self, value: &serde_json::Value) -> Result<(), SchemaError> {
        self.validate(value).map_err(|message| SchemaError::Mismatch {
            schema: self.name().to_string(),
            message,
        })
    }
}

/// Schema backed by a Rust type: a value is valid iff it deserializes into `T`.
pub struct TypedSchema<T> {
    name: String,
    schema: serde_json::Value,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> TypedSchema<T> {
    pub fn new(name: impl Into<String>, schema: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            schema,
            _marker: PhantomData,
        }
    }

    /// Deserialize a value that already passed validation.
    pub fn decode(&self, value: &serde_json::Value) -> Result<T, SchemaError> {
        T::deserialize(value).map_err(|e| SchemaError::Mismatch {
            schema: self.name.clone(),
            message: e.to_string(),
        })
    }
}

impl<T: DeserializeOwned> OutputSchema for TypedSchema<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn json_schema(&self) -> &serde_json::Value {
        &self.schema
    }

    fn validate(&self, value: &serde_json::Value) -> Result<(), String> {
        T::deserialize(value).map(|_| ()).map_err(|e| e.to_string())
    }
}
