//! # Option Bags
//!
//! Purpose: Eager validation of host-native arguments and option bags.
//!
//! ## Design Principles
//! 1. **Fail Early**: Every value is type-checked before any request is built.
//! 2. **Uniform Messages**: A type mismatch always reads
//!    `expected <type> for <name>`.
//! 3. **Absent Is Fine**: Missing and `null` options both mean "use the
//!    default".

use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;

use csm_common::{CoreErrorInfo, CoreResult, DocumentId, DurabilityLevel};

/// Argument validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptionError {
    #[error("expected {expected} for {name}")]
    WrongType { expected: &'static str, name: String },
    #[error("missing argument {0}")]
    Missing(String),
}

impl From<OptionError> for CoreErrorInfo {
    #[track_caller]
    fn from(err: OptionError) -> Self {
        CoreErrorInfo::invalid_argument(err.to_string())
    }
}

fn wrong_type(expected: &'static str, name: &str) -> OptionError {
    OptionError::WrongType {
        expected,
        name: name.to_string(),
    }
}

/// A validated view over an optional JSON object of options.
#[derive(Debug, Clone, Copy)]
pub struct OptionBag<'a> {
    values: Option<&'a Map<String, Value>>,
}

impl<'a> OptionBag<'a> {
    /// Accepts an object, `null`, or nothing.
    pub fn new(value: Option<&'a Value>) -> Result<Self, OptionError> {
        match value {
            None | Some(Value::Null) => Ok(OptionBag { values: None }),
            Some(Value::Object(map)) => Ok(OptionBag { values: Some(map) }),
            Some(_) => Err(wrong_type("array", "options")),
        }
    }

    pub fn empty() -> Self {
        OptionBag { values: None }
    }

    fn get(&self, name: &str) -> Option<&'a Value> {
        self.values
            .and_then(|map| map.get(name))
            .filter(|value| !value.is_null())
    }

    pub fn string(&self, name: &str) -> Result<Option<String>, OptionError> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::String(value)) => Ok(Some(value.clone())),
            Some(_) => Err(wrong_type("string", name)),
        }
    }

    pub fn required_string(&self, name: &str) -> Result<String, OptionError> {
        self.string(name)?
            .ok_or_else(|| OptionError::Missing(name.to_string()))
    }

    pub fn boolean(&self, name: &str) -> Result<Option<bool>, OptionError> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::Bool(value)) => Ok(Some(*value)),
            Some(_) => Err(wrong_type("boolean", name)),
        }
    }

    pub fn integer(&self, name: &str) -> Result<Option<u64>, OptionError> {
        match self.get(name) {
            None => Ok(None),
            Some(value) => value.as_u64().map(Some).ok_or_else(|| wrong_type("integer", name)),
        }
    }

    /// Non-negative integer milliseconds.
    pub fn duration(&self, name: &str) -> Result<Option<Duration>, OptionError> {
        Ok(self.integer(name)?.map(Duration::from_millis))
    }

    pub fn durability(&self, name: &str) -> CoreResult<Option<DurabilityLevel>> {
        match self.string(name)? {
            None => Ok(None),
            Some(level) => level.parse().map(Some),
        }
    }

    pub fn strings(&self, name: &str) -> Result<Vec<String>, OptionError> {
        match self.get(name) {
            None => Ok(Vec::new()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| wrong_type("array of strings", name))
                })
                .collect(),
            Some(_) => Err(wrong_type("array", name)),
        }
    }

    pub fn array(&self, name: &str) -> Result<Vec<Value>, OptionError> {
        match self.get(name) {
            None => Ok(Vec::new()),
            Some(Value::Array(items)) => Ok(items.clone()),
            Some(_) => Err(wrong_type("array", name)),
        }
    }

    pub fn object(&self, name: &str) -> Result<Map<String, Value>, OptionError> {
        match self.get(name) {
            None => Ok(Map::new()),
            Some(Value::Object(map)) => Ok(map.clone()),
            Some(_) => Err(wrong_type("array", name)),
        }
    }
}

/// Positional call arguments.
#[derive(Debug, Clone, Copy)]
pub struct Args<'a> {
    values: &'a [Value],
}

impl<'a> Args<'a> {
    pub fn new(values: &'a [Value]) -> Self {
        Args { values }
    }

    fn required(&self, index: usize, name: &str) -> Result<&'a Value, OptionError> {
        self.values
            .get(index)
            .filter(|value| !value.is_null())
            .ok_or_else(|| OptionError::Missing(name.to_string()))
    }

    pub fn string(&self, index: usize, name: &str) -> Result<&'a str, OptionError> {
        self.required(index, name)?
            .as_str()
            .ok_or_else(|| wrong_type("string", name))
    }

    pub fn integer(&self, index: usize, name: &str) -> Result<u64, OptionError> {
        self.required(index, name)?
            .as_u64()
            .ok_or_else(|| wrong_type("integer", name))
    }

    pub fn value(&self, index: usize, name: &str) -> Result<&'a Value, OptionError> {
        self.required(index, name)
    }

    pub fn strings(&self, index: usize, name: &str) -> Result<Vec<String>, OptionError> {
        match self.required(index, name)? {
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| wrong_type("array of strings", name))
                })
                .collect(),
            _ => Err(wrong_type("array", name)),
        }
    }

    pub fn options(&self, index: usize) -> Result<OptionBag<'a>, OptionError> {
        OptionBag::new(self.values.get(index))
    }

    /// `bucket, scope, collection, id` starting at `index`.
    pub fn document_id(&self, index: usize) -> Result<DocumentId, OptionError> {
        Ok(DocumentId::new(
            self.string(index, "bucket")?,
            self.string(index + 1, "scope")?,
            self.string(index + 2, "collection")?,
            self.string(index + 3, "id")?,
        ))
    }
}
