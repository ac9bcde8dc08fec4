//! Declarative tables turning an external document into record fields.

use std::collections::HashSet;

use serde_json::{Map, Value};

use crate::error::ConfigError;
use crate::service::Document;

pub type Extractor = fn(&Document) -> Option<Value>;

/// Copy what `extract` produces from the document's `source` field into the
/// record's `target` field.
#[derive(Clone, Copy)]
pub struct FieldMapping {
    pub source: &'static str,
    pub target: &'static str,
    pub extract: Extractor,
}

impl FieldMapping {
    pub const fn new(source: &'static str, target: &'static str, extract: Extractor) -> Self {
        Self {
            source,
            target,
            extract,
        }
    }
}

/// A validated mapping table.
#[derive(Clone)]
pub struct FieldMappings {
    mappings: Vec<FieldMapping>,
}

impl FieldMappings {
    pub fn new(mappings: Vec<FieldMapping>) -> Result<Self, ConfigError> {
        if mappings.is_empty() {
            return Err(ConfigError::InvalidMapping("no field mapped".to_owned()));
        }

        let mut targets = HashSet::new();
        for mapping in &mappings {
            if mapping.source.is_empty() || mapping.target.is_empty() {
                return Err(ConfigError::InvalidMapping(
                    "field names cannot be empty".to_owned(),
                ));
            }
            if !targets.insert(mapping.target) {
                return Err(ConfigError::InvalidMapping(format!(
                    "{} is mapped more than once",
                    mapping.target
                )));
            }
        }

        Ok(Self { mappings })
    }

    /// Enrichment fields for `document`. Empty values are left out so they never
    /// overwrite what the record already carries.
    pub fn apply(&self, document: &Document) -> Map<String, Value> {
        let mut fields = Map::new();

        for mapping in &self.mappings {
            match (mapping.extract)(document) {
                None | Some(Value::Null) => {}
                Some(Value::String(s)) if s.is_empty() => {}
                Some(value) => {
                    fields.insert(mapping.target.to_owned(), value);
                }
            }
        }

        fields
    }

    /// Distinct top-level document fields the table reads, in table order.
    pub fn source_fields(&self) -> Vec<&'static str> {
        let mut seen = HashSet::new();
        self.mappings
            .iter()
            .map(|mapping| mapping.source)
            .filter(|source| seen.insert(*source))
            .collect()
    }
}

/// Follow a dotted path (`open_access.oa_status`) through nested objects.
pub fn lookup<'a>(document: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut value = document.get(parts.next()?)?;

    for part in parts {
        value = value.as_object()?.get(part)?;
    }

    Some(value)
}

/// Render a scalar as text: strings as is, numbers and booleans formatted.
pub fn text(document: &Document, path: &str) -> Option<Value> {
    match lookup(document, path)? {
        Value::String(s) => Some(Value::String(s.to_owned())),
        Value::Number(n) => Some(Value::String(n.to_string())),
        Value::Bool(b) => Some(Value::String(b.to_string())),
        _ => None,
    }
}

/// Collect `field` from every object of the array at `path`, deduplicate and join.
pub fn joined_labels(
    document: &Document,
    path: &str,
    field: &str,
    separator: &str,
) -> Option<Value> {
    let items = lookup(document, path)?.as_array()?;
    let mut seen = HashSet::new();

    let labels: Vec<&str> = items
        .iter()
        .filter_map(|item| lookup(item.as_object()?, field)?.as_str())
        .filter(|label| !label.is_empty() && seen.insert(*label))
        .collect();

    Some(Value::String(labels.join(separator)))
}

/// Join the scalars of the array at `path`.
pub fn joined_values(document: &Document, path: &str, separator: &str) -> Option<Value> {
    let items = lookup(document, path)?.as_array()?;

    let values: Vec<String> = items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.to_owned()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .collect();

    Some(Value::String(values.join(separator)))
}
