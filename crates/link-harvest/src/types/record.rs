//! Input and result rows of a batch

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One row of a submitted batch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputRecord {
    /// Value of the designated key column (e.g. the domain)
    pub key: String,
    /// All other cells of the row, by column name
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl InputRecord {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

/// Extraction output for one input row
///
/// Every tracked attribute is present in `values`; `None` marks an absent value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResultRecord {
    /// Key of the input row this result belongs to
    pub key: String,
    /// Attribute name -> extracted value
    pub values: BTreeMap<String, Option<String>>,
}

impl ResultRecord {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            values: BTreeMap::new(),
        }
    }

    /// Result with every attribute absent, used when a record could not be processed
    pub fn empty(key: impl Into<String>, attributes: &[String]) -> Self {
        Self {
            key: key.into(),
            values: attributes.iter().map(|a| (a.clone(), None)).collect(),
        }
    }

    pub fn with_value(mut self, attribute: impl Into<String>, value: Option<String>) -> Self {
        self.values.insert(attribute.into(), value);
        self
    }

    /// Extracted value of an attribute, if any
    pub fn get(&self, attribute: &str) -> Option<&str> {
        self.values.get(attribute).and_then(|v| v.as_deref())
    }

    /// Force the record onto the declared attribute set: missing attributes become
    /// absent, undeclared ones are dropped.
    pub fn conform(mut self, attributes: &[String]) -> Self {
        let mut values = BTreeMap::new();
        for attribute in attributes {
            let value = self.values.remove(attribute).flatten();
            values.insert(attribute.clone(), value);
        }
        self.values = values;
        self
    }

    /// True when no attribute has a value
    pub fn is_empty(&self) -> bool {
        self.values.values().all(Option::is_none)
    }
}

/// A validated batch ready for submission
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InputBatch {
    /// Name of the key column as it appeared in the input
    pub key_column: String,
    /// Rows in input order
    pub records: Vec<InputRecord>,
}

impl InputBatch {
    pub fn new(key_column: impl Into<String>, records: Vec<InputRecord>) -> Self {
        Self {
            key_column: key_column.into(),
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Column layout of a result artifact: key column, then attributes in declaration order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResultHeader {
    pub key_column: String,
    pub attributes: Vec<String>,
}

impl ResultHeader {
    pub fn new(key_column: impl Into<String>, attributes: Vec<String>) -> Self {
        Self {
            key_column: key_column.into(),
            attributes,
        }
    }

    /// All column names in output order
    pub fn columns(&self) -> Vec<&str> {
        std::iter::once(self.key_column.as_str())
            .chain(self.attributes.iter().map(String::as_str))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs() -> Vec<String> {
        vec!["Facebook".to_string(), "GitHub".to_string()]
    }

    #[test]
    fn test_empty_result_has_every_attribute() {
        let record = ResultRecord::empty("example.com", &attrs());
        assert_eq!(record.values.len(), 2);
        assert!(record.is_empty());
        assert_eq!(record.get("Facebook"), None);
    }

    #[test]
    fn test_conform_fills_and_drops() {
        let record = ResultRecord::new("example.com")
            .with_value("GitHub", Some("https://github.com/example".into()))
            .with_value("Myspace", Some("https://myspace.com/example".into()))
            .conform(&attrs());

        assert_eq!(record.values.len(), 2);
        assert_eq!(record.get("GitHub"), Some("https://github.com/example"));
        assert!(record.values.contains_key("Facebook"));
        assert!(!record.values.contains_key("Myspace"));
        assert!(!record.is_empty());
    }

    #[test]
    fn test_header_columns() {
        let header = ResultHeader::new("domain", attrs());
        assert_eq!(header.columns(), vec!["domain", "Facebook", "GitHub"]);
    }
}
