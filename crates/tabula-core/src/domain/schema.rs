//! Table schema: the explicit, ordered column layout that inference output is
//! parsed against.
//!
//! 応答テキストの列は名前で動的に対応付けず、この schema の位置で決まります。
//! 未知の列や余分な列はエラーとして扱い、黙って無視しません。

use std::collections::HashSet;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// What a column carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnRole {
    /// The Record identifier. Exactly one per schema.
    Key,
    /// Echoed input value.
    Input,
    /// The classification output, constrained by the label pattern. Exactly one per schema.
    Label,
    /// Any other produced value.
    Output,
}

/// One column of the expected table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub position: usize,
    pub required: bool,
    pub role: ColumnRole,
    /// Multi-word column that may absorb unescaped delimiters during repair.
    #[serde(default)]
    pub free_text: bool,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, position: usize, role: ColumnRole) -> Self {
        let required = matches!(role, ColumnRole::Key | ColumnRole::Label);
        Self {
            name: name.into(),
            position,
            required,
            role,
            free_text: false,
        }
    }

    pub fn free_text(mut self) -> Self {
        self.free_text = true;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn is_output(&self) -> bool {
        matches!(self.role, ColumnRole::Label | ColumnRole::Output)
    }
}

/// Allowed values of the label column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelPattern {
    /// Closed set of literal labels.
    Vocabulary(Vec<String>),
    /// Regular expression; anchored on both ends when compiled.
    Pattern(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("schema has no columns")]
    Empty,

    #[error("column '{name}' has position {found}, expected {expected}")]
    PositionGap {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("duplicate column name '{0}'")]
    DuplicateName(String),

    #[error("schema needs exactly one key column, found {0}")]
    KeyColumns(usize),

    #[error("schema needs exactly one label column, found {0}")]
    LabelColumns(usize),

    #[error("label vocabulary is empty")]
    EmptyVocabulary,

    #[error("invalid label pattern: {0}")]
    InvalidPattern(String),
}

/// Validated, ordered schema.
#[derive(Debug, Clone)]
pub struct TableSchema {
    columns: Vec<ColumnDescriptor>,
    key_index: usize,
    label_index: usize,
    labels: LabelPattern,
    label_regex: Regex,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnDescriptor>, labels: LabelPattern) -> Result<Self, SchemaError> {
        if columns.is_empty() {
            return Err(SchemaError::Empty);
        }

        let mut seen = HashSet::new();
        for (expected, column) in columns.iter().enumerate() {
            if column.position != expected {
                return Err(SchemaError::PositionGap {
                    name: column.name.clone(),
                    expected,
                    found: column.position,
                });
            }
            if !seen.insert(column.name.as_str()) {
                return Err(SchemaError::DuplicateName(column.name.clone()));
            }
        }

        let keys: Vec<usize> = positions_with_role(&columns, ColumnRole::Key);
        if keys.len() != 1 {
            return Err(SchemaError::KeyColumns(keys.len()));
        }
        let label_positions = positions_with_role(&columns, ColumnRole::Label);
        if label_positions.len() != 1 {
            return Err(SchemaError::LabelColumns(label_positions.len()));
        }

        let label_regex = compile_label_pattern(&labels)?;

        Ok(Self {
            columns,
            key_index: keys[0],
            label_index: label_positions[0],
            labels,
            label_regex,
        })
    }

    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    pub fn arity(&self) -> usize {
        self.columns.len()
    }

    pub fn header(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn key_index(&self) -> usize {
        self.key_index
    }

    pub fn label_index(&self) -> usize {
        self.label_index
    }

    pub fn key_column(&self) -> &ColumnDescriptor {
        &self.columns[self.key_index]
    }

    pub fn label_column(&self) -> &ColumnDescriptor {
        &self.columns[self.label_index]
    }

    pub fn labels(&self) -> &LabelPattern {
        &self.labels
    }

    pub fn position_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Does `value` satisfy the label constraint?
    pub fn is_label(&self, value: &str) -> bool {
        !value.is_empty() && self.label_regex.is_match(value)
    }

    /// Columns the service produces (Label and Output roles).
    pub fn output_columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns.iter().filter(|c| c.is_output())
    }
}

fn positions_with_role(columns: &[ColumnDescriptor], role: ColumnRole) -> Vec<usize> {
    columns
        .iter()
        .filter(|c| c.role == role)
        .map(|c| c.position)
        .collect()
}

fn compile_label_pattern(labels: &LabelPattern) -> Result<Regex, SchemaError> {
    let source = match labels {
        LabelPattern::Vocabulary(words) => {
            if words.iter().all(|w| w.trim().is_empty()) {
                return Err(SchemaError::EmptyVocabulary);
            }
            let alternatives: Vec<String> = words
                .iter()
                .filter(|w| !w.trim().is_empty())
                .map(|w| regex::escape(w.trim()))
                .collect();
            format!("^(?:{})$", alternatives.join("|"))
        }
        LabelPattern::Pattern(pattern) => format!("^(?:{pattern})$"),
    };
    Regex::new(&source).map_err(|e| SchemaError::InvalidPattern(e.to_string()))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// id, site, description (free text), label, remark (free text)
    pub fn work_order_schema() -> TableSchema {
        TableSchema::new(
            vec![
                ColumnDescriptor::new("id", 0, ColumnRole::Key),
                ColumnDescriptor::new("site", 1, ColumnRole::Input),
                ColumnDescriptor::new("description", 2, ColumnRole::Input).free_text(),
                ColumnDescriptor::new("label", 3, ColumnRole::Label),
                ColumnDescriptor::new("remark", 4, ColumnRole::Output).free_text(),
            ],
            LabelPattern::Vocabulary(vec!["quality".into(), "non-quality".into()]),
        )
        .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::work_order_schema;
    use super::*;

    #[test]
    fn schema_exposes_layout() {
        let schema = work_order_schema();
        assert_eq!(schema.arity(), 5);
        assert_eq!(schema.header(), vec!["id", "site", "description", "label", "remark"]);
        assert_eq!(schema.key_index(), 0);
        assert_eq!(schema.label_index(), 3);
        assert!(schema.label_column().required);
        assert_eq!(
            schema.output_columns().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            vec!["label", "remark"]
        );
    }

    #[test]
    fn label_pattern_is_anchored() {
        let schema = work_order_schema();
        assert!(schema.is_label("quality"));
        assert!(schema.is_label("non-quality"));
        assert!(!schema.is_label("quality issue"));
        assert!(!schema.is_label(""));
    }

    #[test]
    fn custom_pattern_is_supported() {
        let schema = TableSchema::new(
            vec![
                ColumnDescriptor::new("id", 0, ColumnRole::Key),
                ColumnDescriptor::new("grade", 1, ColumnRole::Label),
            ],
            LabelPattern::Pattern("[A-C][0-9]".into()),
        )
        .unwrap();
        assert!(schema.is_label("B2"));
        assert!(!schema.is_label("B22"));
    }

    #[test]
    fn rejects_position_gaps() {
        let err = TableSchema::new(
            vec![
                ColumnDescriptor::new("id", 0, ColumnRole::Key),
                ColumnDescriptor::new("label", 2, ColumnRole::Label),
            ],
            LabelPattern::Vocabulary(vec!["a".into()]),
        )
        .unwrap_err();
        assert!(matches!(err, SchemaError::PositionGap { expected: 1, found: 2, .. }));
    }

    #[test]
    fn rejects_duplicate_names() {
        let err = TableSchema::new(
            vec![
                ColumnDescriptor::new("id", 0, ColumnRole::Key),
                ColumnDescriptor::new("id", 1, ColumnRole::Label),
            ],
            LabelPattern::Vocabulary(vec!["a".into()]),
        )
        .unwrap_err();
        assert_eq!(err, SchemaError::DuplicateName("id".into()));
    }

    #[test]
    fn requires_exactly_one_key_and_label() {
        let no_key = TableSchema::new(
            vec![ColumnDescriptor::new("label", 0, ColumnRole::Label)],
            LabelPattern::Vocabulary(vec!["a".into()]),
        );
        assert_eq!(no_key.unwrap_err(), SchemaError::KeyColumns(0));

        let two_labels = TableSchema::new(
            vec![
                ColumnDescriptor::new("id", 0, ColumnRole::Key),
                ColumnDescriptor::new("a", 1, ColumnRole::Label),
                ColumnDescriptor::new("b", 2, ColumnRole::Label),
            ],
            LabelPattern::Vocabulary(vec!["x".into()]),
        );
        assert_eq!(two_labels.unwrap_err(), SchemaError::LabelColumns(2));
    }

    #[test]
    fn rejects_empty_vocabulary_and_bad_patterns() {
        let columns = vec![
            ColumnDescriptor::new("id", 0, ColumnRole::Key),
            ColumnDescriptor::new("label", 1, ColumnRole::Label),
        ];
        assert_eq!(
            TableSchema::new(columns.clone(), LabelPattern::Vocabulary(vec![" ".into()])).unwrap_err(),
            SchemaError::EmptyVocabulary
        );
        assert!(matches!(
            TableSchema::new(columns, LabelPattern::Pattern("(".into())).unwrap_err(),
            SchemaError::InvalidPattern(_)
        ));
    }
}
