//! Structured output validator/repairer.
//!
//! 推論サービスの応答は「区切り文字付きの表」のはずですが、信頼できません。
//! ここでは応答テキストから表を取り出し、行ごとに修復し、
//! 期待した identifier との差分（missing / malformed）を報告します。
//!
//! 純粋関数のみ: I/O も共有状態も持ちません。

mod extract;
mod realign;
mod tokenize;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

pub use crate::domain::Noise;
use crate::domain::{
    RecordKey, RepairKind, RetryReason, Row, StructuredResult, TableSchema, ValidationError,
};

/// Outcome of validating one reply against the identifiers it should contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    /// Resolved rows, all of schema arity.
    pub result: StructuredResult,
    pub missing: BTreeSet<RecordKey>,
    /// Identifier -> why its row was rejected.
    pub malformed: BTreeMap<RecordKey, String>,
    pub repairs: Vec<(RecordKey, RepairKind)>,
    pub noise: Noise,
    /// False when the reply had no header line and canonical order was assumed.
    pub header_present: bool,
}

impl ValidationReport {
    /// Report for a reply that could not be read at all.
    pub fn rejected(schema: &TableSchema, expected: &[RecordKey], error: &ValidationError) -> Self {
        let header = schema.header().into_iter().map(String::from).collect();
        let (missing, malformed) = match error {
            ValidationError::EmptyResponse => (expected.iter().cloned().collect(), BTreeMap::new()),
            _ => (
                BTreeSet::new(),
                expected
                    .iter()
                    .map(|key| (key.clone(), error.to_string()))
                    .collect(),
            ),
        };
        Self {
            result: StructuredResult::new(header),
            missing,
            malformed,
            repairs: Vec::new(),
            noise: Noise::default(),
            header_present: false,
        }
    }

    /// `missing ∪ malformed` with the reason for each identifier.
    pub fn unresolved(&self) -> BTreeMap<RecordKey, RetryReason> {
        self.missing
            .iter()
            .map(|key| (key.clone(), RetryReason::Missing))
            .chain(
                self.malformed
                    .keys()
                    .map(|key| (key.clone(), RetryReason::Malformed)),
            )
            .collect()
    }

    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.malformed.is_empty()
    }
}

/// Validates replies against one schema.
#[derive(Debug, Clone)]
pub struct Validator {
    schema: Arc<TableSchema>,
}

impl Validator {
    pub fn new(schema: Arc<TableSchema>) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Recover the table in `text` and diff it against `expected`.
    ///
    /// Returns an error only when nothing usable is in the reply or its header
    /// disagrees with the schema; row-level problems go into the report.
    pub fn validate(&self, text: &str, expected: &[RecordKey]) -> Result<ValidationReport, ValidationError> {
        let schema = self.schema.as_ref();
        let expected_set: HashSet<&str> = expected.iter().map(RecordKey::as_str).collect();

        let lines = extract::candidate_lines(text);
        let rows = tokenize::logical_lines(&lines);

        let mut noise = Noise::default();
        let mut header_present = false;
        let mut started = false;
        let mut resolved: HashMap<RecordKey, (Vec<String>, Vec<RepairKind>)> = HashMap::new();
        let mut malformed: BTreeMap<RecordKey, String> = BTreeMap::new();

        for raw in &rows {
            let tokens = tokenize::tokenize(raw);
            if tokens.iter().all(String::is_empty) {
                continue;
            }

            if self.is_header_shaped(&tokens) {
                if started {
                    noise.extra_headers += 1;
                } else {
                    self.check_header(&tokens)?;
                    header_present = true;
                    started = true;
                }
                continue;
            }

            let key = tokens
                .get(schema.key_index())
                .filter(|key| expected_set.contains(key.as_str()))
                .map(|key| RecordKey::new(key.as_str()));
            let Some(key) = key else {
                if started {
                    noise.stray_rows += 1;
                } else {
                    noise.prose_lines += 1;
                }
                continue;
            };
            started = true;

            match realign::realign(tokens, schema) {
                Ok(row) => {
                    malformed.remove(&key);
                    resolved.insert(key, (row.cells, row.repairs));
                }
                Err(reason) => {
                    if !resolved.contains_key(&key) {
                        malformed.insert(key, reason);
                    }
                }
            }
        }

        if !started {
            return Err(ValidationError::EmptyResponse);
        }

        let header: Vec<String> = schema.header().into_iter().map(String::from).collect();
        let mut result = StructuredResult::new(header);
        let mut repairs = Vec::new();
        for key in expected {
            if let Some((cells, kinds)) = resolved.remove(key) {
                repairs.extend(kinds.into_iter().map(|kind| (key.clone(), kind)));
                if let Err(e) = result.insert(key.clone(), Row::new(cells)) {
                    malformed.insert(key.clone(), e.to_string());
                }
            }
        }

        let missing = expected
            .iter()
            .filter(|key| !result.contains(key.as_str()) && !malformed.contains_key(key.as_str()))
            .cloned()
            .collect();

        Ok(ValidationReport {
            result,
            missing,
            malformed,
            repairs,
            noise,
            header_present,
        })
    }

    /// First token names the key column, or at least half of the tokens are column names.
    fn is_header_shaped(&self, tokens: &[String]) -> bool {
        let schema = self.schema.as_ref();
        let key_name = &schema.key_column().name;
        if tokens
            .first()
            .is_some_and(|first| first.eq_ignore_ascii_case(key_name))
        {
            return true;
        }
        let names = tokens
            .iter()
            .filter(|token| {
                schema
                    .columns()
                    .iter()
                    .any(|c| c.name.eq_ignore_ascii_case(token))
            })
            .count();
        names * 2 >= tokens.len().max(2) && names * 2 >= schema.arity()
    }

    fn check_header(&self, tokens: &[String]) -> Result<(), ValidationError> {
        let expected = self.schema.header();
        if tokens.iter().map(String::as_str).eq(expected.iter().copied()) {
            return Ok(());
        }

        let unexpected: Vec<String> = tokens
            .iter()
            .filter(|token| !expected.contains(&token.as_str()))
            .cloned()
            .collect();
        let missing: Vec<String> = expected
            .iter()
            .filter(|name| !tokens.iter().any(|token| token == *name))
            .map(|name| name.to_string())
            .collect();
        if unexpected.is_empty() && missing.is_empty() {
            return Err(ValidationError::HeaderLayout {
                found: tokens.to_vec(),
            });
        }
        Err(ValidationError::HeaderMismatch { unexpected, missing })
    }
}
