//! Request rendering.
//!
//! 1 つの Batch（または再試行のチャンク）を推論サービス向けのテキストにします。
//! 表部分は `csv::Writer` で書くので、カンマや改行を含む値も正しく quote されます。

use std::sync::Arc;

use crate::domain::{ColumnRole, LabelPattern, Record, RecordKey, RetryManifest, TableSchema, TaskId};
use crate::ports::{ContextSnapshot, InferenceRequest};

const FORMAT_RULES: &str = "Return only the CSV table: the header line first, then exactly one \
row per identifier, in the order given. Quote any value that contains a comma or a line break. \
Do not add, drop or rename columns.";

const RETRY_NOTICE: &str = "NOTE: a previous reply omitted or garbled the rows for these \
identifiers. Return a complete, well-formed row for every one of them:";

/// Renders requests against one schema.
#[derive(Debug, Clone)]
pub struct RequestRenderer {
    schema: Arc<TableSchema>,
}

impl RequestRenderer {
    pub fn new(schema: Arc<TableSchema>) -> Self {
        Self { schema }
    }

    /// Render the request for `records`.
    ///
    /// `retry` is the manifest of the round being rendered; its identifiers
    /// are listed in a notice so the service knows what went wrong before.
    pub fn render(
        &self,
        task_id: TaskId,
        batch_index: usize,
        round: u32,
        records: &[&Record],
        context: &ContextSnapshot,
        retry: Option<&RetryManifest>,
    ) -> Result<InferenceRequest, csv::Error> {
        let table = self.render_table(records)?;

        let mut prompt = String::new();
        if !context.instructions.is_empty() {
            prompt.push_str(context.instructions.trim());
            prompt.push_str("\n\n");
        }
        if !context.rules.is_empty() {
            prompt.push_str("Rules:\n");
            for rule in &context.rules {
                prompt.push_str("- ");
                prompt.push_str(rule.trim());
                prompt.push('\n');
            }
            prompt.push('\n');
        }
        prompt.push_str(&self.label_line());
        prompt.push_str("\n\n");
        prompt.push_str(FORMAT_RULES);
        prompt.push_str("\n\n");

        if let Some(manifest) = retry {
            let listed: Vec<&str> = records
                .iter()
                .map(|r| r.key.as_str())
                .filter(|key| manifest.contains(key))
                .collect();
            if !listed.is_empty() {
                prompt.push_str(RETRY_NOTICE);
                prompt.push(' ');
                prompt.push_str(&listed.join(", "));
                prompt.push_str("\n\n");
            }
        }

        prompt.push_str(&table);

        Ok(InferenceRequest {
            task_id,
            batch_index,
            round,
            prompt,
            expected: records.iter().map(|r| r.key.clone()).collect::<Vec<RecordKey>>(),
        })
    }

    /// Header plus one line per record; output columns are left blank.
    fn render_table(&self, records: &[&Record]) -> Result<String, csv::Error> {
        let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());
        writer.write_record(self.schema.header())?;

        for record in records {
            let cells = self.schema.columns().iter().map(|column| match column.role {
                ColumnRole::Key => record.key.as_str(),
                ColumnRole::Input => record.input(&column.name).unwrap_or_default(),
                ColumnRole::Label | ColumnRole::Output => "",
            });
            writer.write_record(cells)?;
        }

        let bytes = writer.into_inner().map_err(|e| csv::Error::from(e.into_error()))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn label_line(&self) -> String {
        let column = &self.schema.label_column().name;
        match self.schema.labels() {
            LabelPattern::Vocabulary(values) => {
                format!("Column \"{column}\" must be exactly one of: {}.", values.join(", "))
            }
            LabelPattern::Pattern(pattern) => {
                format!("Column \"{column}\" must match the pattern {pattern}.")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::schema::fixtures::work_order_schema;
    use crate::domain::RetryReason;
    use std::collections::BTreeMap;
    use ulid::Ulid;

    fn renderer() -> RequestRenderer {
        RequestRenderer::new(Arc::new(work_order_schema()))
    }

    fn record(key: &str, description: &str) -> Record {
        Record::new(key, [("site", "plant 1"), ("description", description)])
    }

    fn context() -> ContextSnapshot {
        ContextSnapshot {
            instructions: "Classify each work order.".into(),
            rules: vec!["Leaks are quality issues.".into()],
        }
    }

    #[test]
    fn renders_header_rows_and_rules() {
        let a = record("A", "pump leaks");
        let b = record("B", "paint");
        let request = renderer()
            .render(TaskId::from_ulid(Ulid::new()), 2, 0, &[&a, &b], &context(), None)
            .unwrap();

        assert_eq!(request.batch_index, 2);
        assert_eq!(request.expected, vec![RecordKey::new("A"), RecordKey::new("B")]);
        assert!(request.prompt.starts_with("Classify each work order."));
        assert!(request.prompt.contains("- Leaks are quality issues."));
        assert!(request.prompt.contains("one of: quality, non-quality"));
        assert!(request.prompt.contains("id,site,description,label,remark\nA,plant 1,pump leaks,,\n"));
        assert!(!request.prompt.contains(RETRY_NOTICE));
    }

    #[test]
    fn values_with_commas_are_quoted() {
        let a = record("A", "pump leaks, badly");
        let request = renderer()
            .render(TaskId::from_ulid(Ulid::new()), 0, 0, &[&a], &context(), None)
            .unwrap();
        assert!(request.prompt.contains("A,plant 1,\"pump leaks, badly\",,"));
    }

    #[test]
    fn retry_round_lists_previous_failures() {
        let a = record("A", "x");
        let b = record("B", "y");
        let entries: BTreeMap<RecordKey, RetryReason> =
            [(RecordKey::new("B"), RetryReason::Malformed)].into_iter().collect();
        let manifest = RetryManifest::first(entries, 2).unwrap();

        let request = renderer()
            .render(TaskId::from_ulid(Ulid::new()), 0, 1, &[&a, &b], &context(), Some(&manifest))
            .unwrap();
        assert_eq!(request.round, 1);
        assert!(request.prompt.contains(&format!("{RETRY_NOTICE} B\n")));
    }
}
