//! Row realignment against the schema.
//!
//! 手順:
//! 1. 列数が多い: 最も右にあるラベル token を錨にして左右に分け、余った token を
//!    ラベル列に最も近い自由記述列へ区切り文字で連結して戻す
//! 2. 列数が少ない: 末尾を空文字で埋める（行は捨てない）
//! 3. ラベル列が空で、他の列にちょうど 1 つラベルがあれば移動する
//! 4. 必須列とラベルの制約を満たさなければ malformed

use crate::domain::{ColumnDescriptor, RepairKind, TableSchema};

const FOLD_DELIMITER: &str = ",";

/// A row that now has exactly `schema.arity()` cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Realigned {
    pub cells: Vec<String>,
    pub repairs: Vec<RepairKind>,
}

/// Bring `tokens` to the schema's arity, or explain why that is impossible.
pub(crate) fn realign(tokens: Vec<String>, schema: &TableSchema) -> Result<Realigned, String> {
    let arity = schema.arity();
    let mut repairs = Vec::new();

    let mut cells = if tokens.len() > arity {
        repairs.push(RepairKind::Realigned);
        fold_excess(tokens, schema)?
    } else if tokens.len() < arity {
        repairs.push(RepairKind::Padded);
        let mut padded = tokens;
        padded.resize(arity, String::new());
        padded
    } else {
        tokens
    };

    if relocate_label(&mut cells, schema) {
        repairs.push(RepairKind::LabelRelocated);
    }

    check_constraints(&cells, schema)?;
    Ok(Realigned { cells, repairs })
}

fn fold_excess(tokens: Vec<String>, schema: &TableSchema) -> Result<Vec<String>, String> {
    let label_index = schema.label_index();
    let anchor = tokens
        .iter()
        .rposition(|token| schema.is_label(token))
        .ok_or_else(|| {
            format!(
                "{} tokens for {} columns and no label to anchor on",
                tokens.len(),
                schema.arity()
            )
        })?;

    let columns = schema.columns();
    let mut tokens = tokens;
    let right: Vec<String> = tokens.split_off(anchor + 1);
    let label = tokens.pop().unwrap_or_default();
    let left = tokens;

    let left_columns = &columns[..label_index];
    let right_columns = &columns[label_index + 1..];

    let left = fit_segment(left, left_columns, Side::Left).ok_or_else(|| {
        format!(
            "cannot fit {anchor} tokens left of the label into {} columns",
            left_columns.len()
        )
    })?;
    let right = fit_segment(right, right_columns, Side::Right)
        .ok_or_else(|| "cannot fit tokens right of the label".to_string())?;

    let mut cells = left;
    cells.push(label);
    cells.extend(right);
    Ok(cells)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    /// Segment ends at the label; the nearest free-text column is the last one.
    Left,
    /// Segment starts after the label; the nearest free-text column is the first one.
    Right,
}

fn fit_segment(segment: Vec<String>, columns: &[ColumnDescriptor], side: Side) -> Option<Vec<String>> {
    let want = columns.len();
    if segment.len() == want {
        return Some(segment);
    }
    if segment.len() < want {
        // Missing cells left of the label cannot be placed; right of it they are trailing.
        return match side {
            Side::Left => None,
            Side::Right => {
                let mut padded = segment;
                padded.resize(want, String::new());
                Some(padded)
            }
        };
    }

    let free_text = match side {
        Side::Left => columns.iter().rposition(|c| c.free_text),
        Side::Right => columns.iter().position(|c| c.free_text),
    }?;
    let excess = segment.len() - want;

    let mut cells = Vec::with_capacity(want);
    let mut tokens = segment.into_iter();
    cells.extend(tokens.by_ref().take(free_text));
    let folded: Vec<String> = tokens.by_ref().take(excess + 1).collect();
    cells.push(folded.join(FOLD_DELIMITER));
    cells.extend(tokens);
    Some(cells)
}

/// Move a stray label into an empty label cell. Returns whether anything moved.
fn relocate_label(cells: &mut [String], schema: &TableSchema) -> bool {
    let label_index = schema.label_index();
    if !cells[label_index].is_empty() {
        return false;
    }
    let mut candidates = cells
        .iter()
        .enumerate()
        .filter(|(i, cell)| *i != label_index && *i != schema.key_index() && schema.is_label(cell))
        .map(|(i, _)| i);
    match (candidates.next(), candidates.next()) {
        (Some(from), None) => {
            cells[label_index] = std::mem::take(&mut cells[from]);
            true
        }
        _ => false,
    }
}

fn check_constraints(cells: &[String], schema: &TableSchema) -> Result<(), String> {
    if let Some(column) = schema
        .columns()
        .iter()
        .find(|c| c.required && cells[c.position].is_empty())
    {
        return Err(format!("required column '{}' is empty", column.name));
    }
    let label = &cells[schema.label_index()];
    if !schema.is_label(label) {
        return Err(format!("'{label}' is not an allowed label"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::schema::fixtures::work_order_schema;
    use rstest::rstest;

    fn tokens(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn well_formed_row_is_untouched() {
        let schema = work_order_schema();
        let row = realign(tokens(&["A", "plant 1", "pump leaks", "quality", ""]), &schema).unwrap();
        assert_eq!(row.cells, tokens(&["A", "plant 1", "pump leaks", "quality", ""]));
        assert!(row.repairs.is_empty());
    }

    #[test]
    fn one_embedded_delimiter_is_folded_into_description() {
        let schema = work_order_schema();
        let row = realign(
            tokens(&["A", "plant 1", "pump leaks", "badly", "quality", "check seal"]),
            &schema,
        )
        .unwrap();

        assert_eq!(
            row.cells,
            tokens(&["A", "plant 1", "pump leaks,badly", "quality", "check seal"])
        );
        assert_eq!(row.cells[schema.label_index()], "quality");
        assert_eq!(row.repairs, vec![RepairKind::Realigned]);
    }

    #[test]
    fn excess_right_of_label_goes_to_remark() {
        let schema = work_order_schema();
        let row = realign(
            tokens(&["A", "plant 1", "pump", "non-quality", "ok", "no action"]),
            &schema,
        )
        .unwrap();
        assert_eq!(row.cells, tokens(&["A", "plant 1", "pump", "non-quality", "ok,no action"]));
    }

    #[test]
    fn rightmost_label_is_the_anchor() {
        let schema = work_order_schema();
        // "quality" in the description must not be taken as the label.
        let row = realign(
            tokens(&["A", "plant 1", "quality", "drop", "non-quality", ""]),
            &schema,
        )
        .unwrap();
        assert_eq!(row.cells[2], "quality,drop");
        assert_eq!(row.cells[3], "non-quality");
    }

    #[test]
    fn excess_without_label_is_malformed() {
        let schema = work_order_schema();
        let err = realign(tokens(&["A", "b", "c", "d", "e", "f"]), &schema).unwrap_err();
        assert!(err.contains("no label"));
    }

    #[test]
    fn short_row_is_padded() {
        let schema = work_order_schema();
        let row = realign(tokens(&["A", "plant 1", "pump", "quality"]), &schema).unwrap();
        assert_eq!(row.cells.len(), schema.arity());
        assert_eq!(row.cells[4], "");
        assert_eq!(row.repairs, vec![RepairKind::Padded]);
    }

    #[test]
    fn misplaced_label_is_relocated() {
        let schema = work_order_schema();
        let row = realign(tokens(&["A", "plant 1", "pump", "", "quality"]), &schema).unwrap();
        assert_eq!(row.cells, tokens(&["A", "plant 1", "pump", "quality", ""]));
        assert_eq!(row.repairs, vec![RepairKind::LabelRelocated]);
    }

    #[rstest]
    #[case::missing_label(&["A", "plant 1", "pump"])]
    #[case::empty_key(&["", "plant 1", "pump", "quality", ""])]
    #[case::unknown_label(&["A", "plant 1", "pump", "maybe", ""])]
    fn unrepairable_rows(#[case] values: &[&str]) {
        let schema = work_order_schema();
        assert!(realign(tokens(values), &schema).is_err());
    }
}
