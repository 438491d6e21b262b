//! Permissive, quote-aware line tokenizer.

use std::sync::LazyLock;

use regex::Regex;

/// Physical lines joined while a quoted field is still open.
const MAX_CONTINUATION_LINES: usize = 4;

/// `, "` and `" ,` padding that would stop the csv reader from seeing a quoted field.
static PADDED_QUOTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#",[ \t]+""#).expect("static regex"));
static TRAILING_PADDED_QUOTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""[ \t]+,"#).expect("static regex"));

/// Join physical lines into logical rows.
///
/// A line that ends inside a quoted field continues on the next line, up to a
/// small bound. A join is kept only if the quote closes and the joined text
/// reads as exactly one record; otherwise the lines stand on their own.
pub(crate) fn logical_lines(lines: &[&str]) -> Vec<String> {
    let mut rows = Vec::with_capacity(lines.len());
    let mut pending: Vec<&str> = Vec::new();

    for &line in lines {
        pending.push(line);
        let buffer = pending.join("\n");
        if ends_in_quoted_field(&buffer) {
            if pending.len() < MAX_CONTINUATION_LINES {
                continue;
            }
            rows.extend(pending.drain(..).map(str::to_string));
            continue;
        }
        if pending.len() == 1 || record_count(&buffer) == 1 {
            rows.push(buffer);
        } else {
            rows.extend(pending.iter().map(|l| l.to_string()));
        }
        pending.clear();
    }
    rows.extend(pending.into_iter().map(str::to_string));
    rows
}

/// Whether `text` stops inside a quoted field.
///
/// A quote opens a field only at field start (after the delimiter and optional
/// blanks). Quotes anywhere else are literal characters, e.g. `12" pipe`.
fn ends_in_quoted_field(text: &str) -> bool {
    let mut in_quotes = false;
    let mut at_field_start = true;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            continue;
        }
        match c {
            ',' | '\n' => at_field_start = true,
            '"' if at_field_start => {
                in_quotes = true;
                at_field_start = false;
            }
            ' ' | '\t' => {}
            _ => at_field_start = false,
        }
    }
    in_quotes
}

fn normalize(row: &str) -> String {
    let normalized = PADDED_QUOTE.replace_all(row, ",\"");
    TRAILING_PADDED_QUOTE.replace_all(&normalized, "\",").into_owned()
}

fn record_count(text: &str) -> usize {
    let normalized = normalize(text);
    csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(normalized.as_bytes())
        .records()
        .count()
}

/// Split one logical row into cleaned tokens.
///
/// Quoted fields (with `""` escapes) keep their delimiters. An unbalanced quote
/// never fails the row: the csv reader takes the rest of the line as one field.
pub(crate) fn tokenize(row: &str) -> Vec<String> {
    let normalized = normalize(row);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(normalized.as_bytes());
    let mut record = csv::StringRecord::new();
    match reader.read_record(&mut record) {
        Ok(true) => record.iter().map(clean_token).collect(),
        Ok(false) => Vec::new(),
        Err(error) => {
            tracing::debug!(%error, "csv reader rejected row, splitting naively");
            row.split(',').map(clean_token).collect()
        }
    }
}

/// Trim, drop carriage returns, and map null-like markers to empty.
pub(crate) fn clean_token(raw: &str) -> String {
    let token = raw.replace('\r', "");
    let token = token.trim();
    match token.to_ascii_lowercase().as_str() {
        "nan" | "null" | "none" => String::new(),
        _ => token.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::plain("A, site 1 ,x", &["A", "site 1", "x"])]
    #[case::quoted("A,\"a, b\",x", &["A", "a, b", "x"])]
    #[case::padded_quote("A, \"a, b\" ,x", &["A", "a, b", "x"])]
    #[case::escaped_quote("A,\"say \"\"hi\"\"\",x", &["A", "say \"hi\"", "x"])]
    #[case::null_markers("A,NaN,null,None,x", &["A", "", "", "", "x"])]
    #[case::trailing_empty("A,x,", &["A", "x", ""])]
    fn tokenizes_rows(#[case] row: &str, #[case] expected: &[&str]) {
        assert_eq!(tokenize(row), expected);
    }

    #[test]
    fn unbalanced_quote_does_not_fail() {
        let tokens = tokenize("A,\"broken,x");
        assert_eq!(tokens[0], "A");
        assert!(tokens.len() >= 2);
    }

    #[test]
    fn open_quotes_join_continuation_lines() {
        let lines = ["A,\"first line", "second line\",x", "B,y"];
        let rows = logical_lines(&lines);
        assert_eq!(rows.len(), 2);
        assert_eq!(tokenize(&rows[0]), vec!["A", "first line\nsecond line", "x"]);
    }

    #[test]
    fn unclosed_quote_leaves_lines_apart() {
        let lines = ["A,\"never closed", "b", "c", "d", "e", "f"];
        let rows = logical_lines(&lines);
        assert_eq!(rows, lines);
    }

    #[test]
    fn quote_inside_a_field_is_literal() {
        let lines = ["A,p1,replaced 12\" pipe,quality,", "B,p1,pump,quality,", "C,p1,pump,quality,"];
        let rows = logical_lines(&lines);
        assert_eq!(rows, lines);
        assert_eq!(tokenize(&rows[0])[2], "replaced 12\" pipe");
    }

    #[rstest]
    #[case::padded("A, \"open", true)]
    #[case::closed("A,\"a, b\",x", false)]
    #[case::escaped("A,\"say \"\"hi", true)]
    #[case::mid_field("A,12\" pipe", false)]
    #[case::after_close("A,\"x\"y\"", false)]
    fn detects_open_quoted_fields(#[case] text: &str, #[case] open: bool) {
        assert_eq!(ends_in_quoted_field(text), open);
    }
}
