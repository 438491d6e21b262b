//! Isolate candidate table text from a free-form reply.

/// Lines of the candidate table, with fence markers removed.
///
/// If the reply contains fenced blocks, only their contents are kept; prose
/// around them is dropped. Otherwise every line is kept and leading prose is
/// skipped later, once header and key detection can tell prose from data.
pub(crate) fn candidate_lines(text: &str) -> Vec<&str> {
    let lines: Vec<&str> = text.lines().collect();
    let has_fence = lines.iter().any(|line| is_fence(line));
    if !has_fence {
        return lines
            .into_iter()
            .filter(|line| !is_noise_line(line))
            .collect();
    }

    let mut inside = false;
    let mut fenced = Vec::new();
    for line in lines {
        if is_fence(line) {
            inside = !inside;
            continue;
        }
        if inside && !is_noise_line(line) {
            fenced.push(line);
        }
    }
    fenced
}

fn is_fence(line: &str) -> bool {
    line.trim_start().starts_with("```")
}

/// Blank lines and table rulers such as `---` or `|---|---|`.
pub(crate) fn is_noise_line(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return true;
    }
    trimmed.len() >= 3
        && trimmed
            .chars()
            .all(|c| matches!(c, '-' | '=' | '|' | ':' | '+' | ' '))
}
