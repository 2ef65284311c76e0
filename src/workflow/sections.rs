//! Heading-based section filter for counterfactual output.
//!
//! Best effort only. Nothing downstream depends on what it returns.

const KEYWORDS: [&str; 5] = ["causal", "pathway", "relationship", "mechanism", "link"];

/// Heading text if `line` is a markdown heading (`#`, `##`, ... then whitespace)
fn heading(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    let body = trimmed.trim_start_matches('#');
    let hashes = trimmed.len() - body.len();
    if hashes == 0 || !body.starts_with(char::is_whitespace) {
        return None;
    }
    Some(body.trim())
}

/// Split `text` at markdown headings and keep the sections that mention a
/// causal keyword, heading included. Text before the first heading counts as
/// a section of its own.
pub fn extract_relevant_sections(text: &str) -> Vec<String> {
    let mut sections: Vec<Vec<&str>> = vec![Vec::new()];
    for line in text.lines() {
        match heading(line) {
            Some(title) => sections.push(vec![title]),
            None => {
                if let Some(current) = sections.last_mut() {
                    current.push(line);
                }
            }
        }
    }

    sections
        .into_iter()
        .map(|lines| lines.join("\n").trim().to_string())
        .filter(|section| !section.is_empty())
        .filter(|section| {
            let lower = section.to_lowercase();
            KEYWORDS.iter().any(|k| lower.contains(k))
        })
        .collect()
}
