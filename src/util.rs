//! Shared text helpers.

/// Lowercase `title`, collapse every run of non-alphanumerics into `sep`,
/// and cut the result to at most `max_len` bytes on a char boundary.
pub fn slugify(title: &str, sep: char, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { sep })
        .collect::<String>()
        .split(sep)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(&sep.to_string());
    if slug.len() > max_len {
        slug[..slug.floor_char_boundary(max_len)]
            .trim_end_matches(sep)
            .to_string()
    } else {
        slug
    }
}

/// Remove a surrounding markdown code fence from generated text.
///
/// Handles a complete fence, an opening fence with no closing line, and
/// text with no fence at all. Text before the opening fence is dropped.
pub fn strip_code_fences(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let code = match lines.iter().position(|l| l.trim_start().starts_with("```")) {
        Some(open) => {
            let body = &lines[open + 1..];
            let close = body
                .iter()
                .rposition(|l| l.trim() == "```")
                .unwrap_or(body.len());
            body[..close].join("\n")
        }
        None => text.to_string(),
    };
    let code = code.trim_matches(|c: char| c == '\n' || c == '\r');
    if code.trim().is_empty() {
        String::new()
    } else {
        format!("{}\n", code.trim_end())
    }
}
