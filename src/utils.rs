/// Splits `text` into `;` terminated statements. Semicolons in quotes and `--` comments don't end
/// a statement. Empty statements are skipped.
pub fn split_statements(text: &str) -> Vec<&str> {
    let mut stmts = vec![];
    let mut start = 0;
    let mut quote = None;
    let mut in_comment = false;
    let mut chars = text.char_indices().peekable();
    while let Some((pos, c)) = chars.next() {
        match (quote, c) {
            _ if in_comment => in_comment = c != '\n',
            (Some(q), _) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"' | '`') => quote = Some(c),
            (None, '-') if matches!(chars.peek(), Some((_, '-'))) => in_comment = true,
            (None, ';') => {
                stmts.push(&text[start..pos]);
                start = pos + 1;
            }
            _ => {}
        }
    }
    stmts.push(&text[start..]);
    stmts
        .into_iter()
        .filter(|stmt| !is_blank(stmt))
        .map(str::trim)
        .collect()
}

/// True if `stmt` only holds whitespace and comments.
fn is_blank(stmt: &str) -> bool {
    stmt.lines()
        .map(str::trim)
        .all(|line| line.is_empty() || line.starts_with("--"))
}
