//! LogsQL checks for the logs backend.
//!
//! LogsQL has no metric names, so parsing only validates that quotes and
//! parentheses balance. Tag scoping prepends exact-match field filters to the
//! filter part of the query, before the first top-level pipe.

use super::{split_tags, ParseError, ParsedExpr};

/// Validate a LogsQL query; the result never lists metrics
pub fn parse(expr: &str) -> Result<ParsedExpr, ParseError> {
    if expr.trim().is_empty() {
        return Err(ParseError::new(0, "empty query"));
    }
    first_top_level_pipe(expr)?;
    Ok(ParsedExpr::default())
}

/// Byte index of the first `|` outside quotes and parentheses, if any
fn first_top_level_pipe(expr: &str) -> Result<Option<usize>, ParseError> {
    let bytes = expr.as_bytes();
    let mut depth: usize = 0;
    let mut pipe = None;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' | b'\'' | b'`' => {
                let quote = bytes[i];
                let start = i;
                i += 1;
                loop {
                    match bytes.get(i) {
                        None => return Err(ParseError::new(start, "unterminated string")),
                        Some(b'\\') if quote != b'`' => i += 2,
                        Some(b) if *b == quote => break,
                        Some(_) => i += 1,
                    }
                }
            }
            b'(' => depth += 1,
            b')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| ParseError::new(i, "unbalanced ')'"))?;
            }
            b'|' if depth == 0 && pipe.is_none() => pipe = Some(i),
            _ => {}
        }
        i += 1;
    }
    if depth != 0 {
        return Err(ParseError::new(expr.len(), "unclosed '('"));
    }
    Ok(pipe)
}

/// Quote a LogsQL string literal
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Scope a query by `key=value` tags: `k1:="v1" k2:="v2" (filters) | pipes`
pub fn inject_filters(expr: &str, event_tags: &[String]) -> Result<String, ParseError> {
    parse(expr)?;
    let tags = split_tags(event_tags);
    if tags.is_empty() {
        return Ok(expr.to_string());
    }

    let filters = tags
        .iter()
        .map(|(k, v)| format!("{}:={}", k, quote(v)))
        .collect::<Vec<_>>()
        .join(" ");

    let (head, tail) = match first_top_level_pipe(expr)? {
        Some(idx) => (&expr[..idx], &expr[idx..]),
        None => (expr, ""),
    };
    let head = head.trim();
    let scoped = if head.is_empty() || head == "*" {
        filters
    } else {
        format!("{} ({})", filters, head)
    };

    if tail.is_empty() {
        Ok(scoped)
    } else {
        Ok(format!("{} {}", scoped, tail.trim()))
    }
}
