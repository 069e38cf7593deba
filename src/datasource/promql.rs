//! A lightweight PromQL scanner.
//!
//! It does not build an AST. It tokenizes the expression, checks that
//! operators and operands alternate and brackets balance, and records every
//! vector selector with its byte span. That is enough to extract referenced
//! metric names for the rule cache and to inject label matchers.

use super::{split_tags, ParseError, ParsedExpr};

const KEYWORDS: &[&str] = &[
    "and", "or", "unless", "by", "without", "on", "ignoring", "group_left", "group_right",
    "offset", "bool", "atan2", "inf", "nan",
];

const AGGREGATIONS: &[&str] = &[
    "sum", "avg", "count", "min", "max", "stddev", "stdvar", "topk", "bottomk", "quantile",
    "count_values", "group", "limitk", "limit_ratio",
];

/// Functions a selector name may be called as
const FUNCTIONS: &[&str] = &[
    "abs", "absent", "absent_over_time", "acos", "acosh", "asin", "asinh", "atan", "atanh",
    "avg_over_time", "ceil", "changes", "clamp", "clamp_max", "clamp_min", "cos", "cosh",
    "count_over_time", "day_of_month", "day_of_week", "day_of_year", "days_in_month", "deg",
    "delta", "deriv", "double_exponential_smoothing", "exp", "floor", "histogram_avg",
    "histogram_count", "histogram_fraction", "histogram_quantile", "histogram_stddev",
    "histogram_stdvar", "histogram_sum", "holt_winters", "hour", "idelta", "increase", "info",
    "irate", "label_join", "label_replace", "last_over_time", "ln", "log10", "log2",
    "mad_over_time", "max_over_time", "min_over_time", "minute", "month", "pi", "predict_linear",
    "present_over_time", "quantile_over_time", "rad", "rate", "resets", "round", "scalar", "sgn",
    "sin", "sinh", "sort", "sort_by_label", "sort_by_label_desc", "sort_desc", "sqrt",
    "stddev_over_time", "stdvar_over_time", "sum_over_time", "tan", "tanh", "time", "timestamp",
    "vector", "year",
];

const GROUPING: &[&str] = &["by", "without", "on", "ignoring", "group_left", "group_right"];

const BINARY_KEYWORDS: &[&str] = &["and", "or", "unless", "atan2"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Ident,
    Number,
    Str,
    /// `$name` template variable, treated as a scalar operand
    Variable,
    LParen,
    RParen,
    /// `{...}`; the span covers both braces
    Braces,
    /// `[...]`; the span covers both brackets
    Range,
    Comma,
    Op,
    At,
}

#[derive(Debug, Clone, Copy)]
struct Token {
    kind: Kind,
    start: usize,
    end: usize,
}

/// One vector selector found in the expression
#[derive(Debug, Clone, PartialEq, Eq)]
struct Selector {
    /// Span of the metric name, absent for `{__name__="x"}`-style selectors
    name: Option<(usize, usize)>,
    /// Span of the `{...}` block including braces
    braces: Option<(usize, usize)>,
}

fn tokenize(src: &str) -> Result<Vec<Token>, ParseError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;
        match c {
            b' ' | b'\t' | b'\r' | b'\n' => {
                i += 1;
                continue;
            }
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                continue;
            }
            b'"' | b'\'' | b'`' => {
                i = skip_string(bytes, i)?;
                tokens.push(Token { kind: Kind::Str, start, end: i });
                continue;
            }
            b'{' => {
                i = skip_block(bytes, i, b'{', b'}')?;
                tokens.push(Token { kind: Kind::Braces, start, end: i });
                continue;
            }
            b'[' => {
                i = skip_block(bytes, i, b'[', b']')?;
                tokens.push(Token { kind: Kind::Range, start, end: i });
                continue;
            }
            b'}' | b']' => {
                return Err(ParseError::new(i, format!("unexpected '{}'", c as char)));
            }
            b'(' => tokens.push(Token { kind: Kind::LParen, start, end: i + 1 }),
            b')' => tokens.push(Token { kind: Kind::RParen, start, end: i + 1 }),
            b',' => tokens.push(Token { kind: Kind::Comma, start, end: i + 1 }),
            b'@' => tokens.push(Token { kind: Kind::At, start, end: i + 1 }),
            b'$' => {
                i += 1;
                while i < bytes.len() && is_ident_char(bytes[i]) {
                    i += 1;
                }
                if i == start + 1 {
                    return Err(ParseError::new(start, "empty variable name"));
                }
                tokens.push(Token { kind: Kind::Variable, start, end: i });
                continue;
            }
            b'=' | b'!' | b'<' | b'>' => {
                let two = bytes.get(i + 1).copied();
                let len = match (c, two) {
                    (b'=', Some(b'=')) | (b'!', Some(b'=')) | (b'<', Some(b'=')) | (b'>', Some(b'=')) => 2,
                    (b'<', _) | (b'>', _) => 1,
                    _ => return Err(ParseError::new(i, format!("unexpected '{}'", c as char))),
                };
                tokens.push(Token { kind: Kind::Op, start, end: i + len });
                i += len;
                continue;
            }
            b'+' | b'-' | b'*' | b'/' | b'%' | b'^' => {
                tokens.push(Token { kind: Kind::Op, start, end: i + 1 })
            }
            c if c.is_ascii_digit() || (c == b'.' && bytes.get(i + 1).map_or(false, u8::is_ascii_digit)) => {
                i += 1;
                while i < bytes.len() {
                    let b = bytes[i];
                    if b.is_ascii_alphanumeric() || b == b'.' || b == b'_' {
                        i += 1;
                    } else if (b == b'+' || b == b'-')
                        && matches!(bytes[i - 1], b'e' | b'E')
                        && bytes.get(i + 1).map_or(false, u8::is_ascii_digit)
                        && !src[start..i].starts_with("0x")
                    {
                        i += 1;
                    } else {
                        break;
                    }
                }
                tokens.push(Token { kind: Kind::Number, start, end: i });
                continue;
            }
            c if is_ident_start(c) => {
                while i < bytes.len() && is_ident_char(bytes[i]) {
                    i += 1;
                }
                tokens.push(Token { kind: Kind::Ident, start, end: i });
                continue;
            }
            _ => {
                return Err(ParseError::new(
                    i,
                    format!("unexpected character {:?}", src[i..].chars().next().unwrap_or('?')),
                ))
            }
        }
        i += 1;
    }

    Ok(tokens)
}

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_' || c == b':'
}

fn is_ident_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b':'
}

/// Skip a quoted string starting at `i`, returning the index after the closing quote
fn skip_string(bytes: &[u8], i: usize) -> Result<usize, ParseError> {
    let quote = bytes[i];
    let mut j = i + 1;
    while j < bytes.len() {
        match bytes[j] {
            b'\\' if quote != b'`' => j += 2,
            b if b == quote => return Ok(j + 1),
            _ => j += 1,
        }
    }
    Err(ParseError::new(i, "unterminated string"))
}

/// Skip a `{...}` or `[...]` block, honouring strings, returning the index after the closer
fn skip_block(bytes: &[u8], i: usize, open: u8, close: u8) -> Result<usize, ParseError> {
    let mut j = i + 1;
    while j < bytes.len() {
        match bytes[j] {
            b'"' | b'\'' | b'`' => j = skip_string(bytes, j)?,
            b if b == close => return Ok(j + 1),
            b if b == open => {
                return Err(ParseError::new(j, format!("nested '{}'", open as char)));
            }
            _ => j += 1,
        }
    }
    Err(ParseError::new(i, format!("unclosed '{}'", open as char)))
}

struct Analyzer<'a> {
    src: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    selectors: Vec<Selector>,
}

/// Which `[...]` may follow an operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeRule {
    /// Vector selector: a range or a subquery
    Selector,
    /// Parenthesised or call result: a subquery only
    Subquery,
    /// Literals take no range
    Forbidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Paren {
    Group,
    Call,
}

impl<'a> Analyzer<'a> {
    fn text(&self, t: Token) -> &'a str {
        &self.src[t.start..t.end]
    }

    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn peek_is(&self, kind: Kind) -> bool {
        self.peek().map_or(false, |t| t.kind == kind)
    }

    fn peek_keyword(&self, words: &[&str]) -> bool {
        self.peek()
            .map_or(false, |t| t.kind == Kind::Ident && words.contains(&self.text(t)))
    }

    fn error_at(&self, t: Option<Token>, message: impl Into<String>) -> ParseError {
        ParseError::new(t.map_or(self.src.len(), |t| t.start), message)
    }

    /// Skip an optional `( label, ... )` list after a grouping keyword
    fn skip_label_list(&mut self, required: bool) -> Result<(), ParseError> {
        if !self.peek_is(Kind::LParen) {
            if required {
                return Err(self.error_at(self.peek(), "expected label list"));
            }
            return Ok(());
        }
        self.pos += 1;
        loop {
            match self.peek() {
                Some(t) if t.kind == Kind::RParen => {
                    self.pos += 1;
                    return Ok(());
                }
                Some(t) if t.kind == Kind::Ident || t.kind == Kind::Comma || t.kind == Kind::Str => {
                    self.pos += 1
                }
                other => return Err(self.error_at(other, "malformed label list")),
            }
        }
    }

    /// Skip `bool`, `on/ignoring (...)` and `group_left/right (...)` after a binary operator
    fn skip_binary_modifiers(&mut self) -> Result<(), ParseError> {
        if self.peek_keyword(&["bool"]) {
            self.pos += 1;
        }
        if self.peek_keyword(&["on", "ignoring"]) {
            self.pos += 1;
            self.skip_label_list(true)?;
        }
        if self.peek_keyword(&["group_left", "group_right"]) {
            self.pos += 1;
            self.skip_label_list(false)?;
        }
        Ok(())
    }

    /// Skip at most one `[...]` plus `offset <duration>` and `@ <time>` modifiers
    fn skip_postfix(&mut self, rule: RangeRule) -> Result<(), ParseError> {
        let mut ranged = false;
        let mut modified = false;
        loop {
            if let Some(t) = self.peek().filter(|t| t.kind == Kind::Range) {
                let subquery = self.text(t).contains(':');
                match rule {
                    RangeRule::Forbidden => {
                        return Err(self.error_at(Some(t), "range not allowed here"));
                    }
                    RangeRule::Subquery if !subquery => {
                        return Err(self.error_at(Some(t), "range only allowed on a vector selector"));
                    }
                    _ => {}
                }
                if ranged {
                    return Err(self.error_at(Some(t), "range already applied"));
                }
                if modified && !subquery {
                    return Err(self.error_at(Some(t), "range must precede offset and '@'"));
                }
                ranged = true;
                self.pos += 1;
            } else if self.peek_keyword(&["offset"]) {
                modified = true;
                self.pos += 1;
                if self
                    .peek()
                    .map_or(false, |t| t.kind == Kind::Op && self.text(t) == "-")
                {
                    self.pos += 1;
                }
                if !self.peek_is(Kind::Number) {
                    return Err(self.error_at(self.peek(), "expected duration after offset"));
                }
                self.pos += 1;
            } else if self.peek_is(Kind::At) {
                modified = true;
                self.pos += 1;
                match self.peek() {
                    Some(t) if t.kind == Kind::Number => self.pos += 1,
                    Some(t)
                        if t.kind == Kind::Ident
                            && matches!(self.text(t), "start" | "end") =>
                    {
                        self.pos += 1;
                        if !(self.peek_is(Kind::LParen)
                            && self
                                .tokens
                                .get(self.pos + 1)
                                .map_or(false, |t| t.kind == Kind::RParen))
                        {
                            return Err(self.error_at(self.peek(), "expected '()'"));
                        }
                        self.pos += 2;
                    }
                    other => return Err(self.error_at(other, "expected timestamp after '@'")),
                }
            } else {
                return Ok(());
            }
        }
    }

    fn run(&mut self) -> Result<(), ParseError> {
        if self.tokens.is_empty() {
            return Err(ParseError::new(0, "empty expression"));
        }

        let mut expect_operand = true;
        let mut parens: Vec<Paren> = Vec::new();

        while let Some(t) = self.peek() {
            self.pos += 1;
            match t.kind {
                Kind::Number | Kind::Str | Kind::Variable => {
                    if !expect_operand {
                        return Err(self.error_at(Some(t), "unexpected operand"));
                    }
                    expect_operand = false;
                    self.skip_postfix(RangeRule::Forbidden)?;
                }
                Kind::Braces => {
                    if !expect_operand {
                        return Err(self.error_at(Some(t), "unexpected selector"));
                    }
                    self.selectors.push(Selector {
                        name: None,
                        braces: Some((t.start, t.end)),
                    });
                    expect_operand = false;
                    self.skip_postfix(RangeRule::Selector)?;
                }
                Kind::Ident => {
                    let word = self.text(t);
                    if BINARY_KEYWORDS.contains(&word) {
                        if expect_operand {
                            return Err(self.error_at(Some(t), format!("unexpected '{}'", word)));
                        }
                        expect_operand = true;
                        self.skip_binary_modifiers()?;
                        continue;
                    }
                    if GROUPING.contains(&word) {
                        // trailing `sum(x) by (job)` form
                        if expect_operand {
                            return Err(self.error_at(Some(t), format!("unexpected '{}'", word)));
                        }
                        self.skip_label_list(true)?;
                        continue;
                    }
                    if !expect_operand {
                        return Err(self.error_at(Some(t), format!("unexpected '{}'", word)));
                    }
                    if word == "inf" || word == "nan" {
                        expect_operand = false;
                        continue;
                    }
                    if KEYWORDS.contains(&word) {
                        return Err(self.error_at(Some(t), format!("unexpected '{}'", word)));
                    }

                    if AGGREGATIONS.contains(&word) && self.peek_keyword(&["by", "without"]) {
                        self.pos += 1;
                        self.skip_label_list(true)?;
                        if !self.peek_is(Kind::LParen) {
                            return Err(self.error_at(self.peek(), "expected '(' after grouping"));
                        }
                    }

                    if self.peek_is(Kind::LParen) {
                        if !AGGREGATIONS.contains(&word) && !FUNCTIONS.contains(&word) {
                            return Err(self.error_at(Some(t), format!("unknown function '{}'", word)));
                        }
                        self.pos += 1;
                        parens.push(Paren::Call);
                        if self.peek_is(Kind::RParen) {
                            // zero-argument call such as time()
                            self.pos += 1;
                            parens.pop();
                            expect_operand = false;
                            self.after_close()?;
                        }
                        continue;
                    }

                    let braces = match self.peek() {
                        Some(b) if b.kind == Kind::Braces => {
                            self.pos += 1;
                            Some((b.start, b.end))
                        }
                        _ => None,
                    };
                    self.selectors.push(Selector {
                        name: Some((t.start, t.end)),
                        braces,
                    });
                    expect_operand = false;
                    self.skip_postfix(RangeRule::Selector)?;
                }
                Kind::LParen => {
                    if !expect_operand {
                        return Err(self.error_at(Some(t), "unexpected '('"));
                    }
                    parens.push(Paren::Group);
                }
                Kind::RParen => {
                    if expect_operand {
                        return Err(self.error_at(Some(t), "unexpected ')'"));
                    }
                    if parens.pop().is_none() {
                        return Err(self.error_at(Some(t), "unbalanced ')'"));
                    }
                    self.after_close()?;
                }
                Kind::Comma => {
                    if expect_operand || parens.last() != Some(&Paren::Call) {
                        return Err(self.error_at(Some(t), "unexpected ','"));
                    }
                    expect_operand = true;
                }
                Kind::Op => {
                    let op = self.text(t);
                    if expect_operand {
                        if op == "+" || op == "-" {
                            continue;
                        }
                        return Err(self.error_at(Some(t), format!("unexpected '{}'", op)));
                    }
                    expect_operand = true;
                    self.skip_binary_modifiers()?;
                }
                Kind::Range | Kind::At => {
                    return Err(self.error_at(Some(t), "unexpected modifier"));
                }
            }
        }

        if expect_operand {
            return Err(ParseError::new(self.src.len(), "unexpected end of expression"));
        }
        if !parens.is_empty() {
            return Err(ParseError::new(self.src.len(), "unclosed '('"));
        }
        Ok(())
    }

    /// After `)` a subquery range, offset or trailing grouping may follow
    fn after_close(&mut self) -> Result<(), ParseError> {
        self.skip_postfix(RangeRule::Subquery)
    }
}

fn analyze(expr: &str) -> Result<Vec<Selector>, ParseError> {
    let tokens = tokenize(expr)?;
    let mut analyzer = Analyzer {
        src: expr,
        tokens,
        pos: 0,
        selectors: Vec::new(),
    };
    analyzer.run()?;
    Ok(analyzer.selectors)
}

/// Extract `__name__` from a bare `{...}` selector body
fn name_from_matchers(body: &str) -> Option<String> {
    let rest = body.trim_start_matches('{').trim_end_matches('}');
    for part in rest.split(',') {
        let (key, value) = match part.split_once('=') {
            Some(kv) => kv,
            None => continue,
        };
        if key.trim() != "__name__" || value.starts_with('~') {
            continue;
        }
        let value = value.trim().trim_matches(|c| c == '"' || c == '\'' || c == '`');
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    None
}

/// Parse a PromQL expression and list the metric names it references
pub fn parse(expr: &str) -> Result<ParsedExpr, ParseError> {
    let selectors = analyze(expr)?;
    let mut metrics: Vec<String> = Vec::new();
    for selector in selectors {
        let name = match (selector.name, selector.braces) {
            (Some((s, e)), _) => Some(expr[s..e].to_string()),
            (None, Some((s, e))) => name_from_matchers(&expr[s..e]),
            (None, None) => None,
        };
        if let Some(name) = name {
            if !metrics.contains(&name) {
                metrics.push(name);
            }
        }
    }
    Ok(ParsedExpr { metrics })
}

/// Render `key=value` tags as a matcher list: `k1="v1",k2="v2"` with spaces stripped
pub fn matcher_list(event_tags: &[String]) -> String {
    split_tags(event_tags)
        .into_iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v))
        .collect::<Vec<_>>()
        .join(",")
        .replace(' ', "")
}

/// Inject label matchers into every selector of the expression
///
/// `m` becomes `m{L}`, `m{}` becomes `m{L}` and `m{X}` becomes `m{L,X}`.
pub fn inject_labels(expr: &str, event_tags: &[String]) -> Result<String, ParseError> {
    let selectors = analyze(expr)?;
    let matchers = matcher_list(event_tags);
    if matchers.is_empty() {
        return Ok(expr.to_string());
    }

    // (position, bytes to remove, insertion)
    let mut edits: Vec<(usize, usize, String)> = Vec::with_capacity(selectors.len());
    for selector in &selectors {
        match (selector.name, selector.braces) {
            (Some((_, name_end)), None) => {
                edits.push((name_end, 0, format!("{{{}}}", matchers)));
            }
            (_, Some((open, close))) => {
                let inner = &expr[open + 1..close - 1];
                if inner.trim().is_empty() {
                    edits.push((open, close - open, format!("{{{}}}", matchers)));
                } else {
                    edits.push((open + 1, 0, format!("{},", matchers)));
                }
            }
            (None, None) => {}
        }
    }

    let mut out = expr.to_string();
    edits.sort_by(|a, b| b.0.cmp(&a.0));
    for (pos, remove, insert) in edits {
        out.replace_range(pos..pos + remove, &insert);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(expr: &str) -> Vec<String> {
        parse(expr).unwrap().metrics
    }

    #[test]
    fn test_extract_simple() {
        assert_eq!(metrics("up == 0"), vec!["up"]);
        assert_eq!(
            metrics(r#"metric_name{label1="value1",label2="value2"}"#),
            vec!["metric_name"]
        );
        assert_eq!(metrics("cpu_usage + memory_usage > 10"), vec!["cpu_usage", "memory_usage"]);
    }

    #[test]
    fn test_extract_skips_functions_and_grouping() {
        assert_eq!(
            metrics("sum by (job, instance) (rate(http_requests_total{code=~\"5..\"}[5m])) > 1"),
            vec!["http_requests_total"]
        );
        assert_eq!(
            metrics("sum(rate(x[5m])) without (pod) / on (job) group_left (team) y"),
            vec!["x", "y"]
        );
        assert_eq!(metrics("rate(x[5m]) > 2 * rate(x[5m] offset 1d)"), vec!["x"]);
        assert_eq!(metrics("time() - node_boot_time_seconds > 60"), vec!["node_boot_time_seconds"]);
        assert_eq!(metrics(r#"{__name__="up", job="a"} == 0"#), vec!["up"]);
        assert_eq!(metrics("max_over_time(x[10m:1m]) @ end()"), vec!["x"]);
        assert_eq!(metrics("ns:requests:rate5m > 1e-3"), vec!["ns:requests:rate5m"]);
    }

    #[test]
    fn test_extract_with_template_variables() {
        assert_eq!(
            metrics(r#"mem{test1="$test1", test2="$test2"} > $val"#),
            vec!["mem"]
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("").is_err());
        assert!(parse("cpu_usage + ").is_err());
        assert!(parse("rate(x[5m]").is_err());
        assert!(parse("x{a=\"b\"").is_err());
        assert!(parse("x y").is_err());
        assert!(parse("sum(x,)").is_err());
        assert!(parse("x > > 1").is_err());
        assert!(parse("x)").is_err());
    }

    #[test]
    fn test_unknown_function_rejected() {
        let err = parse("nonexistent_fn(up)").unwrap_err();
        assert!(err.to_string().contains("nonexistent_fn"), "{}", err);
        assert!(parse("sum by (job) (rate(x[5m]))").is_ok());
        assert!(parse(r#"label_replace(up, "a", "$1", "b", "(.*)")"#).is_ok());
        assert!(parse("histogram_quantile(0.9, sum by (le) (rate(h_bucket[5m])))").is_ok());
    }

    #[test]
    fn test_range_placement() {
        assert!(parse("up[5m][1m]").is_err());
        assert!(parse("up[5m:1m][1m]").is_err());
        assert!(parse("(up)[5m]").is_err());
        assert!(parse("up offset 1h [5m]").is_err());
        assert!(parse("1[5m]").is_err());
        assert_eq!(metrics("max_over_time(rate(x[5m])[30m:1m])"), vec!["x"]);
        assert_eq!(metrics("x[5m:1m]"), vec!["x"]);
        assert_eq!(metrics("rate(x[5m] offset 1h)"), vec!["x"]);
    }

    #[test]
    fn test_unary_and_bool() {
        assert_eq!(metrics("-x > bool 0"), vec!["x"]);
        assert_eq!(metrics("x > 0 and on (job) y > 0"), vec!["x", "y"]);
    }

    #[test]
    fn test_inject_unlabeled() {
        let out = inject_labels("cpu_usage + memory_usage > 10", &["cluster=c1".to_string()]).unwrap();
        assert_eq!(out, r#"cpu_usage{cluster="c1"} + memory_usage{cluster="c1"} > 10"#);
    }

    #[test]
    fn test_inject_existing_matchers() {
        let tags = vec!["cluster=c1".to_string(), "env = prod".to_string()];
        assert_eq!(
            inject_labels(r#"up{job="a"} == 0"#, &tags).unwrap(),
            r#"up{cluster="c1",env="prod",job="a"} == 0"#
        );
        assert_eq!(
            inject_labels("up{} == 0", &tags).unwrap(),
            r#"up{cluster="c1",env="prod"} == 0"#
        );
        assert_eq!(
            inject_labels("rate(x[5m]) > 2 * rate(x[5m] offset 1d)", &tags[..1]).unwrap(),
            r#"rate(x{cluster="c1"}[5m]) > 2 * rate(x{cluster="c1"}[5m] offset 1d)"#
        );
    }

    #[test]
    fn test_inject_nothing() {
        assert_eq!(inject_labels("up == 0", &[]).unwrap(), "up == 0");
    }
}
