//! Search query language: tokenizer, parser and planner inputs.
//!
//! Queries are a linear stream of words, quoted phrases and `name:value`
//! operators. Free text plus `from:`/`subject:`/`body:` terms compile into an
//! FTS5 expression; everything else becomes row predicates applied outside
//! the FTS match. An unrecognized `name:value` is kept as a literal word so
//! such text can be searched for verbatim.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

static RELATIVE_DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)([dwm])$").unwrap());

/// Parsed search query with structured constraints.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SearchQuery {
    /// Free text terms matched against subject, body and sender columns.
    pub text_terms: Vec<String>,

    pub from_addrs: Vec<String>,
    pub to_addrs: Vec<String>,
    pub subject_terms: Vec<String>,
    pub body_terms: Vec<String>,

    pub has_attachment: Option<bool>,
    pub is_read: Option<bool>,
    pub is_unread: Option<bool>,
    pub is_flagged: Option<bool>,

    pub after_date: Option<DateTime<Utc>>,
    pub before_date: Option<DateTime<Utc>>,
    pub on_date: Option<DateTime<Utc>>,

    pub original_query: String,
}

impl SearchQuery {
    pub fn is_empty(&self) -> bool {
        self.text_terms.is_empty()
            && self.from_addrs.is_empty()
            && self.to_addrs.is_empty()
            && self.subject_terms.is_empty()
            && self.body_terms.is_empty()
            && self.has_attachment.is_none()
            && self.is_read.is_none()
            && self.is_unread.is_none()
            && self.is_flagged.is_none()
            && self.after_date.is_none()
            && self.before_date.is_none()
            && self.on_date.is_none()
    }
}

/// Row-level predicate applied outside the FTS expression.
#[derive(Clone, Debug, PartialEq)]
pub enum RowPredicate {
    /// Substring match against the serialized recipient list.
    ToContains(String),
    HasAttachment(bool),
    IsRead(bool),
    IsFlagged(bool),
    /// `date >= ts` (inclusive).
    After(i64),
    /// `date < ts` (strict).
    Before(i64),
    /// Half-open day interval `[start, end)`.
    OnDay(i64, i64),
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
    Operator { name: &'static str, value: String },
}

fn canonical_operator(name: &str) -> Option<&'static str> {
    match name {
        "from" | "f" => Some("from"),
        "to" | "t" => Some("to"),
        "subject" | "subj" | "s" => Some("subject"),
        "body" | "b" => Some("body"),
        "has" => Some("has"),
        "is" => Some("is"),
        "after" | "since" => Some("after"),
        "before" | "until" => Some("before"),
        "date" | "on" => Some("date"),
        _ => None,
    }
}

fn tokenize(query: &str) -> Vec<Token> {
    let chars: Vec<char> = query.chars().collect();
    let len = chars.len();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < len {
        while pos < len && chars[pos].is_whitespace() {
            pos += 1;
        }
        if pos >= len {
            break;
        }

        // Standalone quoted phrase.
        if chars[pos] == '"' {
            let start = pos + 1;
            let end = find_char(&chars, start, '"');
            let value: String = match end {
                Some(end) => {
                    let v = chars[start..end].iter().collect();
                    pos = end + 1;
                    v
                }
                None => {
                    let v = chars[start..].iter().collect();
                    pos = len;
                    v
                }
            };
            tokens.push(Token::Quoted(value));
            continue;
        }

        // Read up to ':' or whitespace.
        let start = pos;
        while pos < len && chars[pos] != ':' && !chars[pos].is_whitespace() {
            pos += 1;
        }

        if pos < len && chars[pos] == ':' {
            let raw_name: String = chars[start..pos].iter().collect();
            pos += 1;

            if let Some(name) = canonical_operator(&raw_name.to_lowercase()) {
                let value = if pos < len && chars[pos] == '"' {
                    let vstart = pos + 1;
                    match find_char(&chars, vstart, '"') {
                        Some(end) => {
                            let v = chars[vstart..end].iter().collect();
                            pos = end + 1;
                            v
                        }
                        None => {
                            let v = chars[vstart..].iter().collect();
                            pos = len;
                            v
                        }
                    }
                } else {
                    let vstart = pos;
                    while pos < len && !chars[pos].is_whitespace() {
                        pos += 1;
                    }
                    chars[vstart..pos].iter().collect()
                };
                tokens.push(Token::Operator { name, value });
            } else {
                // Not a known operator: keep the whole token (colon included)
                // as a literal word.
                while pos < len && !chars[pos].is_whitespace() {
                    pos += 1;
                }
                tokens.push(Token::Word(chars[start..pos].iter().collect()));
            }
        } else {
            tokens.push(Token::Word(chars[start..pos].iter().collect()));
        }
    }

    tokens
}

fn find_char(chars: &[char], from: usize, needle: char) -> Option<usize> {
    chars[from..].iter().position(|&c| c == needle).map(|i| from + i)
}

/// Parse a date value in any of the accepted formats, relative to `now`.
pub fn parse_date_at(raw: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    use chrono::Datelike;

    let raw = raw.trim().to_lowercase();

    let midnight = |dt: DateTime<Utc>| {
        Utc.with_ymd_and_hms(dt.year(), dt.month(), dt.day(), 0, 0, 0)
            .single()
    };

    if raw == "today" {
        return midnight(now);
    }
    if raw == "yesterday" {
        return midnight(now - Duration::days(1));
    }

    if let Some(caps) = RELATIVE_DATE.captures(&raw) {
        let num: i64 = caps[1].parse().ok()?;
        return match &caps[2] {
            "d" => Some(now - Duration::days(num)),
            "w" => Some(now - Duration::weeks(num)),
            // Months are approximated as 30 days.
            "m" => Some(now - Duration::days(num * 30)),
            _ => None,
        };
    }

    const FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d-%m-%Y", "%d/%m/%Y", "%Y%m%d"];
    for format in FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(&raw, format) {
            return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
        }
    }
    None
}

pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    parse_date_at(raw, Utc::now())
}

/// Parse a raw query string into a [`SearchQuery`].
pub fn parse_query(query: &str) -> SearchQuery {
    parse_query_at(query, Utc::now())
}

pub fn parse_query_at(query: &str, now: DateTime<Utc>) -> SearchQuery {
    let mut result = SearchQuery {
        original_query: query.to_string(),
        ..SearchQuery::default()
    };

    for token in tokenize(query) {
        match token {
            Token::Word(value) | Token::Quoted(value) => {
                if !value.is_empty() {
                    result.text_terms.push(value);
                }
            }
            Token::Operator { name, value } => match name {
                "from" => result.from_addrs.push(value),
                "to" => result.to_addrs.push(value),
                "subject" => result.subject_terms.push(value),
                "body" => result.body_terms.push(value),
                "has" => {
                    if matches!(value.to_lowercase().as_str(), "attachment" | "attachments" | "attach") {
                        result.has_attachment = Some(true);
                    }
                }
                "is" => match value.to_lowercase().as_str() {
                    "unread" => {
                        result.is_unread = Some(true);
                        result.is_read = Some(false);
                    }
                    "read" => {
                        result.is_read = Some(true);
                        result.is_unread = Some(false);
                    }
                    "flagged" | "starred" | "important" => result.is_flagged = Some(true),
                    "unflagged" => result.is_flagged = Some(false),
                    _ => {}
                },
                "after" => result.after_date = parse_date_at(&value, now),
                "before" => result.before_date = parse_date_at(&value, now),
                "date" => result.on_date = parse_date_at(&value, now),
                _ => unreachable!(),
            },
        }
    }

    result
}

fn fts_quote(term: &str) -> String {
    format!("\"{}\"", term.replace('"', "\"\""))
}

/// Build the FTS5 MATCH expression for the text-bearing parts of a query.
/// Returns `None` when the query has no text constraints, in which case the
/// planner falls through to a predicate-only scan.
pub fn build_fts_query(query: &SearchQuery) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();

    for term in &query.text_terms {
        parts.push(fts_quote(term));
    }
    for addr in &query.from_addrs {
        let quoted = fts_quote(addr);
        parts.push(format!("from_addr:{quoted} OR from_name:{quoted}"));
    }
    for term in &query.subject_terms {
        parts.push(format!("subject:{}", fts_quote(term)));
    }
    for term in &query.body_terms {
        parts.push(format!("body_text:{}", fts_quote(term)));
    }

    match parts.len() {
        0 => None,
        1 => Some(parts.remove(0)),
        _ => Some(
            parts
                .iter()
                .map(|p| format!("({p})"))
                .collect::<Vec<_>>()
                .join(" AND "),
        ),
    }
}

/// Compile the non-FTS constraints into row predicates.
pub fn row_predicates(query: &SearchQuery) -> Vec<RowPredicate> {
    let mut predicates = Vec::new();

    for addr in &query.to_addrs {
        predicates.push(RowPredicate::ToContains(addr.clone()));
    }
    if let Some(has) = query.has_attachment {
        predicates.push(RowPredicate::HasAttachment(has));
    }
    if query.is_read == Some(true) {
        predicates.push(RowPredicate::IsRead(true));
    } else if query.is_unread == Some(true) {
        predicates.push(RowPredicate::IsRead(false));
    }
    if let Some(flagged) = query.is_flagged {
        predicates.push(RowPredicate::IsFlagged(flagged));
    }
    if let Some(after) = query.after_date {
        predicates.push(RowPredicate::After(after.timestamp()));
    }
    if let Some(before) = query.before_date {
        predicates.push(RowPredicate::Before(before.timestamp()));
    }
    if let Some(on) = query.on_date {
        let start = on.date_naive().and_hms_opt(0, 0, 0).unwrap();
        let start_ts = Utc.from_utc_datetime(&start).timestamp();
        predicates.push(RowPredicate::OnDay(start_ts, start_ts + 86_400));
    }

    predicates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_words_phrases_and_operators() {
        let tokens = tokenize(r#"hello "big news" from:alice subject:"meeting notes""#);
        assert_eq!(
            tokens,
            vec![
                Token::Word("hello".into()),
                Token::Quoted("big news".into()),
                Token::Operator { name: "from", value: "alice".into() },
                Token::Operator { name: "subject", value: "meeting notes".into() },
            ]
        );
    }

    #[test]
    fn unknown_operator_stays_literal() {
        let query = parse_query("weird:thing hello");
        assert_eq!(query.text_terms, vec!["weird:thing", "hello"]);
        assert!(query.from_addrs.is_empty());
    }

    #[test]
    fn aliases_resolve_to_canonical_operators() {
        let query = parse_query("f:alice t:bob s:report b:numbers since:2025-01-01 until:2025-02-01");
        assert_eq!(query.from_addrs, vec!["alice"]);
        assert_eq!(query.to_addrs, vec!["bob"]);
        assert_eq!(query.subject_terms, vec!["report"]);
        assert_eq!(query.body_terms, vec!["numbers"]);
        assert!(query.after_date.is_some());
        assert!(query.before_date.is_some());
    }

    #[test]
    fn spec_compilation_example() {
        let query = parse_query("from:alice has:attachment after:2025-01-01");
        assert_eq!(query.from_addrs, vec!["alice"]);
        assert_eq!(query.has_attachment, Some(true));
        assert_eq!(
            query.after_date,
            Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap())
        );
        assert!(query.text_terms.is_empty());
    }

    #[test]
    fn blank_query_is_empty() {
        assert!(parse_query("   ").is_empty());
        assert!(!parse_query("hello").is_empty());
        assert!(!parse_query("is:unread").is_empty());
    }

    #[test]
    fn is_operator_variants() {
        let q = parse_query("is:unread");
        assert_eq!(q.is_unread, Some(true));
        assert_eq!(q.is_read, Some(false));

        let q = parse_query("is:starred");
        assert_eq!(q.is_flagged, Some(true));

        let q = parse_query("is:unflagged");
        assert_eq!(q.is_flagged, Some(false));
    }

    #[test]
    fn date_formats_parse() {
        let now = Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap();
        for raw in ["2025-01-02", "2025/01/02", "01/02/2025", "02-01-2025", "02/01/2025", "20250102"] {
            let parsed = parse_date_at(raw, now).unwrap();
            assert_eq!(parsed, Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap(), "format {raw}");
        }

        assert_eq!(
            parse_date_at("today", now).unwrap(),
            Utc.with_ymd_and_hms(2025, 6, 15, 0, 0, 0).unwrap()
        );
        assert_eq!(
            parse_date_at("yesterday", now).unwrap(),
            Utc.with_ymd_and_hms(2025, 6, 14, 0, 0, 0).unwrap()
        );
        assert_eq!(parse_date_at("7d", now).unwrap(), now - Duration::days(7));
        assert_eq!(parse_date_at("2w", now).unwrap(), now - Duration::weeks(2));
        assert_eq!(parse_date_at("1m", now).unwrap(), now - Duration::days(30));
        assert!(parse_date_at("not-a-date", now).is_none());
    }

    #[test]
    fn fts_expression_covers_text_columns() {
        let query = parse_query("from:alice quarterly");
        let fts = build_fts_query(&query).unwrap();
        assert!(fts.contains("\"quarterly\""));
        assert!(fts.contains("from_addr:\"alice\" OR from_name:\"alice\""));
        assert!(fts.contains(" AND "));
    }

    #[test]
    fn predicate_only_query_has_no_fts() {
        let query = parse_query("is:unread has:attachment");
        assert!(build_fts_query(&query).is_none());
        let predicates = row_predicates(&query);
        assert!(predicates.contains(&RowPredicate::HasAttachment(true)));
        assert!(predicates.contains(&RowPredicate::IsRead(false)));
    }

    #[test]
    fn on_date_expands_to_day_interval() {
        let query = parse_query("date:2025-03-10");
        let predicates = row_predicates(&query);
        let expected_start = Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap().timestamp();
        assert!(predicates.contains(&RowPredicate::OnDay(expected_start, expected_start + 86_400)));
    }

    #[test]
    fn quotes_are_escaped_for_fts() {
        let query = SearchQuery {
            subject_terms: vec![r#"say "hi""#.into()],
            ..SearchQuery::default()
        };
        let fts = build_fts_query(&query).unwrap();
        assert_eq!(fts, r#"subject:"say ""hi""""#);
    }
}
