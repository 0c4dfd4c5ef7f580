//! Policy condition grammar.
//!
//! ```text
//! expr      := primitive ( " OR " primitive )*
//! primitive := "payload" ws+ "LIKE" ws+ quoted
//! quoted    := "'" ( any char except "'" | "''" )* "'"
//! ```
//!
//! `%` matches any run of characters, `_` exactly one. Matching is anchored on
//! the whole compact-JSON payload and case-insensitive. There is no AND, NOT,
//! grouping or field selection; anything outside the grammar is a parse error
//! and evaluates to no match.

use regex::Regex;
use serde_json::Value;
use tracing::warn;

use overwatch_store::EventRow;

const FIELD: &str = "payload";
const LIKE: &str = "LIKE";
const OR: &str = " OR ";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConditionError {
    #[error("empty condition")]
    Empty,
    #[error("unknown field at offset {0}; only `payload` is supported")]
    UnknownField(usize),
    #[error("expected whitespace at offset {0}")]
    ExpectedWhitespace(usize),
    #[error("expected LIKE at offset {0}")]
    ExpectedLike(usize),
    #[error("expected quoted pattern at offset {0}")]
    ExpectedQuote(usize),
    #[error("unterminated pattern starting at offset {0}")]
    UnterminatedQuote(usize),
    #[error("unexpected input at offset {0}")]
    TrailingInput(usize),
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),
}

/// A compiled LIKE pattern.
#[derive(Debug, Clone)]
pub struct LikePattern {
    source: String,
    regex: Regex,
}

impl LikePattern {
    pub fn compile(pattern: &str) -> Result<Self, ConditionError> {
        let mut re = String::with_capacity(pattern.len() + 8);
        re.push_str("(?is)^");
        let mut buf = [0u8; 4];
        for c in pattern.chars() {
            match c {
                '%' => re.push_str(".*"),
                '_' => re.push('.'),
                other => re.push_str(&regex::escape(other.encode_utf8(&mut buf))),
            }
        }
        re.push('$');

        let regex = Regex::new(&re).map_err(|e| ConditionError::InvalidPattern(e.to_string()))?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, subject: &str) -> bool {
        self.regex.is_match(subject)
    }
}

impl PartialEq for LikePattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Like(LikePattern),
    Or(Box<Condition>, Box<Condition>),
}

impl Condition {
    /// Parse a condition expression. Surrounding whitespace is ignored.
    pub fn parse(expr: &str) -> Result<Self, ConditionError> {
        let src = expr.trim();
        if src.is_empty() {
            return Err(ConditionError::Empty);
        }
        let mut parser = Parser { src, pos: 0 };
        let mut node = parser.primitive()?;
        while !parser.at_end() {
            if !parser.eat(OR) {
                return Err(ConditionError::TrailingInput(parser.pos));
            }
            let rhs = parser.primitive()?;
            node = Condition::Or(Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    /// Left-to-right, short-circuiting.
    pub fn matches(&self, subject: &str) -> bool {
        match self {
            Condition::Like(p) => p.is_match(subject),
            Condition::Or(lhs, rhs) => lhs.matches(subject) || rhs.matches(subject),
        }
    }

    /// Patterns in evaluation order.
    pub fn patterns(&self) -> Vec<&str> {
        match self {
            Condition::Like(p) => vec![p.source()],
            Condition::Or(lhs, rhs) => {
                let mut out = lhs.patterns();
                out.extend(rhs.patterns());
                out
            }
        }
    }
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl Parser<'_> {
    fn rest(&self) -> &str {
        &self.src[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn eat(&mut self, literal: &str) -> bool {
        if self.rest().starts_with(literal) {
            self.pos += literal.len();
            true
        } else {
            false
        }
    }

    fn whitespace(&mut self) -> Result<(), ConditionError> {
        let skipped = self
            .rest()
            .char_indices()
            .find(|(_, c)| *c != ' ' && *c != '\t')
            .map(|(i, _)| i)
            .unwrap_or(self.rest().len());
        if skipped == 0 {
            return Err(ConditionError::ExpectedWhitespace(self.pos));
        }
        self.pos += skipped;
        Ok(())
    }

    fn primitive(&mut self) -> Result<Condition, ConditionError> {
        if !self.eat(FIELD) {
            return Err(ConditionError::UnknownField(self.pos));
        }
        self.whitespace()?;
        if !self.eat(LIKE) {
            return Err(ConditionError::ExpectedLike(self.pos));
        }
        self.whitespace()?;
        let pattern = self.quoted()?;
        Ok(Condition::Like(LikePattern::compile(&pattern)?))
    }

    fn quoted(&mut self) -> Result<String, ConditionError> {
        let start = self.pos;
        if !self.eat("'") {
            return Err(ConditionError::ExpectedQuote(start));
        }
        let mut out = String::new();
        let mut chars = self.rest().char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if c == '\'' {
                if let Some((_, '\'')) = chars.peek() {
                    out.push('\'');
                    chars.next();
                    continue;
                }
                self.pos += i + 1;
                return Ok(out);
            }
            out.push(c);
        }
        Err(ConditionError::UnterminatedQuote(start))
    }
}

/// The string conditions are matched against: compact JSON.
pub fn serialize_payload(payload: &Value) -> String {
    payload.to_string()
}

/// Evaluate a condition against an event. Never fails: malformed conditions
/// are logged and treated as no match.
pub fn evaluate(expr: &str, event: &EventRow) -> bool {
    match Condition::parse(expr) {
        Ok(condition) => condition.matches(&serialize_payload(&event.payload)),
        Err(e) => {
            warn!(condition = expr, error = %e, event_id = %event.id, "malformed policy condition, treating as no match");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overwatch_core::ids::{EventId, SessionId};
    use serde_json::json;

    fn event(payload: Value) -> EventRow {
        EventRow {
            id: EventId::new(),
            session_id: SessionId::from_raw("s"),
            timestamp: overwatch_core::timestamp_now(),
            event_type: "command".into(),
            level: None,
            payload,
            tags: vec![],
        }
    }

    #[test]
    fn substring_match_is_case_insensitive() {
        let e = event(json!({"code": "import Workers-AI"}));
        assert!(evaluate("payload LIKE '%workers-ai%'", &e));
        assert!(!evaluate("payload LIKE '%foo-bar%'", &e));
    }

    #[test]
    fn match_is_anchored() {
        let e = event(json!({"a": 1}));
        assert!(evaluate(r#"payload LIKE '{"a":1}'"#, &e));
        assert!(!evaluate("payload LIKE 'a'", &e));
        assert!(evaluate("payload LIKE '{%'", &e));
        assert!(!evaluate("payload LIKE 'x%'", &e));
    }

    #[test]
    fn underscore_matches_exactly_one_char() {
        let e = event(json!("cat"));
        assert!(evaluate("payload LIKE '\"c_t\"'", &e));
        assert!(!evaluate("payload LIKE '\"c_\"'", &e));
        assert!(!evaluate("payload LIKE '\"c__t\"'", &e));
        let wide = event(json!("cüt"));
        assert!(evaluate("payload LIKE '\"c_t\"'", &wide));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let e = event(json!({"cmd": "rm -rf ./*"}));
        assert!(evaluate("payload LIKE '%./*%'", &e));
        assert!(!evaluate("payload LIKE '%.+%'", &e));
    }

    #[test]
    fn doubled_quote_is_literal_quote() {
        let e = event(json!({"msg": "don't"}));
        assert!(evaluate("payload LIKE '%don''t%'", &e));
        let parsed = Condition::parse("payload LIKE 'it''s'").unwrap();
        assert_eq!(parsed.patterns(), vec!["it's"]);
    }

    #[test]
    fn or_is_left_to_right() {
        let c = Condition::parse("payload LIKE '%a%' OR payload LIKE '%b%' OR payload LIKE '%c%'").unwrap();
        assert_eq!(c.patterns(), vec!["%a%", "%b%", "%c%"]);
        assert!(matches!(&c, Condition::Or(lhs, _) if matches!(**lhs, Condition::Or(_, _))));
        assert!(c.matches("xxcxx"));
        assert!(!c.matches("xyz"));
    }

    #[test]
    fn or_equals_disjunction_of_parts() {
        let payloads = [json!("alpha"), json!("beta"), json!("gamma"), json!({"k": "alphabet"})];
        let a = "payload LIKE '%alpha%'";
        let b = "payload LIKE '%beta%'";
        let both = format!("{a} OR {b}");
        for p in payloads {
            let e = event(p);
            assert_eq!(evaluate(&both, &e), evaluate(a, &e) || evaluate(b, &e));
        }
    }

    #[test]
    fn flexible_whitespace_inside_primitive() {
        assert!(Condition::parse("payload   LIKE\t'%x%'").is_ok());
        assert!(Condition::parse("  payload LIKE '%x%'  ").is_ok());
    }

    #[test]
    fn malformed_conditions_never_match() {
        let e = event(json!({"code": "anything at all"}));
        let malformed = [
            "",
            "   ",
            "payload LIKE %x%",
            "payload LIKE '%x%",
            "payload like '%x%'",
            "code LIKE '%x%'",
            "payload = '%x%'",
            "payloadLIKE '%%'",
            "payload LIKE'%%'",
            "payload LIKE '%%' AND payload LIKE '%%'",
            "NOT payload LIKE '%%'",
            "(payload LIKE '%%')",
            "payload LIKE '%%' or payload LIKE '%%'",
            "payload LIKE '%%'  OR payload LIKE '%%'",
            "payload LIKE '%%' OR",
            "payload LIKE '%%' trailing",
        ];
        for expr in malformed {
            assert!(Condition::parse(expr).is_err(), "should reject {expr:?}");
            assert!(!evaluate(expr, &e), "should not match {expr:?}");
        }
    }

    #[test]
    fn error_offsets() {
        assert_eq!(Condition::parse(""), Err(ConditionError::Empty));
        assert_eq!(Condition::parse("code LIKE 'x'"), Err(ConditionError::UnknownField(0)));
        assert_eq!(Condition::parse("payload LIKE 'x"), Err(ConditionError::UnterminatedQuote(13)));
        assert_eq!(Condition::parse("payload LIKE 'x' y"), Err(ConditionError::TrailingInput(16)));
    }
}
