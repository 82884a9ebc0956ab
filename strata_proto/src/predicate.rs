//! Predicate expressions selecting streams.
//!
//! The grammar is small, and reads like a restricted XPath:
//!
//! ```text
//! expr    := or
//! or      := and ("or" and)*
//! and     := unary ("and" unary)*
//! unary   := "not" unary | "(" expr ")" | call | compare
//! compare := operand ("=" | "!=" | "<" | ">" | "<=" | ">=") operand
//! call    := ("starts-with" | "contains") "(" operand "," operand ")"
//! operand := path | 'text' | "text" | number | "count" "(" path ")"
//! path    := ident ("/" ident)*
//! ```
//!
//! Single-segment paths name core fields (`name`, `type`, `channel_count`, ...). Paths
//! starting with `desc/` walk the metadata tree, taking the first matching node at each
//! level. A path that designates nothing makes every comparison it takes part in false.
//!
//! Comparisons are numeric when both sides read as numbers, and lexical otherwise.
//!
//! Expressions are parsed once, on the querying side, then sent over the network as a
//! syntax tree and evaluated by each outlet against its full descriptor.

use crate::info::StreamInfo;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    /// A core field or a `desc/...` metadata path.
    Path(String),
    Text(String),
    Number(f64),
    /// The number of nodes designated by a path.
    Count(String),
}

/// A boolean expression over a stream descriptor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare(Operand, CmpOp, Operand),
    StartsWith(Operand, Operand),
    Contains(Operand, Operand),
    /// Exact text equality of a field or metadata path, with no numeric reading.
    Is(String, String),
}

/// The value of an operand, once evaluated against a descriptor.
enum Value {
    Text(String),
    Number(f64),
}

impl Value {
    fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(t) => t.trim().parse().ok(),
        }
    }

    fn into_text(self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::Text(t) => t,
        }
    }
}

impl Operand {
    fn eval(&self, info: &StreamInfo) -> Option<Value> {
        match self {
            Self::Path(p) => info.field(p).map(Value::Text),
            Self::Text(t) => Some(Value::Text(t.clone())),
            Self::Number(n) => Some(Value::Number(*n)),
            Self::Count(p) => Some(Value::Number(info.count(p) as f64)),
        }
    }
}

impl CmpOp {
    fn holds(self, ord: core::cmp::Ordering) -> bool {
        use core::cmp::Ordering::*;

        match self {
            Self::Eq => ord == Equal,
            Self::Ne => ord != Equal,
            Self::Lt => ord == Less,
            Self::Gt => ord == Greater,
            Self::Le => ord != Greater,
            Self::Ge => ord != Less,
        }
    }
}

impl Expr {
    /// Parses an expression, failing with the byte position of the first error.
    pub fn parse(src: &str) -> Result<Expr, crate::Error> {
        let mut parser = Parser {
            tokens: tokenize(src)?,
            pos: 0,
            src_len: src.len(),
        };

        let expr = parser.expr()?;

        match parser.peek() {
            None => Ok(expr),
            Some((at, tok)) => Err(crate::Error::Predicate {
                position: *at,
                message: format!("unexpected {tok}"),
            }),
        }
    }

    /// Builds an expression testing a core field for exact equality with `value`.
    ///
    /// Fails if `property` does not name a core field.
    pub fn property(property: &str, value: &str) -> Result<Expr, crate::Error> {
        if !crate::info::CORE_FIELDS.contains(&property) {
            return Err(crate::Error::UnknownProperty(property.to_owned()));
        }

        Ok(Expr::Is(property.to_owned(), value.to_owned()))
    }

    /// Combines two expressions with a conjunction.
    pub fn and(self, other: Expr) -> Expr {
        Expr::And(Box::new(self), Box::new(other))
    }

    /// Evaluates this expression against a descriptor.
    pub fn eval(&self, info: &StreamInfo) -> bool {
        match self {
            Self::And(a, b) => a.eval(info) && b.eval(info),
            Self::Or(a, b) => a.eval(info) || b.eval(info),
            Self::Not(a) => !a.eval(info),
            Self::Compare(l, op, r) => {
                let (Some(l), Some(r)) = (l.eval(info), r.eval(info)) else {
                    return false;
                };

                match (l.as_number(), r.as_number()) {
                    (Some(l), Some(r)) => l.partial_cmp(&r).is_some_and(|o| op.holds(o)),
                    _ => op.holds(l.into_text().cmp(&r.into_text())),
                }
            }
            Self::StartsWith(l, r) => match (l.eval(info), r.eval(info)) {
                (Some(l), Some(r)) => l.into_text().starts_with(&r.into_text()),
                _ => false,
            },
            Self::Contains(l, r) => match (l.eval(info), r.eval(info)) {
                (Some(l), Some(r)) => l.into_text().contains(&r.into_text()),
                _ => false,
            },
            Self::Is(path, value) => info.field(path).is_some_and(|v| v == *value),
        }
    }
}

impl core::str::FromStr for Expr {
    type Err = crate::Error;

    #[inline(always)]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Text(String),
    Number(f64),
    Op(CmpOp),
    Slash,
    Comma,
    Open,
    Close,
}

impl core::fmt::Display for Token {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Ident(s) => write!(f, "`{s}`"),
            Self::Text(s) => write!(f, "string '{s}'"),
            Self::Number(n) => write!(f, "number {n}"),
            Self::Op(op) => write!(f, "operator {op:?}"),
            Self::Slash => f.write_str("`/`"),
            Self::Comma => f.write_str("`,`"),
            Self::Open => f.write_str("`(`"),
            Self::Close => f.write_str("`)`"),
        }
    }
}

fn tokenize(src: &str) -> Result<Vec<(usize, Token)>, crate::Error> {
    let err = |position: usize, message: &str| crate::Error::Predicate {
        position,
        message: message.to_owned(),
    };

    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let start = i;
        let c = bytes[i];

        let tok = match c {
            b' ' | b'\t' | b'\n' | b'\r' => {
                i += 1;
                continue;
            }
            b'/' => {
                i += 1;
                Token::Slash
            }
            b',' => {
                i += 1;
                Token::Comma
            }
            b'(' => {
                i += 1;
                Token::Open
            }
            b')' => {
                i += 1;
                Token::Close
            }
            b'=' => {
                i += 1;
                Token::Op(CmpOp::Eq)
            }
            b'!' if bytes.get(i + 1) == Some(&b'=') => {
                i += 2;
                Token::Op(CmpOp::Ne)
            }
            b'<' | b'>' => {
                let or_equal = bytes.get(i + 1) == Some(&b'=');
                i += 1 + usize::from(or_equal);
                Token::Op(match (c, or_equal) {
                    (b'<', false) => CmpOp::Lt,
                    (b'<', true) => CmpOp::Le,
                    (_, false) => CmpOp::Gt,
                    (_, true) => CmpOp::Ge,
                })
            }
            b'\'' | b'"' => {
                let end = src[i + 1..]
                    .find(c as char)
                    .ok_or_else(|| err(start, "unterminated string"))?;
                let text = src[i + 1..i + 1 + end].to_owned();
                i += end + 2;
                Token::Text(text)
            }
            b'0'..=b'9' | b'-' | b'.' => {
                i += 1;
                while i < bytes.len()
                    && (bytes[i].is_ascii_digit()
                        || matches!(bytes[i], b'.' | b'e' | b'E')
                        || (matches!(bytes[i], b'+' | b'-')
                            && matches!(bytes[i - 1], b'e' | b'E')))
                {
                    i += 1;
                }
                let n = src[start..i]
                    .parse()
                    .map_err(|_| err(start, "malformed number"))?;
                Token::Number(n)
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || matches!(bytes[i], b'_' | b'-' | b'.'))
                {
                    i += 1;
                }
                Token::Ident(src[start..i].to_owned())
            }
            _ => return Err(err(start, "unexpected character")),
        };

        tokens.push((start, tok));
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    src_len: usize,
}

impl Parser {
    fn peek(&self) -> Option<&(usize, Token)> {
        self.tokens.get(self.pos)
    }

    fn peek_ident(&self, word: &str) -> bool {
        matches!(self.peek(), Some((_, Token::Ident(s))) if s == word)
    }

    fn position(&self) -> usize {
        self.peek().map(|(at, _)| *at).unwrap_or(self.src_len)
    }

    fn error<T>(&self, message: impl Into<String>) -> Result<T, crate::Error> {
        Err(crate::Error::Predicate {
            position: self.position(),
            message: message.into(),
        })
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += usize::from(tok.is_some());
        tok
    }

    fn expect(&mut self, expected: Token) -> Result<(), crate::Error> {
        match self.peek() {
            Some((_, tok)) if *tok == expected => {
                self.pos += 1;
                Ok(())
            }
            Some((_, tok)) => {
                let found = tok.to_string();
                self.error(format!("expected {expected}, found {found}"))
            }
            None => self.error(format!("expected {expected}, found end of input")),
        }
    }

    fn expr(&mut self) -> Result<Expr, crate::Error> {
        let mut lhs = self.and()?;

        while self.peek_ident("or") {
            self.pos += 1;
            lhs = Expr::Or(Box::new(lhs), Box::new(self.and()?));
        }

        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, crate::Error> {
        let mut lhs = self.unary()?;

        while self.peek_ident("and") {
            self.pos += 1;
            lhs = Expr::And(Box::new(lhs), Box::new(self.unary()?));
        }

        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, crate::Error> {
        if self.peek_ident("not") && !self.is_comparison_at(1) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }

        if matches!(self.peek(), Some((_, Token::Open))) {
            self.pos += 1;
            let inner = self.expr()?;
            self.expect(Token::Close)?;
            return Ok(inner);
        }

        for (word, build) in [
            ("starts-with", Expr::StartsWith as fn(Operand, Operand) -> Expr),
            ("contains", Expr::Contains),
        ] {
            if self.peek_ident(word)
                && matches!(self.tokens.get(self.pos + 1), Some((_, Token::Open)))
            {
                self.pos += 2;
                let lhs = self.operand()?;
                self.expect(Token::Comma)?;
                let rhs = self.operand()?;
                self.expect(Token::Close)?;
                return Ok(build(lhs, rhs));
            }
        }

        let lhs = self.operand()?;

        let op = match self.next() {
            Some(Token::Op(op)) => op,
            _ => {
                self.pos = self.pos.saturating_sub(1);
                return self.error("expected a comparison operator");
            }
        };

        let rhs = self.operand()?;

        Ok(Expr::Compare(lhs, op, rhs))
    }

    /// Whether the token at `offset` is a comparison operator, meaning the identifier
    /// before it is a field name rather than a keyword.
    fn is_comparison_at(&self, offset: usize) -> bool {
        matches!(self.tokens.get(self.pos + offset), Some((_, Token::Op(_))))
    }

    fn operand(&mut self) -> Result<Operand, crate::Error> {
        if self.peek_ident("count") && matches!(self.tokens.get(self.pos + 1), Some((_, Token::Open))) {
            self.pos += 2;
            let path = self.path()?;
            self.expect(Token::Close)?;
            return Ok(Operand::Count(path));
        }

        match self.peek().map(|(_, t)| t.clone()) {
            Some(Token::Text(t)) => {
                self.pos += 1;
                Ok(Operand::Text(t))
            }
            Some(Token::Number(n)) => {
                self.pos += 1;
                Ok(Operand::Number(n))
            }
            Some(Token::Ident(_)) => self.path().map(Operand::Path),
            Some(tok) => self.error(format!("expected an operand, found {tok}")),
            None => self.error("expected an operand, found end of input"),
        }
    }

    fn path(&mut self) -> Result<String, crate::Error> {
        let mut path = match self.next() {
            Some(Token::Ident(s)) => s,
            _ => {
                self.pos = self.pos.saturating_sub(1);
                return self.error("expected a field name");
            }
        };

        while matches!(self.peek(), Some((_, Token::Slash))) {
            self.pos += 1;
            match self.next() {
                Some(Token::Ident(s)) => {
                    path.push('/');
                    path.push_str(&s);
                }
                _ => {
                    self.pos = self.pos.saturating_sub(1);
                    return self.error("expected a field name after `/`");
                }
            }
        }

        // single-segment paths must name core fields
        if !path.contains('/') && path != "desc" && !crate::info::CORE_FIELDS.contains(&path.as_str()) {
            return Err(crate::Error::UnknownProperty(path));
        }

        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleFormat;

    fn info() -> StreamInfo {
        let mut info = StreamInfo::new(
            "BioSemi",
            "EEG",
            32,
            2048.,
            SampleFormat::Float32,
            "biosemi-1",
        )
        .unwrap();

        let desc = info.desc_mut();
        desc.append_child_value("manufacturer", "BioSemi");
        let channels = desc.append_child("channels");
        for i in 0..32 {
            channels
                .append_child("channel")
                .append_child_value("label", format!("A{}", i + 1));
        }

        info.assign_identity("default", 0.);
        info
    }

    fn check(src: &str) -> bool {
        Expr::parse(src).unwrap().eval(&info())
    }

    #[test]
    fn equality_and_conjunction() {
        assert!(check("name='BioSemi'"));
        assert!(check("name='BioSemi' and type=\"EEG\""));
        assert!(!check("name='BioSemi' and type='Markers'"));
        assert!(check("type='Markers' or channel_count=32"));
        assert!(check("not type='Markers'"));
        assert!(check("(type='Markers' or type='EEG') and source_id != 'x'"));
    }

    #[test]
    fn numeric_comparisons() {
        assert!(check("channel_count > 8"));
        assert!(check("nominal_srate >= 2048"));
        assert!(check("channel_count = 32.0"));
        assert!(!check("nominal_srate < 1e3"));
    }

    #[test]
    fn metadata_paths() {
        assert!(check("desc/manufacturer='BioSemi'"));
        assert!(check("desc/channels/channel/label='A1'"));
        assert!(check("count(desc/channels/channel)=32"));
        assert!(!check("desc/missing='x'"));
        assert!(!check("desc/missing!='x'"));
    }

    #[test]
    fn string_functions() {
        assert!(check("starts-with(name, 'Bio')"));
        assert!(check("contains(source_id, 'semi')"));
        assert!(!check("starts-with(name, 'Semi')"));
    }

    #[test]
    fn malformed_predicates_fail_with_position() {
        let err = Expr::parse("name='BioSemi' and").unwrap_err();
        assert!(matches!(err, crate::Error::Predicate { position: 18, .. }), "{err:?}");

        let err = Expr::parse("name = 'open").unwrap_err();
        assert!(matches!(err, crate::Error::Predicate { position: 7, .. }), "{err:?}");

        assert!(Expr::parse("name 'x'").is_err());
        assert!(Expr::parse("name='x')").is_err());
        assert!(Expr::parse("(name='x'").is_err());
        assert!(Expr::parse("name=='x'").is_err());
        assert!(Expr::parse("").is_err());
        assert!(matches!(
            Expr::parse("colour='red'"),
            Err(crate::Error::UnknownProperty(_))
        ));
    }

    #[test]
    fn property_expression() {
        assert!(Expr::property("name", "BioSemi").unwrap().eval(&info()));
        assert!(!Expr::property("type", "eeg").unwrap().eval(&info()));
        assert!(Expr::property("desc", "x").is_err());
    }

    #[test]
    fn property_equality_is_textual() {
        let stream = |name: &str, source_id: &str| {
            let mut info =
                StreamInfo::new(name, "EEG", 1, 0., SampleFormat::Float32, source_id).unwrap();
            info.assign_identity("default", 0.);
            info
        };

        let prop = |p: &str, v: &str| Expr::property(p, v).unwrap();

        assert!(!prop("name", "1.0").eval(&stream("1", "")));
        assert!(!prop("source_id", "7").eval(&stream("x", "007")));
        assert!(prop("source_id", "NaN").eval(&stream("x", "NaN")));
        assert!(prop("source_id", "007").eval(&stream("x", "007")));

        // the parsed language still compares numerically
        assert!(Expr::parse("source_id = 7").unwrap().eval(&stream("x", "007")));
    }
}
