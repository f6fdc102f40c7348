//! Detection of index-eligible `column = value` clauses.

/// A single equality comparison extracted from a WHERE clause.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EqualityPredicate {
    /// Column name as written.
    pub column: String,
    /// Comparison value with surrounding quotes removed.
    pub value: String,
}

#[derive(Debug, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
    Op(String),
}

const REJECTED_KEYWORDS: &[&str] = &["and", "or", "not", "like", "in", "between", "is", "glob"];

/// Parses `clause` if it is exactly one equality comparison.
///
/// Accepts `col=val`, `col = val`, `col = 'val'` and `col = "val"`, with an
/// optional leading `WHERE`. Returns `None` for anything compound or using
/// another operator, so the caller falls back to a full scan.
pub fn parse_equality(clause: &str) -> Option<EqualityPredicate> {
    let mut tokens = tokenize(clause)?;
    if let Some(Token::Word(first)) = tokens.first() {
        if first.eq_ignore_ascii_case("where") {
            tokens.remove(0);
        }
    }
    let rejected = tokens.iter().any(|token| match token {
        Token::Word(word) => REJECTED_KEYWORDS
            .iter()
            .any(|kw| word.eq_ignore_ascii_case(kw)),
        _ => false,
    });
    if rejected {
        return None;
    }
    let mut iter = tokens.into_iter();
    let (Some(Token::Word(column)), Some(Token::Op(op)), Some(value), None) =
        (iter.next(), iter.next(), iter.next(), iter.next())
    else {
        return None;
    };
    if op != "=" && op != "==" {
        return None;
    }
    let value = match value {
        Token::Word(word) | Token::Quoted(word) => word,
        Token::Op(_) => return None,
    };
    Some(EqualityPredicate { column, value })
}

fn tokenize(input: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '\'' || c == '"' {
            chars.next();
            let mut value = String::new();
            loop {
                match chars.next() {
                    None => return None,
                    Some(ch) if ch == c => {
                        // Doubled quote is an escaped quote.
                        if chars.peek() == Some(&c) {
                            chars.next();
                            value.push(c);
                        } else {
                            break;
                        }
                    }
                    Some(ch) => value.push(ch),
                }
            }
            tokens.push(Token::Quoted(value));
        } else if matches!(c, '=' | '<' | '>' | '!') {
            let mut op = String::new();
            while let Some(&ch) = chars.peek() {
                if !matches!(ch, '=' | '<' | '>' | '!') {
                    break;
                }
                op.push(ch);
                chars.next();
            }
            tokens.push(Token::Op(op));
        } else if is_word_char(c) {
            let mut word = String::new();
            while let Some(&ch) = chars.peek() {
                if !is_word_char(ch) {
                    break;
                }
                word.push(ch);
                chars.next();
            }
            tokens.push(Token::Word(word));
        } else {
            return None;
        }
    }
    Some(tokens)
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '.' | '-' | '+')
}
