//! Statement classification.
//!
//! Decides how a statement is executed and whether its result may be
//! cached. Only SELECT-class statements are cachable: a statement whose
//! first significant token is `SELECT`, or a `WITH` whose top-level verb
//! resolves to `SELECT`. `EXPLAIN`, `SHOW` and friends return rows but are
//! never cached; everything else is treated as a write.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementClass {
    /// Returns rows; result may be cached.
    CachableRead,
    /// Returns rows; never cached.
    UncachedRead,
    /// Executed for its side effect; reports rows_affected.
    Write,
}

/// A significant token: keyword-ish word plus the paren depth it starts at.
struct Token {
    text: String,
    depth: u32,
}

struct Tokens<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    depth: u32,
}

impl<'a> Tokens<'a> {
    fn new(sql: &'a str) -> Tokens<'a> {
        Tokens {
            chars: sql.chars().peekable(),
            depth: 0,
        }
    }
}

impl Iterator for Tokens<'_> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        while let Some(c) = self.chars.next() {
            match c {
                '-' if self.chars.peek() == Some(&'-') => {
                    for c in self.chars.by_ref() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                '/' if self.chars.peek() == Some(&'*') => {
                    self.chars.next();
                    let mut prev = '\0';
                    for c in self.chars.by_ref() {
                        if prev == '*' && c == '/' {
                            break;
                        }
                        prev = c;
                    }
                }
                '\'' | '"' => {
                    let quote = c;
                    for c in self.chars.by_ref() {
                        if c == quote {
                            break;
                        }
                    }
                }
                '(' => self.depth += 1,
                ')' => self.depth = self.depth.saturating_sub(1),
                c if c.is_alphabetic() || c == '_' => {
                    let depth = self.depth;
                    let mut word = String::new();
                    word.extend(c.to_uppercase());
                    while let Some(&next) = self.chars.peek() {
                        if next.is_alphanumeric() || next == '_' {
                            word.extend(next.to_uppercase());
                            self.chars.next();
                        } else {
                            break;
                        }
                    }
                    return Some(Token { text: word, depth });
                }
                _ => {}
            }
        }
        None
    }
}

pub fn classify(sql: &str) -> StatementClass {
    let mut tokens = Tokens::new(sql);
    let first = match tokens.next() {
        Some(token) => token,
        None => return StatementClass::Write,
    };

    match first.text.as_str() {
        "SELECT" => StatementClass::CachableRead,
        "WITH" => {
            // The verb of a WITH statement is the first top-level keyword
            // after the CTE list.
            for token in tokens {
                if token.depth > 0 {
                    continue;
                }
                match token.text.as_str() {
                    "SELECT" => return StatementClass::CachableRead,
                    "INSERT" | "UPDATE" | "DELETE" | "MERGE" => return StatementClass::Write,
                    _ => {}
                }
            }
            StatementClass::UncachedRead
        }
        "EXPLAIN" | "SHOW" | "VALUES" | "TABLE" | "FETCH" => StatementClass::UncachedRead,
        _ => StatementClass::Write,
    }
}

pub fn is_cachable(sql: &str) -> bool {
    classify(sql) == StatementClass::CachableRead
}
