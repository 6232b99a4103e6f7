//! Cache key derivation.
//!
//! A fingerprint identifies a (statement, parameters) pair. The SQL text is
//! normalized first so formatting differences collapse onto one key:
//! comments are stripped, whitespace runs become single spaces and
//! everything outside quoted literals is lowercased. Parameters are folded
//! into the hash with a type tag and a length prefix each, so `["1"]` and
//! `[1]` never collide.

use serde_json::Value;
use xxhash_rust::xxh3::Xxh3;

/// Normalizes SQL for fingerprinting. Literal case inside `'...'` and
/// `"..."` is preserved.
pub fn normalize_sql(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut pending_space = false;

    while let Some(c) = chars.next() {
        match c {
            '-' if chars.peek() == Some(&'-') => {
                // line comment
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
                pending_space = true;
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
                pending_space = true;
            }
            '\'' | '"' => {
                if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                out.push(c);
                let quote = c;
                while let Some(qc) = chars.next() {
                    out.push(qc);
                    // doubled quote is an escaped quote, not a terminator
                    if qc == quote {
                        if chars.peek() == Some(&quote) {
                            out.push(chars.next().unwrap());
                        } else {
                            break;
                        }
                    }
                }
            }
            c if c.is_whitespace() => pending_space = true,
            c => {
                if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                out.extend(c.to_lowercase());
            }
        }
    }

    out
}

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_JSON: u8 = 5;

fn hash_param(hasher: &mut Xxh3, param: &Value) {
    let mut put = |tag: u8, bytes: &[u8]| {
        hasher.update(&[tag]);
        hasher.update(&(bytes.len() as u32).to_le_bytes());
        hasher.update(bytes);
    };

    match param {
        Value::Null => put(TAG_NULL, &[]),
        Value::Bool(b) => put(TAG_BOOL, &[*b as u8]),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                put(TAG_INT, &i.to_le_bytes());
            } else {
                put(TAG_FLOAT, &n.as_f64().unwrap_or(f64::NAN).to_le_bytes());
            }
        }
        Value::String(s) => put(TAG_STRING, s.as_bytes()),
        other => put(TAG_JSON, other.to_string().as_bytes()),
    }
}

/// Stable 64-bit fingerprint over normalized SQL and the ordered parameter
/// list.
pub fn fingerprint(sql: &str, params: &[Value]) -> u64 {
    let mut hasher = Xxh3::new();
    hasher.update(normalize_sql(sql).as_bytes());
    hasher.update(&[0xff]);
    hasher.update(&(params.len() as u32).to_le_bytes());
    for param in params {
        hash_param(&mut hasher, param);
    }
    hasher.digest()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn whitespace_and_case_collapse() {
        assert_eq!(
            normalize_sql("SELECT   *\n  FROM Users"),
            "select * from users"
        );
    }

    #[test]
    fn quoted_literals_keep_their_case() {
        assert_eq!(
            normalize_sql("SELECT 'MiXeD' AS v"),
            "select 'MiXeD' as v"
        );
        assert_eq!(
            normalize_sql("SELECT \"MiXeD\" FROM t"),
            "select \"MiXeD\" from t"
        );
    }

    #[test]
    fn comments_are_stripped() {
        assert_eq!(
            normalize_sql("/* lead */ SELECT 1 -- trailing\n"),
            "select 1"
        );
        assert_eq!(normalize_sql("SELECT /* in */ 1"), "select 1");
    }

    #[test]
    fn escaped_quote_does_not_terminate_literal() {
        assert_eq!(
            normalize_sql("SELECT 'it''s AND stays'"),
            "select 'it''s AND stays'"
        );
    }

    #[test]
    fn equivalent_statements_share_a_fingerprint() {
        let a = fingerprint("SELECT * FROM users WHERE id=$1", &[json!(1)]);
        let b = fingerprint("select  *  from users where id=$1", &[json!(1)]);
        assert_eq!(a, b);
    }

    #[test]
    fn parameters_key_the_fingerprint() {
        let sql = "SELECT * FROM users WHERE id=$1";
        let one = fingerprint(sql, &[json!(1)]);
        let two = fingerprint(sql, &[json!(2)]);
        let one_again = fingerprint(sql, &[json!(1)]);
        assert_ne!(one, two);
        assert_eq!(one, one_again);
    }

    #[test]
    fn parameter_types_are_distinguished() {
        let sql = "SELECT * FROM t WHERE v=$1";
        assert_ne!(
            fingerprint(sql, &[json!(1)]),
            fingerprint(sql, &[json!("1")])
        );
        assert_ne!(fingerprint(sql, &[json!(1)]), fingerprint(sql, &[json!(1.0)]));
        assert_ne!(
            fingerprint(sql, &[json!(null)]),
            fingerprint(sql, &[json!("")])
        );
    }

    #[test]
    fn parameter_boundaries_do_not_bleed() {
        let sql = "SELECT $1, $2";
        assert_ne!(
            fingerprint(sql, &[json!("ab"), json!("c")]),
            fingerprint(sql, &[json!("a"), json!("bc")])
        );
    }
}
