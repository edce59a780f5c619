use crate::error::GuardError;
use regex::Regex;

/// Key pattern with Redis `KEYS`/`SCAN MATCH` semantics, so the memory
/// backend deletes the same keys Redis would.
///
/// `*` matches any run of characters (including `:` and newlines), `?`
/// matches exactly one character, `[...]` is a character class (`[^...]`
/// negated, `a-z` ranges) and `\` makes the next character literal. An
/// unterminated `[` is literal.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    regex: Regex,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Result<Self, GuardError> {
        let chars: Vec<char> = pattern.chars().collect();
        let mut expr = String::with_capacity(pattern.len() + 8);
        expr.push_str("(?s)^");

        let mut i = 0;
        while i < chars.len() {
            match chars[i] {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                '\\' if i + 1 < chars.len() => {
                    i += 1;
                    push_literal(&mut expr, chars[i]);
                }
                '[' => match class_end(&chars, i + 1) {
                    Some(end) => {
                        push_class(&mut expr, &chars[i + 1..end]);
                        i = end;
                    }
                    None => push_literal(&mut expr, '['),
                },
                other => push_literal(&mut expr, other),
            }
            i += 1;
        }
        expr.push('$');

        let regex = Regex::new(&expr)
            .map_err(|e| GuardError::Validation(format!("Invalid key pattern '{}': {}", pattern, e)))?;

        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

fn push_literal(expr: &mut String, c: char) {
    expr.push_str(&regex::escape(c.encode_utf8(&mut [0; 4])));
}

/// Index of the `]` closing a class whose body starts at `start`.
fn class_end(chars: &[char], start: usize) -> Option<usize> {
    let mut i = start;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            ']' => return Some(i),
            _ => i += 1,
        }
    }
    None
}

fn push_class(expr: &mut String, body: &[char]) {
    let (negated, body) = match body.split_first() {
        Some(('^', rest)) => (true, rest),
        _ => (false, body),
    };
    if body.is_empty() {
        // `[]` matches nothing, `[^]` any single character
        expr.push_str(if negated { "." } else { r"\b\B" });
        return;
    }

    expr.push('[');
    if negated {
        expr.push('^');
    }
    let mut i = 0;
    while i < body.len() {
        if body[i] == '\\' && i + 1 < body.len() {
            i += 1;
            push_literal(expr, body[i]);
        } else if i + 2 < body.len() && body[i + 1] == '-' {
            let (low, high) = if body[i] <= body[i + 2] {
                (body[i], body[i + 2])
            } else {
                (body[i + 2], body[i])
            };
            push_literal(expr, low);
            expr.push('-');
            push_literal(expr, high);
            i += 2;
        } else {
            push_literal(expr, body[i]);
        }
        i += 1;
    }
    expr.push(']');
}
