//! Matching of localized server messages against printf-style templates.
//!
//! The recognizer templates come from configuration so they can follow the
//! server's message locale. Supported placeholders: `%s` (greedy text,
//! bounded by the literal that follows), `%d` (integer), `%f` (float),
//! `%%` (literal percent). Matching backtracks, so templates with several
//! `%s` in a row of literals work.

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(String),
    Str,
    Int,
    Float,
}

fn lex(template: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut chars = template.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            literal.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => literal.push('%'),
            Some(p @ ('s' | 'd' | 'f')) => {
                if !literal.is_empty() {
                    tokens.push(Token::Literal(std::mem::take(&mut literal)));
                }
                tokens.push(match p {
                    's' => Token::Str,
                    'd' => Token::Int,
                    _ => Token::Float,
                });
            }
            Some(other) => {
                literal.push('%');
                literal.push(other);
            }
            None => literal.push('%'),
        }
    }
    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    tokens
}

/// Number of capturing placeholders in a template.
pub fn placeholder_count(template: &str) -> usize {
    lex(template)
        .iter()
        .filter(|t| !matches!(t, Token::Literal(_)))
        .count()
}

/// Does `text` match `template` in full?
pub fn match_template(text: &str, template: &str) -> bool {
    if template.is_empty() {
        return false;
    }
    let tokens = lex(template);
    let mut caps = Vec::new();
    matches(text, &tokens, &mut caps)
}

/// Match and return the captured placeholder values, in template order.
pub fn capture(text: &str, template: &str) -> Option<Vec<String>> {
    if template.is_empty() {
        return None;
    }
    let tokens = lex(template);
    let mut caps = Vec::new();
    if matches(text, &tokens, &mut caps) {
        Some(caps)
    } else {
        None
    }
}

fn matches(text: &str, tokens: &[Token], caps: &mut Vec<String>) -> bool {
    let Some((head, rest)) = tokens.split_first() else {
        return text.is_empty();
    };

    match head {
        Token::Literal(lit) => match text.strip_prefix(lit.as_str()) {
            Some(remainder) => matches(remainder, rest, caps),
            None => false,
        },
        Token::Str => try_lengths(text, rest, caps),
        Token::Int => {
            let span = leading_span(text, |i, c| c.is_ascii_digit() || (i == 0 && c == '-'));
            try_numeric(text, rest, caps, span, |s| s.parse::<i64>().is_ok())
        }
        Token::Float => {
            let span = leading_span(text, |i, c| {
                c.is_ascii_digit() || c == '.' || (i == 0 && (c == '-' || c == '+'))
            });
            try_numeric(text, rest, caps, span, |s| s.parse::<f64>().is_ok())
        }
    }
}

/// Greedy `%s`: try the longest capture first, shrinking on failure.
fn try_lengths(text: &str, rest: &[Token], caps: &mut Vec<String>) -> bool {
    let mut cut = text.len();
    loop {
        if text.is_char_boundary(cut) {
            caps.push(text[..cut].to_string());
            if matches(&text[cut..], rest, caps) {
                return true;
            }
            caps.pop();
        }
        if cut == 0 {
            return false;
        }
        cut -= 1;
    }
}

fn try_numeric(
    text: &str,
    rest: &[Token],
    caps: &mut Vec<String>,
    span: usize,
    valid: impl Fn(&str) -> bool,
) -> bool {
    let mut cut = span;
    while cut > 0 {
        let candidate = &text[..cut];
        if valid(candidate) {
            caps.push(candidate.to_string());
            if matches(&text[cut..], rest, caps) {
                return true;
            }
            caps.pop();
        }
        cut -= 1;
    }
    false
}

fn leading_span(text: &str, keep: impl Fn(usize, char) -> bool) -> usize {
    let mut end = 0;
    for (i, c) in text.char_indices() {
        if keep(i, c) {
            end = i + c.len_utf8();
        } else {
            break;
        }
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_only_must_match_exactly() {
        assert!(match_template("database system is shut down", "database system is shut down"));
        assert!(!match_template("database system is shut down now", "database system is shut down"));
    }

    #[test]
    fn captures_checkpoint_starting() {
        let caps = capture("checkpoint starting: time", "%s starting:%s").unwrap();
        assert_eq!(caps, vec!["checkpoint", " time"]);
    }

    #[test]
    fn captures_checkpoint_complete_fields() {
        let template = "%s complete: wrote %d buffers (%f%%); \
                        %d transaction log file(s) added, %d removed, %d recycled; \
                        write=%d.%d s, sync=%d.%d s, total=%d.%d s";
        let message = "checkpoint complete: wrote 42 buffers (1.6%); \
                       0 transaction log file(s) added, 1 removed, 3 recycled; \
                       write=9.250 s, sync=0.130 s, total=9.400 s";
        let caps = capture(message, template).unwrap();
        assert_eq!(
            caps,
            vec![
                "checkpoint",
                "42",
                "1.6",
                "0",
                "1",
                "3",
                "9",
                "250",
                "0",
                "130",
                "9",
                "400"
            ]
        );
    }

    #[test]
    fn captures_rusage_floats() {
        let caps = capture(
            "CPU 0.01s/0.02u sec elapsed 0.30 sec",
            "CPU %fs/%fu sec elapsed %f sec",
        )
        .unwrap();
        assert_eq!(caps, vec!["0.01", "0.02", "0.30"]);
    }

    #[test]
    fn percent_escape_is_literal() {
        assert!(match_template("100% done", "%d%% done"));
        assert_eq!(capture("100% done", "%d%% done").unwrap(), vec!["100"]);
    }

    #[test]
    fn mismatch_returns_none() {
        assert!(capture("autovacuum launcher started", "%s starting:%s").is_none());
        assert!(capture("checkpoint complete", "%s complete: wrote %d buffers").is_none());
    }

    #[test]
    fn placeholder_count_ignores_escapes() {
        assert_eq!(placeholder_count("%s starting:%s"), 2);
        assert_eq!(placeholder_count("wrote %d buffers (%f%%)"), 2);
    }

    #[test]
    fn negative_integers_are_captured() {
        assert_eq!(capture("delta -42 end", "delta %d end").unwrap(), vec!["-42"]);
    }
}
