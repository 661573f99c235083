//! Lexical syntax highlighting for CQL.
//!
//! The highlighter only classifies tokens for display; it never validates
//! the query. Its output is HTML in which every character of the input
//! appears exactly once (escaped), wrapped in `<span class="sh-*">`
//! elements. Stripping the tags and unescaping yields the input again.

/// CSS classes used by the highlighter.
pub mod class {
    pub const STRING: &str = "sh-string";
    pub const ATTR: &str = "sh-attr";
    pub const OPERATOR: &str = "sh-operator";
    pub const BRACKET: &str = "sh-bracket";
    pub const STRUCT: &str = "sh-struct";
    pub const REPETITION: &str = "sh-repetition";
    pub const KEYWORD: &str = "sh-keyword";
    pub const NUMBER: &str = "sh-number";
}

const KEYWORDS: [&str; 4] = ["within", "containing", "meet", "union"];

/// Escape `text` for inclusion in HTML element content or attributes.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    push_escaped(&mut out, text.chars());
    out
}

fn push_escaped(out: &mut String, chars: impl IntoIterator<Item = char>) {
    for c in chars {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
}

fn push_span(out: &mut String, class: &str, chars: &[char]) {
    out.push_str("<span class=\"");
    out.push_str(class);
    out.push_str("\">");
    push_escaped(out, chars.iter().copied());
    out.push_str("</span>");
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '.'
}

/// Returns the length of the comparison operator starting at `i`, if any.
fn operator_len(chars: &[char], i: usize) -> Option<usize> {
    let at = |k: usize| chars.get(i + k).copied();
    match (at(0), at(1), at(2)) {
        (Some('!'), Some('='), Some('=')) => Some(3),
        (Some('!'), Some('='), _) | (Some('='), Some('='), _) => Some(2),
        (Some('=' | '&' | '|' | '!'), _, _) => Some(1),
        _ => None,
    }
}

/// Index of the end of the string literal opened at `start` (exclusive).
///
/// An unterminated literal runs to the end of the input.
fn string_end(chars: &[char], start: usize) -> usize {
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            '"' => return i + 1,
            _ => i += 1,
        }
    }
    chars.len()
}

/// Highlight a CQL query.
///
/// # Examples
///
/// ```
/// use kontext_flux::highlight::highlight_cql;
///
/// let html = highlight_cql(r#"[lemma="dog"]"#);
/// assert_eq!(
///     html,
///     "<span class=\"sh-bracket\">[</span>\
///      <span class=\"sh-attr\">lemma</span>\
///      <span class=\"sh-operator\">=</span>\
///      <span class=\"sh-string\">&quot;dog&quot;</span>\
///      <span class=\"sh-bracket\">]</span>"
/// );
/// ```
pub fn highlight_cql(query: &str) -> String {
    let chars: Vec<char> = query.chars().collect();
    let mut out = String::with_capacity(query.len() * 4);
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' => {
                let end = string_end(&chars, i).min(chars.len());
                push_span(&mut out, class::STRING, &chars[i..end]);
                i = end;
            }
            '[' | ']' | '(' | ')' => {
                push_span(&mut out, class::BRACKET, &chars[i..=i]);
                i += 1;
            }
            '<' => {
                let end = chars[i..]
                    .iter()
                    .position(|ch| *ch == '>')
                    .map_or(chars.len(), |p| i + p + 1);
                push_span(&mut out, class::STRUCT, &chars[i..end]);
                i = end;
            }
            '{' => match chars[i..].iter().position(|ch| *ch == '}') {
                Some(p)
                    if chars[i + 1..i + p]
                        .iter()
                        .all(|ch| ch.is_ascii_digit() || *ch == ',' || ch.is_whitespace()) =>
                {
                    push_span(&mut out, class::REPETITION, &chars[i..=i + p]);
                    i += p + 1;
                }
                _ => {
                    push_escaped(&mut out, [c]);
                    i += 1;
                }
            },
            '*' | '+' | '?' => {
                push_span(&mut out, class::REPETITION, &chars[i..=i]);
                i += 1;
            }
            _ if c.is_ascii_digit() => {
                let end = chars[i..]
                    .iter()
                    .position(|ch| !ch.is_ascii_digit())
                    .map_or(chars.len(), |p| i + p);
                push_span(&mut out, class::NUMBER, &chars[i..end]);
                i = end;
            }
            _ if is_ident_char(c) => {
                let end = chars[i..]
                    .iter()
                    .position(|ch| !is_ident_char(*ch))
                    .map_or(chars.len(), |p| i + p);
                let word: String = chars[i..end].iter().collect();
                let mut next = end;
                while chars.get(next).is_some_and(|ch| ch.is_whitespace()) {
                    next += 1;
                }
                let after = (chars.get(next), chars.get(next + 1));
                if matches!(after, (Some('='), _) | (Some('!'), Some('='))) {
                    push_span(&mut out, class::ATTR, &chars[i..end]);
                } else if KEYWORDS.contains(&word.as_str()) {
                    push_span(&mut out, class::KEYWORD, &chars[i..end]);
                } else {
                    push_escaped(&mut out, chars[i..end].iter().copied());
                }
                i = end;
            }
            _ => match operator_len(&chars, i) {
                Some(len) => {
                    push_span(&mut out, class::OPERATOR, &chars[i..i + len]);
                    i += len;
                }
                None => {
                    push_escaped(&mut out, [c]);
                    i += 1;
                }
            },
        }
    }
    out
}
