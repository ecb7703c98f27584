//! Shell-style glob matching used for ban/except/invex masks.
//!
//! See spec.md §3 "Glob" and §9's open question about trailing empty
//! alternatives: `{a,b,}` is deliberately treated as "optionally match
//! nothing", not a parse error.

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(char),
    AnyChar,
    AnyRun,
    Set { negate: bool, ranges: Vec<(char, char)>, singles: Vec<char> },
    Alternation(Vec<Vec<Part>>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Glob {
    parts: Vec<Part>,
}

impl Glob {
    pub fn parse(pattern: &str) -> Glob {
        let chars: Vec<char> = pattern.chars().collect();
        let parts = parse_parts(&chars, 0, chars.len());
        Glob { parts }
    }

    pub fn matches(&self, text: &str) -> bool {
        let text: Vec<char> = text.chars().collect();
        match_parts(&self.parts, &text)
    }

    /// Returns an equivalent glob whose literal/alternation characters
    /// have been passed through `fold`. Used to implement spec.md §8
    /// invariant 5 (glob equivalence under casefold) without re-parsing.
    pub fn casefold(&self, fold: impl Fn(char) -> char + Copy) -> Glob {
        Glob { parts: fold_parts(&self.parts, fold) }
    }
}

fn parse_parts(chars: &[char], mut i: usize, end: usize) -> Vec<Part> {
    let mut parts = Vec::new();
    while i < end {
        match chars[i] {
            '?' => {
                parts.push(Part::AnyChar);
                i += 1;
            }
            '*' => {
                parts.push(Part::AnyRun);
                i += 1;
            }
            '[' => match find_matching(chars, i, end, '[', ']') {
                Some(close) => {
                    parts.push(parse_set(&chars[i + 1..close]));
                    i = close + 1;
                }
                None => {
                    // Unclosed '[' is treated literally from this position.
                    parts.push(Part::Literal(chars[i]));
                    i += 1;
                }
            },
            '{' => match find_matching(chars, i, end, '{', '}') {
                Some(close) => {
                    let inner = &chars[i + 1..close];
                    let alts = split_top_level_commas(inner)
                        .into_iter()
                        .map(|span| parse_parts(inner, span.0, span.1))
                        .collect();
                    parts.push(Part::Alternation(alts));
                    i = close + 1;
                }
                None => {
                    parts.push(Part::Literal(chars[i]));
                    i += 1;
                }
            },
            c => {
                parts.push(Part::Literal(c));
                i += 1;
            }
        }
    }
    parts
}

fn find_matching(chars: &[char], open_at: usize, end: usize, open: char, close: char) -> Option<usize> {
    let mut depth = 0;
    let mut i = open_at;
    while i < end {
        if chars[i] == open {
            depth += 1;
        } else if chars[i] == close {
            depth -= 1;
            if depth == 0 {
                return Some(i);
            }
        }
        i += 1;
    }
    None
}

/// Splits `inner` on top-level commas, returning `(start, end)` spans
/// relative to `inner`'s own indexing (offsets are added by the caller
/// via slicing `inner` itself, so spans are plain `inner`-local indices).
fn split_top_level_commas(inner: &[char]) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;
    let mut depth = 0;
    for (idx, &c) in inner.iter().enumerate() {
        match c {
            '[' | '{' => depth += 1,
            ']' | '}' => depth -= 1,
            ',' if depth == 0 => {
                spans.push((start, idx));
                start = idx + 1;
            }
            _ => {}
        }
    }
    spans.push((start, inner.len()));
    spans
}

fn parse_set(inner: &[char]) -> Part {
    let (negate, inner) = match inner.first() {
        Some('!') => (true, &inner[1..]),
        _ => (false, inner),
    };
    let mut ranges = Vec::new();
    let mut singles = Vec::new();
    let mut i = 0;
    while i < inner.len() {
        if i + 2 < inner.len() && inner[i + 1] == '-' {
            let (mut a, mut b) = (inner[i], inner[i + 2]);
            if a > b {
                std::mem::swap(&mut a, &mut b);
            }
            ranges.push((a, b));
            i += 3;
        } else {
            singles.push(inner[i]);
            i += 1;
        }
    }
    Part::Set { negate, ranges, singles }
}

fn fold_parts(parts: &[Part], fold: impl Fn(char) -> char + Copy) -> Vec<Part> {
    parts
        .iter()
        .map(|p| match p {
            Part::Literal(c) => Part::Literal(fold(*c)),
            Part::AnyChar => Part::AnyChar,
            Part::AnyRun => Part::AnyRun,
            Part::Set { negate, ranges, singles } => Part::Set {
                negate: *negate,
                ranges: ranges.iter().map(|(a, b)| (fold(*a), fold(*b))).collect(),
                singles: singles.iter().map(|c| fold(*c)).collect(),
            },
            Part::Alternation(alts) => {
                Part::Alternation(alts.iter().map(|a| fold_parts(a, fold)).collect())
            }
        })
        .collect()
}

fn set_matches(negate: bool, ranges: &[(char, char)], singles: &[char], c: char) -> bool {
    let hit = singles.contains(&c) || ranges.iter().any(|(a, b)| *a <= c && c <= *b);
    hit != negate
}

fn match_parts(parts: &[Part], text: &[char]) -> bool {
    match_at(parts, text, 0, 0)
}

fn match_at(parts: &[Part], text: &[char], pi: usize, ti: usize) -> bool {
    if pi == parts.len() {
        return ti == text.len();
    }
    match &parts[pi] {
        Part::Literal(c) => ti < text.len() && text[ti] == *c && match_at(parts, text, pi + 1, ti + 1),
        Part::AnyChar => ti < text.len() && match_at(parts, text, pi + 1, ti + 1),
        Part::AnyRun => {
            for consume in 0..=(text.len() - ti) {
                if match_at(parts, text, pi + 1, ti + consume) {
                    return true;
                }
            }
            false
        }
        Part::Set { negate, ranges, singles } => {
            ti < text.len()
                && set_matches(*negate, ranges, singles, text[ti])
                && match_at(parts, text, pi + 1, ti + 1)
        }
        Part::Alternation(alts) => alts.iter().any(|alt| {
            // An empty alternative (trailing `{a,b,}`) matches zero
            // characters here, then resumes the outer pattern at `ti`.
            let mut combined: Vec<Part> = alt.clone();
            combined.extend_from_slice(&parts[pi + 1..]);
            match_at(&combined, text, 0, ti)
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_and_wildcards() {
        let g = Glob::parse("nick!*@*.example.com");
        assert!(g.matches("nick!user@host.example.com"));
        assert!(!g.matches("nick!user@host.example.org"));
    }

    #[test]
    fn question_mark_matches_single_char() {
        let g = Glob::parse("a?c");
        assert!(g.matches("abc"));
        assert!(!g.matches("ac"));
        assert!(!g.matches("abbc"));
    }

    #[test]
    fn set_and_negated_set_and_range() {
        assert!(Glob::parse("[a-c]at").matches("bat"));
        assert!(!Glob::parse("[a-c]at").matches("dat"));
        assert!(Glob::parse("[!a-c]at").matches("dat"));
        assert!(Glob::parse("[c-a]at").matches("bat")); // auto-ordered range
    }

    #[test]
    fn alternation_with_trailing_empty_is_optional() {
        let g = Glob::parse("file.{txt,md,}");
        assert!(g.matches("file.txt"));
        assert!(g.matches("file.md"));
        assert!(g.matches("file."));
    }

    #[test]
    fn unclosed_bracket_and_brace_are_literal() {
        let g = Glob::parse("a[bc");
        assert!(g.matches("a[bc"));
        let g2 = Glob::parse("a{bc");
        assert!(g2.matches("a{bc"));
    }

    #[test]
    fn casefold_equivalence() {
        let lower = |c: char| c.to_ascii_lowercase();
        let g = Glob::parse("Nick!*@Host").casefold(lower);
        let direct = Glob::parse(&"nick!*@host".to_string());
        assert_eq!(g.matches("nick!user@host"), direct.matches("nick!user@host"));
    }
}
