//! Case-mapping: deciding when two nicknames or channel names name the
//! same entity. See spec.md §3 "Case-mapping" and §8 invariant 4.

/// The three case-mapping variants recognized over IRC, selected via the
/// server's `CASEMAPPING` ISUPPORT token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseMapping {
    Ascii,
    Rfc1459,
    Rfc1459Strict,
}

/// What kind of name is being normalized. Channels keep their leading
/// prefix character verbatim; nicknames fold in full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameKind {
    Nickname,
    Channel,
}

impl CaseMapping {
    fn fold_char(self, c: char) -> char {
        match self {
            CaseMapping::Ascii => c.to_ascii_lowercase(),
            CaseMapping::Rfc1459 => fold_rfc1459(c, true),
            CaseMapping::Rfc1459Strict => fold_rfc1459(c, false),
        }
    }

    /// Normalizes `s` under this case mapping. For channels, the leading
    /// prefix character (`#`, `&`, ...) is preserved verbatim and only
    /// the body is folded, per spec.md §3.
    pub fn normalize(self, kind: NameKind, s: &str) -> String {
        match kind {
            NameKind::Nickname => s.chars().map(|c| self.fold_char(c)).collect(),
            NameKind::Channel => {
                let mut chars = s.chars();
                match chars.next() {
                    Some(prefix) => {
                        let mut out = String::with_capacity(s.len());
                        out.push(prefix);
                        out.extend(chars.map(|c| self.fold_char(c)));
                        out
                    }
                    None => String::new(),
                }
            }
        }
    }
}

fn fold_rfc1459(c: char, fold_tilde: bool) -> char {
    match c {
        'A'..='Z' => ((c as u8) + 32) as char,
        '[' => '{',
        ']' => '}',
        '\\' => '|',
        '~' if fold_tilde => '^',
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_only_folds_letters() {
        assert_eq!(CaseMapping::Ascii.normalize(NameKind::Nickname, "AlicE[1]"), "alice[1]");
    }

    #[test]
    fn rfc1459_folds_bracket_chars() {
        let m = CaseMapping::Rfc1459;
        assert_eq!(m.normalize(NameKind::Nickname, "Alice[]\\~"), "alice{}|^");
    }

    #[test]
    fn rfc1459_strict_does_not_fold_tilde() {
        let m = CaseMapping::Rfc1459Strict;
        assert_eq!(m.normalize(NameKind::Nickname, "a~b"), "a~b");
    }

    #[test]
    fn channel_prefix_preserved_body_folded() {
        let m = CaseMapping::Ascii;
        assert_eq!(m.normalize(NameKind::Channel, "#RuSt"), "#rust");
    }

    #[test]
    fn normalize_is_idempotent() {
        for mapping in [CaseMapping::Ascii, CaseMapping::Rfc1459, CaseMapping::Rfc1459Strict] {
            for s in ["Alice[]{}\\|~^", "#MixedCase~Chan"] {
                let once = mapping.normalize(NameKind::Nickname, s);
                let twice = mapping.normalize(NameKind::Nickname, &once);
                assert_eq!(once, twice);
            }
        }
    }
}
