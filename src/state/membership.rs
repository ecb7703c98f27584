//! Per-channel membership modes and grant precedence.
//!
//! See spec.md §3 "Membership": a set of mode letters with a canonical
//! precedence order used for `canGrant` — a user may grant a mode only
//! if they hold a mode at least as high.

use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MembershipMode {
    Voice,
    HalfOp,
    Op,
    Admin,
    Owner,
}

impl MembershipMode {
    pub fn letter(self) -> char {
        match self {
            MembershipMode::Voice => 'v',
            MembershipMode::HalfOp => 'h',
            MembershipMode::Op => 'o',
            MembershipMode::Admin => 'a',
            MembershipMode::Owner => 'q',
        }
    }

    pub fn prefix_sigil(self) -> char {
        match self {
            MembershipMode::Voice => '+',
            MembershipMode::HalfOp => '%',
            MembershipMode::Op => '@',
            MembershipMode::Admin => '&',
            MembershipMode::Owner => '~',
        }
    }

    /// The membership mode named by a `MODE` letter (`v`/`h`/`o`/`a`/`q`),
    /// or `None` for any other letter.
    pub fn from_letter(letter: char) -> Option<MembershipMode> {
        match letter {
            'v' => Some(MembershipMode::Voice),
            'h' => Some(MembershipMode::HalfOp),
            'o' => Some(MembershipMode::Op),
            'a' => Some(MembershipMode::Admin),
            'q' => Some(MembershipMode::Owner),
            _ => None,
        }
    }
}

/// A user's modes within one channel. Ordered by [`MembershipMode`]'s
/// derived `Ord`, which reflects the canonical precedence
/// voice < halfop < op < admin < owner.
#[derive(Debug, Clone, Default)]
pub struct Membership {
    modes: HashSet<MembershipMode>,
}

impl Membership {
    pub fn new() -> Membership {
        Membership { modes: HashSet::new() }
    }

    pub fn with_mode(mode: MembershipMode) -> Membership {
        let mut m = Membership::new();
        m.modes.insert(mode);
        m
    }

    pub fn has(&self, mode: MembershipMode) -> bool {
        self.modes.contains(&mode)
    }

    pub fn highest(&self) -> Option<MembershipMode> {
        self.modes.iter().copied().max()
    }

    pub fn grant(&mut self, mode: MembershipMode) {
        self.modes.insert(mode);
    }

    pub fn revoke(&mut self, mode: MembershipMode) {
        self.modes.remove(&mode);
    }

    /// Whether a member holding `self`'s modes may grant or revoke
    /// `target` to/from someone else: they must hold a mode at least as
    /// high as `target`.
    pub fn can_grant(&self, target: MembershipMode) -> bool {
        self.highest().is_some_and(|h| h >= target)
    }

    pub fn is_voiced_or_higher(&self) -> bool {
        !self.modes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_grant_requires_at_least_equal_precedence() {
        let op = Membership::with_mode(MembershipMode::Op);
        assert!(op.can_grant(MembershipMode::Voice));
        assert!(op.can_grant(MembershipMode::Op));
        assert!(!op.can_grant(MembershipMode::Admin));
    }

    #[test]
    fn highest_picks_max_precedence() {
        let mut m = Membership::new();
        m.grant(MembershipMode::Voice);
        m.grant(MembershipMode::Op);
        assert_eq!(m.highest(), Some(MembershipMode::Op));
    }
}
