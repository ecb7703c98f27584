//! Channels: topic, flags, membership, and ban/except/invex lists.
//!
//! See spec.md §3 "Channel" and §4.4 "Channel visibility and policy".

use std::collections::HashMap;
use std::time::Instant;

use crate::glob::Glob;
use crate::state::membership::Membership;
use crate::state::user::UserId;

/// Who last set a channel's topic: a live reference to the setting user,
/// or a frozen nickname once that user has parted or quit. See spec.md
/// §3's `ServerSetBy` invariant.
#[derive(Debug, Clone)]
pub enum TopicSetter {
    Live(UserId),
    Frozen(String),
}

#[derive(Debug, Clone)]
pub struct Topic {
    pub text: String,
    pub set_by: TopicSetter,
    pub set_at: Instant,
}

#[derive(Debug, Clone, Default)]
pub struct ChannelFlags {
    pub invite_only: bool,
    pub moderated: bool,
    pub no_external_messages: bool,
    pub secret: bool,
    pub protected_topic: bool,
}

#[derive(Debug, Clone)]
pub struct Channel {
    pub name: String,
    pub topic: Option<Topic>,
    pub created_at: Instant,
    pub members: HashMap<UserId, Membership>,
    pub bans: Vec<String>,
    pub excepts: Vec<String>,
    pub invex: Vec<String>,
    pub flags: ChannelFlags,
    pub key: Option<String>,
    pub client_limit: Option<usize>,
    pub invited: std::collections::HashSet<UserId>,
}

impl Channel {
    pub fn new(name: String, now: Instant) -> Channel {
        Channel {
            name,
            topic: None,
            created_at: now,
            members: HashMap::new(),
            bans: Vec::new(),
            excepts: Vec::new(),
            invex: Vec::new(),
            flags: ChannelFlags::default(),
            key: None,
            client_limit: None,
            invited: std::collections::HashSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn at_client_limit(&self) -> bool {
        self.client_limit.is_some_and(|limit| self.members.len() >= limit)
    }

    /// Whether `mask` (a `nick!user@host` string) matches any glob in
    /// `patterns`.
    fn mask_matches_any(patterns: &[String], mask: &str) -> bool {
        patterns.iter().any(|p| Glob::parse(p).matches(mask))
    }

    pub fn is_banned(&self, mask: &str) -> bool {
        Self::mask_matches_any(&self.bans, mask) && !Self::mask_matches_any(&self.excepts, mask)
    }

    pub fn is_invited_by_mask(&self, mask: &str) -> bool {
        Self::mask_matches_any(&self.invex, mask)
    }

    pub fn is_invited(&self, user: UserId, mask: &str) -> bool {
        self.invited.contains(&user) || self.is_invited_by_mask(mask)
    }

    /// Replaces a live topic setter with a frozen nickname, per spec.md
    /// §3's invariant: "A `SetByUser` is evacuated to `SetByNickname`
    /// when that user parts or quits the channel."
    pub fn freeze_topic_setter_if(&mut self, departing: UserId, departing_nick: &str) {
        if let Some(topic) = &mut self.topic {
            if let TopicSetter::Live(setter) = topic.set_by {
                if setter == departing {
                    topic.set_by = TopicSetter::Frozen(departing_nick.to_string());
                }
            }
        }
    }
}
