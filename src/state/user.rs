//! Registered and anonymous connections.
//!
//! Grounded on the teacher's `Db` value types, generalized from a string
//! key-value record to the `User` attribute set spec.md §3 describes.
//! Users are arena-owned records keyed by a stable [`UserId`] rather than
//! held behind shared references, per spec.md §9's "hidden cyclic
//! references" design note.

use std::collections::HashSet;
use std::time::Instant;

/// Stable identity for a [`User`], independent of its nickname (which may
/// change) or its connection (which is 1:1 but stored separately so
/// lookups by connection don't require scanning).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub u64);

/// Opaque identifier for the transport-level connection a [`User`] is
/// attached to. Assigned by the caller (the dispatcher), not by
/// `ServerState`.
pub type ConnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Registered,
    Quitting,
}

/// One connected (or just-connected, pre-registration) client.
#[derive(Debug, Clone)]
pub struct User {
    pub id: UserId,
    pub conn: ConnId,
    pub host_address: String,
    pub nickname: Option<String>,
    pub username: Option<String>,
    pub real_name: Option<String>,
    pub modes: HashSet<char>,
    pub away_message: Option<String>,
    pub signed_on_at: Instant,
    pub last_active_at: Instant,
    pub last_ping_at: Option<Instant>,
    pub last_pong_at: Option<Instant>,
    pub quit_message: Option<String>,
    /// Insertion-ordered: channels render in join order in e.g. `WHOIS`.
    pub channels: Vec<String>,
    pub invited_to: HashSet<String>,
    pub negotiating_capabilities: bool,
    pub password_accepted: bool,
    pub state: ConnectionState,
}

impl User {
    pub fn new(id: UserId, conn: ConnId, host_address: String, now: Instant) -> User {
        User {
            id,
            conn,
            host_address,
            nickname: None,
            username: None,
            real_name: None,
            modes: HashSet::new(),
            away_message: None,
            signed_on_at: now,
            last_active_at: now,
            last_ping_at: None,
            last_pong_at: None,
            quit_message: None,
            channels: Vec::new(),
            invited_to: HashSet::new(),
            negotiating_capabilities: false,
            password_accepted: false,
            state: ConnectionState::New,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.state == ConnectionState::Registered
    }

    /// Adds `channel` to this user's joined set if not already present.
    /// Returns whether it was newly added (used to build the rollback
    /// compensation).
    pub fn add_channel(&mut self, channel: &str) -> bool {
        if self.channels.iter().any(|c| c == channel) {
            false
        } else {
            self.channels.push(channel.to_string());
            true
        }
    }

    pub fn remove_channel(&mut self, channel: &str) {
        self.channels.retain(|c| c != channel);
    }

    /// `nick!user@host`, used for ban/except/invex mask matching.
    pub fn mask(&self) -> String {
        format!(
            "{}!{}@{}",
            self.nickname.as_deref().unwrap_or("*"),
            self.username.as_deref().unwrap_or("*"),
            self.host_address
        )
    }
}
