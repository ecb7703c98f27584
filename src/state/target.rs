//! Lazily-evaluated, composable recipient sets.
//!
//! See spec.md §4.4 "Message targeting". A [`MessageTarget`] is built up
//! from literal users, channel masks, and "watchers of a user" sources,
//! then narrowed by filter predicates; it is only resolved against live
//! state at emission time, so a slow-to-send message still reflects
//! membership changes that happened while it queued.

use crate::state::channel::Channel;
use crate::state::membership::Membership;
use crate::state::user::UserId;
use crate::state::StateData;

enum Source {
    User(UserId),
    ChannelMask(String),
    Watchers { user: UserId, include_self: bool },
}

type UserFilter = Box<dyn Fn(&StateData, UserId) -> bool + Send>;
type ChannelFilter = Box<dyn Fn(&Channel) -> bool + Send>;
type ChannelUserFilter = Box<dyn Fn(&Channel, &Membership) -> bool + Send>;

/// A recipient set under construction. Consumed by [`MessageTarget::materialize`]
/// once a dispatcher is ready to send.
#[derive(Default)]
pub struct MessageTarget {
    sources: Vec<Source>,
    exclude: Vec<UserId>,
    include: Vec<UserId>,
    user_filters: Vec<UserFilter>,
    channel_filters: Vec<ChannelFilter>,
    channel_user_filters: Vec<ChannelUserFilter>,
}

impl MessageTarget {
    pub fn new() -> MessageTarget {
        MessageTarget::default()
    }

    pub fn nickname(user: UserId) -> MessageTarget {
        let mut t = MessageTarget::new();
        t.sources.push(Source::User(user));
        t
    }

    pub fn channel(canonical_name: impl Into<String>) -> MessageTarget {
        let mut t = MessageTarget::new();
        t.sources.push(Source::ChannelMask(canonical_name.into()));
        t
    }

    /// The user's own connection plus every member of every channel they
    /// are in.
    pub fn watchers_of(user: UserId, include_self: bool) -> MessageTarget {
        let mut t = MessageTarget::new();
        t.sources.push(Source::Watchers { user, include_self });
        t
    }

    pub fn exclude(mut self, user: UserId) -> Self {
        self.exclude.push(user);
        self
    }

    pub fn include(mut self, user: UserId) -> Self {
        self.include.push(user);
        self
    }

    pub fn filter_users(mut self, p: impl Fn(&StateData, UserId) -> bool + Send + 'static) -> Self {
        self.user_filters.push(Box::new(p));
        self
    }

    pub fn filter_channels(mut self, p: impl Fn(&Channel) -> bool + Send + 'static) -> Self {
        self.channel_filters.push(Box::new(p));
        self
    }

    pub fn filter_channel_users(
        mut self,
        p: impl Fn(&Channel, &Membership) -> bool + Send + 'static,
    ) -> Self {
        self.channel_user_filters.push(Box::new(p));
        self
    }

    /// Resolves the target against `data`, computing:
    /// `users ∪ {m : c ∈ channels, channelFilters all pass(c), m ∈ c.members,
    /// channelUserFilters all pass(c,m)}`, then filtering by `userFilters`.
    pub fn materialize(&self, data: &StateData) -> Vec<UserId> {
        let mut out: Vec<UserId> = Vec::new();
        let mut seen = std::collections::HashSet::new();

        let mut push = |out: &mut Vec<UserId>, seen: &mut std::collections::HashSet<UserId>, u: UserId| {
            if seen.insert(u) {
                out.push(u);
            }
        };

        for source in &self.sources {
            match source {
                Source::User(u) => push(&mut out, &mut seen, *u),
                Source::ChannelMask(name) => {
                    if let Some(chan) = data.channels.get(name) {
                        if self.channel_filters.iter().all(|f| f(chan)) {
                            for (member, membership) in &chan.members {
                                if self.channel_user_filters.iter().all(|f| f(chan, membership)) {
                                    push(&mut out, &mut seen, *member);
                                }
                            }
                        }
                    }
                }
                Source::Watchers { user, include_self } => {
                    if *include_self {
                        push(&mut out, &mut seen, *user);
                    }
                    if let Some(u) = data.users.get(user) {
                        for channel_name in &u.channels {
                            if let Some(chan) = data.channels.get(channel_name) {
                                if self.channel_filters.iter().all(|f| f(chan)) {
                                    for (member, membership) in &chan.members {
                                        if *member == *user && !*include_self {
                                            continue;
                                        }
                                        if self.channel_user_filters.iter().all(|f| f(chan, membership)) {
                                            push(&mut out, &mut seen, *member);
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        for u in &self.include {
            push(&mut out, &mut seen, *u);
        }

        out.retain(|u| !self.exclude.contains(u));
        out.retain(|u| self.user_filters.iter().all(|f| f(data, *u)));
        out
    }
}
