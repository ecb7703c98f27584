//! The authoritative server-side state machine.
//!
//! Grounded on the teacher's `Db`/`Shared` split (a `HashMap` store behind
//! an async mutex, mutated by short-lived command handlers) and on
//! `other_examples/45f2812a_delthas-ellidri__src-state-mod.rs.rs`'s
//! `State(Arc<Mutex<StateInner>>)` wrapper, generalized from a key-value
//! store to the user/channel/membership model spec.md §4.4 describes.
//! Every mutator takes an explicit [`tx::Tx`] and records a compensation
//! for each primitive edit, per spec.md §9's "thread-local transaction
//! context → explicit handle" design note.

pub mod channel;
pub mod membership;
pub mod target;
pub mod tx;
pub mod user;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::instrument;

use crate::config::ServerConfig;
use crate::error::StateError;
use channel::{Channel, Topic, TopicSetter};
use membership::{Membership, MembershipMode};
use target::MessageTarget;
use tx::Tx;
use user::{ConnId, ConnectionState, User, UserId};

/// The data actually guarded by [`ServerState`]'s mutex. Split out so
/// that [`tx::Tx`] compensations can close over `&mut StateData` without
/// needing to re-enter the async lock.
pub struct StateData {
    pub config: ServerConfig,
    pub users: HashMap<UserId, User>,
    pub users_by_nickname: HashMap<String, UserId>,
    pub users_by_conn: HashMap<ConnId, UserId>,
    pub channels: HashMap<String, Channel>,
    next_user_id: u64,
}

impl StateData {
    fn fold_nick(&self, nick: &str) -> String {
        self.config.case_mapping.normalize(crate::casemap::NameKind::Nickname, nick)
    }

    fn fold_channel(&self, name: &str) -> String {
        self.config.case_mapping.normalize(crate::casemap::NameKind::Channel, name)
    }

    fn user_mut(&mut self, conn: ConnId) -> Result<&mut User, StateError> {
        let id = *self.users_by_conn.get(&conn).ok_or(StateError::NotRegistered)?;
        Ok(self.users.get_mut(&id).expect("users_by_conn points at a live user"))
    }

    fn user(&self, conn: ConnId) -> Result<&User, StateError> {
        let id = *self.users_by_conn.get(&conn).ok_or(StateError::NotRegistered)?;
        Ok(self.users.get(&id).expect("users_by_conn points at a live user"))
    }
}

/// One `+`/`-` mode-letter change parsed from a `MODE` command line, with
/// its argument if the letter takes one. See spec.md §4.4's channel mode
/// letters: `i`/`m`/`n`/`s`/`t` (flags, no arg), `k`/`l` (key/limit, arg
/// only when setting), `b`/`e`/`I` (mask lists, arg always), `o`/`v`/`h`/
/// `a`/`q` (membership grants, arg always).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeChange {
    pub add: bool,
    pub letter: char,
    pub arg: Option<String>,
}

/// Parses a classic `+ov-b`-style modestring against the trailing
/// parameter list: each letter that always takes an argument consumes the
/// next unconsumed parameter; `k`/`l` consume one only while adding.
pub fn parse_mode_changes(modestring: &str, args: &[String]) -> Vec<ModeChange> {
    let mut changes = Vec::new();
    let mut add = true;
    let mut args = args.iter();
    for letter in modestring.chars() {
        match letter {
            '+' => add = true,
            '-' => add = false,
            'o' | 'v' | 'h' | 'a' | 'q' | 'b' | 'e' | 'I' => {
                changes.push(ModeChange { add, letter, arg: args.next().cloned() });
            }
            'k' | 'l' if add => {
                changes.push(ModeChange { add, letter, arg: args.next().cloned() });
            }
            _ => changes.push(ModeChange { add, letter, arg: None }),
        }
    }
    changes
}

/// Validates a nickname against `^[a-z]+[a-z0-9_-]*$` (case-insensitively)
/// and rejects channel-type prefix characters, per spec.md §4.4.
fn is_valid_nickname(nick: &str, channel_types: &[char]) -> bool {
    let mut chars = nick.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() && !channel_types.contains(&c) => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Validates a channel name body: non-empty, free of spaces, commas,
/// colons, and control characters, within the configured length.
fn is_valid_channel_body(body: &str, max_len: usize) -> bool {
    !body.is_empty()
        && body.len() <= max_len
        && body.chars().all(|c| !c.is_whitespace() && c != ',' && c != ':' && c != '\u{7}')
}

/// Handle to the single authoritative copy of server state. Cheap to
/// clone; every clone shares the same guarded data, matching spec.md
/// §5's single-writer requirement for `ServerState`.
#[derive(Clone)]
pub struct ServerState {
    data: Arc<Mutex<StateData>>,
}

impl ServerState {
    pub fn new(config: ServerConfig) -> ServerState {
        ServerState {
            data: Arc::new(Mutex::new(StateData {
                config,
                users: HashMap::new(),
                users_by_nickname: HashMap::new(),
                users_by_conn: HashMap::new(),
                channels: HashMap::new(),
                next_user_id: 1,
            })),
        }
    }

    /// Runs `f` with exclusive access to the guarded [`StateData`],
    /// rolling back `f`'s transaction on failure and committing on
    /// success. This is the single entry point every public operation
    /// below funnels through.
    async fn transact<T>(
        &self,
        f: impl FnOnce(&mut StateData, &mut Tx) -> Result<T, StateError>,
    ) -> Result<T, StateError> {
        let mut data = self.data.lock().await;
        let mut tx = Tx::new();
        match f(&mut data, &mut tx) {
            Ok(value) => {
                tx.commit();
                Ok(value)
            }
            Err(err) => {
                tx.rollback(&mut data);
                Err(err)
            }
        }
    }

    /// Registers a new, anonymous user for a freshly accepted connection.
    /// Cannot fail: this only ever adds, never overwrites, state.
    #[instrument(skip(self))]
    pub async fn connect(&self, conn: ConnId, host_address: String) -> UserId {
        let mut data = self.data.lock().await;
        let id = UserId(data.next_user_id);
        data.next_user_id += 1;
        let mut user = User::new(id, conn, host_address, Instant::now());
        if data.config.password.is_none() {
            user.password_accepted = true;
        }
        data.users.insert(id, user);
        data.users_by_conn.insert(conn, id);
        id
    }

    /// Removes `conn`'s user entirely: parts every joined channel
    /// (freezing any live topic-setter references) and drops the
    /// nickname/connection index entries. Not itself transactional —
    /// there is no failure path, and by the time a connection
    /// disconnects there is nothing left to roll back to.
    #[instrument(skip(self))]
    pub async fn quit(&self, conn: ConnId, message: Option<String>) -> Vec<String> {
        let mut data = self.data.lock().await;
        let Some(&id) = data.users_by_conn.get(&conn) else {
            return Vec::new();
        };
        let mut affected = Vec::new();
        if let Some(user) = data.users.get_mut(&id) {
            user.quit_message = message;
            user.state = ConnectionState::Quitting;
        }
        let channels = data.users.get(&id).map(|u| u.channels.clone()).unwrap_or_default();
        let nick = data.users.get(&id).and_then(|u| u.nickname.clone()).unwrap_or_default();
        for channel_name in channels {
            if let Some(chan) = data.channels.get_mut(&channel_name) {
                chan.members.remove(&id);
                chan.freeze_topic_setter_if(id, &nick);
                affected.push(channel_name.clone());
                if chan.is_empty() {
                    data.channels.remove(&channel_name);
                }
            }
        }
        if let Some(user) = data.users.get(&id) {
            if let Some(nick) = &user.nickname {
                let folded = data.fold_nick(nick);
                data.users_by_nickname.remove(&folded);
            }
        }
        data.users_by_conn.remove(&conn);
        data.users.remove(&id);
        affected
    }

    #[instrument(skip(self, pw))]
    pub async fn check_password(&self, conn: ConnId, pw: &str) -> Result<(), StateError> {
        self.transact(|data, tx| {
            let expected = data.config.password.clone();
            let user = data.user_mut(conn)?;
            if user.is_registered() {
                return Err(StateError::AlreadyRegistered);
            }
            match &expected {
                Some(expected) if expected != pw => Err(StateError::InvalidPassword),
                _ => {
                    user.password_accepted = true;
                    let conn = conn;
                    tx.record(move |data| {
                        if let Ok(user) = data.user_mut(conn) {
                            user.password_accepted = false;
                        }
                    });
                    Ok(())
                }
            }
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn set_user_info(
        &self,
        conn: ConnId,
        username: &str,
        real_name: &str,
    ) -> Result<(), StateError> {
        let username = username.to_string();
        let real_name = real_name.to_string();
        self.transact(move |data, tx| {
            let user_len = data.config.user_length;
            let real_len = data.config.real_name_max_length;
            let user = data.user_mut(conn)?;
            if !user.password_accepted {
                return Err(StateError::NotRegistered);
            }
            let prev_username = user.username.clone();
            let prev_real_name = user.real_name.clone();
            user.username = Some(truncate(&username, user_len));
            user.real_name = Some(truncate(&real_name, real_len));
            tx.record(move |data| {
                if let Ok(user) = data.user_mut(conn) {
                    user.username = prev_username;
                    user.real_name = prev_real_name;
                }
            });
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn set_nickname(&self, conn: ConnId, nick: &str) -> Result<(), StateError> {
        let requested = nick.to_string();
        self.transact(move |data, tx| {
            let channel_types = data.config.channel_types.clone();
            let nick_len = data.config.nick_length;
            if !is_valid_nickname(&requested, &channel_types) {
                return Err(StateError::ErroneousNickname(requested.clone()));
            }
            let truncated = truncate(&requested, nick_len);
            let folded = data.fold_nick(&truncated);

            let id = *data.users_by_conn.get(&conn).ok_or(StateError::NotRegistered)?;

            if let Some(prev) = &data.users.get(&id).unwrap().nickname {
                if data.fold_nick(prev) == folded {
                    return Err(StateError::NoOp);
                }
            }

            if let Some(&holder) = data.users_by_nickname.get(&folded) {
                if holder != id {
                    return Err(StateError::NicknameInUse(truncated));
                }
            }

            let prev_nick = data.users.get(&id).unwrap().nickname.clone();
            let prev_folded = prev_nick.as_ref().map(|n| data.fold_nick(n));

            if let Some(prev_folded) = &prev_folded {
                data.users_by_nickname.remove(prev_folded);
            }
            data.users_by_nickname.insert(folded, id);
            data.users.get_mut(&id).unwrap().nickname = Some(truncated);

            tx.record(move |data| {
                if let Some(user) = data.users.get_mut(&id) {
                    if let Some(nick) = &user.nickname {
                        let folded = data.config.case_mapping.normalize(crate::casemap::NameKind::Nickname, nick);
                        data.users_by_nickname.remove(&folded);
                    }
                    user.nickname = prev_nick.clone();
                }
                if let (Some(prev_nick), Some(prev_folded)) = (&prev_nick, &prev_folded) {
                    let _ = prev_nick;
                    data.users_by_nickname.insert(prev_folded.clone(), id);
                }
            });

            Ok(())
        })
        .await
    }

    /// Atomically advances `NEW -> REGISTERED` iff password entered, not
    /// negotiating capabilities, and nickname/username/realname all set.
    /// Returns whether registration actually completed (not completing
    /// is not a failure: the client may still be mid-handshake).
    #[instrument(skip(self))]
    pub async fn try_finish_registration(&self, conn: ConnId) -> Result<bool, StateError> {
        self.transact(move |data, tx| {
            let user = data.user_mut(conn)?;
            let ready = user.password_accepted
                && !user.negotiating_capabilities
                && user.nickname.is_some()
                && user.username.is_some()
                && user.real_name.is_some()
                && user.state == ConnectionState::New;
            if !ready {
                return Ok(false);
            }
            user.state = ConnectionState::Registered;
            tx.record(move |data| {
                if let Ok(user) = data.user_mut(conn) {
                    user.state = ConnectionState::New;
                }
            });
            Ok(true)
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn join_channel(&self, conn: ConnId, name: &str, key: Option<&str>) -> Result<(), StateError> {
        let requested = name.to_string();
        let key = key.map(|k| k.to_string());
        self.transact(move |data, tx| {
            let prefix = requested.chars().next().ok_or_else(|| StateError::BadChannelMask(requested.clone()))?;
            if !data.config.is_channel_prefix(prefix) {
                return Err(StateError::BadChannelMask(requested.clone()));
            }
            let body = &requested[prefix.len_utf8()..];
            if !is_valid_channel_body(body, data.config.channel_name_max_length) {
                return Err(StateError::BadChannelMask(requested.clone()));
            }

            let user_id = *data.users_by_conn.get(&conn).ok_or(StateError::NotRegistered)?;
            let canonical = data.fold_channel(&requested);
            let mask = data.users.get(&user_id).unwrap().mask();

            let created = !data.channels.contains_key(&canonical);
            if created {
                let mut chan = Channel::new(canonical.clone(), Instant::now());
                chan.client_limit = data.config.channel_limit_for(prefix);
                data.channels.insert(canonical.clone(), chan);
            }

            {
                let chan = data.channels.get(&canonical).unwrap();
                if let Some(configured_key) = &chan.key {
                    if key.as_deref() != Some(configured_key.as_str()) {
                        if created {
                            data.channels.remove(&canonical);
                        }
                        return Err(StateError::BadChannelKey(requested.clone()));
                    }
                }
                if chan.is_banned(&mask) {
                    if created {
                        data.channels.remove(&canonical);
                    }
                    return Err(StateError::BannedFromChannel(requested.clone()));
                }
                if chan.flags.invite_only && !chan.is_invited(user_id, &mask) {
                    if created {
                        data.channels.remove(&canonical);
                    }
                    return Err(StateError::InviteOnlyChannel(requested.clone()));
                }
                if !created && chan.at_client_limit() {
                    return Err(StateError::ChannelIsFull(requested.clone()));
                }
            }

            let membership = if created { Membership::with_mode(MembershipMode::Op) } else { Membership::new() };
            data.channels.get_mut(&canonical).unwrap().members.insert(user_id, membership);
            data.users.get_mut(&user_id).unwrap().add_channel(&canonical);

            let canonical_for_undo = canonical.clone();
            tx.record(move |data| {
                if let Some(chan) = data.channels.get_mut(&canonical_for_undo) {
                    chan.members.remove(&user_id);
                    if chan.is_empty() {
                        data.channels.remove(&canonical_for_undo);
                    }
                }
                if let Some(user) = data.users.get_mut(&user_id) {
                    user.remove_channel(&canonical_for_undo);
                }
            });

            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn part_channel(&self, conn: ConnId, name: &str) -> Result<(), StateError> {
        let requested = name.to_string();
        self.transact(move |data, tx| {
            let user_id = *data.users_by_conn.get(&conn).ok_or(StateError::NotRegistered)?;
            let canonical = data.fold_channel(&requested);

            let Some(chan) = data.channels.get(&canonical) else {
                return Err(StateError::NoSuchChannel(requested.clone()));
            };
            let Some(membership) = chan.members.get(&user_id).cloned() else {
                return Err(StateError::NotOnChannel(requested.clone()));
            };

            let nick = data.users.get(&user_id).unwrap().nickname.clone().unwrap_or_default();
            let chan = data.channels.get_mut(&canonical).unwrap();
            chan.members.remove(&user_id);
            chan.freeze_topic_setter_if(user_id, &nick);
            let became_empty = chan.is_empty();
            if became_empty {
                data.channels.remove(&canonical);
            }
            data.users.get_mut(&user_id).unwrap().remove_channel(&canonical);

            let canonical_for_undo = canonical.clone();
            tx.record(move |data| {
                let chan = data
                    .channels
                    .entry(canonical_for_undo.clone())
                    .or_insert_with(|| Channel::new(canonical_for_undo.clone(), Instant::now()));
                chan.members.insert(user_id, membership.clone());
                if let Some(user) = data.users.get_mut(&user_id) {
                    user.add_channel(&canonical_for_undo);
                }
            });

            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn set_channel_topic(&self, conn: ConnId, name: &str, topic: &str) -> Result<(), StateError> {
        let requested = name.to_string();
        let topic_text = topic.to_string();
        self.transact(move |data, tx| {
            let user_id = *data.users_by_conn.get(&conn).ok_or(StateError::NotRegistered)?;
            let canonical = data.fold_channel(&requested);

            let Some(chan) = data.channels.get(&canonical) else {
                return Err(StateError::NoSuchChannel(requested.clone()));
            };
            let Some(membership) = chan.members.get(&user_id) else {
                return Err(StateError::NotOnChannel(requested.clone()));
            };
            if chan.flags.protected_topic && !membership.can_grant(MembershipMode::HalfOp) {
                return Err(StateError::NotChannelOperator(requested.clone()));
            }

            let prev_topic = chan.topic.clone();
            let chan = data.channels.get_mut(&canonical).unwrap();
            chan.topic = Some(Topic { text: topic_text.clone(), set_by: TopicSetter::Live(user_id), set_at: Instant::now() });

            let canonical_for_undo = canonical.clone();
            tx.record(move |data| {
                if let Some(chan) = data.channels.get_mut(&canonical_for_undo) {
                    chan.topic = prev_topic.clone();
                }
            });

            Ok(())
        })
        .await
    }

    /// Applies a batch of parsed `MODE` changes to a channel. The issuer
    /// must hold at least `Op` to change anything; a membership grant
    /// additionally requires `can_grant(target_mode)` and is silently
    /// skipped (not an error) if the issuer's own mode is too low or the
    /// named nickname isn't a member, matching real servers' handling of
    /// a partially-authorized multi-letter `MODE` command.
    #[instrument(skip(self, changes))]
    pub async fn set_channel_mode(&self, conn: ConnId, name: &str, changes: &[ModeChange]) -> Result<(), StateError> {
        let requested = name.to_string();
        let changes = changes.to_vec();
        self.transact(move |data, tx| {
            let user_id = *data.users_by_conn.get(&conn).ok_or(StateError::NotRegistered)?;
            let canonical = data.fold_channel(&requested);

            let chan = data.channels.get(&canonical).ok_or_else(|| StateError::NoSuchChannel(requested.clone()))?;
            let issuer = chan.members.get(&user_id).cloned().ok_or_else(|| StateError::NotOnChannel(requested.clone()))?;
            if !issuer.can_grant(MembershipMode::Op) {
                return Err(StateError::NotChannelOperator(requested.clone()));
            }

            let before = chan.clone();

            for change in &changes {
                if let Some(mode) = MembershipMode::from_letter(change.letter) {
                    if !issuer.can_grant(mode) {
                        continue;
                    }
                    let Some(nick) = &change.arg else { continue };
                    let folded = data.fold_nick(nick);
                    let Some(&target_user) = data.users_by_nickname.get(&folded) else { continue };
                    let Some(chan) = data.channels.get_mut(&canonical) else { continue };
                    let Some(target_membership) = chan.members.get_mut(&target_user) else { continue };
                    if change.add {
                        target_membership.grant(mode);
                    } else {
                        target_membership.revoke(mode);
                    }
                    continue;
                }

                let chan = data.channels.get_mut(&canonical).unwrap();
                match change.letter {
                    'i' => chan.flags.invite_only = change.add,
                    'm' => chan.flags.moderated = change.add,
                    'n' => chan.flags.no_external_messages = change.add,
                    's' => chan.flags.secret = change.add,
                    't' => chan.flags.protected_topic = change.add,
                    'k' => chan.key = if change.add { change.arg.clone() } else { None },
                    'l' => {
                        chan.client_limit = if change.add { change.arg.as_deref().and_then(|n| n.parse().ok()) } else { None };
                    }
                    'b' => apply_mask_list(&mut chan.bans, change),
                    'e' => apply_mask_list(&mut chan.excepts, change),
                    'I' => apply_mask_list(&mut chan.invex, change),
                    _ => {}
                }
            }

            let canonical_for_undo = canonical.clone();
            tx.record(move |data| {
                if let Some(chan) = data.channels.get_mut(&canonical_for_undo) {
                    *chan = before.clone();
                }
            });

            Ok(())
        })
        .await
    }

    /// Resolves a `PRIVMSG`/`NOTICE` mask to a [`MessageTarget`],
    /// enforcing spec.md §4.4's channel policy flags: `moderated`
    /// ("non-voiced, non-op users blocked from speaking") and
    /// `no-external-messages` ("only members may send"). Fails with
    /// `CannotSendToChannel` if the caller isn't allowed to post.
    #[instrument(skip(self))]
    pub async fn resolve_privmsg_target(&self, conn: ConnId, mask: &str) -> Result<MessageTarget, StateError> {
        let requested = mask.to_string();
        let data = self.data.lock().await;
        let user_id = *data.users_by_conn.get(&conn).ok_or(StateError::NotRegistered)?;

        if let Some(prefix) = requested.chars().next() {
            if data.config.is_channel_prefix(prefix) {
                let canonical = data.fold_channel(&requested);
                let chan = data.channels.get(&canonical).ok_or_else(|| StateError::NoSuchChannel(requested.clone()))?;
                let is_member = chan.members.contains_key(&user_id);

                // Materializing the channel through `filter_channel_users`
                // tells us whether `user_id`, as a current member, clears
                // the moderation bar (voice or higher when moderated).
                let cleared_moderation = MessageTarget::channel(canonical.clone())
                    .filter_channel_users(|chan, membership| !chan.flags.moderated || membership.is_voiced_or_higher())
                    .materialize(&data)
                    .contains(&user_id);

                let may_speak = if is_member { cleared_moderation } else { !chan.flags.no_external_messages };
                if !may_speak {
                    return Err(StateError::CannotSendToChannel(requested));
                }

                return Ok(MessageTarget::channel(canonical).exclude(user_id));
            }
        }

        let folded = data.fold_nick(&requested);
        let target = data.users_by_nickname.get(&folded).copied().ok_or_else(|| StateError::NoSuchNick(requested.clone()))?;
        Ok(MessageTarget::nickname(target))
    }

    /// Records that a `PONG` was just received from `conn`'s user.
    /// Not transactional: liveness bookkeeping isn't rolled back by
    /// anything, and there is no failure path.
    pub async fn touch_pong(&self, conn: ConnId) {
        let mut data = self.data.lock().await;
        if let Ok(user) = data.user_mut(conn) {
            user.last_pong_at = Some(Instant::now());
        }
    }

    /// Runs `f` with read-only access to the guarded state, e.g. to
    /// materialize a [`target::MessageTarget`] or build a `NAMES` reply.
    pub async fn with_data<T>(&self, f: impl FnOnce(&StateData) -> T) -> T {
        let data = self.data.lock().await;
        f(&data)
    }
}

/// Adds or removes `change`'s mask argument from a ban/except/invex list,
/// used by `set_channel_mode` for the `b`/`e`/`I` mode letters.
fn apply_mask_list(list: &mut Vec<String>, change: &ModeChange) {
    let Some(mask) = &change.arg else { return };
    if change.add {
        if !list.contains(mask) {
            list.push(mask.clone());
        }
    } else {
        list.retain(|m| m != mask);
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        s.chars().take(max_len).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    fn fresh_state() -> ServerState {
        ServerState::new(ServerConfig::default())
    }

    #[tokio::test]
    async fn nickname_must_be_unique_case_folded() {
        let state = fresh_state();
        state.connect(1, "host-a".into()).await;
        state.connect(2, "host-b".into()).await;
        state.set_nickname(1, "alice").await.unwrap();
        let err = state.set_nickname(2, "Alice").await.unwrap_err();
        assert_eq!(err, StateError::NicknameInUse("Alice".to_string()));
    }

    #[tokio::test]
    async fn renaming_to_the_same_nickname_is_a_noop() {
        let state = fresh_state();
        state.connect(1, "host-a".into()).await;
        state.set_nickname(1, "alice").await.unwrap();
        let err = state.set_nickname(1, "alice").await.unwrap_err();
        assert_eq!(err, StateError::NoOp);
    }

    #[tokio::test]
    async fn failed_nick_change_leaves_state_untouched() {
        let state = fresh_state();
        state.connect(1, "host-a".into()).await;
        state.connect(2, "host-b".into()).await;
        state.set_nickname(1, "alice").await.unwrap();
        state.set_nickname(2, "bob").await.unwrap();

        let err = state.set_nickname(1, "bob").await.unwrap_err();
        assert_eq!(err, StateError::NicknameInUse("bob".to_string()));

        state
            .with_data(|data| {
                assert_eq!(data.users.get(&UserId(1)).unwrap().nickname.as_deref(), Some("alice"));
                assert_eq!(data.users.get(&UserId(2)).unwrap().nickname.as_deref(), Some("bob"));
                assert_eq!(data.users_by_nickname.len(), 2);
            })
            .await;
    }

    #[tokio::test]
    async fn join_then_part_removes_empty_channel() {
        let state = fresh_state();
        state.connect(1, "host-a".into()).await;
        state.set_nickname(1, "alice").await.unwrap();
        state.join_channel(1, "#rust", None).await.unwrap();
        state.with_data(|data| assert!(data.channels.contains_key("#rust"))).await;
        state.part_channel(1, "#rust").await.unwrap();
        state.with_data(|data| assert!(!data.channels.contains_key("#rust"))).await;
    }

    #[tokio::test]
    async fn part_channel_not_a_member_fails() {
        let state = fresh_state();
        state.connect(1, "host-a".into()).await;
        state.connect(2, "host-b".into()).await;
        state.set_nickname(1, "alice").await.unwrap();
        state.set_nickname(2, "bob").await.unwrap();
        state.join_channel(1, "#rust", None).await.unwrap();
        let err = state.part_channel(2, "#rust").await.unwrap_err();
        assert_eq!(err, StateError::NotOnChannel("#rust".to_string()));
    }

    #[tokio::test]
    async fn resolve_privmsg_target_channel_excludes_caller() {
        let state = fresh_state();
        state.connect(1, "host-a".into()).await;
        state.connect(2, "host-b".into()).await;
        state.set_nickname(1, "alice").await.unwrap();
        state.set_nickname(2, "bob").await.unwrap();
        state.join_channel(1, "#rust", None).await.unwrap();
        state.join_channel(2, "#rust", None).await.unwrap();
        let target = state.resolve_privmsg_target(1, "#rust").await.unwrap();
        let recipients = state.with_data(|data| target.materialize(data)).await;
        assert_eq!(recipients, vec![UserId(2)]);
    }

    #[tokio::test]
    async fn resolve_privmsg_target_rejects_unvoiced_in_moderated_channel() {
        let state = fresh_state();
        state.connect(1, "host-a".into()).await;
        state.connect(2, "host-b".into()).await;
        state.set_nickname(1, "alice").await.unwrap();
        state.set_nickname(2, "bob").await.unwrap();
        state.join_channel(1, "#rust", None).await.unwrap();
        state.join_channel(2, "#rust", None).await.unwrap();
        state
            .transact(|data, _tx| {
                data.channels.get_mut("#rust").unwrap().flags.moderated = true;
                Ok::<(), StateError>(())
            })
            .await
            .unwrap();

        let err = state.resolve_privmsg_target(2, "#rust").await.unwrap_err();
        assert_eq!(err, StateError::CannotSendToChannel("#rust".to_string()));
    }

    #[tokio::test]
    async fn resolve_privmsg_target_rejects_non_member_when_no_external_messages() {
        let state = fresh_state();
        state.connect(1, "host-a".into()).await;
        state.connect(2, "host-b".into()).await;
        state.set_nickname(1, "alice").await.unwrap();
        state.set_nickname(2, "bob").await.unwrap();
        state.join_channel(1, "#rust", None).await.unwrap();
        state
            .transact(|data, _tx| {
                data.channels.get_mut("#rust").unwrap().flags.no_external_messages = true;
                Ok::<(), StateError>(())
            })
            .await
            .unwrap();

        let err = state.resolve_privmsg_target(2, "#rust").await.unwrap_err();
        assert_eq!(err, StateError::CannotSendToChannel("#rust".to_string()));
    }

    #[test]
    fn parse_mode_changes_tracks_sign_and_args() {
        let args = vec!["alice".to_string(), "secret".to_string()];
        let changes = parse_mode_changes("+ok-m", &args);
        assert_eq!(
            changes,
            vec![
                ModeChange { add: true, letter: 'o', arg: Some("alice".to_string()) },
                ModeChange { add: true, letter: 'k', arg: Some("secret".to_string()) },
                ModeChange { add: false, letter: 'm', arg: None },
            ]
        );
    }

    #[test]
    fn parse_mode_changes_does_not_consume_arg_for_unset_key() {
        let changes = parse_mode_changes("-k", &[]);
        assert_eq!(changes, vec![ModeChange { add: false, letter: 'k', arg: None }]);
    }

    #[tokio::test]
    async fn set_channel_mode_requires_operator() {
        let state = fresh_state();
        state.connect(1, "host-a".into()).await;
        state.connect(2, "host-b".into()).await;
        state.set_nickname(1, "alice").await.unwrap();
        state.set_nickname(2, "bob").await.unwrap();
        state.join_channel(1, "#rust", None).await.unwrap();
        state.join_channel(2, "#rust", None).await.unwrap();

        let changes = vec![ModeChange { add: true, letter: 'm', arg: None }];
        let err = state.set_channel_mode(2, "#rust", &changes).await.unwrap_err();
        assert_eq!(err, StateError::NotChannelOperator("#rust".to_string()));
    }

    #[tokio::test]
    async fn set_channel_mode_flips_flags() {
        let state = fresh_state();
        state.connect(1, "host-a".into()).await;
        state.set_nickname(1, "alice").await.unwrap();
        state.join_channel(1, "#rust", None).await.unwrap();

        let changes = vec![
            ModeChange { add: true, letter: 'm', arg: None },
            ModeChange { add: true, letter: 's', arg: None },
        ];
        state.set_channel_mode(1, "#rust", &changes).await.unwrap();
        state
            .with_data(|data| {
                let chan = data.channels.get("#rust").unwrap();
                assert!(chan.flags.moderated);
                assert!(chan.flags.secret);
            })
            .await;
    }

    #[tokio::test]
    async fn set_channel_mode_grants_membership() {
        let state = fresh_state();
        state.connect(1, "host-a".into()).await;
        state.connect(2, "host-b".into()).await;
        state.set_nickname(1, "alice").await.unwrap();
        state.set_nickname(2, "bob").await.unwrap();
        state.join_channel(1, "#rust", None).await.unwrap();
        state.join_channel(2, "#rust", None).await.unwrap();

        let changes = vec![ModeChange { add: true, letter: 'v', arg: Some("bob".to_string()) }];
        state.set_channel_mode(1, "#rust", &changes).await.unwrap();
        state
            .with_data(|data| {
                let chan = data.channels.get("#rust").unwrap();
                let bob = chan.members.get(&UserId(2)).unwrap();
                assert!(bob.has(MembershipMode::Voice));
            })
            .await;
    }

    #[tokio::test]
    async fn set_channel_mode_skips_grant_above_issuer_precedence() {
        let state = fresh_state();
        state.connect(1, "host-a".into()).await;
        state.connect(2, "host-b".into()).await;
        state.set_nickname(1, "alice").await.unwrap();
        state.set_nickname(2, "bob").await.unwrap();
        state.join_channel(1, "#rust", None).await.unwrap();
        state.join_channel(2, "#rust", None).await.unwrap();

        // Alice is Op (channel founder); granting +a (Admin) is above her
        // own precedence, so the change applies to the flags that follow
        // but silently skips the grant.
        let changes = vec![
            ModeChange { add: true, letter: 'a', arg: Some("bob".to_string()) },
            ModeChange { add: true, letter: 's', arg: None },
        ];
        state.set_channel_mode(1, "#rust", &changes).await.unwrap();
        state
            .with_data(|data| {
                let chan = data.channels.get("#rust").unwrap();
                assert!(!chan.members.get(&UserId(2)).unwrap().has(MembershipMode::Admin));
                assert!(chan.flags.secret);
            })
            .await;
    }
}
