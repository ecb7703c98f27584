//! Routes parsed commands for one connection to [`crate::state::ServerState`]
//! and emits replies to one or many recipients.
//!
//! See spec.md §4.6. Enforces the registration gate (only `PASS`, `NICK`,
//! `USER`, `CAP`, `QUIT`, `PING`, `PONG` before registration), routes
//! `PRIVMSG`/`NOTICE` through `resolveMask`, and runs the idle-ping
//! sweeper. Grounded on the teacher's `cmd::Command::apply` dispatch
//! (one match arm per command, each given a `&Db` and a `&mut Connection`)
//! generalized to IRC verbs and a [`crate::state::ServerState`] handle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{info, instrument, warn};

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::StateError;
use crate::message::{Command as WireCommand, Message, Prefix};
use crate::numeric::NumericReply;
use crate::protocol_dsl::{ParamPlan, Slot};
use crate::state::target::MessageTarget;
use crate::state::user::{ConnId, UserId};
use crate::state::{parse_mode_changes, ServerState};

const PRE_REGISTRATION_COMMANDS: &[&str] = &["PASS", "NICK", "USER", "CAP", "QUIT", "PING", "PONG"];

/// Ties together server state, the set of live connections, and the
/// configuration every handler needs (server name, limits).
#[derive(Clone)]
pub struct Dispatcher {
    state: ServerState,
    connections: Arc<RwLock<HashMap<ConnId, Connection>>>,
    config: ServerConfig,
}

impl Dispatcher {
    pub fn new(state: ServerState, config: ServerConfig) -> Dispatcher {
        Dispatcher { state, connections: Arc::new(RwLock::new(HashMap::new())), config }
    }

    pub async fn register_connection(&self, conn_id: ConnId, connection: Connection) {
        self.connections.write().await.insert(conn_id, connection);
        self.state.connect(conn_id, "0.0.0.0".to_string()).await;
    }

    /// Handles one ingress line for `conn_id`. Installed as the
    /// connection's [`crate::connection::IngressHandler`].
    #[instrument(skip(self, line))]
    pub async fn handle_line(&self, conn_id: ConnId, line: String) -> crate::Result<()> {
        let message = match Message::parse(&line) {
            Ok(m) => m,
            Err(err) => {
                warn!(%err, "dropping malformed line");
                return Ok(());
            }
        };

        let verb = message.command.as_str().to_string();
        if !self.is_registered(conn_id).await && !PRE_REGISTRATION_COMMANDS.contains(&verb.as_str()) {
            self.send_numeric(conn_id, NumericReply::err_notregistered()).await;
            return Ok(());
        }

        match verb.as_str() {
            "PASS" => self.handle_pass(conn_id, &message).await,
            "NICK" => self.handle_nick(conn_id, &message).await,
            "USER" => self.handle_user(conn_id, &message).await,
            "CAP" => self.handle_cap(conn_id, &message).await,
            "PING" => self.handle_ping(conn_id, &message).await,
            "PONG" => self.handle_pong(conn_id).await,
            "QUIT" => self.handle_quit(conn_id, &message).await,
            "JOIN" => self.handle_join(conn_id, &message).await,
            "PART" => self.handle_part(conn_id, &message).await,
            "TOPIC" => self.handle_topic(conn_id, &message).await,
            "MODE" => self.handle_mode(conn_id, &message).await,
            "PRIVMSG" => self.handle_privmsg(conn_id, &message, false).await,
            "NOTICE" => self.handle_privmsg(conn_id, &message, true).await,
            _ => {}
        }

        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn handle_disconnect(&self, conn_id: ConnId) {
        let mask = self.mask_of(conn_id).await.unwrap_or_default();
        let affected_channels = self.state.quit(conn_id, None).await;
        self.connections.write().await.remove(&conn_id);
        self.announce_quit(&mask, None, &affected_channels).await;
    }

    async fn is_registered(&self, conn_id: ConnId) -> bool {
        self.state
            .with_data(|data| {
                data.users_by_conn
                    .get(&conn_id)
                    .and_then(|id| data.users.get(id))
                    .map(|u| u.is_registered())
                    .unwrap_or(false)
            })
            .await
    }

    async fn handle_pass(&self, conn_id: ConnId, message: &Message) {
        let Some(pw) = message.all_params().first().map(|s| s.to_string()) else {
            self.send_numeric(conn_id, NumericReply::err_needmoreparams(message.command.as_str())).await;
            return;
        };
        if let Err(err) = self.state.check_password(conn_id, &pw).await {
            self.send_state_error(conn_id, err).await;
        }
    }

    async fn handle_nick(&self, conn_id: ConnId, message: &Message) {
        let Some(nick) = message.all_params().first().map(|s| s.to_string()) else {
            self.send_numeric(conn_id, NumericReply::err_needmoreparams(message.command.as_str())).await;
            return;
        };
        match self.state.set_nickname(conn_id, &nick).await {
            Ok(()) => self.maybe_finish_registration(conn_id).await,
            Err(StateError::NoOp) => {}
            Err(err) => self.send_state_error(conn_id, err).await,
        }
    }

    async fn handle_user(&self, conn_id: ConnId, message: &Message) {
        let params = message.all_params();
        if params.len() < 4 {
            self.send_numeric(conn_id, NumericReply::err_needmoreparams(message.command.as_str())).await;
            return;
        }
        let username = params[0].to_string();
        let real_name = params[3].to_string();
        match self.state.set_user_info(conn_id, &username, &real_name).await {
            Ok(()) => self.maybe_finish_registration(conn_id).await,
            Err(err) => self.send_state_error(conn_id, err).await,
        }
    }

    async fn handle_cap(&self, _conn_id: ConnId, _message: &Message) {
        // CAP negotiation framing only, per spec.md's non-goal on IRCv3
        // beyond the handshake: LS/LIST/REQ/END are all accepted but no
        // capability is ever actually offered.
    }

    async fn maybe_finish_registration(&self, conn_id: ConnId) {
        match self.state.try_finish_registration(conn_id).await {
            Ok(true) => self.send_welcome_burst(conn_id).await,
            Ok(false) => {}
            Err(err) => self.send_state_error(conn_id, err).await,
        }
    }

    async fn send_welcome_burst(&self, conn_id: ConnId) {
        let nick = self.nickname_of(conn_id).await.unwrap_or_default();
        let user_at_host = self.user_at_host_of(conn_id).await.unwrap_or_default();
        let server_name = self.config.server_name.clone();
        let version = env!("CARGO_PKG_VERSION");

        self.send(conn_id, NumericReply::welcome(&nick, &user_at_host).into_message(&server_name, &nick)).await;
        self.send(conn_id, NumericReply::yourhost(&server_name, version).into_message(&server_name, &nick)).await;
        self.send(conn_id, NumericReply::created("at server start").into_message(&server_name, &nick)).await;
        self.send(conn_id, NumericReply::myinfo(&server_name, version, "i", "beiklmnst").into_message(&server_name, &nick)).await;
        info!(nick, "user registered");
    }

    async fn handle_ping(&self, conn_id: ConnId, message: &Message) {
        let token = message.all_params().first().map(|s| s.to_string()).unwrap_or_default();
        let mut reply = Message::new(WireCommand::Named("PONG".to_string())).with_param(self.config.server_name.clone());
        reply = reply.with_trailing(token);
        self.send_raw(conn_id, reply).await;
    }

    async fn handle_pong(&self, conn_id: ConnId) {
        self.state.touch_pong(conn_id).await;
    }

    async fn handle_quit(&self, conn_id: ConnId, message: &Message) {
        let reason = message.trailing.clone();
        // Capture the mask before `quit` removes the user record.
        let mask = self.mask_of(conn_id).await.unwrap_or_default();
        let affected = self.state.quit(conn_id, reason.clone()).await;
        if let Some(conn) = self.connections.read().await.get(&conn_id) {
            conn.close_deferred();
        }
        self.announce_quit(&mask, reason.as_deref(), &affected).await;
    }

    async fn handle_join(&self, conn_id: ConnId, message: &Message) {
        let params = message.all_params();
        // Two slots: the comma-separated channel list is required, the
        // comma-separated key list is optional and defaults to empty.
        let plan = ParamPlan::new(vec![Slot::required("channels"), Slot::optional_empty("keys")]);
        let Ok(resolved) = plan.resolve(&params) else {
            self.send_numeric(conn_id, NumericReply::err_needmoreparams(message.command.as_str())).await;
            return;
        };
        let Some(channels) = resolved.one(0) else {
            self.send_numeric(conn_id, NumericReply::err_needmoreparams(message.command.as_str())).await;
            return;
        };
        let keys: Vec<String> = resolved.one(1).map(|k| k.split(',').map(str::to_string).collect()).unwrap_or_default();

        for (i, channel_name) in channels.split(',').enumerate() {
            let key = keys.get(i).map(String::as_str);
            match self.state.join_channel(conn_id, channel_name, key).await {
                Ok(()) => self.announce_join(conn_id, channel_name).await,
                Err(err) => self.send_state_error(conn_id, err).await,
            }
        }
    }

    async fn announce_join(&self, conn_id: ConnId, channel_name: &str) {
        let nick = self.nickname_of(conn_id).await.unwrap_or_default();
        let user_id = self.user_id_of(conn_id).await;
        let mask = self.mask_of(conn_id).await.unwrap_or_default();

        let join_line = Message::new(WireCommand::Named("JOIN".to_string()))
            .with_param(channel_name.to_string());
        let mut join_line = join_line;
        join_line.prefix = Some(Prefix::from_mask(&mask));

        if let Some(user_id) = user_id {
            let target = MessageTarget::channel(channel_name.to_string());
            self.send_to_target(&target, join_line).await;
        }

        let server_name = self.config.server_name.clone();
        if let Some(names) = self.names_reply(channel_name).await {
            self.send(conn_id, NumericReply::namreply("=", channel_name, &names).into_message(&server_name, &nick)).await;
        }
        self.send(conn_id, NumericReply::endofnames(channel_name).into_message(&server_name, &nick)).await;
    }

    async fn names_reply(&self, channel_name: &str) -> Option<String> {
        self.state
            .with_data(|data| {
                let chan = data.channels.get(channel_name)?;
                let mut names = Vec::new();
                for (member, membership) in &chan.members {
                    if let Some(user) = data.users.get(member) {
                        let nick = user.nickname.clone().unwrap_or_default();
                        let sigil = membership.highest().map(|m| m.prefix_sigil()).unwrap_or(' ');
                        names.push(format!("{sigil}{nick}").trim_start().to_string());
                    }
                }
                Some(names.join(" "))
            })
            .await
    }

    async fn handle_part(&self, conn_id: ConnId, message: &Message) {
        let params = message.all_params();
        let Some(channels) = params.first() else {
            self.send_numeric(conn_id, NumericReply::err_needmoreparams(message.command.as_str())).await;
            return;
        };
        for channel_name in channels.split(',') {
            let mask = self.mask_of(conn_id).await.unwrap_or_default();
            let mut part_line = Message::new(WireCommand::Named("PART".to_string())).with_param(channel_name.to_string());
            part_line.prefix = Some(Prefix::from_mask(&mask));
            let target = MessageTarget::channel(channel_name.to_string());
            self.send_to_target(&target, part_line).await;

            if let Err(err) = self.state.part_channel(conn_id, channel_name).await {
                self.send_state_error(conn_id, err).await;
            }
        }
    }

    async fn handle_topic(&self, conn_id: ConnId, message: &Message) {
        let params = message.all_params();
        let Some(channel_name) = params.first().map(|s| s.to_string()) else {
            self.send_numeric(conn_id, NumericReply::err_needmoreparams(message.command.as_str())).await;
            return;
        };
        let server_name = self.config.server_name.clone();
        let nick = self.nickname_of(conn_id).await.unwrap_or_default();

        match params.get(1) {
            None => {
                let topic = self.state.with_data(|data| data.channels.get(&channel_name).and_then(|c| c.topic.clone())).await;
                match topic {
                    Some(topic) => {
                        self.send(conn_id, NumericReply::topic(&channel_name, &topic.text).into_message(&server_name, &nick)).await;
                    }
                    None => {
                        self.send(conn_id, NumericReply::notopic(&channel_name).into_message(&server_name, &nick)).await;
                    }
                }
            }
            Some(new_topic) => match self.state.set_channel_topic(conn_id, &channel_name, new_topic).await {
                Ok(()) => {
                    let mask = self.mask_of(conn_id).await.unwrap_or_default();
                    let mut topic_line = Message::new(WireCommand::Named("TOPIC".to_string()))
                        .with_param(channel_name.clone())
                        .with_trailing(new_topic.to_string());
                    topic_line.prefix = Some(Prefix::from_mask(&mask));
                    let target = MessageTarget::channel(channel_name.clone());
                    self.send_to_target(&target, topic_line).await;
                }
                Err(err) => self.send_state_error(conn_id, err).await,
            },
        }
    }

    async fn handle_mode(&self, conn_id: ConnId, message: &Message) {
        let params = message.all_params();
        let Some(target) = params.first() else {
            self.send_numeric(conn_id, NumericReply::err_needmoreparams(message.command.as_str())).await;
            return;
        };
        if !target.chars().next().is_some_and(|c| self.config.is_channel_prefix(c)) {
            // User modes aren't modeled beyond the registration handshake.
            return;
        }
        let Some(modestring) = params.get(1) else {
            return;
        };
        let mode_args: Vec<String> = params[2..].iter().map(|s| s.to_string()).collect();
        let changes = parse_mode_changes(modestring, &mode_args);
        if changes.is_empty() {
            return;
        }

        match self.state.set_channel_mode(conn_id, target, &changes).await {
            Ok(()) => {
                let mask = self.mask_of(conn_id).await.unwrap_or_default();
                let mut mode_line = Message::new(WireCommand::Named("MODE".to_string()))
                    .with_param(target.to_string())
                    .with_param(modestring.to_string());
                for arg in &mode_args {
                    mode_line = mode_line.with_param(arg.clone());
                }
                mode_line.prefix = Some(Prefix::from_mask(&mask));
                let target_set = MessageTarget::channel(target.to_string());
                self.send_to_target(&target_set, mode_line).await;
            }
            Err(err) => self.send_state_error(conn_id, err).await,
        }
    }

    async fn handle_privmsg(&self, conn_id: ConnId, message: &Message, is_notice: bool) {
        let params = message.all_params();
        let Some(target_mask) = params.first() else {
            if !is_notice {
                self.send_numeric(conn_id, NumericReply::err_needmoreparams(message.command.as_str())).await;
            }
            return;
        };
        let Some(text) = message.trailing.clone().or_else(|| params.get(1).map(|s| s.to_string())) else {
            return;
        };

        match self.state.resolve_privmsg_target(conn_id, target_mask).await {
            Ok(target) => {
                let mask = self.mask_of(conn_id).await.unwrap_or_default();
                let verb = if is_notice { "NOTICE" } else { "PRIVMSG" };
                let mut line = Message::new(WireCommand::Named(verb.to_string()))
                    .with_param(target_mask.to_string())
                    .with_trailing(text);
                line.prefix = Some(Prefix::from_mask(&mask));
                self.send_to_target(&target, line).await;
            }
            Err(err) if !is_notice => self.send_state_error(conn_id, err).await,
            Err(_) => {}
        }
    }

    async fn send_to_target(&self, target: &MessageTarget, message: Message) {
        let recipients = self.state.with_data(|data| target.materialize(data)).await;
        let connections = self.connections.read().await;
        let line = message.serialize();
        for recipient in recipients {
            if let Some(conn_id) = self.conn_id_for_user(recipient).await {
                if let Some(conn) = connections.get(&conn_id) {
                    conn.offer(line.clone());
                }
            }
        }
    }

    /// Builds a real `:nick!user@host QUIT :reason` message, the same
    /// way `announce_join` builds `JOIN`, and fans it to every channel
    /// the quitting user was a member of. `mask` and `affected_channels`
    /// must be captured before `ServerState::quit` removes the user
    /// record and its memberships.
    async fn announce_quit(&self, mask: &str, reason: Option<&str>, affected_channels: &[String]) {
        if mask.is_empty() {
            return;
        }
        let mut quit_line = Message::new(WireCommand::Named("QUIT".to_string())).with_trailing(reason.unwrap_or("Client quit").to_string());
        quit_line.prefix = Some(Prefix::from_mask(mask));
        for channel_name in affected_channels {
            let target = MessageTarget::channel(channel_name.clone());
            self.send_to_target(&target, quit_line.clone()).await;
        }
    }

    async fn conn_id_for_user(&self, user_id: UserId) -> Option<ConnId> {
        self.state.with_data(|data| data.users.get(&user_id).map(|u| u.conn)).await
    }

    async fn user_id_of(&self, conn_id: ConnId) -> Option<UserId> {
        self.state.with_data(|data| data.users_by_conn.get(&conn_id).copied()).await
    }

    async fn nickname_of(&self, conn_id: ConnId) -> Option<String> {
        self.state
            .with_data(|data| data.users_by_conn.get(&conn_id).and_then(|id| data.users.get(id)).and_then(|u| u.nickname.clone()))
            .await
    }

    async fn mask_of(&self, conn_id: ConnId) -> Option<String> {
        self.state
            .with_data(|data| data.users_by_conn.get(&conn_id).and_then(|id| data.users.get(id)).map(|u| u.mask()))
            .await
    }

    async fn user_at_host_of(&self, conn_id: ConnId) -> Option<String> {
        self.state
            .with_data(|data| {
                data.users_by_conn
                    .get(&conn_id)
                    .and_then(|id| data.users.get(id))
                    .map(|u| format!("{}@{}", u.username.clone().unwrap_or_default(), u.host_address))
            })
            .await
    }

    async fn send_numeric(&self, conn_id: ConnId, reply: NumericReply) {
        let nick = self.nickname_of(conn_id).await.unwrap_or_else(|| "*".to_string());
        let server_name = self.config.server_name.clone();
        self.send(conn_id, reply.into_message(&server_name, &nick)).await;
    }

    async fn send_state_error(&self, conn_id: ConnId, err: StateError) {
        if let Some(reply) = err.to_numeric() {
            self.send_numeric(conn_id, reply).await;
        }
    }

    async fn send(&self, conn_id: ConnId, message: Message) {
        self.send_raw(conn_id, message).await;
    }

    async fn send_raw(&self, conn_id: ConnId, message: Message) {
        if let Some(conn) = self.connections.read().await.get(&conn_id) {
            conn.offer(message.serialize());
        }
    }

    /// Spawns the periodic idle-ping sweeper: every `ping_interval`,
    /// ping every registered user and disconnect anyone whose last
    /// `PONG` is older than `ping_deadline`. Grounded on the teacher's
    /// `db::Db::purge_expired_tasks` sweep pattern.
    pub fn spawn_idle_sweeper(&self) {
        let dispatcher = self.clone();
        let period = self.config.ping_interval;
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                dispatcher.sweep_idle_connections().await;
            }
        });
    }

    async fn sweep_idle_connections(&self) {
        let deadline = self.config.ping_deadline;
        let server_name = self.config.server_name.clone();
        let now = Instant::now();

        let (to_ping, to_drop) = self
            .state
            .with_data(|data| {
                let mut ping = Vec::new();
                let mut drop = Vec::new();
                for user in data.users.values() {
                    if !user.is_registered() {
                        continue;
                    }
                    let idle_for = user.last_pong_at.map(|t| now.duration_since(t)).unwrap_or_else(|| now.duration_since(user.signed_on_at));
                    if idle_for >= deadline {
                        drop.push(user.conn);
                    } else if idle_for >= deadline / 2 {
                        ping.push(user.conn);
                    }
                }
                (ping, drop)
            })
            .await;

        for conn_id in to_ping {
            let ping = Message::new(WireCommand::Named("PING".to_string())).with_trailing(server_name.clone());
            self.send_raw(conn_id, ping).await;
        }
        for conn_id in to_drop {
            warn!(conn_id, "disconnecting idle connection");
            self.handle_disconnect(conn_id).await;
            if let Some(conn) = self.connections.read().await.get(&conn_id) {
                conn.close_deferred();
            }
        }
    }

    /// Closes every live connection and waits for each to finish
    /// draining, used by the process shutdown path so a `ctrl_c`
    /// leaves no half-closed sockets behind.
    pub async fn shutdown_all(&self) {
        let waits: Vec<_> = self.connections.read().await.values().map(Connection::close_deferred).collect();
        for wait in waits {
            wait.await;
        }
    }
}
