//! Crate-wide error types.
//!
//! Mirrors the split the teacher's `parse`/top-level error types use: the
//! interesting sub-errors (`ParseError`, `StateError`, `DccError`) are real
//! enums callers match on, while `crate::Error` stays an opaque
//! aggregate for anything that just needs to propagate with `?`.

use thiserror::Error;

use crate::numeric::NumericReply;

/// Crate-wide error type for anything that doesn't need to be inspected
/// by the caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Parse(#[from] ParseError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Dcc(#[from] crate::dcc::DccError),

    #[error("{0}")]
    Other(String),
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures while parsing a single IRC line into a [`crate::message::Message`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty line")]
    EmptyLine,

    #[error("missing command")]
    MissingCommand,

    #[error("malformed tag block")]
    MalformedTags,

    #[error("malformed prefix")]
    MalformedPrefix,

    #[error("too many parameters")]
    TooManyParams,

    #[error("bad integer: {0}")]
    BadInteger(String),

    #[error("unknown parameter key: {0}")]
    UnknownKey(String),

    #[error("parameter plan could not be satisfied: needed at least {needed}, got {got}")]
    InsufficientParams { needed: usize, got: usize },
}

/// Every way a [`crate::state::ServerState`] mutation can fail.
///
/// Each variant carries exactly what the dispatcher needs to build the
/// matching IRC numeric reply without the state layer knowing anything
/// about wire formatting, per spec.md's "error taxonomy" design.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("invalid password")]
    InvalidPassword,

    #[error("already registered")]
    AlreadyRegistered,

    #[error("not registered")]
    NotRegistered,

    #[error("erroneous nickname: {0}")]
    ErroneousNickname(String),

    #[error("nickname in use: {0}")]
    NicknameInUse(String),

    #[error("no such nick: {0}")]
    NoSuchNick(String),

    #[error("no such channel: {0}")]
    NoSuchChannel(String),

    #[error("not on channel: {0}")]
    NotOnChannel(String),

    #[error("bad channel mask: {0}")]
    BadChannelMask(String),

    #[error("not channel operator: {0}")]
    NotChannelOperator(String),

    #[error("channel is full: {0}")]
    ChannelIsFull(String),

    #[error("invite only channel: {0}")]
    InviteOnlyChannel(String),

    #[error("banned from channel: {0}")]
    BannedFromChannel(String),

    #[error("bad channel key: {0}")]
    BadChannelKey(String),

    #[error("cannot send to channel: {0}")]
    CannotSendToChannel(String),

    #[error("no-op: state already reflects the requested change")]
    NoOp,
}

impl StateError {
    /// Builds the IRC numeric reply a dispatcher should send to the
    /// issuing connection for this failure. `NoOp` has no reply: it is
    /// a success-shaped failure used to short-circuit idempotent
    /// mutations (e.g. `NICK` to the same nickname).
    pub fn to_numeric(&self) -> Option<NumericReply> {
        use StateError::*;
        Some(match self {
            InvalidPassword => NumericReply::err_passwdmismatch(),
            AlreadyRegistered => NumericReply::err_alreadyregistred(),
            NotRegistered => NumericReply::err_notregistered(),
            ErroneousNickname(n) => NumericReply::err_erroneusnickname(n),
            NicknameInUse(n) => NumericReply::err_nicknameinuse(n),
            NoSuchNick(n) => NumericReply::err_nosuchnick(n),
            NoSuchChannel(c) => NumericReply::err_nosuchchannel(c),
            NotOnChannel(c) => NumericReply::err_notonchannel(c),
            BadChannelMask(c) => NumericReply::err_badchanmask(c),
            NotChannelOperator(c) => NumericReply::err_chanoprivsneeded(c),
            ChannelIsFull(c) => NumericReply::err_channelisfull(c),
            InviteOnlyChannel(c) => NumericReply::err_inviteonlychan(c),
            BannedFromChannel(c) => NumericReply::err_bannedfromchan(c),
            BadChannelKey(c) => NumericReply::err_badchannelkey(c),
            CannotSendToChannel(c) => NumericReply::err_cannotsendtochan(c),
            NoOp => return None,
        })
    }
}
