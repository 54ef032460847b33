/// Session-level error taxonomy. The supervisor layers decide restart vs
/// quarantine based on these kinds, and the HTTP API reports `kind()` in
/// error bodies.
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DvrError {
    #[error("connect to {addr} failed: {source}")]
    DialFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Non-zero CmdReply on UserLogin. Observed "22" = bad credentials.
    /// Never retried.
    #[error("login rejected by DVR (CmdReply={reply})")]
    AuthFailed { reply: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("media channel read failed: {0}")]
    MediaRead(String),

    #[error("DVR refused stream create: {0}")]
    StreamCreateFailed(String),

    #[error("DVR refused stream start: {0}")]
    StreamStartFailed(String),

    #[error("no command-channel traffic for {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("not logged in")]
    NotLoggedIn,

    #[error("connection closed by DVR")]
    ConnectionClosed,
}

impl DvrError {
    /// Stable kind string for API error bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            DvrError::DialFailed { .. } => "DialFailed",
            DvrError::AuthFailed { .. } => "AuthFailed",
            DvrError::Protocol(_) => "ProtocolError",
            DvrError::Timeout(_) => "Timeout",
            DvrError::MediaRead(_) => "MediaReadError",
            DvrError::StreamCreateFailed(_) => "StreamCreateFailed",
            DvrError::StreamStartFailed(_) => "StreamStartFailed",
            DvrError::HeartbeatTimeout(_) => "HeartbeatTimeout",
            DvrError::NotLoggedIn => "NotLoggedIn",
            DvrError::ConnectionClosed => "ConnectionClosed",
        }
    }

    /// Network-shaped failures are retriable and map to feeder exit code 2;
    /// everything else is an auth/protocol failure (exit code 1).
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            DvrError::DialFailed { .. }
                | DvrError::Timeout(_)
                | DvrError::MediaRead(_)
                | DvrError::HeartbeatTimeout(_)
                | DvrError::ConnectionClosed
        )
    }
}
