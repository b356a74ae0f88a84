use thiserror::Error;

/// Failure categories surfaced by the session on the configure/run paths.
///
/// The `Display` rendering of a variant is what `SvSession::last_error`
/// returns, so messages are written for the operator, not the debugger.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Invalid session parameters: interface name, MAC strings, VLAN
    /// fields, sample rate, svID length, channel-mapping indices.
    #[error("configuration error: {0}")]
    Config(String),

    /// COMTRADE file problems: open/read failures, malformed headers,
    /// unknown data format, empty recordings.
    #[error("COMTRADE error: {0}")]
    File(String),

    /// A mapped COMTRADE channel does not exist in the recording.
    #[error("channel mapping error: {0}")]
    Channel(String),

    /// Raw L2 endpoint could not be opened, or MAC auto-detection failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation invalid for the current lifecycle state.
    #[error("invalid session state: {0}")]
    State(String),
}
