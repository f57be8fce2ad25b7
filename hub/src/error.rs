use thiserror::Error;

/// Validation failures surfaced back to the originating connection as an
/// `error` envelope. The `Display` output is the exact client-facing message;
/// the connection always stays open.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Invalid message format")]
    InvalidFormat,

    /// Payload was valid JSON but missed or mistyped a required field.
    /// Carries the serde message, which names the offending field.
    #[error("{0}")]
    BadPayload(String),

    /// Unknown and expired codes are reported identically so a client
    /// cannot probe whether a code once existed.
    #[error("Invalid session code")]
    InvalidSessionCode,

    #[error("Target device not connected")]
    TargetNotConnected,

    #[error("User \"{0}\" not found or not online")]
    UserNotFound(String),

    #[error("Group not found")]
    GroupNotFound,

    #[error("Device \"{0}\" is not a member of this session")]
    NotSessionMember(String),
}
