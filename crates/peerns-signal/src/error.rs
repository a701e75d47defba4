/// Errors surfaced by the signaling layer.
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    /// The endpoint is held by another session. A protocol signal, not a
    /// failure: callers join instead of electing, or regenerate their id.
    #[error("endpoint already taken: {0}")]
    IdTaken(String),

    /// Nothing is listening on the endpoint.
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    /// The channel peer went away mid-send.
    #[error("channel closed")]
    ChannelClosed,

    /// The signaling session itself is down.
    #[error("signaling session closed")]
    SessionClosed,

    #[error("invalid endpoint name: {0}")]
    InvalidEndpoint(String),
}
