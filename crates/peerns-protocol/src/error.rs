/// Protocol-level errors for peerns.
///
/// Wraps signaling errors and adds protocol-specific variants. Claim
/// conflicts are not represented here: `SignalError::IdTaken` is handled as
/// a protocol signal before errors propagate.
#[derive(Debug, thiserror::Error)]
pub enum PeernsError {
    #[error("signaling error: {0}")]
    Signal(#[from] peerns_signal::SignalError),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("crypto material unusable: {0}")]
    CryptoUnavailable(String),

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("decryption failed")]
    DecryptFailed,

    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("peer unreachable: {0}")]
    Unreachable(String),

    #[error("runtime shut down")]
    Shutdown,
}
