use thiserror::Error;

/// Errors produced while framing or parsing protocol messages.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("postcard: {0}")]
    Codec(#[from] postcard::Error),

    /// Declared frame length exceeds the sanity limit.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    /// Declared frame length is smaller than the fixed header.
    #[error("declared frame length {len} is shorter than the header")]
    FrameTooShort { len: usize },

    /// The id word in the header disagrees with the decoded message.
    #[error("frame id {header_id} does not match message id {message_id}")]
    IdMismatch { header_id: u32, message_id: u32 },

    /// A fixed-size record arrived truncated.
    #[error("truncated record: got {got} of {want} bytes")]
    Truncated { got: usize, want: usize },
}
