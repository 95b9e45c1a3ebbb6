use thiserror::Error;

/// Control-thread errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Proto(#[from] chorus_proto::error::ProtoError),

    #[error(transparent)]
    Shm(#[from] chorus_shm::ShmError),

    #[error(transparent)]
    AudioThread(#[from] chorus_audio::AudioThreadError),

    #[error(transparent)]
    Stream(#[from] chorus_audio::StreamError),

    #[error("invalid argument: {0}")]
    Inval(&'static str),

    /// A client violated the wire protocol; its connection is dropped.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// Unrecoverable initialization failure; the daemon exits nonzero.
    #[error("fatal: {0}")]
    Fatal(String),
}

const EIO: i32 = 5;
const ENOMEM: i32 = 12;
const EINVAL: i32 = 22;

impl ServerError {
    /// Errno-style code reported to clients in `StreamConnected.err`.
    pub fn client_errno(&self) -> i32 {
        match self {
            ServerError::Inval(_) | ServerError::Protocol(_) => EINVAL,
            ServerError::Shm(_) => ENOMEM,
            _ => EIO,
        }
    }
}
