use thiserror::Error;

/// Errors from creating, attaching or using shared-memory regions.
#[derive(Debug, Error)]
pub enum ShmError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Region is smaller than its declared layout.
    #[error("shm region of {len} bytes cannot hold {need} bytes")]
    TooSmall { len: usize, need: usize },

    /// Magic or version check failed at attach.
    #[error("shm header mismatch: magic {magic:#x}, version {version}")]
    HeaderMismatch { magic: u32, version: u32 },

    /// A parameter was outside its allowed range; state is unchanged.
    #[error("invalid argument: {0}")]
    Inval(&'static str),
}
