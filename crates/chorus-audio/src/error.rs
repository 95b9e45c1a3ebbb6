use thiserror::Error;

use chorus_proto::ids::StreamId;

/// Errors surfaced by iodev implementations.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device is not open")]
    NotOpen,

    #[error("device is already open")]
    AlreadyOpen,

    /// Hardware reported an under/overrun; recoverable by reopening.
    #[error("device xrun")]
    Xrun,

    /// The negotiated format is not supported by the device.
    #[error("unsupported format: {rate} Hz, {channels} ch")]
    UnsupportedFormat { rate: u32, channels: u32 },

    /// A format must be negotiated before the operation.
    #[error("no format configured")]
    NoFormat,

    /// `get_buffer` was called while a buffer was already outstanding.
    #[error("buffer already held")]
    BufferHeld,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Unrecoverable driver failure; the device will be suspended.
    #[error("device failed: {0}")]
    Fatal(&'static str),
}

/// Errors on a single stream; these disconnect the stream, not the device.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("audio socket: {0}")]
    Transport(#[from] std::io::Error),

    #[error("shm: {0}")]
    Shm(#[from] chorus_shm::ShmError),

    #[error("audio socket retry budget exhausted")]
    RetriesExhausted,

    #[error("conversion: {0}")]
    Dsp(#[from] chorus_dsp::DspError),

    /// Peer closed its end of the audio socket.
    #[error("client hung up")]
    HungUp,
}

/// Errors from the audio thread command surface.
#[derive(Debug, Error)]
pub enum AudioThreadError {
    #[error("failed to spawn audio thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// Command or reply channel closed; the thread is gone.
    #[error("audio thread exited")]
    ThreadExited,

    #[error("unknown device index {0}")]
    UnknownDevice(u32),

    #[error("unknown stream {0}")]
    UnknownStream(StreamId),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Stream(#[from] StreamError),
}
