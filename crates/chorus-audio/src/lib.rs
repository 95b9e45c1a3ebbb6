//! Device abstraction, per-stream plumbing and the realtime audio thread of
//! the chorus daemon.

pub mod buffer_share;
pub mod dev_io;
pub mod dev_stream;
pub mod empty_iodev;
pub mod error;
pub mod iodev;
pub mod ionode;
pub mod loopback_iodev;
pub mod poll;
pub mod rstream;
pub mod test_iodev;
pub mod thread;
pub mod time;

pub use dev_io::{DevState, OpenDev};
pub use dev_stream::{DevStream, SharedRstream};
pub use error::{AudioThreadError, DeviceError, StreamError};
pub use iodev::Iodev;
pub use ionode::Ionode;
pub use rstream::Rstream;
pub use thread::{spawn_audio_thread, AudioEvent, AudioThreadHandle};
