//! Audio formats, channel mixing, rate conversion and sample math shared by
//! the chorus daemon and its tooling.

pub mod convert;
pub mod error;
pub mod format;
pub mod matrix;
pub mod rate;
pub mod sample;

pub use convert::FormatConverter;
pub use error::DspError;
pub use format::{frames_at_rate, AudioFormat, ChannelSlot, SampleFormat, CH_MAX};
