use thiserror::Error;

/// Errors from format validation and converter construction.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DspError {
    /// A channel layout entry points outside the channel count.
    #[error("channel layout entry {entry} exceeds channel count {num_channels}")]
    InvalidChannelLayout { entry: i8, num_channels: u32 },

    /// No mixing rule exists between the two layouts.
    #[error("no channel conversion from {from} to {to} channels")]
    UnsupportedChannelConversion { from: u32, to: u32 },

    /// A zero frame rate or channel count was supplied.
    #[error("degenerate audio format: rate {frame_rate}, channels {num_channels}")]
    DegenerateFormat { frame_rate: u32, num_channels: u32 },

    /// Output buffer cannot hold the converted frames.
    #[error("output buffer holds {capacity} frames, {needed} needed")]
    OutputTooSmall { capacity: usize, needed: usize },
}
