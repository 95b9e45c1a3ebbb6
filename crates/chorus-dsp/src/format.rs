//! Audio sample formats and channel layouts.

use serde::{Deserialize, Serialize};

use crate::error::DspError;

/// Number of semantic channel slots in a layout.
pub const CH_MAX: usize = 11;

/// Semantic channel slots, indexing into [`AudioFormat::channel_layout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ChannelSlot {
    FrontLeft = 0,
    FrontRight = 1,
    RearLeft = 2,
    RearRight = 3,
    FrontCenter = 4,
    LowFrequency = 5,
    SideLeft = 6,
    SideRight = 7,
    RearCenter = 8,
    FrontLeftOfCenter = 9,
    FrontRightOfCenter = 10,
}

/// PCM sample encodings the daemon understands.
///
/// `S24LE` uses a four-byte container with the top byte ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    U8,
    S16LE,
    S24LE,
    S32LE,
}

impl SampleFormat {
    /// Bytes occupied by one sample of this format.
    pub fn sample_bytes(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16LE => 2,
            SampleFormat::S24LE => 4,
            SampleFormat::S32LE => 4,
        }
    }
}

/// Full description of an interleaved PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_format: SampleFormat,
    pub frame_rate: u32,
    pub num_channels: u32,
    /// Maps each semantic slot to a physical channel index, -1 when absent.
    pub channel_layout: [i8; CH_MAX],
}

impl AudioFormat {
    /// Create a format with the default layout for `num_channels`:
    /// mono maps front-center, stereo maps front left/right, anything wider
    /// starts unset and must be assigned via [`set_channel_layout`].
    ///
    /// [`set_channel_layout`]: AudioFormat::set_channel_layout
    pub fn new(sample_format: SampleFormat, frame_rate: u32, num_channels: u32) -> Self {
        let mut channel_layout = [-1i8; CH_MAX];
        match num_channels {
            1 => channel_layout[ChannelSlot::FrontCenter as usize] = 0,
            2 => {
                channel_layout[ChannelSlot::FrontLeft as usize] = 0;
                channel_layout[ChannelSlot::FrontRight as usize] = 1;
            },
            _ => {},
        }
        Self {
            sample_format,
            frame_rate,
            num_channels,
            channel_layout,
        }
    }

    /// Replace the channel layout, verifying every entry stays inside the
    /// channel count.
    pub fn set_channel_layout(&mut self, layout: [i8; CH_MAX]) -> Result<(), DspError> {
        for &entry in &layout {
            if entry >= self.num_channels as i8 {
                return Err(DspError::InvalidChannelLayout {
                    entry,
                    num_channels: self.num_channels,
                });
            }
        }
        self.channel_layout = layout;
        Ok(())
    }

    /// Bytes per interleaved frame.
    pub fn frame_bytes(&self) -> usize {
        self.sample_format.sample_bytes() * self.num_channels as usize
    }

    /// True when converting `self` to `other` is a no-op.
    pub fn conversion_needed(&self, other: &AudioFormat) -> bool {
        self.sample_format != other.sample_format
            || self.frame_rate != other.frame_rate
            || self.num_channels != other.num_channels
            || self.channel_layout != other.channel_layout
    }
}

/// Number of frames at `to_rate` covering `frames` at `from_rate`, rounded
/// up so callers never undersize a buffer.
pub fn frames_at_rate(frames: u32, from_rate: u32, to_rate: u32) -> u32 {
    if from_rate == to_rate || frames == 0 {
        return frames;
    }
    let scaled = u64::from(frames) * u64::from(to_rate) + u64::from(from_rate) - 1;
    (scaled / u64::from(from_rate)) as u32
}

#[cfg(test)]
mod tests {
    use super::{frames_at_rate, AudioFormat, SampleFormat, CH_MAX};

    #[test]
    fn stereo_default_layout() {
        let fmt = AudioFormat::new(SampleFormat::S16LE, 48000, 2);
        assert_eq!(fmt.channel_layout[0], 0);
        assert_eq!(fmt.channel_layout[1], 1);
        assert_eq!(fmt.frame_bytes(), 4);
    }

    #[test]
    fn layout_entry_must_fit_channel_count() {
        let mut fmt = AudioFormat::new(SampleFormat::S16LE, 48000, 2);
        let mut layout = [-1i8; CH_MAX];
        layout[0] = 2;
        assert!(fmt.set_channel_layout(layout).is_err());
        layout[0] = 1;
        assert!(fmt.set_channel_layout(layout).is_ok());
    }

    #[test]
    fn frames_at_rate_rounds_up() {
        assert_eq!(frames_at_rate(441, 44100, 48000), 480);
        assert_eq!(frames_at_rate(480, 48000, 44100), 441);
        assert_eq!(frames_at_rate(240, 48000, 44100), 221);
        assert_eq!(frames_at_rate(0, 44100, 48000), 0);
        assert_eq!(frames_at_rate(100, 48000, 48000), 100);
    }

    #[test]
    fn rate_mapping_inverse_within_one_frame() {
        let pairs = [(44100u32, 48000u32), (48000, 44100), (16000, 48000), (96000, 44100)];
        for &(from, to) in &pairs {
            for k in [1u32, 7, 240, 441, 480, 4096] {
                let there = frames_at_rate(k, from, to);
                let back = frames_at_rate(there, to, from);
                assert!(
                    back >= k && back - k <= 1,
                    "{from}->{to}: {k} -> {there} -> {back}"
                );
            }
        }
    }
}
