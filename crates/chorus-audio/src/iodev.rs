//! The iodev capability set.
//!
//! Every device the daemon can route audio through, real or virtual,
//! implements [`Iodev`]. The audio thread drives devices exclusively
//! through this trait; concrete drivers (hardware PCM, Bluetooth, the
//! virtual devices in this crate) differ only behind it.

use std::time::Instant;

use chorus_dsp::format::{AudioFormat, SampleFormat};
use chorus_proto::types::Direction;

use crate::error::DeviceError;
use crate::ionode::Ionode;

/// Capability interface for one audio device.
pub trait Iodev: Send {
    /// Stable human-readable name.
    fn name(&self) -> &str;

    fn direction(&self) -> Direction;

    /// Frame rates the device can run at, preferred first.
    fn supported_rates(&self) -> &[u32];

    fn supported_channel_counts(&self) -> &[u32];

    fn supported_formats(&self) -> &[SampleFormat];

    /// Total frames the device-side buffer holds.
    fn buffer_size(&self) -> u32;

    /// Refresh the supported format lists from the hardware. Called before
    /// format negotiation; a no-op for virtual devices.
    fn update_supported_formats(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Format the device is configured for, once negotiated.
    fn format(&self) -> Option<&AudioFormat>;

    fn set_format(&mut self, format: AudioFormat) -> Result<(), DeviceError>;

    fn open(&mut self) -> Result<(), DeviceError>;

    fn close(&mut self) -> Result<(), DeviceError>;

    fn is_open(&self) -> bool;

    /// True while the device clock is actually running.
    fn dev_running(&self) -> bool {
        self.is_open()
    }

    /// Frames currently in the device buffer: queued ahead for playback,
    /// available to read for capture. Returns the level together with the
    /// timestamp it was measured at; wake-time arithmetic is done against
    /// that timestamp. Must be cheap.
    fn frames_queued(&mut self, now: Instant) -> Result<(u32, Instant), DeviceError>;

    /// Frames of latency between the buffer and the jack.
    fn delay_frames(&mut self, now: Instant) -> Result<u32, DeviceError> {
        self.frames_queued(now).map(|(frames, _)| frames)
    }

    /// Borrow up to `frames` frames of linear device memory. Returns the
    /// buffer and the frame count actually available. No second
    /// `get_buffer` may be issued before the matching [`put_buffer`].
    ///
    /// [`put_buffer`]: Iodev::put_buffer
    fn get_buffer(&mut self, frames: u32) -> Result<(&mut [u8], u32), DeviceError>;

    /// Commit `frames` frames (at most the count returned by `get_buffer`).
    fn put_buffer(&mut self, frames: u32) -> Result<(), DeviceError>;

    /// Initial node set; indices are assigned by the device list.
    fn nodes(&self) -> &[Ionode];

    fn active_node_index(&self) -> usize {
        0
    }

    /// React to the active node changing (re-route amplifiers etc).
    fn update_active_node(&mut self, node_index: usize);

    /// True when the daemon must apply volume in software because the
    /// driver cannot.
    fn software_volume_needed(&self) -> bool {
        false
    }
}

/// Pick a device format closest to the stream's wishes from the supported
/// lists: exact rate match wins, then the first (preferred) entries.
pub fn negotiate_format(dev: &mut dyn Iodev, wanted: &AudioFormat) -> Result<AudioFormat, DeviceError> {
    dev.update_supported_formats()?;

    let rates = dev.supported_rates();
    let rate = rates
        .iter()
        .copied()
        .find(|&r| r == wanted.frame_rate)
        .or_else(|| rates.first().copied())
        .ok_or(DeviceError::UnsupportedFormat {
            rate: wanted.frame_rate,
            channels: wanted.num_channels,
        })?;

    let channel_counts = dev.supported_channel_counts();
    let channels = channel_counts
        .iter()
        .copied()
        .find(|&c| c == wanted.num_channels)
        .or_else(|| channel_counts.first().copied())
        .ok_or(DeviceError::UnsupportedFormat {
            rate: wanted.frame_rate,
            channels: wanted.num_channels,
        })?;

    let formats = dev.supported_formats();
    let sample_format = formats
        .iter()
        .copied()
        .find(|&f| f == wanted.sample_format)
        .or_else(|| formats.first().copied())
        .ok_or(DeviceError::UnsupportedFormat {
            rate: wanted.frame_rate,
            channels: wanted.num_channels,
        })?;

    let format = AudioFormat::new(sample_format, rate, channels);
    dev.set_format(format)?;
    Ok(format)
}

#[cfg(test)]
mod tests {
    use chorus_dsp::format::{AudioFormat, SampleFormat};
    use chorus_proto::types::Direction;

    use crate::empty_iodev::EmptyIodev;

    use super::negotiate_format;

    #[test]
    fn negotiation_prefers_exact_rate() {
        let mut dev = EmptyIodev::new(Direction::Output);
        let wanted = AudioFormat::new(SampleFormat::S16LE, 44100, 2);
        let got = negotiate_format(&mut dev, &wanted).unwrap();
        assert_eq!(got.frame_rate, 44100);
        assert_eq!(got.num_channels, 2);
    }

    #[test]
    fn negotiation_falls_back_to_preferred() {
        let mut dev = EmptyIodev::new(Direction::Output);
        let wanted = AudioFormat::new(SampleFormat::S16LE, 8000, 7);
        let got = negotiate_format(&mut dev, &wanted).unwrap();
        assert_eq!(got.frame_rate, 48000);
        assert_eq!(got.num_channels, 2);
    }
}
