//! The fallback "empty" device.
//!
//! Attached in place of real hardware when no device is available so that
//! streams stay schedulable. It consumes playback data and produces capture
//! silence at wall-clock rate, with the frame level derived from elapsed
//! time rather than any hardware counter.

use std::time::Instant;

use chorus_dsp::format::{AudioFormat, SampleFormat};
use chorus_dsp::sample::fill_silence;
use chorus_proto::ids::NodeId;
use chorus_proto::types::{Direction, NodeType};

use crate::error::DeviceError;
use crate::iodev::Iodev;
use crate::ionode::Ionode;
use crate::time::duration_to_frames;

const EMPTY_BUFFER_FRAMES: u32 = 8192;

const SUPPORTED_RATES: &[u32] = &[48000, 44100, 96000, 16000];
const SUPPORTED_CHANNEL_COUNTS: &[u32] = &[2, 1];
const SUPPORTED_FORMATS: &[SampleFormat] = &[
    SampleFormat::S16LE,
    SampleFormat::S24LE,
    SampleFormat::S32LE,
    SampleFormat::U8,
];

pub struct EmptyIodev {
    name: String,
    direction: Direction,
    format: Option<AudioFormat>,
    nodes: Vec<Ionode>,
    open: bool,
    opened_at: Option<Instant>,
    /// Frames written (playback) or consumed (capture) since open.
    frames_moved: u64,
    scratch: Vec<u8>,
    held_frames: Option<u32>,
}

impl EmptyIodev {
    pub fn new(direction: Direction) -> Self {
        let name = match direction {
            Direction::Output => "Silent Playback",
            Direction::Input => "Silent Capture",
        };
        let node = Ionode::new(NodeId::NONE, NodeType::Unknown, name).plugged(true);
        Self {
            name: name.to_string(),
            direction,
            format: None,
            nodes: vec![node],
            open: false,
            opened_at: None,
            frames_moved: 0,
            scratch: Vec::new(),
            held_frames: None,
        }
    }

    fn elapsed_frames(&self, now: Instant) -> u64 {
        let (Some(opened_at), Some(format)) = (self.opened_at, self.format.as_ref()) else {
            return 0;
        };
        duration_to_frames(now.saturating_duration_since(opened_at), format.frame_rate)
    }
}

impl Iodev for EmptyIodev {
    fn name(&self) -> &str {
        &self.name
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn supported_rates(&self) -> &[u32] {
        SUPPORTED_RATES
    }

    fn supported_channel_counts(&self) -> &[u32] {
        SUPPORTED_CHANNEL_COUNTS
    }

    fn supported_formats(&self) -> &[SampleFormat] {
        SUPPORTED_FORMATS
    }

    fn buffer_size(&self) -> u32 {
        EMPTY_BUFFER_FRAMES
    }

    fn format(&self) -> Option<&AudioFormat> {
        self.format.as_ref()
    }

    fn set_format(&mut self, format: AudioFormat) -> Result<(), DeviceError> {
        self.format = Some(format);
        Ok(())
    }

    fn open(&mut self) -> Result<(), DeviceError> {
        if self.open {
            return Err(DeviceError::AlreadyOpen);
        }
        let format = self.format.ok_or(DeviceError::NoFormat)?;
        self.scratch =
            vec![0u8; EMPTY_BUFFER_FRAMES as usize * format.frame_bytes()];
        self.open = true;
        self.opened_at = Some(Instant::now());
        self.frames_moved = 0;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if !self.open {
            return Err(DeviceError::NotOpen);
        }
        self.open = false;
        self.opened_at = None;
        self.held_frames = None;
        self.scratch.clear();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn frames_queued(&mut self, now: Instant) -> Result<(u32, Instant), DeviceError> {
        if !self.open {
            return Err(DeviceError::NotOpen);
        }
        let elapsed = self.elapsed_frames(now);
        let level = match self.direction {
            // Playback level drains as the virtual clock consumes frames.
            Direction::Output => self.frames_moved.saturating_sub(elapsed),
            // Capture accumulates up to one buffer of silence.
            Direction::Input => {
                (elapsed.saturating_sub(self.frames_moved)).min(u64::from(EMPTY_BUFFER_FRAMES))
            },
        };
        Ok((level as u32, now))
    }

    fn get_buffer(&mut self, frames: u32) -> Result<(&mut [u8], u32), DeviceError> {
        if !self.open {
            return Err(DeviceError::NotOpen);
        }
        if self.held_frames.is_some() {
            return Err(DeviceError::BufferHeld);
        }
        let format = self.format.ok_or(DeviceError::NoFormat)?;
        let granted = frames.min(EMPTY_BUFFER_FRAMES);
        let bytes = granted as usize * format.frame_bytes();
        fill_silence(&mut self.scratch[..bytes], format.sample_format);
        self.held_frames = Some(granted);
        Ok((&mut self.scratch[..bytes], granted))
    }

    fn put_buffer(&mut self, frames: u32) -> Result<(), DeviceError> {
        let held = self.held_frames.take().ok_or(DeviceError::NotOpen)?;
        self.frames_moved += u64::from(frames.min(held));
        Ok(())
    }

    fn nodes(&self) -> &[Ionode] {
        &self.nodes
    }

    fn update_active_node(&mut self, _node_index: usize) {}
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use chorus_dsp::format::{AudioFormat, SampleFormat};
    use chorus_proto::types::Direction;

    use crate::iodev::Iodev;

    use super::EmptyIodev;

    #[test]
    fn playback_level_drains_with_time() {
        let mut dev = EmptyIodev::new(Direction::Output);
        dev.set_format(AudioFormat::new(SampleFormat::S16LE, 48000, 2))
            .unwrap();
        dev.open().unwrap();

        let (buf, granted) = dev.get_buffer(480).unwrap();
        assert_eq!(granted, 480);
        assert!(buf.iter().all(|&b| b == 0));
        dev.put_buffer(480).unwrap();

        let now = Instant::now();
        let (level, _) = dev.frames_queued(now).unwrap();
        assert!(level <= 480);
        let (level, _) = dev.frames_queued(now + Duration::from_millis(20)).unwrap();
        assert_eq!(level, 0);
        dev.close().unwrap();
    }

    #[test]
    fn capture_level_accumulates_with_time() {
        let mut dev = EmptyIodev::new(Direction::Input);
        dev.set_format(AudioFormat::new(SampleFormat::S16LE, 48000, 2))
            .unwrap();
        dev.open().unwrap();
        let now = Instant::now();
        let (level, _) = dev.frames_queued(now + Duration::from_millis(10)).unwrap();
        assert!((470..=490).contains(&level));
        dev.close().unwrap();
    }

    #[test]
    fn double_get_buffer_is_refused() {
        let mut dev = EmptyIodev::new(Direction::Output);
        dev.set_format(AudioFormat::new(SampleFormat::S16LE, 48000, 2))
            .unwrap();
        dev.open().unwrap();
        let _ = dev.get_buffer(16).unwrap();
        assert!(dev.get_buffer(16).is_err());
    }
}
