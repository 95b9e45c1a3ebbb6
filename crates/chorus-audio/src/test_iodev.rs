//! Canned-sample capture device.
//!
//! Stands in for hardware in integration tests and hotword bring-up: test
//! code feeds sample bursts in, attached streams capture them through the
//! normal device path. Exposes a hotword node so detection streams can be
//! exercised without a DSP.

use std::collections::VecDeque;
use std::time::Instant;

use chorus_dsp::format::{AudioFormat, SampleFormat};
use chorus_proto::ids::NodeId;
use chorus_proto::types::{Direction, NodeType};

use crate::error::DeviceError;
use crate::iodev::Iodev;
use crate::ionode::Ionode;

const TEST_BUFFER_FRAMES: u32 = 16384;

const SUPPORTED_RATES: &[u32] = &[16000, 44100, 48000];
const SUPPORTED_CHANNEL_COUNTS: &[u32] = &[1, 2];
const SUPPORTED_FORMATS: &[SampleFormat] = &[SampleFormat::S16LE];

pub struct TestIodev {
    name: String,
    format: Option<AudioFormat>,
    nodes: Vec<Ionode>,
    open: bool,
    queue: VecDeque<u8>,
    scratch: Vec<u8>,
    held_frames: Option<u32>,
}

impl TestIodev {
    pub fn new(hotword: bool) -> Self {
        let (name, node_type) = if hotword {
            ("Test Hotword Device", NodeType::Hotword)
        } else {
            ("Test Capture Device", NodeType::Mic)
        };
        let node = Ionode::new(NodeId::NONE, node_type, name).plugged(true);
        Self {
            name: name.to_string(),
            format: None,
            nodes: vec![node],
            open: false,
            queue: VecDeque::new(),
            scratch: Vec::new(),
            held_frames: None,
        }
    }

    /// Feed a burst of raw sample bytes for attached streams to capture.
    /// Excess beyond the device buffer is dropped oldest-first.
    pub fn feed_samples(&mut self, bytes: &[u8]) {
        self.queue.extend(bytes.iter().copied());
        let cap = self.capacity_bytes();
        while self.queue.len() > cap {
            self.queue.pop_front();
        }
    }

    fn capacity_bytes(&self) -> usize {
        let fb = self.format.map(|f| f.frame_bytes()).unwrap_or(2);
        TEST_BUFFER_FRAMES as usize * fb
    }
}

impl Iodev for TestIodev {
    fn name(&self) -> &str {
        &self.name
    }

    fn direction(&self) -> Direction {
        Direction::Input
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
        TEST_BUFFER_FRAMES
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
        self.scratch = vec![0u8; TEST_BUFFER_FRAMES as usize * format.frame_bytes()];
        self.queue.clear();
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if !self.open {
            return Err(DeviceError::NotOpen);
        }
        self.open = false;
        self.held_frames = None;
        self.queue.clear();
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
        let fb = self.format.ok_or(DeviceError::NoFormat)?.frame_bytes();
        Ok(((self.queue.len() / fb) as u32, now))
    }

    fn get_buffer(&mut self, frames: u32) -> Result<(&mut [u8], u32), DeviceError> {
        if !self.open {
            return Err(DeviceError::NotOpen);
        }
        if self.held_frames.is_some() {
            return Err(DeviceError::BufferHeld);
        }
        let fb = self.format.ok_or(DeviceError::NoFormat)?.frame_bytes();
        let queued = (self.queue.len() / fb) as u32;
        let granted = frames.min(queued);
        let bytes = granted as usize * fb;
        for (i, slot) in self.scratch[..bytes].iter_mut().enumerate() {
            *slot = self.queue[i];
        }
        self.held_frames = Some(granted);
        Ok((&mut self.scratch[..bytes], granted))
    }

    fn put_buffer(&mut self, frames: u32) -> Result<(), DeviceError> {
        let held = self.held_frames.take().ok_or(DeviceError::NotOpen)?;
        let fb = self.format.ok_or(DeviceError::NoFormat)?.frame_bytes();
        let drain = (frames.min(held) as usize * fb).min(self.queue.len());
        self.queue.drain(..drain);
        Ok(())
    }

    fn nodes(&self) -> &[Ionode] {
        &self.nodes
    }

    fn update_active_node(&mut self, _node_index: usize) {}
}
