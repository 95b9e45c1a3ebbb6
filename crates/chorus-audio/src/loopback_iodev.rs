//! Loopback capture devices.
//!
//! A loopback device is a virtual capture device fed by a tap on the
//! playback mix, either post-mix-pre-DSP or post-DSP. The tap and the
//! device share a ring addressed by unbounded 64-bit write/read counters,
//! so `queued = min(write - read, buffer_frames)` and a writer lapping the
//! reader simply drops the oldest frames: the producer always wins.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chorus_dsp::format::{AudioFormat, SampleFormat};
use chorus_proto::ids::NodeId;
use chorus_proto::types::{Direction, NodeType};

use crate::error::DeviceError;
use crate::iodev::Iodev;
use crate::ionode::Ionode;

pub const LOOPBACK_BUFFER_FRAMES: u32 = 8192;

const SUPPORTED_RATES: &[u32] = &[44100, 48000];
const SUPPORTED_CHANNEL_COUNTS: &[u32] = &[2, 1];
const SUPPORTED_FORMATS: &[SampleFormat] = &[
    SampleFormat::S16LE,
    SampleFormat::S24LE,
    SampleFormat::S32LE,
];

/// Where the tap sits in the playback path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopbackType {
    PostMixPreDsp,
    PostDsp,
}

impl LoopbackType {
    pub fn node_type(self) -> NodeType {
        match self {
            LoopbackType::PostMixPreDsp => NodeType::PostMixLoopback,
            LoopbackType::PostDsp => NodeType::PostDspLoopback,
        }
    }

    pub fn device_name(self) -> &'static str {
        match self {
            LoopbackType::PostMixPreDsp => "Post Mix Pre DSP Loopback",
            LoopbackType::PostDsp => "Post DSP Loopback",
        }
    }
}

struct RingInner {
    buffer: Vec<u8>,
    frame_bytes: usize,
    buffer_frames: u32,
    /// Total frames ever written; never wraps.
    write_count: u64,
    /// Total frames ever consumed; never exceeds `write_count`.
    read_count: u64,
}

/// The ring shared between the playback tap and the loopback device.
pub struct LoopbackRing {
    loopback_type: LoopbackType,
    inner: Mutex<RingInner>,
}

impl LoopbackRing {
    pub fn new(loopback_type: LoopbackType, buffer_frames: u32, frame_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            loopback_type,
            inner: Mutex::new(RingInner {
                buffer: vec![0u8; buffer_frames as usize * frame_bytes],
                frame_bytes,
                buffer_frames,
                write_count: 0,
                read_count: 0,
            }),
        })
    }

    pub fn loopback_type(&self) -> LoopbackType {
        self.loopback_type
    }

    fn guard(&self) -> MutexGuard<'_, RingInner> {
        self.inner.lock().expect("loopback ring mutex poisoned")
    }

    pub fn queued_frames(&self) -> u32 {
        let inner = self.guard();
        (inner.write_count - inner.read_count).min(u64::from(inner.buffer_frames)) as u32
    }

    /// Feed mixed playback frames into the ring. When the writer outruns
    /// the reader by more than the buffer, the oldest frames are dropped.
    pub fn write_frames(&self, bytes: &[u8]) {
        let mut inner = self.guard();
        let fb = inner.frame_bytes;
        let frames = (bytes.len() / fb) as u64;
        if frames == 0 {
            return;
        }
        let cap = u64::from(inner.buffer_frames);

        // Only the newest `cap` frames can survive anyway.
        let keep = frames.min(cap);
        let skipped = frames - keep;
        let start_count = inner.write_count + skipped;

        for i in 0..keep {
            let src = ((skipped + i) as usize) * fb;
            let slot = ((start_count + i) % cap) as usize * fb;
            inner.buffer[slot..slot + fb].copy_from_slice(&bytes[src..src + fb]);
        }

        inner.write_count += frames;
        if inner.write_count - inner.read_count > cap {
            inner.read_count = inner.write_count - cap;
        }
    }

    /// Copy up to `max_frames` queued frames into `out` without consuming.
    pub fn peek_frames(&self, out: &mut [u8], max_frames: u32) -> u32 {
        let inner = self.guard();
        let fb = inner.frame_bytes;
        let cap = u64::from(inner.buffer_frames);
        let queued = (inner.write_count - inner.read_count).min(cap);
        let take = queued.min(u64::from(max_frames)).min((out.len() / fb) as u64);
        for i in 0..take {
            let slot = ((inner.read_count + i) % cap) as usize * fb;
            let dst = i as usize * fb;
            out[dst..dst + fb].copy_from_slice(&inner.buffer[slot..slot + fb]);
        }
        take as u32
    }

    /// Consume `frames` previously peeked frames.
    pub fn consume_frames(&self, frames: u32) {
        let mut inner = self.guard();
        let queued = inner.write_count - inner.read_count;
        inner.read_count += u64::from(frames).min(queued);
    }

    pub fn clear(&self) {
        let mut inner = self.guard();
        inner.read_count = inner.write_count;
    }
}

/// The capture iodev end of a loopback ring.
pub struct LoopbackIodev {
    ring: Arc<LoopbackRing>,
    format: Option<AudioFormat>,
    nodes: Vec<Ionode>,
    open: bool,
    scratch: Vec<u8>,
    held_frames: Option<u32>,
}

impl LoopbackIodev {
    pub fn new(ring: Arc<LoopbackRing>) -> Self {
        let loopback_type = ring.loopback_type();
        let node = Ionode::new(NodeId::NONE, loopback_type.node_type(), loopback_type.device_name())
            .plugged(true);
        Self {
            ring,
            format: None,
            nodes: vec![node],
            open: false,
            scratch: Vec::new(),
            held_frames: None,
        }
    }

    pub fn ring(&self) -> Arc<LoopbackRing> {
        Arc::clone(&self.ring)
    }
}

impl Iodev for LoopbackIodev {
    fn name(&self) -> &str {
        self.ring.loopback_type().device_name()
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
        LOOPBACK_BUFFER_FRAMES
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
        self.scratch = vec![0u8; LOOPBACK_BUFFER_FRAMES as usize * format.frame_bytes()];
        self.ring.clear();
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if !self.open {
            return Err(DeviceError::NotOpen);
        }
        self.open = false;
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
        Ok((self.ring.queued_frames(), now))
    }

    fn get_buffer(&mut self, frames: u32) -> Result<(&mut [u8], u32), DeviceError> {
        if !self.open {
            return Err(DeviceError::NotOpen);
        }
        if self.held_frames.is_some() {
            return Err(DeviceError::BufferHeld);
        }
        let format = self.format.ok_or(DeviceError::NoFormat)?;
        let got = self.ring.peek_frames(&mut self.scratch, frames);
        self.held_frames = Some(got);
        Ok((&mut self.scratch[..got as usize * format.frame_bytes()], got))
    }

    fn put_buffer(&mut self, frames: u32) -> Result<(), DeviceError> {
        let held = self.held_frames.take().ok_or(DeviceError::NotOpen)?;
        self.ring.consume_frames(frames.min(held));
        Ok(())
    }

    fn nodes(&self) -> &[Ionode] {
        &self.nodes
    }

    fn update_active_node(&mut self, _node_index: usize) {}
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use chorus_dsp::format::{AudioFormat, SampleFormat};

    use crate::iodev::Iodev;

    use super::{LoopbackIodev, LoopbackRing, LoopbackType};

    fn make_dev(buffer_frames: u32) -> LoopbackIodev {
        let ring = LoopbackRing::new(LoopbackType::PostMixPreDsp, buffer_frames, 4);
        let mut dev = LoopbackIodev::new(ring);
        dev.set_format(AudioFormat::new(SampleFormat::S16LE, 48000, 2))
            .unwrap();
        dev
    }

    #[test]
    fn open_close_and_empty_level() {
        let mut dev = make_dev(1024);
        dev.open().unwrap();
        assert!(dev.is_open());
        let (level, _) = dev.frames_queued(Instant::now()).unwrap();
        assert_eq!(level, 0);
        dev.close().unwrap();
        assert!(!dev.is_open());
    }

    #[test]
    fn simple_loopback_round_trip() {
        let mut dev = make_dev(2048);
        dev.open().unwrap();
        let ring = dev.ring();

        let samples: Vec<u8> = (0..1024u32 * 4).map(|i| (i % 251) as u8).collect();
        ring.write_frames(&samples);
        assert_eq!(dev.frames_queued(Instant::now()).unwrap().0, 1024);

        let (buf, got) = dev.get_buffer(1024).unwrap();
        assert_eq!(got, 1024);
        assert_eq!(buf, &samples[..]);
        dev.put_buffer(1024).unwrap();
        assert_eq!(dev.frames_queued(Instant::now()).unwrap().0, 0);
    }

    #[test]
    fn writer_overrun_drops_oldest() {
        let ring = LoopbackRing::new(LoopbackType::PostDsp, 4, 4);
        for value in 0..6u8 {
            ring.write_frames(&[value; 4]);
        }
        // Only the newest 4 frames survive.
        assert_eq!(ring.queued_frames(), 4);
        let mut out = [0u8; 16];
        assert_eq!(ring.peek_frames(&mut out, 4), 4);
        assert_eq!(&out[..4], &[2u8; 4]);
        assert_eq!(&out[12..], &[5u8; 4]);
    }

    #[test]
    fn unread_ring_does_not_grow() {
        let ring = LoopbackRing::new(LoopbackType::PostMixPreDsp, 16, 4);
        for _ in 0..1000 {
            ring.write_frames(&[0u8; 64]);
        }
        assert_eq!(ring.queued_frames(), 16);
    }

    #[test]
    fn oversized_write_keeps_newest_window() {
        let ring = LoopbackRing::new(LoopbackType::PostMixPreDsp, 4, 1);
        ring.write_frames(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(ring.queued_frames(), 4);
        let mut out = [0u8; 4];
        assert_eq!(ring.peek_frames(&mut out, 4), 4);
        assert_eq!(out, [5, 6, 7, 8]);
    }
}
