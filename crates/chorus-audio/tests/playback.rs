//! Playback servicing: fetch requests, mixing with shared-buffer
//! accounting, and the draining close.

use std::cell::RefCell;
use std::io::Read;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chorus_audio::dev_io::{DevState, OpenDev, PlaybackVolume};
use chorus_audio::dev_stream::SharedRstream;
use chorus_audio::error::DeviceError;
use chorus_audio::iodev::Iodev;
use chorus_audio::ionode::Ionode;
use chorus_audio::loopback_iodev::{LoopbackRing, LoopbackType};
use chorus_audio::rstream::Rstream;
use chorus_dsp::format::{AudioFormat, SampleFormat};
use chorus_proto::audio::{AudioMessage, AudioMessageId, AUDIO_MESSAGE_LEN};
use chorus_proto::ids::{NodeId, StreamId};
use chorus_proto::types::{Direction, NodeType, StreamFlags};
use chorus_shm::audio_area::region_len;
use chorus_shm::{AudioShm, ShmRegion};

const RATES: &[u32] = &[48000];
const CHANNELS: &[u32] = &[2];
const FORMATS: &[SampleFormat] = &[SampleFormat::S16LE];

/// Playback device writing into an inspectable buffer.
struct FakePlaybackDev {
    format: Option<AudioFormat>,
    nodes: Vec<Ionode>,
    open: bool,
    level: u32,
    scratch: Vec<u8>,
    held: Option<u32>,
    committed: Arc<Mutex<Vec<u8>>>,
}

impl FakePlaybackDev {
    fn new() -> (Self, Arc<Mutex<Vec<u8>>>) {
        let committed = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                format: None,
                nodes: vec![
                    Ionode::new(NodeId::NONE, NodeType::InternalSpeaker, "Fake Speaker")
                        .plugged(true),
                ],
                open: false,
                level: 0,
                scratch: Vec::new(),
                held: None,
                committed: Arc::clone(&committed),
            },
            committed,
        )
    }
}

impl Iodev for FakePlaybackDev {
    fn name(&self) -> &str {
        "Fake Speaker"
    }

    fn direction(&self) -> Direction {
        Direction::Output
    }

    fn supported_rates(&self) -> &[u32] {
        RATES
    }

    fn supported_channel_counts(&self) -> &[u32] {
        CHANNELS
    }

    fn supported_formats(&self) -> &[SampleFormat] {
        FORMATS
    }

    fn buffer_size(&self) -> u32 {
        4096
    }

    fn format(&self) -> Option<&AudioFormat> {
        self.format.as_ref()
    }

    fn set_format(&mut self, format: AudioFormat) -> Result<(), DeviceError> {
        self.format = Some(format);
        Ok(())
    }

    fn open(&mut self) -> Result<(), DeviceError> {
        let format = self.format.ok_or(DeviceError::NoFormat)?;
        self.scratch = vec![0u8; 4096 * format.frame_bytes()];
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn frames_queued(&mut self, now: Instant) -> Result<(u32, Instant), DeviceError> {
        Ok((self.level, now))
    }

    fn get_buffer(&mut self, frames: u32) -> Result<(&mut [u8], u32), DeviceError> {
        let fb = self.format.ok_or(DeviceError::NoFormat)?.frame_bytes();
        let granted = frames.min(4096 - self.level);
        self.held = Some(granted);
        Ok((&mut self.scratch[..granted as usize * fb], granted))
    }

    fn put_buffer(&mut self, frames: u32) -> Result<(), DeviceError> {
        let held = self.held.take().unwrap_or(0);
        let fb = self.format.map(|f| f.frame_bytes()).unwrap_or(4);
        let commit = frames.min(held);
        self.committed
            .lock()
            .unwrap()
            .extend_from_slice(&self.scratch[..commit as usize * fb]);
        self.level += commit;
        Ok(())
    }

    fn nodes(&self) -> &[Ionode] {
        &self.nodes
    }

    fn update_active_node(&mut self, _node_index: usize) {}
}

struct PlaybackHarness {
    shared: SharedRstream,
    client_shm: AudioShm,
    client_sock: UnixStream,
}

impl PlaybackHarness {
    /// Produce `frames` frames of a constant sample from the client side.
    fn client_write(&mut self, frames: u32, sample: i16) {
        let buf = self.client_shm.begin_write();
        for chunk in buf.chunks_exact_mut(2).take(frames as usize * 2) {
            chunk.copy_from_slice(&sample.to_le_bytes());
        }
        self.client_shm.buffer_written(frames);
        self.client_shm.buffer_write_complete(0);
    }
}

fn make_playback_stream(
    dir: &tempfile::TempDir,
    tag: u16,
    cb_threshold: u32,
    start: Instant,
) -> PlaybackHarness {
    let format = AudioFormat::new(SampleFormat::S16LE, 48000, 2);
    let used_size = cb_threshold as usize * format.frame_bytes();
    let path = dir.path().join(format!("shm-{tag}"));
    let region = ShmRegion::create(&path, region_len(used_size)).unwrap();
    let shm = AudioShm::create(region, &format, used_size as u32).unwrap();
    let client_shm = AudioShm::attach(ShmRegion::open(&path).unwrap()).unwrap();

    let (daemon_end, client_end) = UnixStream::pair().unwrap();
    client_end.set_nonblocking(true).unwrap();

    let rstream = Rstream::new(
        StreamId::new(1, tag),
        Direction::Output,
        format,
        cb_threshold * 2,
        cb_threshold,
        cb_threshold,
        StreamFlags::NONE,
        shm,
        daemon_end,
        start,
    )
    .unwrap();
    PlaybackHarness {
        shared: Rc::new(RefCell::new(rstream)),
        client_shm,
        client_sock: client_end,
    }
}

#[test]
fn low_stream_gets_a_data_request() {
    let dir = tempfile::tempdir().unwrap();
    let start = Instant::now();

    let (dev, _committed) = FakePlaybackDev::new();
    let mut odev = OpenDev::new(0, Box::new(dev));
    let mut harness = make_playback_stream(&dir, 1, 480, start);
    harness.client_write(240, 100);
    odev.add_stream(Rc::clone(&harness.shared)).unwrap();

    odev.service_output(start, PlaybackVolume::default(), &[])
        .unwrap();

    let mut buf = [0u8; AUDIO_MESSAGE_LEN];
    (&harness.client_sock).read_exact(&mut buf).unwrap();
    let msg = AudioMessage::decode(&buf).unwrap();
    assert_eq!(msg.id, AudioMessageId::RequestData);
    assert!(msg.frames > 0);
    assert!(harness.shared.borrow().shm().callback_pending());
    // The schedule moved one period ahead.
    assert_eq!(
        harness.shared.borrow().next_cb_ts() - start,
        Duration::from_millis(10)
    );
}

#[test]
fn device_advances_by_slowest_stream() {
    let dir = tempfile::tempdir().unwrap();
    let start = Instant::now();

    let (dev, committed) = FakePlaybackDev::new();
    let mut odev = OpenDev::new(0, Box::new(dev));

    let mut s1 = make_playback_stream(&dir, 1, 480, start);
    s1.client_write(480, 1000);
    odev.add_stream(Rc::clone(&s1.shared)).unwrap();
    let mut s2 = make_playback_stream(&dir, 2, 480, start);
    s2.client_write(240, -400);
    odev.add_stream(Rc::clone(&s2.shared)).unwrap();

    odev.service_output(start, PlaybackVolume::default(), &[])
        .unwrap();

    let bytes = committed.lock().unwrap();
    // Only the 240 frames both streams covered were committed.
    assert_eq!(bytes.len(), 240 * 4);
    let sample = i16::from_le_bytes([bytes[0], bytes[1]]);
    assert_eq!(sample, 600);
}

#[test]
fn committed_mix_feeds_loopback_ring() {
    let dir = tempfile::tempdir().unwrap();
    let start = Instant::now();

    let (dev, _committed) = FakePlaybackDev::new();
    let mut odev = OpenDev::new(0, Box::new(dev));
    let mut harness = make_playback_stream(&dir, 1, 480, start);
    harness.client_write(480, 2500);
    odev.add_stream(Rc::clone(&harness.shared)).unwrap();

    let ring = LoopbackRing::new(LoopbackType::PostMixPreDsp, 8192, 4);
    odev.service_output(start, PlaybackVolume::default(), &[Arc::clone(&ring)])
        .unwrap();

    assert_eq!(ring.queued_frames(), 480);
    let mut out = vec![0u8; 4];
    ring.peek_frames(&mut out, 1);
    assert_eq!(i16::from_le_bytes([out[0], out[1]]), 2500);
}

#[test]
fn muted_output_commits_silence() {
    let dir = tempfile::tempdir().unwrap();
    let start = Instant::now();

    let (dev, committed) = FakePlaybackDev::new();
    let mut odev = OpenDev::new(0, Box::new(dev));
    let mut harness = make_playback_stream(&dir, 1, 480, start);
    harness.client_write(480, 9999);
    odev.add_stream(Rc::clone(&harness.shared)).unwrap();

    let volume = PlaybackVolume {
        software_scaler: 1.0,
        muted: true,
    };
    odev.service_output(start, volume, &[]).unwrap();

    let bytes = committed.lock().unwrap();
    assert!(!bytes.is_empty());
    assert!(bytes.iter().all(|&b| b == 0));
}

#[test]
fn last_stream_detach_drains_then_closes() {
    let dir = tempfile::tempdir().unwrap();
    let start = Instant::now();

    let (dev, _committed) = FakePlaybackDev::new();
    let mut odev = OpenDev::new(0, Box::new(dev));
    let mut harness = make_playback_stream(&dir, 1, 480, start);
    harness.client_write(480, 10);
    odev.add_stream(Rc::clone(&harness.shared)).unwrap();
    assert_eq!(odev.state(), DevState::NormalRun);

    odev.rm_stream(harness.shared.borrow().id());
    assert_eq!(odev.state(), DevState::Draining);

    // First drain pass pads with silence; the level then sits at the pad,
    // so the device closes.
    odev.service_output(start, PlaybackVolume::default(), &[])
        .unwrap();
    assert_eq!(odev.state(), DevState::Closed);
}

#[test]
fn add_then_remove_leaves_device_stream_free() {
    let dir = tempfile::tempdir().unwrap();
    let start = Instant::now();

    let (dev, _committed) = FakePlaybackDev::new();
    let mut odev = OpenDev::new(0, Box::new(dev));
    let harness = make_playback_stream(&dir, 1, 480, start);
    let id = harness.shared.borrow().id();

    odev.add_stream(Rc::clone(&harness.shared)).unwrap();
    assert_eq!(odev.stream_count(), 1);
    assert!(odev.has_stream(id));

    let view = odev.rm_stream(id).unwrap();
    drop(view);
    assert_eq!(odev.stream_count(), 0);
    assert!(!odev.has_stream(id));
}
