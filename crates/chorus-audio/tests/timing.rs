//! Wake-time scheduling behavior of capture devices.
//!
//! Each test builds an open capture device with a controllable frame level,
//! attaches streams with known shm fill and callback schedules, runs one
//! service pass and checks the computed wake deadline. All expectations are
//! expressed relative to a fixed start timestamp; the device reports its
//! level as measured at that timestamp, so the arithmetic is exact.

use std::cell::RefCell;
use std::os::fd::RawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::{Duration, Instant};

use chorus_audio::dev_io::OpenDev;
use chorus_audio::dev_stream::SharedRstream;
use chorus_audio::error::DeviceError;
use chorus_audio::iodev::Iodev;
use chorus_audio::ionode::Ionode;
use chorus_audio::rstream::Rstream;
use chorus_dsp::format::{AudioFormat, SampleFormat};
use chorus_proto::ids::{NodeId, StreamId};
use chorus_proto::types::{Direction, NodeType, StreamFlags};
use chorus_shm::audio_area::region_len;
use chorus_shm::{AudioShm, ShmRegion};

const FAKE_RATES: &[u32] = &[48000, 44100, 16000];
const FAKE_CHANNELS: &[u32] = &[2, 1];
const FAKE_FORMATS: &[SampleFormat] = &[SampleFormat::S16LE];

/// Capture device with a level pinned by the test.
struct FakeCaptureDev {
    format: Option<AudioFormat>,
    nodes: Vec<Ionode>,
    open: bool,
    level: u32,
    level_ts: Instant,
    scratch: Vec<u8>,
    held: Option<u32>,
}

impl FakeCaptureDev {
    fn new(level: u32, level_ts: Instant) -> Self {
        Self {
            format: None,
            nodes: vec![Ionode::new(NodeId::NONE, NodeType::Mic, "Fake Mic").plugged(true)],
            open: false,
            level,
            level_ts,
            scratch: Vec::new(),
            held: None,
        }
    }
}

impl Iodev for FakeCaptureDev {
    fn name(&self) -> &str {
        "Fake Mic"
    }

    fn direction(&self) -> Direction {
        Direction::Input
    }

    fn supported_rates(&self) -> &[u32] {
        FAKE_RATES
    }

    fn supported_channel_counts(&self) -> &[u32] {
        FAKE_CHANNELS
    }

    fn supported_formats(&self) -> &[SampleFormat] {
        FAKE_FORMATS
    }

    fn buffer_size(&self) -> u32 {
        16384
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
        self.scratch = vec![0u8; 16384 * format.frame_bytes()];
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

    fn frames_queued(&mut self, _now: Instant) -> Result<(u32, Instant), DeviceError> {
        Ok((self.level, self.level_ts))
    }

    fn get_buffer(&mut self, frames: u32) -> Result<(&mut [u8], u32), DeviceError> {
        let fb = self.format.ok_or(DeviceError::NoFormat)?.frame_bytes();
        let granted = frames.min(self.level);
        self.held = Some(granted);
        Ok((&mut self.scratch[..granted as usize * fb], granted))
    }

    fn put_buffer(&mut self, frames: u32) -> Result<(), DeviceError> {
        let held = self.held.take().unwrap_or(0);
        self.level -= frames.min(held);
        Ok(())
    }

    fn nodes(&self) -> &[Ionode] {
        &self.nodes
    }

    fn update_active_node(&mut self, _node_index: usize) {}
}

struct StreamHarness {
    shared: SharedRstream,
    /// Keeps the client end of the audio socket open.
    _client: UnixStream,
}

impl StreamHarness {
    fn next_cb_ts(&self) -> Instant {
        self.shared.borrow().next_cb_ts()
    }

    fn audio_fd(&self) -> RawFd {
        self.shared.borrow().audio_fd()
    }

    /// Append frames to the open shm buffer without committing.
    fn fill(&self, frames: u32) {
        let mut rstream = self.shared.borrow_mut();
        let shm = rstream.shm_mut();
        shm.begin_write();
        shm.buffer_written(frames);
    }

    /// Append frames and commit the buffer, as a completed burst would.
    fn fill_commit(&self, frames: u32) {
        let mut rstream = self.shared.borrow_mut();
        let shm = rstream.shm_mut();
        shm.begin_write();
        shm.buffer_written(frames);
        shm.buffer_write_complete(0);
    }
}

fn make_stream(
    dir: &tempfile::TempDir,
    tag: u16,
    rate: u32,
    cb_threshold: u32,
    flags: StreamFlags,
    next_cb_ts: Instant,
) -> StreamHarness {
    let format = AudioFormat::new(SampleFormat::S16LE, rate, 2);
    let used_size = cb_threshold as usize * format.frame_bytes();
    let region = ShmRegion::create(
        &dir.path().join(format!("shm-{tag}")),
        region_len(used_size),
    )
    .unwrap();
    let shm = AudioShm::create(region, &format, used_size as u32).unwrap();
    let (daemon_end, client_end) = UnixStream::pair().unwrap();
    client_end.set_nonblocking(true).unwrap();

    let mut rstream = Rstream::new(
        StreamId::new(1, tag),
        Direction::Input,
        format,
        cb_threshold * 2,
        cb_threshold,
        cb_threshold,
        flags,
        shm,
        daemon_end,
        next_cb_ts,
    )
    .unwrap();
    rstream.set_next_cb_ts(next_cb_ts);
    StreamHarness {
        shared: Rc::new(RefCell::new(rstream)),
        _client: client_end,
    }
}

fn make_open_dev(
    dev_level: u32,
    start: Instant,
    dev_rate: u32,
    streams: &[&StreamHarness],
) -> OpenDev {
    let mut fake = FakeCaptureDev::new(dev_level, start);
    fake.set_format(AudioFormat::new(SampleFormat::S16LE, dev_rate, 2))
        .unwrap();
    let mut odev = OpenDev::new(0, Box::new(fake));
    odev.open_device(&AudioFormat::new(SampleFormat::S16LE, dev_rate, 2))
        .unwrap();
    for harness in streams {
        odev.add_stream(Rc::clone(&harness.shared)).unwrap();
    }
    odev
}

fn wake_after_service(odev: &mut OpenDev, now: Instant) -> Instant {
    odev.service_input(now, 0).unwrap();
    odev.wake_ts().expect("wake deadline computed")
}

// One device, one stream, a full callback of data buffered: after the
// service cycle the wake lands exactly one callback interval out and equals
// the stream's own schedule.
#[test]
fn wait_after_fill() {
    let dir = tempfile::tempdir().unwrap();
    let start = Instant::now();

    let stream = make_stream(&dir, 1, 48000, 480, StreamFlags::NONE, start);
    stream.fill(480);

    let mut odev = make_open_dev(0, start, 48000, &[&stream]);
    let wake = wake_after_service(&mut odev, start);

    assert_eq!(wake, stream.next_cb_ts());
    assert_eq!(wake - start, Duration::from_millis(10));
}

// Device at 48 kHz, stream at 44.1 kHz: the callback interval survives the
// rate conversion.
#[test]
fn wait_after_fill_src() {
    let dir = tempfile::tempdir().unwrap();
    let start = Instant::now();

    let stream = make_stream(&dir, 1, 44100, 441, StreamFlags::NONE, start);
    stream.fill(441);

    let mut odev = make_open_dev(0, start, 48000, &[&stream]);
    let wake = wake_after_service(&mut odev, start);

    let delta = wake - start;
    assert!(delta > Duration::from_micros(9900), "{delta:?}");
    assert!(delta < Duration::from_micros(10100), "{delta:?}");
}

// Two streams, one ready and one half-filled: the sleep is the time the
// device needs to produce the missing half callback.
#[test]
fn wait_two_streams_same_format() {
    let dir = tempfile::tempdir().unwrap();
    let start = Instant::now();

    let stream1 = make_stream(&dir, 1, 48000, 480, StreamFlags::NONE, start);
    stream1.fill(480);
    let stream2 = make_stream(&dir, 2, 48000, 480, StreamFlags::NONE, start);
    stream2.fill(240);

    let mut odev = make_open_dev(0, start, 48000, &[&stream1, &stream2]);
    let wake = wake_after_service(&mut odev, start);

    let delta = wake - start;
    assert!(delta > Duration::from_micros(4900), "{delta:?}");
    assert!(delta < Duration::from_micros(5100), "{delta:?}");
}

// A 44.1 kHz device feeding a 44.1 kHz stream (ready) and a 48 kHz stream
// (half-filled): 240 output-rate frames converted back to device rate set
// the sleep.
#[test]
fn wait_two_streams_different_rates() {
    let dir = tempfile::tempdir().unwrap();
    let start = Instant::now();

    let stream1 = make_stream(&dir, 1, 44100, 441, StreamFlags::NONE, start);
    stream1.fill(441);
    let stream2 = make_stream(&dir, 2, 48000, 480, StreamFlags::NONE, start);
    stream2.fill(240);

    let mut odev = make_open_dev(0, start, 44100, &[&stream1, &stream2]);
    let wake = wake_after_service(&mut odev, start);

    let delta = wake - start;
    assert!(delta > Duration::from_micros(4900), "{delta:?}");
    assert!(delta < Duration::from_micros(5100), "{delta:?}");
}

// Both streams full, callbacks scheduled 3 ms and 5 ms out, the device
// already holding a callback of samples: the earlier schedule wins.
#[test]
fn wait_two_streams_different_wakeup_times() {
    let dir = tempfile::tempdir().unwrap();
    let start = Instant::now();

    let stream1 = make_stream(
        &dir,
        1,
        44100,
        441,
        StreamFlags::NONE,
        start + Duration::from_millis(3),
    );
    stream1.fill(441);
    let stream2 = make_stream(
        &dir,
        2,
        48000,
        480,
        StreamFlags::NONE,
        start + Duration::from_millis(5),
    );
    stream2.fill(480);

    let mut odev = make_open_dev(441, start, 44100, &[&stream1, &stream2]);
    let wake = wake_after_service(&mut odev, start);

    let delta = wake - start;
    assert!(delta > Duration::from_micros(2900), "{delta:?}");
    assert!(delta < Duration::from_micros(3100), "{delta:?}");
}

// A hotword stream below its callback threshold is paced by the device:
// wake when the remaining shm space would fill at device rate, ignoring the
// stream's own schedule.
#[test]
fn hotword_stream_uses_dev_timing() {
    let dir = tempfile::tempdir().unwrap();
    let start = Instant::now();

    let stream = make_stream(
        &dir,
        1,
        48000,
        240,
        StreamFlags::HOTWORD,
        start + Duration::from_millis(3),
    );
    stream.fill(192);

    let mut odev = make_open_dev(0, start, 48000, &[&stream]);
    let wake = wake_after_service(&mut odev, start);

    // 480 - 192 = 288 frames at 48 kHz.
    assert_eq!(wake - start, Duration::from_millis(6));
}

// A hotword stream that received a bulk burst at or above the threshold is
// socket-driven: its fd is polled and the device deadline rests at the long
// default.
#[test]
fn hotword_stream_bulk_data() {
    let dir = tempfile::tempdir().unwrap();
    let start = Instant::now();

    let stream = make_stream(&dir, 1, 48000, 240, StreamFlags::HOTWORD, start);
    stream.fill_commit(240);
    stream.fill_commit(240);

    let mut odev = make_open_dev(7000, start, 48000, &[&stream]);
    let wake = wake_after_service(&mut odev, start);

    let poll_fd = odev.streams()[0].poll_stream_fd();
    assert_eq!(poll_fd, Some(stream.audio_fd()));

    let delta = wake - start;
    assert!(delta > Duration::from_secs(19), "{delta:?}");
    assert!(delta < Duration::from_secs(21), "{delta:?}");
}

// The boundary case buffer_frames == cb_threshold still schedules: the
// callback fires and the schedule advances by exactly one period.
#[test]
fn buffer_equal_to_threshold_advances_schedule() {
    let dir = tempfile::tempdir().unwrap();
    let start = Instant::now();

    let stream = make_stream(&dir, 1, 48000, 480, StreamFlags::NONE, start);
    stream.fill(480);
    let before = stream.next_cb_ts();

    let mut odev = make_open_dev(0, start, 48000, &[&stream]);
    odev.service_input(start, 0).unwrap();

    assert_eq!(stream.next_cb_ts() - before, Duration::from_millis(10));
    // The delivered callback reached the client socket.
    let mut buf = [0u8; 12];
    use std::io::Read;
    let mut client = &stream._client;
    client.read_exact(&mut buf).unwrap();
}
