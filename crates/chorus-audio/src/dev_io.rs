//! Servicing of open devices: fills, drains, captures and the wake-time
//! computation that paces the audio thread.
//!
//! An [`OpenDev`] walks the state machine
//! `Closed -> OpenPending -> NormalRun -> Draining -> Closed`. In the
//! steady state every service pass moves samples between the device buffer
//! and the attached streams, commits by the minimum progress across
//! streams, and derives the next deadline from device levels and per-stream
//! callback schedules. All arithmetic is done against the level timestamp
//! the device reported, never against a fresh clock read.

use std::time::{Duration, Instant};

use chorus_dsp::format::{frames_at_rate, AudioFormat};
use chorus_dsp::sample::fill_silence;
use chorus_proto::ids::StreamId;
use chorus_proto::types::Direction;
use tracing::{debug, warn};

use crate::buffer_share::BufferShare;
use crate::dev_stream::{DevStream, SharedRstream};
use crate::error::{AudioThreadError, DeviceError};
use crate::iodev::{negotiate_format, Iodev};
use crate::loopback_iodev::LoopbackRing;
use crate::time::frames_to_duration;

/// Devices whose streams are all socket-driven wake at this floor.
pub const HOTWORD_WAKE_DEFAULT: Duration = Duration::from_secs(20);

/// Consecutive fatal buffer errors tolerated before suspension.
pub const MAX_CONSECUTIVE_DEV_ERRORS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevState {
    Closed,
    OpenPending,
    NormalRun,
    Draining,
}

/// Volume decisions the audio thread makes per service pass.
#[derive(Debug, Clone, Copy)]
pub struct PlaybackVolume {
    /// System scaler for software-volume devices; 1.0 otherwise.
    pub software_scaler: f32,
    pub muted: bool,
}

impl Default for PlaybackVolume {
    fn default() -> Self {
        Self {
            software_scaler: 1.0,
            muted: false,
        }
    }
}

/// An active device plus its attached stream views.
pub struct OpenDev {
    index: u32,
    dev: Box<dyn Iodev>,
    streams: Vec<DevStream>,
    buff_state: BufferShare,
    state: DevState,
    wake_ts: Option<Instant>,
    min_cb_level: u32,
    max_cb_level: u32,
    consecutive_errors: u32,
    drain_padded: bool,
    tap_buf: Vec<u8>,
}

impl OpenDev {
    pub fn new(index: u32, dev: Box<dyn Iodev>) -> Self {
        let window = dev.buffer_size();
        Self {
            index,
            dev,
            streams: Vec::new(),
            buff_state: BufferShare::new(window),
            state: DevState::Closed,
            wake_ts: None,
            min_cb_level: 0,
            max_cb_level: 0,
            consecutive_errors: 0,
            drain_padded: false,
            tap_buf: Vec::new(),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn direction(&self) -> Direction {
        self.dev.direction()
    }

    pub fn state(&self) -> DevState {
        self.state
    }

    pub fn wake_ts(&self) -> Option<Instant> {
        self.wake_ts
    }

    pub fn dev(&self) -> &dyn Iodev {
        self.dev.as_ref()
    }

    pub fn dev_mut(&mut self) -> &mut dyn Iodev {
        self.dev.as_mut()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.streams.iter().map(|ds| ds.id()).collect()
    }

    pub fn streams(&self) -> &[DevStream] {
        &self.streams
    }

    pub fn has_stream(&self, id: StreamId) -> bool {
        self.streams.iter().any(|ds| ds.id() == id)
    }

    fn dev_rate(&self) -> u32 {
        self.dev.format().map(|f| f.frame_rate).unwrap_or(48000)
    }

    fn dev_format(&self) -> Result<AudioFormat, DeviceError> {
        self.dev.format().copied().ok_or(DeviceError::NoFormat)
    }

    /// `Closed -> OpenPending -> NormalRun`: negotiate a format close to
    /// `wanted` and open the hardware.
    pub fn open_device(&mut self, wanted: &AudioFormat) -> Result<(), DeviceError> {
        self.state = DevState::OpenPending;
        match negotiate_format(self.dev.as_mut(), wanted).and_then(|_| self.dev.open()) {
            Ok(()) => {
                let active = self.dev.active_node_index();
                self.dev.update_active_node(active);
                self.state = DevState::NormalRun;
                self.consecutive_errors = 0;
                self.drain_padded = false;
                self.buff_state = BufferShare::new(self.dev.buffer_size());
                Ok(())
            },
            Err(e) => {
                self.state = DevState::Closed;
                Err(e)
            },
        }
    }

    pub fn close_device(&mut self) {
        if self.dev.is_open() {
            if let Err(e) = self.dev.close() {
                warn!(dev = self.index, error = %e, "closing device failed");
            }
        }
        self.state = DevState::Closed;
        self.wake_ts = None;
    }

    /// Attach a stream, opening the device first if needed.
    pub fn add_stream(&mut self, stream: SharedRstream) -> Result<(), AudioThreadError> {
        if !matches!(self.state, DevState::NormalRun | DevState::Draining) {
            let wanted = *stream.borrow().format();
            self.open_device(&wanted)?;
        }
        // A new stream rescues a draining playback device.
        if self.state == DevState::Draining {
            self.state = DevState::NormalRun;
            self.drain_padded = false;
        }
        let dev_format = self.dev_format()?;
        let ds = DevStream::new(stream, &dev_format, self.dev.buffer_size())?;
        self.buff_state.add_id(ds.id().as_u32());
        self.streams.push(ds);
        self.update_cb_levels();
        Ok(())
    }

    /// Detach a stream. The last playback stream puts the device into
    /// `Draining`; the last capture stream closes it immediately.
    pub fn rm_stream(&mut self, id: StreamId) -> Option<DevStream> {
        let pos = self.streams.iter().position(|ds| ds.id() == id)?;
        let ds = self.streams.remove(pos);
        self.buff_state.rm_id(id.as_u32());
        self.update_cb_levels();
        if self.streams.is_empty() {
            match self.dev.direction() {
                Direction::Output => {
                    if self.state == DevState::NormalRun {
                        self.state = DevState::Draining;
                        self.drain_padded = false;
                    }
                },
                Direction::Input => self.close_device(),
            }
        }
        Some(ds)
    }

    fn update_cb_levels(&mut self) {
        let rate = self.dev_rate();
        let levels = self.streams.iter().map(|ds| {
            let rstream = ds.stream();
            frames_at_rate(rstream.cb_threshold(), rstream.frame_rate(), rate)
        });
        self.min_cb_level = levels.clone().min().unwrap_or(0);
        self.max_cb_level = levels.max().unwrap_or(0);
    }

    /// Target fill level for playback: two callbacks of headroom, enough
    /// for the largest attached callback, capped by the device buffer.
    fn target_level(&self) -> u32 {
        let base = if self.min_cb_level > 0 {
            (self.min_cb_level * 2).max(self.max_cb_level)
        } else {
            2048
        };
        base.min(self.dev.buffer_size())
    }

    // ---- capture path ----

    /// Move captured device frames into every attached stream, advancing
    /// the device by the minimum progress. System capture mute substitutes
    /// silence without disturbing the flow. Returns streams that failed.
    pub fn capture_to_streams(
        &mut self,
        now: Instant,
        capture_muted: bool,
    ) -> Result<Vec<StreamId>, DeviceError> {
        let mut failed = Vec::new();
        let format = self.dev_format()?;
        let fb = format.frame_bytes();
        loop {
            let (level, _ts) = self.dev.frames_queued(now)?;
            if level == 0 {
                break;
            }
            let (buf, got) = self.dev.get_buffer(level)?;
            if got == 0 {
                self.dev.put_buffer(0)?;
                break;
            }
            if capture_muted {
                fill_silence(&mut buf[..got as usize * fb], format.sample_format);
            }
            for ds in self.streams.iter_mut() {
                let id = ds.id();
                let already = self.buff_state.frames(id.as_u32());
                if already >= got {
                    continue;
                }
                let chunk = &buf[already as usize * fb..got as usize * fb];
                match ds.capture_sink(chunk, got - already) {
                    Ok(consumed) => {
                        self.buff_state.set_frames(id.as_u32(), already + consumed);
                    },
                    Err(e) => {
                        warn!(stream = %id, error = %e, "capture sink failed");
                        failed.push(id);
                    },
                }
            }
            let commit = if self.streams.is_empty() {
                got
            } else {
                self.buff_state.min_frames().min(got)
            };
            self.dev.put_buffer(commit)?;
            self.buff_state.advance(commit);
            if commit == 0 {
                // No stream can take more; stop instead of spinning.
                break;
            }
        }
        Ok(failed)
    }

    /// Deliver due capture callbacks to clients.
    pub fn send_captured_samples(
        &mut self,
        now: Instant,
        ts_nanos: u64,
    ) -> Vec<StreamId> {
        let mut failed = Vec::new();
        for ds in self.streams.iter_mut() {
            match ds.capture_update_rstream(now, ts_nanos) {
                Ok(fired) => {
                    if fired {
                        debug!(stream = %ds.id(), "capture callback delivered");
                    }
                },
                Err(e) => {
                    warn!(stream = %ds.id(), error = %e, "capture callback failed");
                    failed.push(ds.id());
                },
            }
        }
        failed
    }

    /// Recompute the capture wake deadline from stream demands, floored at
    /// the hotword default when every stream is socket-driven.
    pub fn update_input_wake_ts(&mut self, now: Instant) -> Result<(), DeviceError> {
        let (level, level_ts) = self.dev.frames_queued(now)?;
        let rate = self.dev_rate();
        let mut wake = level_ts + HOTWORD_WAKE_DEFAULT;
        for ds in self.streams.iter() {
            if let Some(t) = ds.capture_wake_time(level, level_ts, rate) {
                wake = wake.min(t);
            }
        }
        self.wake_ts = Some(wake);
        Ok(())
    }

    /// Full capture service pass.
    pub fn service_input(
        &mut self,
        now: Instant,
        ts_nanos: u64,
    ) -> Result<Vec<StreamId>, DeviceError> {
        self.service_input_muted(now, ts_nanos, false)
    }

    /// Capture service pass with the system capture-mute decision applied.
    pub fn service_input_muted(
        &mut self,
        now: Instant,
        ts_nanos: u64,
        capture_muted: bool,
    ) -> Result<Vec<StreamId>, DeviceError> {
        if self.state != DevState::NormalRun {
            return Ok(Vec::new());
        }
        let mut failed = self.capture_to_streams(now, capture_muted)?;
        failed.extend(self.send_captured_samples(now, ts_nanos));
        self.update_input_wake_ts(now)?;
        Ok(failed)
    }

    // ---- playback path ----

    /// Ask clients for more data where the callback schedule is due.
    pub fn fetch_playback_streams(&mut self, now: Instant) -> Vec<StreamId> {
        let mut failed = Vec::new();
        for ds in self.streams.iter_mut() {
            let mut rstream = ds.stream_mut();
            if now < rstream.next_cb_ts() {
                continue;
            }
            if rstream.shm().callback_pending() {
                continue;
            }
            let readable = rstream.shm().readable_frames();
            if readable < rstream.cb_threshold() {
                let writable = rstream
                    .buffer_frames()
                    .saturating_sub(readable)
                    .max(rstream.min_cb_level());
                if let Err(e) = rstream.request_data(writable) {
                    warn!(stream = %rstream.id(), error = %e, "data request failed");
                    failed.push(rstream.id());
                    continue;
                }
            }
            rstream.update_next_cb_ts();
        }
        failed
    }

    /// Mix attached streams into the device buffer and commit the minimum
    /// progress; feeds loopback taps with the committed mix.
    pub fn write_output_samples(
        &mut self,
        now: Instant,
        volume: PlaybackVolume,
        loopbacks: &[std::sync::Arc<LoopbackRing>],
    ) -> Result<Vec<StreamId>, DeviceError> {
        let mut failed = Vec::new();
        let format = self.dev_format()?;
        let fb = format.frame_bytes();

        let (level, _ts) = self.dev.frames_queued(now)?;
        let target = self.target_level();
        if level >= target {
            return Ok(failed);
        }
        let to_fill = target - level;

        let (buf, got) = self.dev.get_buffer(to_fill)?;
        if got == 0 {
            self.dev.put_buffer(0)?;
            return Ok(failed);
        }
        fill_silence(&mut buf[..got as usize * fb], format.sample_format);

        for ds in self.streams.iter_mut() {
            let id = ds.id();
            let already = self.buff_state.frames(id.as_u32());
            if already >= got {
                continue;
            }
            match ds.mix_into(buf, already, got - already, volume.software_scaler) {
                Ok(mixed) => {
                    self.buff_state.set_frames(id.as_u32(), already + mixed);
                },
                Err(e) => {
                    warn!(stream = %id, error = %e, "mixing stream failed");
                    failed.push(id);
                },
            }
        }

        let commit = if self.streams.is_empty() {
            got
        } else {
            self.buff_state.min_frames().min(got)
        };
        let commit_bytes = commit as usize * fb;
        if volume.muted {
            fill_silence(&mut buf[..commit_bytes], format.sample_format);
        }
        if commit > 0 && !loopbacks.is_empty() {
            if self.tap_buf.len() < commit_bytes {
                self.tap_buf.resize(commit_bytes, 0);
            }
            self.tap_buf[..commit_bytes].copy_from_slice(&buf[..commit_bytes]);
        }

        self.dev.put_buffer(commit)?;
        self.buff_state.advance(commit);

        if commit > 0 {
            for ring in loopbacks {
                ring.write_frames(&self.tap_buf[..commit_bytes]);
            }
        }
        Ok(failed)
    }

    /// Recompute the playback wake deadline: the time until the hardware
    /// drains to one callback, bounded by per-stream schedules.
    pub fn update_output_wake_ts(&mut self, now: Instant) -> Result<(), DeviceError> {
        let (level, level_ts) = self.dev.frames_queued(now)?;
        let rate = self.dev_rate();
        let headroom = level.saturating_sub(self.min_cb_level);
        let mut wake = level_ts + frames_to_duration(u64::from(headroom), rate);
        for ds in self.streams.iter() {
            wake = wake.min(ds.playback_wake_time(now, rate));
        }
        self.wake_ts = Some(wake);
        Ok(())
    }

    /// Full playback service pass. Returns streams that failed; a finished
    /// drain is visible as `state()` turning `Closed`.
    pub fn service_output(
        &mut self,
        now: Instant,
        volume: PlaybackVolume,
        loopbacks: &[std::sync::Arc<LoopbackRing>],
    ) -> Result<Vec<StreamId>, DeviceError> {
        match self.state {
            DevState::NormalRun => {
                let mut failed = self.fetch_playback_streams(now);
                failed.extend(self.write_output_samples(now, volume, loopbacks)?);
                self.update_output_wake_ts(now)?;
                Ok(failed)
            },
            DevState::Draining => {
                self.drain_playback(now)?;
                Ok(Vec::new())
            },
            _ => Ok(Vec::new()),
        }
    }

    /// Draining: pad once with silence against an underrun pop, then close
    /// when the level has fallen to the padding.
    pub fn drain_playback(&mut self, now: Instant) -> Result<bool, DeviceError> {
        let format = self.dev_format()?;
        let pad = self.min_cb_level.max(256);
        if !self.drain_padded {
            let fb = format.frame_bytes();
            let (buf, got) = self.dev.get_buffer(pad)?;
            fill_silence(&mut buf[..got as usize * fb], format.sample_format);
            self.dev.put_buffer(got)?;
            self.drain_padded = true;
        }
        let (level, level_ts) = self.dev.frames_queued(now)?;
        if level <= pad {
            debug!(dev = self.index, "drained, closing");
            self.close_device();
            return Ok(true);
        }
        let rate = self.dev_rate();
        self.wake_ts = Some(level_ts + frames_to_duration(u64::from(level - pad), rate));
        Ok(false)
    }

    // ---- failure handling ----

    /// Reset after an xrun: reopen the device and clear per-stream window
    /// accounting without dropping any stream.
    pub fn recover_from_xrun(&mut self) -> Result<(), DeviceError> {
        warn!(dev = self.index, "xrun, resetting device");
        if self.dev.is_open() {
            let _ = self.dev.close();
        }
        self.dev.open()?;
        self.buff_state.reset();
        Ok(())
    }

    /// Track a device error; returns true when the error budget is spent
    /// and the device must be suspended.
    pub fn note_device_error(&mut self) -> bool {
        self.consecutive_errors += 1;
        self.consecutive_errors >= MAX_CONSECUTIVE_DEV_ERRORS
    }

    pub fn clear_device_errors(&mut self) {
        self.consecutive_errors = 0;
    }

    /// Tear down and hand back every stream view, e.g. for reattachment to
    /// the fallback device.
    pub fn take_streams(&mut self) -> Vec<DevStream> {
        for ds in self.streams.iter() {
            self.buff_state.rm_id(ds.id().as_u32());
        }
        std::mem::take(&mut self.streams)
    }

    /// Release the inner device, consuming this open-dev.
    pub fn into_iodev(mut self) -> Box<dyn Iodev> {
        self.close_device();
        self.dev
    }
}
