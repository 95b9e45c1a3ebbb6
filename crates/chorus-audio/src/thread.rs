//! The realtime audio thread.
//!
//! Exactly one per daemon. It owns every open device and every live stream,
//! and suspends only in `poll(2)` over the command wake pipe, the streams'
//! audio sockets and the nearest device deadline. The control thread talks
//! to it through a typed command channel; each command carries its own
//! reply channel and commands are handled in FIFO order.

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, info, warn};

use chorus_proto::audio::AudioMessageId;
use chorus_proto::ids::StreamId;
use chorus_proto::types::Direction;
use chorus_shm::ServerStateShm;

use crate::dev_io::{DevState, OpenDev, PlaybackVolume};
use crate::dev_stream::SharedRstream;
use crate::error::{AudioThreadError, DeviceError, StreamError};
use crate::iodev::Iodev;
use crate::loopback_iodev::LoopbackRing;
use crate::poll::{wake_pipe, Poller, WakeReader, WakeWriter};
use crate::rstream::Rstream;
use crate::time::wall_nanos;

/// Reserved device index of the playback fallback device.
pub const FALLBACK_OUTPUT_INDEX: u32 = u32::MAX;
/// Reserved device index of the capture fallback device.
pub const FALLBACK_INPUT_INDEX: u32 = u32::MAX - 1;

/// Longest the thread will sleep with nothing scheduled.
const IDLE_WAKE: Duration = Duration::from_secs(2);

/// Commands from the control thread. Synchronous commands reply with an
/// error code before the sender issues the next one.
pub enum AudioCommand {
    AddStream {
        stream: Box<Rstream>,
        reply: Sender<Result<(), AudioThreadError>>,
    },
    RemoveStream {
        stream_id: StreamId,
        reply: Sender<Result<(), AudioThreadError>>,
    },
    AddActiveDev {
        index: u32,
        dev: Box<dyn Iodev>,
        /// Present when the device is the capture end of a loopback; its
        /// ring is registered as a tap on the playback mix.
        loopback: Option<Arc<LoopbackRing>>,
        reply: Sender<Result<(), AudioThreadError>>,
    },
    RemoveActiveDev {
        index: u32,
        reply: Sender<Result<Box<dyn Iodev>, AudioThreadError>>,
    },
    DumpDebugInfo {
        reply: Sender<AudioDebugInfo>,
    },
    Shutdown {
        reply: Sender<()>,
    },
}

/// Unsolicited notifications to the control thread.
pub enum AudioEvent {
    /// The stream's audio socket failed; the control thread should
    /// disconnect the client stream.
    StreamSocketError(StreamId),
    /// A device hit its error budget; streams moved to the fallback and the
    /// closed driver is handed back for safekeeping.
    DeviceSuspended { index: u32, dev: Box<dyn Iodev> },
    /// Streams were moved between devices and clients should re-sync.
    StreamsReattached(Vec<StreamId>),
}

/// Snapshot for `DumpDebugInfo`.
#[derive(Debug, Clone)]
pub struct AudioDebugInfo {
    pub num_streams: usize,
    pub devs: Vec<DevDebugInfo>,
}

#[derive(Debug, Clone)]
pub struct DevDebugInfo {
    pub index: u32,
    pub name: String,
    pub direction: Direction,
    pub state: DevState,
    pub num_streams: usize,
}

/// Control-side handle; commands are serialized through it.
pub struct AudioThreadHandle {
    cmd_tx: Sender<AudioCommand>,
    wake: WakeWriter,
    join: Option<JoinHandle<()>>,
}

impl AudioThreadHandle {
    fn send(&self, cmd: AudioCommand) -> Result<(), AudioThreadError> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| AudioThreadError::ThreadExited)?;
        self.wake.notify();
        Ok(())
    }

    pub fn add_stream(&self, stream: Rstream) -> Result<(), AudioThreadError> {
        let (reply, rx) = bounded(1);
        self.send(AudioCommand::AddStream {
            stream: Box::new(stream),
            reply,
        })?;
        rx.recv().map_err(|_| AudioThreadError::ThreadExited)?
    }

    pub fn remove_stream(&self, stream_id: StreamId) -> Result<(), AudioThreadError> {
        let (reply, rx) = bounded(1);
        self.send(AudioCommand::RemoveStream { stream_id, reply })?;
        rx.recv().map_err(|_| AudioThreadError::ThreadExited)?
    }

    pub fn add_active_dev(
        &self,
        index: u32,
        dev: Box<dyn Iodev>,
        loopback: Option<Arc<LoopbackRing>>,
    ) -> Result<(), AudioThreadError> {
        let (reply, rx) = bounded(1);
        self.send(AudioCommand::AddActiveDev {
            index,
            dev,
            loopback,
            reply,
        })?;
        rx.recv().map_err(|_| AudioThreadError::ThreadExited)?
    }

    pub fn remove_active_dev(&self, index: u32) -> Result<Box<dyn Iodev>, AudioThreadError> {
        let (reply, rx) = bounded(1);
        self.send(AudioCommand::RemoveActiveDev { index, reply })?;
        rx.recv().map_err(|_| AudioThreadError::ThreadExited)?
    }

    pub fn dump_debug_info(&self) -> Result<AudioDebugInfo, AudioThreadError> {
        let (reply, rx) = bounded(1);
        self.send(AudioCommand::DumpDebugInfo { reply })?;
        rx.recv().map_err(|_| AudioThreadError::ThreadExited)
    }
}

impl Drop for AudioThreadHandle {
    fn drop(&mut self) {
        let (reply, rx) = bounded(1);
        if self.send(AudioCommand::Shutdown { reply }).is_ok() {
            let _ = rx.recv_timeout(Duration::from_secs(1));
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Spawn the audio thread with one fallback device per direction.
pub fn spawn_audio_thread(
    fallback_output: Box<dyn Iodev>,
    fallback_input: Box<dyn Iodev>,
    state_shm: Option<ServerStateShm>,
    events: Sender<AudioEvent>,
    event_wake: WakeWriter,
) -> Result<AudioThreadHandle, AudioThreadError> {
    let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
    let (wake_rx, wake_tx) = wake_pipe().map_err(AudioThreadError::Spawn)?;

    let join = std::thread::Builder::new()
        .name("chorus-audio".to_string())
        .spawn(move || {
            let worker = AudioThreadWorker {
                cmd_rx,
                wake: wake_rx,
                events,
                event_wake,
                open_devs: Vec::new(),
                fallback_output: OpenDev::new(FALLBACK_OUTPUT_INDEX, fallback_output),
                fallback_input: OpenDev::new(FALLBACK_INPUT_INDEX, fallback_input),
                streams: HashMap::new(),
                loopbacks: Vec::new(),
                state_shm,
            };
            worker.run();
        })
        .map_err(AudioThreadError::Spawn)?;

    Ok(AudioThreadHandle {
        cmd_tx,
        wake: wake_tx,
        join: Some(join),
    })
}

struct AudioThreadWorker {
    cmd_rx: Receiver<AudioCommand>,
    wake: WakeReader,
    events: Sender<AudioEvent>,
    event_wake: WakeWriter,
    open_devs: Vec<OpenDev>,
    fallback_output: OpenDev,
    fallback_input: OpenDev,
    streams: HashMap<StreamId, SharedRstream>,
    loopbacks: Vec<Arc<LoopbackRing>>,
    state_shm: Option<ServerStateShm>,
}

impl AudioThreadWorker {
    fn run(mut self) {
        let _rt_handle = promote_to_realtime();
        info!("audio thread running");

        let mut poller = Poller::new();
        loop {
            let now = Instant::now();
            self.service_due_devices(now);

            let deadline = self.next_wake();
            let timeout = deadline
                .map(|ts| ts.saturating_duration_since(now))
                .unwrap_or(IDLE_WAKE);

            poller.clear();
            let wake_slot = poller.add(self.wake.as_raw_fd());
            let stream_fds: Vec<(StreamId, usize)> = self
                .streams
                .iter()
                .map(|(&id, stream)| {
                    let fd: RawFd = stream.borrow().audio_fd();
                    (id, poller.add(fd))
                })
                .collect();

            if let Err(e) = poller.poll(Some(timeout)) {
                warn!(error = %e, "poll failed");
                continue;
            }

            if poller.readable(wake_slot) {
                self.wake.drain();
                if !self.drain_commands() {
                    break;
                }
            }

            let mut dead = Vec::new();
            for (id, slot) in stream_fds {
                if poller.hung_up(slot) {
                    dead.push(id);
                    continue;
                }
                if poller.readable(slot) && !self.handle_stream_message(id) {
                    dead.push(id);
                }
            }
            for id in dead {
                self.fail_stream(id);
            }
        }

        info!("audio thread exiting");
        self.shutdown_devices();
    }

    /// Handle every queued command; false means shutdown was requested.
    fn drain_commands(&mut self) -> bool {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                AudioCommand::AddStream { stream, reply } => {
                    let result = self.add_stream(*stream);
                    let _ = reply.send(result);
                },
                AudioCommand::RemoveStream { stream_id, reply } => {
                    let result = self.remove_stream(stream_id);
                    let _ = reply.send(result);
                },
                AudioCommand::AddActiveDev {
                    index,
                    dev,
                    loopback,
                    reply,
                } => {
                    let result = self.add_active_dev(index, dev, loopback);
                    let _ = reply.send(result);
                },
                AudioCommand::RemoveActiveDev { index, reply } => {
                    let result = self.remove_active_dev(index);
                    let _ = reply.send(result);
                },
                AudioCommand::DumpDebugInfo { reply } => {
                    let _ = reply.send(self.debug_info());
                },
                AudioCommand::Shutdown { reply } => {
                    let _ = reply.send(());
                    return false;
                },
            }
        }
        true
    }

    fn add_stream(&mut self, stream: Rstream) -> Result<(), AudioThreadError> {
        let id = stream.id();
        let direction = stream.direction();
        let shared: SharedRstream = Rc::new(RefCell::new(stream));

        let mut attached = 0usize;
        for odev in self.open_devs.iter_mut() {
            if odev.direction() != direction {
                continue;
            }
            match odev.add_stream(Rc::clone(&shared)) {
                Ok(()) => attached += 1,
                Err(e) => {
                    warn!(dev = odev.index(), error = %e, "attach failed");
                },
            }
        }
        if attached == 0 {
            let fallback = match direction {
                Direction::Output => &mut self.fallback_output,
                Direction::Input => &mut self.fallback_input,
            };
            fallback.add_stream(Rc::clone(&shared))?;
        }
        self.streams.insert(id, shared);
        debug!(stream = %id, "stream added");
        Ok(())
    }

    fn remove_stream(&mut self, stream_id: StreamId) -> Result<(), AudioThreadError> {
        if self.streams.remove(&stream_id).is_none() {
            return Err(AudioThreadError::UnknownStream(stream_id));
        }
        for odev in self.open_devs.iter_mut() {
            odev.rm_stream(stream_id);
        }
        self.fallback_output.rm_stream(stream_id);
        self.fallback_input.rm_stream(stream_id);
        debug!(stream = %stream_id, "stream removed");
        Ok(())
    }

    fn add_active_dev(
        &mut self,
        index: u32,
        dev: Box<dyn Iodev>,
        loopback: Option<Arc<LoopbackRing>>,
    ) -> Result<(), AudioThreadError> {
        let direction = dev.direction();
        let mut odev = OpenDev::new(index, dev);

        // Streams of this direction move off the fallback onto real
        // hardware.
        let moved: Vec<StreamId> = {
            let fallback = match direction {
                Direction::Output => &mut self.fallback_output,
                Direction::Input => &mut self.fallback_input,
            };
            fallback.stream_ids()
        };
        let mut reattached = Vec::new();
        for id in moved {
            let Some(shared) = self.streams.get(&id).map(Rc::clone) else {
                continue;
            };
            if odev.add_stream(shared).is_ok() {
                let fallback = match direction {
                    Direction::Output => &mut self.fallback_output,
                    Direction::Input => &mut self.fallback_input,
                };
                fallback.rm_stream(id);
                reattached.push(id);
            }
        }

        if let Some(ring) = loopback {
            self.loopbacks.push(ring);
        }
        self.open_devs.push(odev);
        if !reattached.is_empty() {
            self.post_event(AudioEvent::StreamsReattached(reattached));
        }
        info!(dev = index, "active device added");
        Ok(())
    }

    fn remove_active_dev(&mut self, index: u32) -> Result<Box<dyn Iodev>, AudioThreadError> {
        let pos = self
            .open_devs
            .iter()
            .position(|d| d.index() == index)
            .ok_or(AudioThreadError::UnknownDevice(index))?;
        let mut odev = self.open_devs.remove(pos);
        let direction = odev.direction();
        let views = odev.take_streams();

        let mut reattached = Vec::new();
        for view in views {
            let shared = view.shared_stream();
            let id = view.id();
            drop(view);
            if self.attach_to_some_dev(direction, id, shared) {
                reattached.push(id);
            }
        }
        if !reattached.is_empty() {
            self.post_event(AudioEvent::StreamsReattached(reattached));
        }
        info!(dev = index, "active device removed");
        Ok(odev.into_iodev())
    }

    /// Attach a stream to any open device of `direction`, falling back to
    /// the empty device. True when it landed somewhere.
    fn attach_to_some_dev(
        &mut self,
        direction: Direction,
        id: StreamId,
        shared: SharedRstream,
    ) -> bool {
        for odev in self.open_devs.iter_mut() {
            if odev.direction() == direction && odev.add_stream(Rc::clone(&shared)).is_ok() {
                return true;
            }
        }
        let fallback = match direction {
            Direction::Output => &mut self.fallback_output,
            Direction::Input => &mut self.fallback_input,
        };
        if let Err(e) = fallback.add_stream(shared) {
            warn!(stream = %id, error = %e, "fallback attach failed");
            return false;
        }
        true
    }

    fn service_due_devices(&mut self, now: Instant) {
        let ts_nanos = wall_nanos();
        let loopbacks = self.loopbacks.clone();
        let mut suspended: Vec<u32> = Vec::new();
        let mut failed_streams: Vec<StreamId> = Vec::new();

        for odev in self
            .open_devs
            .iter_mut()
            .chain([&mut self.fallback_output, &mut self.fallback_input])
        {
            if odev.state() == DevState::Closed {
                continue;
            }
            if let Some(wake) = odev.wake_ts() {
                if wake > now && odev.state() != DevState::Draining {
                    continue;
                }
            }

            let result = match odev.direction() {
                Direction::Input => {
                    let capture_muted = self
                        .state_shm
                        .as_ref()
                        .map(|s| s.snapshot().capture_mute != 0)
                        .unwrap_or(false);
                    odev.service_input_muted(now, ts_nanos, capture_muted)
                },
                Direction::Output => {
                    let volume = {
                        let software = odev.dev().software_volume_needed();
                        self_playback_volume(self.state_shm.as_ref(), software)
                    };
                    odev.service_output(now, volume, &loopbacks)
                },
            };

            match result {
                Ok(failed) => {
                    odev.clear_device_errors();
                    failed_streams.extend(failed);
                },
                Err(DeviceError::Xrun) => {
                    if let Err(e) = odev.recover_from_xrun() {
                        warn!(dev = odev.index(), error = %e, "xrun recovery failed");
                        if odev.note_device_error() {
                            suspended.push(odev.index());
                        }
                    }
                },
                Err(e) => {
                    warn!(dev = odev.index(), error = %e, "device service failed");
                    if odev.note_device_error() {
                        suspended.push(odev.index());
                    }
                },
            }
        }

        for id in failed_streams {
            self.fail_stream(id);
        }
        for index in suspended {
            self.suspend_device(index);
        }
    }

    /// Drop a stream whose socket failed and tell the control thread.
    fn fail_stream(&mut self, id: StreamId) {
        if self.remove_stream(id).is_ok() {
            self.post_event(AudioEvent::StreamSocketError(id));
        }
    }

    /// Move a failing device out of service; its streams go to the
    /// fallback and the control thread is notified.
    fn suspend_device(&mut self, index: u32) {
        let Some(pos) = self.open_devs.iter().position(|d| d.index() == index) else {
            return;
        };
        let mut odev = self.open_devs.remove(pos);
        let direction = odev.direction();
        let views = odev.take_streams();
        let dev = odev.into_iodev();

        let mut reattached = Vec::new();
        for view in views {
            let shared = view.shared_stream();
            let id = view.id();
            drop(view);
            if self.attach_to_some_dev(direction, id, shared) {
                reattached.push(id);
            }
        }
        warn!(dev = index, "device suspended");
        self.post_event(AudioEvent::DeviceSuspended { index, dev });
        if !reattached.is_empty() {
            self.post_event(AudioEvent::StreamsReattached(reattached));
        }
    }

    /// Earliest deadline over every open device.
    fn next_wake(&self) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        for odev in self
            .open_devs
            .iter()
            .chain([&self.fallback_output, &self.fallback_input])
        {
            if odev.state() == DevState::Closed {
                continue;
            }
            if let Some(ts) = odev.wake_ts() {
                next = Some(match next {
                    Some(cur) => cur.min(ts),
                    None => ts,
                });
            }
        }
        next
    }

    /// Read one audio message from a stream; false drops the stream.
    fn handle_stream_message(&mut self, id: StreamId) -> bool {
        let Some(shared) = self.streams.get(&id).map(Rc::clone) else {
            return true;
        };
        let mut rstream = shared.borrow_mut();
        loop {
            match rstream.read_audio_message() {
                Ok(Some(msg)) => match msg.id {
                    AudioMessageId::DataReady => {
                        rstream.shm().set_callback_pending(false);
                    },
                    AudioMessageId::RequestData => {
                        // Clients do not request; ignore but keep the
                        // connection.
                        debug!(stream = %id, "unexpected request from client");
                    },
                },
                Ok(None) => return true,
                Err(StreamError::HungUp) => return false,
                Err(e) => {
                    warn!(stream = %id, error = %e, "audio socket error");
                    return false;
                },
            }
        }
    }

    fn post_event(&self, event: AudioEvent) {
        match self.events.try_send(event) {
            Ok(()) => self.event_wake.notify(),
            Err(TrySendError::Full(_)) => {
                warn!("event channel full, dropping event");
            },
            Err(TrySendError::Disconnected(_)) => {},
        }
    }

    fn debug_info(&self) -> AudioDebugInfo {
        let devs = self
            .open_devs
            .iter()
            .chain([&self.fallback_output, &self.fallback_input])
            .map(|odev| DevDebugInfo {
                index: odev.index(),
                name: odev.dev().name().to_string(),
                direction: odev.direction(),
                state: odev.state(),
                num_streams: odev.stream_count(),
            })
            .collect();
        AudioDebugInfo {
            num_streams: self.streams.len(),
            devs,
        }
    }

    fn shutdown_devices(&mut self) {
        for odev in self.open_devs.iter_mut() {
            odev.close_device();
        }
        self.fallback_output.close_device();
        self.fallback_input.close_device();
        self.streams.clear();
    }
}

fn self_playback_volume(state: Option<&ServerStateShm>, software_needed: bool) -> PlaybackVolume {
    let Some(state) = state else {
        return PlaybackVolume::default();
    };
    let snap = state.snapshot();
    PlaybackVolume {
        software_scaler: if software_needed {
            snap.volume as f32 / 100.0
        } else {
            1.0
        },
        muted: snap.mute != 0,
    }
}

/// Try for realtime scheduling, falling back to a raised nice level.
fn promote_to_realtime() -> Option<audio_thread_priority::RtPriorityHandle> {
    match audio_thread_priority::promote_current_thread_to_real_time(256, 48000) {
        Ok(handle) => {
            info!("audio thread promoted to realtime");
            Some(handle)
        },
        Err(_) => {
            let rc = unsafe { libc::nice(-10) };
            warn!(nice = rc, "realtime promotion failed, using nice level");
            None
        },
    }
}
