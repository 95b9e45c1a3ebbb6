//! The control thread: client sessions, message dispatch and stream setup.

use std::collections::HashMap;
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};

use chorus_audio::empty_iodev::EmptyIodev;
use chorus_audio::loopback_iodev::LoopbackRing;
use chorus_audio::poll::{wake_pipe, Poller, WakeReader};
use chorus_audio::rstream::Rstream;
use chorus_audio::thread::{spawn_audio_thread, AudioDebugInfo, AudioEvent};
use chorus_audio::{AudioThreadHandle, Iodev};
use chorus_dsp::format::AudioFormat;
use chorus_proto::control::{ClientMessage, ServerMessage};
use chorus_proto::ids::{ClientId, NodeId, StreamId};
use chorus_proto::types::{Direction, NodeAttr, StreamFlags};
use chorus_proto::{audio_socket_name, stream_shm_name, SERVER_STATE_SHM_NAME};
use chorus_shm::audio_area::region_len as audio_region_len;
use chorus_shm::server_state::region_len as state_region_len;
use chorus_shm::{AudioShm, ServerStateShm, ShmRegion};

use crate::config::ServerConfig;
use crate::dsp::DspManager;
use crate::error::ServerError;
use crate::iodev_list::IodevList;
use crate::observer::{AlertKind, AlertRegistry};
use crate::rclient::{ClientRead, Rclient};
use crate::stream_list::{StreamEntry, StreamList};
use crate::system_state::SystemState;

pub struct Server {
    config: ServerConfig,
    listener: UnixListener,
    clients: HashMap<ClientId, Rclient>,
    next_client_id: ClientId,
    streams: StreamList,
    iodevs: IodevList,
    system: SystemState,
    audio: AudioThreadHandle,
    events_rx: Receiver<AudioEvent>,
    event_wake: WakeReader,
    alerts: AlertRegistry,
    dsp: DspManager,
}

impl Server {
    /// Bring up the daemon core: runtime directories, the server-state shm,
    /// the audio thread with its fallback devices, and the control socket.
    /// Any failure here is fatal for the daemon.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        std::fs::create_dir_all(&config.sock_dir)?;
        std::fs::create_dir_all(&config.shm_dir)?;
        apply_dir_permissions(&config.sock_dir, config.audio_gid)?;

        let state_path = config.shm_dir.join(SERVER_STATE_SHM_NAME);
        let _ = std::fs::remove_file(&state_path);
        let system = SystemState::new(ServerStateShm::create(ShmRegion::create(
            &state_path,
            state_region_len(),
        )?)?);
        let audio_state = ServerStateShm::attach(ShmRegion::open(&state_path)?)?;

        let (events_tx, events_rx) = crossbeam_channel::bounded(64);
        let (event_wake, event_wake_tx) = wake_pipe()?;
        let audio = spawn_audio_thread(
            Box::new(EmptyIodev::new(Direction::Output)),
            Box::new(EmptyIodev::new(Direction::Input)),
            Some(audio_state),
            events_tx,
            event_wake_tx,
        )?;

        let socket_path = config.server_socket_path();
        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path)?;
        listener.set_nonblocking(true)?;
        apply_socket_permissions(&socket_path, config.audio_gid)?;
        info!(socket = %socket_path.display(), "control socket ready");

        let dsp = DspManager::new(config.dsp_config.clone());

        Ok(Self {
            config,
            listener,
            clients: HashMap::new(),
            next_client_id: 1,
            streams: StreamList::new(),
            iodevs: IodevList::new(),
            system,
            audio,
            events_rx,
            event_wake,
            alerts: AlertRegistry::new(),
            dsp,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Register a device with the registry and publish the new lists.
    pub fn add_device(
        &mut self,
        dev: Box<dyn Iodev>,
        loopback: Option<std::sync::Arc<LoopbackRing>>,
    ) -> u32 {
        let index = self.iodevs.add_device(dev, loopback);
        self.publish_device_state();
        self.alerts.pend(AlertKind::NodesChanged);
        index
    }

    pub fn select_node(&mut self, direction: Direction, node_id: NodeId) -> Result<(), ServerError> {
        self.iodevs.select_node(direction, node_id, &self.audio)?;
        self.publish_device_state();
        self.alerts.pend(AlertKind::ActiveNodeChanged);
        Ok(())
    }

    pub fn audio_debug_info(&self) -> Result<AudioDebugInfo, ServerError> {
        Ok(self.audio.dump_debug_info()?)
    }

    /// Serve until `stop` is raised. One pass per loop iteration; the wait
    /// is bounded so the flag is honored promptly.
    pub fn run_until(&mut self, stop: &AtomicBool) -> Result<(), ServerError> {
        while !stop.load(Ordering::Relaxed) {
            self.run_once(Duration::from_millis(200))?;
        }
        Ok(())
    }

    pub fn run(&mut self) -> Result<(), ServerError> {
        loop {
            self.run_once(Duration::from_millis(500))?;
        }
    }

    /// One multiplexed wait plus the work it surfaced.
    pub fn run_once(&mut self, timeout: Duration) -> Result<(), ServerError> {
        let mut poller = Poller::new();
        let listener_slot = poller.add(self.listener.as_raw_fd());
        let event_slot = poller.add(self.event_wake.as_raw_fd());
        let client_slots: Vec<(ClientId, usize)> = self
            .clients
            .values()
            .map(|c| (c.id(), poller.add(c.fd())))
            .collect();

        poller.poll(Some(timeout))?;

        if poller.readable(listener_slot) {
            self.accept_clients();
        }
        if poller.readable(event_slot) {
            self.event_wake.drain();
            self.drain_audio_events();
        }

        let mut inbound: Vec<(ClientId, ServerMessage)> = Vec::new();
        let mut dropped: Vec<ClientId> = Vec::new();
        for (id, slot) in client_slots {
            if !poller.readable(slot) {
                continue;
            }
            let Some(client) = self.clients.get_mut(&id) else {
                continue;
            };
            match client.pump() {
                ClientRead::Messages(msgs) => {
                    inbound.extend(msgs.into_iter().map(|m| (id, m)));
                },
                ClientRead::Disconnected => dropped.push(id),
            }
        }
        for id in dropped {
            self.disconnect_client(id);
        }
        for (id, msg) in inbound {
            if let Err(e) = self.handle_message(id, msg) {
                warn!(client = id, error = %e, "message handling failed");
            }
        }

        self.process_alerts();
        Ok(())
    }

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((sock, _addr)) => {
                    let id = self.next_client_id;
                    self.next_client_id += 1;
                    let mut client = Rclient::new(id, sock);
                    if let Err(e) = client.send(&ClientMessage::Connected { client_id: id }) {
                        warn!(client = id, error = %e, "greeting failed");
                        continue;
                    }
                    info!(client = id, "client connected");
                    self.clients.insert(id, client);
                    self.system.client_attached(id);
                    self.alerts.pend(AlertKind::ClientListChanged);
                },
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                },
            }
        }
    }

    fn disconnect_client(&mut self, id: ClientId) {
        if self.clients.remove(&id).is_none() {
            return;
        }
        for stream_id in self.streams.ids_for_client(id) {
            if let Err(e) = self.disconnect_stream(stream_id) {
                warn!(stream = %stream_id, error = %e, "cleanup disconnect failed");
            }
        }
        self.system.client_detached(id);
        self.alerts.pend(AlertKind::ClientListChanged);
        info!(client = id, "client disconnected");
    }

    fn handle_message(&mut self, client_id: ClientId, msg: ServerMessage) -> Result<(), ServerError> {
        match msg {
            ServerMessage::ConnectStream {
                stream_id,
                direction,
                format,
                buffer_frames,
                cb_threshold,
                min_cb_level,
                flags,
            } => {
                let reply = self.connect_stream(
                    client_id,
                    stream_id,
                    direction,
                    format,
                    buffer_frames,
                    cb_threshold,
                    min_cb_level,
                    flags,
                );
                self.send_to(client_id, &reply);
            },
            ServerMessage::DisconnectStream { stream_id } => {
                if self.streams.owner_of(stream_id) != Some(client_id) {
                    return Err(ServerError::Protocol("stream not owned by client"));
                }
                self.disconnect_stream(stream_id)?;
            },
            ServerMessage::SwitchStreamTypeIodev {
                stream_type: _,
                iodev_index,
            } => {
                let direction = self
                    .iodevs
                    .device_direction(iodev_index)
                    .ok_or(ServerError::Inval("unknown device"))?;
                let node = self
                    .iodevs
                    .best_node_of_device(iodev_index)
                    .ok_or(ServerError::Inval("device has no usable node"))?;
                self.select_node(direction, node)?;
            },
            ServerMessage::SetSystemVolume { volume } => {
                self.system.set_volume(volume);
                self.alerts.pend(AlertKind::VolumeChanged);
            },
            ServerMessage::SetSystemMute { mute } => {
                if self.system.set_mute(mute) {
                    self.alerts.pend(AlertKind::VolumeChanged);
                }
            },
            ServerMessage::SetSystemMuteLocked { locked } => {
                self.system.set_mute_locked(locked);
                self.alerts.pend(AlertKind::VolumeChanged);
            },
            ServerMessage::SetSystemCaptureGain { gain } => {
                self.system.set_capture_gain(gain)?;
                self.alerts.pend(AlertKind::VolumeChanged);
            },
            ServerMessage::SetSystemCaptureMute { mute } => {
                if self.system.set_capture_mute(mute) {
                    self.alerts.pend(AlertKind::VolumeChanged);
                }
            },
            ServerMessage::SetSystemCaptureMuteLocked { locked } => {
                self.system.set_capture_mute_locked(locked);
                self.alerts.pend(AlertKind::VolumeChanged);
            },
            ServerMessage::ReloadDsp => {
                self.dsp.reload();
            },
            ServerMessage::DumpDsp => {
                let reply = ClientMessage::DspDump {
                    dump: self.dsp.dump(),
                };
                self.send_to(client_id, &reply);
            },
            ServerMessage::SelectNode { direction, node_id } => {
                self.select_node(direction, node_id)?;
            },
            ServerMessage::SetNodeAttr {
                node_id,
                attr,
                value,
            } => {
                self.iodevs.set_node_attr(node_id, attr, value)?;
                self.publish_device_state();
                self.alerts.pend(AlertKind::NodesChanged);
                if attr == NodeAttr::Plugged {
                    self.alerts.pend(AlertKind::ActiveNodeChanged);
                }
            },
            ServerMessage::SetNodeVolume { node_id, volume } => {
                self.iodevs.set_node_volume(node_id, volume)?;
                self.publish_device_state();
                self.alerts.pend(AlertKind::NodesChanged);
            },
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn connect_stream(
        &mut self,
        client_id: ClientId,
        stream_id: StreamId,
        direction: Direction,
        format: AudioFormat,
        buffer_frames: u32,
        cb_threshold: u32,
        min_cb_level: u32,
        flags: StreamFlags,
    ) -> ClientMessage {
        match self.try_connect_stream(
            client_id,
            stream_id,
            direction,
            format,
            buffer_frames,
            cb_threshold,
            min_cb_level,
            flags,
        ) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(stream = %stream_id, error = %e, "stream connect failed");
                ClientMessage::StreamConnected {
                    err: e.client_errno(),
                    stream_id,
                    format,
                    shm_key: String::new(),
                    shm_max_size: 0,
                    buffer_frames,
                    cb_threshold,
                }
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn try_connect_stream(
        &mut self,
        client_id: ClientId,
        stream_id: StreamId,
        direction: Direction,
        format: AudioFormat,
        buffer_frames: u32,
        cb_threshold: u32,
        min_cb_level: u32,
        flags: StreamFlags,
    ) -> Result<ClientMessage, ServerError> {
        if stream_id.client_id() != client_id {
            return Err(ServerError::Protocol("stream id outside client id space"));
        }
        if self.streams.contains(stream_id) {
            return Err(ServerError::Inval("stream id already in use"));
        }
        if buffer_frames == 0 || cb_threshold == 0 || cb_threshold > buffer_frames {
            return Err(ServerError::Inval("bad buffer geometry"));
        }
        if format.frame_rate == 0 || format.num_channels == 0 {
            return Err(ServerError::Inval("bad stream format"));
        }
        for &entry in format.channel_layout.iter() {
            if entry >= format.num_channels as i8 {
                return Err(ServerError::Inval("bad channel layout"));
            }
        }

        // One shm buffer holds a callback; round to a power of two so the
        // region size is predictable for the client.
        let used_frames = cb_threshold.next_power_of_two();
        let used_size = used_frames as usize * format.frame_bytes();
        let shm_name = stream_shm_name(stream_id);
        let shm_path = self.config.shm_dir.join(&shm_name);
        let _ = std::fs::remove_file(&shm_path);
        let region_size = audio_region_len(used_size);
        let region = ShmRegion::create(&shm_path, region_size)?;
        let shm = AudioShm::create(region, &format, used_size as u32)?;

        let sock_path = self.config.sock_dir.join(audio_socket_name(stream_id));
        let sock = UnixStream::connect(&sock_path)?;

        let rstream = Rstream::new(
            stream_id,
            direction,
            format,
            buffer_frames,
            cb_threshold,
            min_cb_level,
            flags,
            shm,
            sock,
            Instant::now(),
        )?;
        self.audio.add_stream(rstream)?;

        self.streams.add(StreamEntry {
            id: stream_id,
            client_id,
            direction,
            shm_path,
            buffer_frames,
            cb_threshold,
        });
        self.system.stream_attached();
        debug!(stream = %stream_id, "stream connected");

        Ok(ClientMessage::StreamConnected {
            err: 0,
            stream_id,
            format,
            shm_key: shm_name,
            shm_max_size: region_size as u64,
            buffer_frames,
            cb_threshold,
        })
    }

    fn disconnect_stream(&mut self, stream_id: StreamId) -> Result<(), ServerError> {
        match self.audio.remove_stream(stream_id) {
            Ok(()) => {},
            // Already gone on the audio side (e.g. socket error path).
            Err(chorus_audio::AudioThreadError::UnknownStream(_)) => {},
            Err(e) => return Err(e.into()),
        }
        if self.streams.remove(stream_id).is_some() {
            self.system.stream_detached();
            debug!(stream = %stream_id, "stream disconnected");
        }
        Ok(())
    }

    fn drain_audio_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                AudioEvent::StreamSocketError(stream_id) => {
                    warn!(stream = %stream_id, "audio socket error, disconnecting");
                    if let Err(e) = self.disconnect_stream(stream_id) {
                        warn!(stream = %stream_id, error = %e, "disconnect failed");
                    }
                },
                AudioEvent::DeviceSuspended { index, dev } => {
                    self.iodevs.on_device_suspended(index, dev);
                    self.publish_device_state();
                    self.alerts.pend(AlertKind::NodesChanged);
                    self.alerts.pend(AlertKind::ActiveNodeChanged);
                },
                AudioEvent::StreamsReattached(ids) => {
                    for stream_id in ids {
                        if let Some(owner) = self.streams.owner_of(stream_id) {
                            let msg = ClientMessage::StreamReattach { stream_id };
                            self.send_to(owner, &msg);
                        }
                    }
                },
            }
        }
    }

    fn process_alerts(&mut self) {
        if !self.alerts.has_pending() {
            return;
        }
        for kind in self.alerts.drain() {
            let msg = match kind {
                AlertKind::VolumeChanged => {
                    let snap = self.system.snapshot();
                    ClientMessage::VolumeUpdate {
                        volume: snap.volume,
                        muted: snap.mute != 0,
                        mute_locked: snap.mute_locked != 0,
                        capture_gain: snap.capture_gain,
                        capture_muted: snap.capture_mute != 0,
                        capture_mute_locked: snap.capture_mute_locked != 0,
                    }
                },
                AlertKind::NodesChanged | AlertKind::ActiveNodeChanged => {
                    let (devices, nodes) = self.iodevs.infos();
                    ClientMessage::IodevList { devices, nodes }
                },
                AlertKind::ClientListChanged => ClientMessage::ClientListUpdate {
                    clients: self.system.attached_clients(),
                },
            };
            self.broadcast(&msg);
        }
    }

    fn broadcast(&mut self, msg: &ClientMessage) {
        let mut dead = Vec::new();
        for (&id, client) in self.clients.iter_mut() {
            if let Err(e) = client.send(msg) {
                warn!(client = id, error = %e, "broadcast failed");
                dead.push(id);
            }
        }
        for id in dead {
            self.disconnect_client(id);
        }
    }

    fn send_to(&mut self, client_id: ClientId, msg: &ClientMessage) {
        let Some(client) = self.clients.get_mut(&client_id) else {
            return;
        };
        if let Err(e) = client.send(msg) {
            warn!(client = client_id, error = %e, "send failed");
            self.disconnect_client(client_id);
        }
    }

    fn publish_device_state(&mut self) {
        let iodevs = &self.iodevs;
        self.system.update(|data| iodevs.publish(data));
    }
}

/// 0700, group handover, then 0770, per the socket-directory contract.
fn apply_dir_permissions(path: &Path, gid: Option<u32>) -> Result<(), ServerError> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    if let Some(gid) = gid {
        std::os::unix::fs::chown(path, None, Some(gid))?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o770))?;
    }
    Ok(())
}

fn apply_socket_permissions(path: &Path, gid: Option<u32>) -> Result<(), ServerError> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    if let Some(gid) = gid {
        std::os::unix::fs::chown(path, None, Some(gid))?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o770))?;
    }
    Ok(())
}
