//! Server-side stream state.
//!
//! One `Rstream` exists per client stream. It owns the daemon's mapping of
//! the stream's shared-memory area and the daemon end of the audio socket.
//! Created by the control thread, then handed to the audio thread, which
//! owns it until disconnect.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use chorus_dsp::format::AudioFormat;
use chorus_proto::audio::{AudioMessage, AUDIO_MESSAGE_LEN};
use chorus_proto::ids::StreamId;
use chorus_proto::types::{Direction, StreamFlags};
use chorus_shm::AudioShm;

use crate::error::StreamError;
use crate::time::frames_to_duration;

/// Consecutive `EAGAIN`s tolerated on the audio socket before the stream is
/// declared dead.
const MAX_SOCKET_RETRIES: u32 = 10;

pub struct Rstream {
    id: StreamId,
    direction: Direction,
    format: AudioFormat,
    buffer_frames: u32,
    cb_threshold: u32,
    min_cb_level: u32,
    flags: StreamFlags,
    shm: AudioShm,
    sock: UnixStream,
    next_cb_ts: Instant,
    last_fetched_cb_ts: Option<Instant>,
    write_retries: u32,
}

impl Rstream {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: StreamId,
        direction: Direction,
        format: AudioFormat,
        buffer_frames: u32,
        cb_threshold: u32,
        min_cb_level: u32,
        flags: StreamFlags,
        shm: AudioShm,
        sock: UnixStream,
        now: Instant,
    ) -> Result<Self, StreamError> {
        sock.set_nonblocking(true)?;
        Ok(Self {
            id,
            direction,
            format,
            buffer_frames,
            cb_threshold,
            min_cb_level,
            flags,
            shm,
            sock,
            next_cb_ts: now,
            last_fetched_cb_ts: None,
            write_retries: 0,
        })
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    pub fn frame_rate(&self) -> u32 {
        self.format.frame_rate
    }

    pub fn buffer_frames(&self) -> u32 {
        self.buffer_frames
    }

    pub fn cb_threshold(&self) -> u32 {
        self.cb_threshold
    }

    pub fn min_cb_level(&self) -> u32 {
        self.min_cb_level
    }

    pub fn flags(&self) -> StreamFlags {
        self.flags
    }

    pub fn is_hotword(&self) -> bool {
        self.flags.contains(StreamFlags::HOTWORD)
    }

    pub fn shm(&self) -> &AudioShm {
        &self.shm
    }

    pub fn shm_mut(&mut self) -> &mut AudioShm {
        &mut self.shm
    }

    pub fn audio_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    pub fn next_cb_ts(&self) -> Instant {
        self.next_cb_ts
    }

    pub fn set_next_cb_ts(&mut self, ts: Instant) {
        self.next_cb_ts = ts;
    }

    pub fn last_fetched_cb_ts(&self) -> Option<Instant> {
        self.last_fetched_cb_ts
    }

    /// Interval between callbacks at the stream's own rate.
    pub fn cb_period(&self) -> Duration {
        frames_to_duration(u64::from(self.cb_threshold), self.format.frame_rate)
    }

    /// Advance the callback schedule by one period after a successful
    /// fill/drain. `next_cb_ts` never moves backwards.
    pub fn update_next_cb_ts(&mut self) {
        self.next_cb_ts += self.cb_period();
    }

    /// Ask a playback client for up to `frames` frames of data.
    pub fn request_data(&mut self, frames: u32) -> Result<(), StreamError> {
        self.shm.set_callback_pending(true);
        self.last_fetched_cb_ts = Some(self.next_cb_ts);
        self.send(AudioMessage::request_data(frames))
    }

    /// Commit the capture buffer and tell the client samples are ready.
    pub fn audio_ready(&mut self, frames: u32, ts_nanos: u64) -> Result<(), StreamError> {
        self.shm.buffer_write_complete(ts_nanos);
        self.send(AudioMessage::data_ready(frames))
    }

    /// Nonblocking read of one audio message from the client.
    pub fn read_audio_message(&mut self) -> Result<Option<AudioMessage>, StreamError> {
        let mut buf = [0u8; AUDIO_MESSAGE_LEN];
        match self.sock.read(&mut buf) {
            Ok(0) => Err(StreamError::HungUp),
            Ok(n) if n < AUDIO_MESSAGE_LEN => {
                // A fixed-size record arrived short; the peer is broken.
                Err(StreamError::HungUp)
            },
            Ok(_) => Ok(Some(AudioMessage::decode(&buf).map_err(|_| StreamError::HungUp)?)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(StreamError::Transport(e)),
        }
    }

    fn send(&mut self, msg: AudioMessage) -> Result<(), StreamError> {
        match self.sock.write(&msg.encode()) {
            Ok(n) if n == AUDIO_MESSAGE_LEN => {
                self.write_retries = 0;
                Ok(())
            },
            Ok(_) => Err(StreamError::HungUp),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.write_retries += 1;
                if self.write_retries > MAX_SOCKET_RETRIES {
                    Err(StreamError::RetriesExhausted)
                } else {
                    Ok(())
                }
            },
            Err(e) => Err(StreamError::Transport(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::os::unix::net::UnixStream;
    use std::time::{Duration, Instant};

    use chorus_dsp::format::{AudioFormat, SampleFormat};
    use chorus_proto::audio::{AudioMessage, AudioMessageId, AUDIO_MESSAGE_LEN};
    use chorus_proto::ids::StreamId;
    use chorus_proto::types::{Direction, StreamFlags};
    use chorus_shm::audio_area::region_len;
    use chorus_shm::{AudioShm, ShmRegion};

    use super::Rstream;

    fn make_stream(dir: &tempfile::TempDir) -> (Rstream, UnixStream) {
        let fmt = AudioFormat::new(SampleFormat::S16LE, 48000, 2);
        let used_size = 480 * 4;
        let region =
            ShmRegion::create(&dir.path().join("shm"), region_len(used_size)).unwrap();
        let shm = AudioShm::create(region, &fmt, used_size as u32).unwrap();
        let (daemon_end, client_end) = UnixStream::pair().unwrap();
        client_end.set_nonblocking(true).unwrap();
        let stream = Rstream::new(
            StreamId::new(1, 1),
            Direction::Input,
            fmt,
            960,
            480,
            480,
            StreamFlags::NONE,
            shm,
            daemon_end,
            Instant::now(),
        )
        .unwrap();
        (stream, client_end)
    }

    #[test]
    fn next_cb_ts_advances_by_cb_period() {
        let dir = tempfile::tempdir().unwrap();
        let (mut stream, _client) = make_stream(&dir);
        let before = stream.next_cb_ts();
        stream.update_next_cb_ts();
        assert_eq!(stream.next_cb_ts() - before, Duration::from_millis(10));
        stream.update_next_cb_ts();
        assert_eq!(stream.next_cb_ts() - before, Duration::from_millis(20));
    }

    #[test]
    fn audio_ready_reaches_client() {
        let dir = tempfile::tempdir().unwrap();
        let (mut stream, mut client) = make_stream(&dir);
        stream.shm_mut().begin_write();
        stream.shm_mut().buffer_written(480);
        stream.audio_ready(480, 42).unwrap();

        let mut buf = [0u8; AUDIO_MESSAGE_LEN];
        client.read_exact(&mut buf).unwrap();
        let msg = AudioMessage::decode(&buf).unwrap();
        assert_eq!(msg.id, AudioMessageId::DataReady);
        assert_eq!(msg.frames, 480);
    }

    #[test]
    fn hangup_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut stream, client) = make_stream(&dir);
        drop(client);
        assert!(stream.read_audio_message().is_err());
    }

    #[test]
    fn no_message_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let (mut stream, _client) = make_stream(&dir);
        assert!(stream.read_audio_message().unwrap().is_none());
    }
}
