//! Per-device view of one stream.
//!
//! A `DevStream` pairs an [`Rstream`] with the format converter needed for
//! one particular device, plus the scratch buffers conversion requires. The
//! same stream attached to two devices gets two `DevStream`s sharing the
//! underlying `Rstream`.

use std::cell::{Ref, RefCell, RefMut};
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Instant;

use chorus_dsp::format::{frames_at_rate, AudioFormat};
use chorus_dsp::sample::{mix_add, scale_buffer};
use chorus_dsp::FormatConverter;
use chorus_proto::ids::StreamId;

use crate::error::StreamError;
use crate::rstream::Rstream;
use crate::time::frames_to_duration;

pub type SharedRstream = Rc<RefCell<Rstream>>;

pub struct DevStream {
    stream: SharedRstream,
    dev_format: AudioFormat,
    /// Converter between device and stream formats; `None` when identical.
    /// Capture converts device -> stream, playback stream -> device.
    conv: Option<FormatConverter>,
    conv_buf: Vec<u8>,
    read_buf: Vec<u8>,
}

impl DevStream {
    pub fn new(
        stream: SharedRstream,
        dev_format: &AudioFormat,
        max_frames: u32,
    ) -> Result<Self, StreamError> {
        let (conv, conv_buf, read_buf) = {
            let rstream = stream.borrow();
            let stream_format = *rstream.format();
            let conv = if stream_format.conversion_needed(dev_format) {
                let (from, to) = if rstream.direction().is_input() {
                    (*dev_format, stream_format)
                } else {
                    (stream_format, *dev_format)
                };
                Some(FormatConverter::new(from, to, max_frames as usize)?)
            } else {
                None
            };
            let max_out = frames_at_rate(max_frames, dev_format.frame_rate, stream_format.frame_rate)
                .max(max_frames) as usize
                + 1;
            (
                conv,
                vec![0u8; max_out * dev_format.frame_bytes().max(stream_format.frame_bytes())],
                vec![0u8; max_out * stream_format.frame_bytes()],
            )
        };
        Ok(Self {
            stream,
            dev_format: *dev_format,
            conv,
            conv_buf,
            read_buf,
        })
    }

    pub fn id(&self) -> StreamId {
        self.stream.borrow().id()
    }

    pub fn stream(&self) -> Ref<'_, Rstream> {
        self.stream.borrow()
    }

    pub fn stream_mut(&self) -> RefMut<'_, Rstream> {
        self.stream.borrow_mut()
    }

    pub fn shared_stream(&self) -> SharedRstream {
        Rc::clone(&self.stream)
    }

    pub fn audio_fd(&self) -> RawFd {
        self.stream.borrow().audio_fd()
    }

    fn stream_rate(&self) -> u32 {
        self.stream.borrow().frame_rate()
    }

    /// Device-rate frames required to yield `stream_frames` frames at the
    /// stream's rate.
    fn stream_to_dev_frames(&self, stream_frames: u32) -> u32 {
        frames_at_rate(stream_frames, self.stream_rate(), self.dev_format.frame_rate)
    }

    // ---- playback ----

    /// Device-rate frames this playback stream can contribute right now.
    pub fn playback_frames_ready(&self) -> u32 {
        let rstream = self.stream.borrow();
        let readable = rstream.shm().readable_frames();
        match self.conv.as_ref() {
            Some(conv) => conv.in_frames_to_out(readable),
            None => readable,
        }
    }

    /// Read up to `frames` device-rate frames from the stream, convert,
    /// apply the stream volume and mix into `dev_buf` starting at
    /// `offset_frames`. Returns the device frames mixed.
    ///
    /// `software_scaler` carries the system volume on devices that need
    /// volume applied in software; it is 1.0 otherwise.
    pub fn mix_into(
        &mut self,
        dev_buf: &mut [u8],
        offset_frames: u32,
        frames: u32,
        software_scaler: f32,
    ) -> Result<u32, StreamError> {
        if frames == 0 {
            return Ok(0);
        }
        let dev_fb = self.dev_format.frame_bytes();
        let (muted, scaler, read_frames) = {
            let mut rstream = self.stream.borrow_mut();
            let want_stream = match self.conv.as_ref() {
                Some(conv) => conv.out_frames_to_in(frames),
                None => frames,
            };
            let stream_fb = rstream.format().frame_bytes();
            let need = want_stream as usize * stream_fb;
            if self.read_buf.len() < need {
                self.read_buf.resize(need, 0);
            }
            let muted = rstream.shm().muted();
            let scaler = rstream.shm().volume_scaler();
            let got = rstream
                .shm_mut()
                .read_frames(&mut self.read_buf[..need], want_stream);
            (muted, scaler, got)
        };
        if read_frames == 0 {
            return Ok(0);
        }

        let stream_fb = self.stream.borrow().format().frame_bytes();
        let (src, produced) = match self.conv.as_mut() {
            Some(conv) => {
                let produced = conv.convert(
                    &self.read_buf[..read_frames as usize * stream_fb],
                    &mut self.conv_buf,
                )?;
                (&self.conv_buf[..produced * dev_fb], produced as u32)
            },
            None => (
                &self.read_buf[..read_frames as usize * stream_fb],
                read_frames,
            ),
        };

        let mixed = produced.min(frames);
        if muted {
            // Muted streams contribute silence; the mix buffer already
            // holds it.
            return Ok(mixed);
        }
        let dst_off = offset_frames as usize * dev_fb;
        let dst_end = (dst_off + mixed as usize * dev_fb).min(dev_buf.len());
        mix_add(
            &mut dev_buf[dst_off..dst_end],
            &src[..mixed as usize * dev_fb],
            self.dev_format.sample_format,
            scaler * software_scaler,
        );
        Ok(mixed)
    }

    /// Next wake needed by this playback stream.
    pub fn playback_wake_time(&self, now: Instant, dev_rate: u32) -> Instant {
        let rstream = self.stream.borrow();
        let readable = rstream.shm().readable_frames();
        let needed_stream = rstream.cb_threshold().saturating_sub(readable);
        let next_cb_ts = rstream.next_cb_ts();
        if needed_stream == 0 {
            return next_cb_ts;
        }
        let needed_dev = self.stream_to_dev_frames(needed_stream);
        let fill_time = now + frames_to_duration(u64::from(needed_dev), dev_rate);
        next_cb_ts.max(fill_time)
    }

    // ---- capture ----

    /// Push up to `dev_frames` captured device-rate frames into the
    /// stream's shm, converting on the way. Returns the device frames
    /// consumed.
    pub fn capture_sink(&mut self, dev_bytes: &[u8], dev_frames: u32) -> Result<u32, StreamError> {
        if dev_frames == 0 {
            return Ok(0);
        }
        let dev_fb = self.dev_format.frame_bytes();
        let mut rstream = self.stream.borrow_mut();
        let room = rstream.shm().writable_frames();
        if room == 0 {
            return Ok(0);
        }

        match self.conv.as_mut() {
            Some(conv) => {
                // Largest device chunk whose conversion fits the room.
                let mut take = frames_at_rate(
                    room,
                    conv.to_format().frame_rate,
                    conv.from_format().frame_rate,
                )
                .min(dev_frames);
                while take > 0 && conv.in_frames_to_out(take) > room {
                    take -= 1;
                }
                if take == 0 {
                    return Ok(0);
                }
                let produced = {
                    let dst = rstream.shm_mut().begin_write();
                    conv.convert(&dev_bytes[..take as usize * dev_fb], dst)?
                };
                rstream.shm_mut().buffer_written(produced as u32);
                Ok(take)
            },
            None => {
                let take = dev_frames.min(room);
                let bytes = take as usize * dev_fb;
                let dst = rstream.shm_mut().begin_write();
                dst[..bytes].copy_from_slice(&dev_bytes[..bytes]);
                rstream.shm_mut().buffer_written(take);
                Ok(take)
            },
        }
    }

    /// Fire the capture callback when due: commit the buffer and notify the
    /// client. Normal streams wait for their scheduled `next_cb_ts`;
    /// hotword streams fire as soon as a full callback is buffered.
    /// Returns true when a callback was delivered.
    pub fn capture_update_rstream(
        &mut self,
        now: Instant,
        ts_nanos: u64,
    ) -> Result<bool, StreamError> {
        let mut rstream = self.stream.borrow_mut();
        let fill = rstream.shm().current_fill();
        if fill < rstream.cb_threshold() {
            return Ok(false);
        }
        if !rstream.is_hotword() && now < rstream.next_cb_ts() {
            return Ok(false);
        }
        let frames = fill;
        rstream.audio_ready(frames, ts_nanos)?;
        rstream.update_next_cb_ts();
        Ok(true)
    }

    /// Next wake this capture stream needs from its device, or `None` when
    /// the stream is socket-driven (hotword with a full buffer) and
    /// contributes no device deadline.
    pub fn capture_wake_time(
        &self,
        dev_level: u32,
        level_ts: Instant,
        dev_rate: u32,
    ) -> Option<Instant> {
        let rstream = self.stream.borrow();
        let shm = rstream.shm();

        if rstream.is_hotword() {
            let level = shm.total_level();
            if level >= rstream.cb_threshold() {
                return None;
            }
            // Hotword bursts land all at once; wake when the whole shm
            // would fill at device rate.
            let needed_stream = shm.capacity_frames().saturating_sub(level);
            let needed_dev = self.stream_to_dev_frames(needed_stream);
            let extra = needed_dev.saturating_sub(dev_level);
            return Some(level_ts + frames_to_duration(u64::from(extra), dev_rate));
        }

        let fill = shm.current_fill();
        let needed_stream = rstream.cb_threshold().saturating_sub(fill);
        if needed_stream == 0 {
            return Some(rstream.next_cb_ts());
        }
        let needed_dev = self.stream_to_dev_frames(needed_stream);
        if needed_dev > dev_level {
            let fill_time =
                level_ts + frames_to_duration(u64::from(needed_dev - dev_level), dev_rate);
            Some(rstream.next_cb_ts().max(fill_time))
        } else {
            Some(rstream.next_cb_ts())
        }
    }

    /// The stream fd to poll instead of a device deadline, for socket-driven
    /// hotword streams.
    pub fn poll_stream_fd(&self) -> Option<RawFd> {
        let rstream = self.stream.borrow();
        if rstream.is_hotword() && rstream.shm().total_level() >= rstream.cb_threshold() {
            return Some(rstream.audio_fd());
        }
        None
    }
}

/// Apply system software volume to an already mixed device buffer.
pub fn apply_software_volume(buf: &mut [u8], format: &AudioFormat, scaler: f32) {
    scale_buffer(buf, format.sample_format, scaler);
}
