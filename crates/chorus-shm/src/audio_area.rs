//! Per-stream audio shared-memory area.
//!
//! One region per stream, mapped by the daemon and one client. The sample
//! space is split into two equal buffers, A and B; the producer fills the
//! buffer selected by `write_buf_idx` (possibly across several partial
//! writes), commits it and flips, while the consumer drains from
//! `read_buf_idx`. `write_in_progress` acts as a one-bit seq-lock around
//! each produce session: a consumer only trusts a buffer it observed with
//! the flag clear. Roles are fixed per direction — the daemon produces for
//! capture streams and consumes for playback streams.

use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};

use chorus_dsp::format::{AudioFormat, CH_MAX};

use crate::error::ShmError;
use crate::region::ShmRegion;

pub const AUDIO_SHM_MAGIC: u32 = 0x4348_524d;
pub const AUDIO_SHM_VERSION: u32 = 1;

const NUM_BUFFERS: usize = 2;

#[repr(C)]
struct AudioShmConfig {
    frame_bytes: u32,
    /// Bytes in one of the two sample buffers.
    used_size: u32,
    num_channels: u32,
    frame_rate: u32,
    channel_layout: [i8; CH_MAX],
    _pad: [u8; 1],
}

#[repr(C)]
struct AudioShmHeader {
    magic: u32,
    version: u32,
    config: AudioShmConfig,
    read_buf_idx: AtomicU32,
    write_buf_idx: AtomicU32,
    read_offset: [AtomicU32; NUM_BUFFERS],
    write_offset: [AtomicU32; NUM_BUFFERS],
    write_in_progress: [AtomicU32; NUM_BUFFERS],
    /// f32 bit pattern; [0.0, 1.0].
    volume_scaler: AtomicU32,
    mute: AtomicU32,
    callback_pending: AtomicU32,
    num_overruns: AtomicU32,
    /// Timestamp of the oldest committed sample, monotonic nanoseconds.
    ts_nanos: AtomicU64,
}

fn header_len() -> usize {
    std::mem::size_of::<AudioShmHeader>()
}

/// Total region size for a given per-buffer byte count.
pub fn region_len(used_size: usize) -> usize {
    header_len() + NUM_BUFFERS * used_size
}

/// A mapped audio area plus the local producer session state.
pub struct AudioShm {
    region: ShmRegion,
    /// Producer-local: a write session is open (begin seen, commit not yet).
    write_started: bool,
}

impl AudioShm {
    /// Initialize a fresh region for the given format; `used_size` is the
    /// per-buffer byte count and must be a multiple of the frame size.
    pub fn create(region: ShmRegion, format: &AudioFormat, used_size: u32) -> Result<Self, ShmError> {
        let frame_bytes = format.frame_bytes() as u32;
        if frame_bytes == 0 || used_size == 0 || used_size % frame_bytes != 0 {
            return Err(ShmError::Inval("used_size must hold whole frames"));
        }
        let need = region_len(used_size as usize);
        if region.len() < need {
            return Err(ShmError::TooSmall {
                len: region.len(),
                need,
            });
        }

        unsafe {
            let header = region.as_mut_ptr() as *mut AudioShmHeader;
            std::ptr::write(
                header,
                AudioShmHeader {
                    magic: AUDIO_SHM_MAGIC,
                    version: AUDIO_SHM_VERSION,
                    config: AudioShmConfig {
                        frame_bytes,
                        used_size,
                        num_channels: format.num_channels,
                        frame_rate: format.frame_rate,
                        channel_layout: format.channel_layout,
                        _pad: [0],
                    },
                    read_buf_idx: AtomicU32::new(0),
                    write_buf_idx: AtomicU32::new(0),
                    read_offset: [AtomicU32::new(0), AtomicU32::new(0)],
                    write_offset: [AtomicU32::new(0), AtomicU32::new(0)],
                    write_in_progress: [AtomicU32::new(0), AtomicU32::new(0)],
                    volume_scaler: AtomicU32::new(1.0f32.to_bits()),
                    mute: AtomicU32::new(0),
                    callback_pending: AtomicU32::new(0),
                    num_overruns: AtomicU32::new(0),
                    ts_nanos: AtomicU64::new(0),
                },
            );
            // Deterministic startup: zeroed sample space.
            std::ptr::write_bytes(
                region.as_mut_ptr().add(header_len()),
                0,
                region.len() - header_len(),
            );
        }

        Ok(Self {
            region,
            write_started: false,
        })
    }

    /// Attach to a region initialized by the peer.
    pub fn attach(region: ShmRegion) -> Result<Self, ShmError> {
        if region.len() < header_len() {
            return Err(ShmError::TooSmall {
                len: region.len(),
                need: header_len(),
            });
        }
        let shm = Self {
            region,
            write_started: false,
        };
        let header = shm.header();
        if header.magic != AUDIO_SHM_MAGIC || header.version != AUDIO_SHM_VERSION {
            return Err(ShmError::HeaderMismatch {
                magic: header.magic,
                version: header.version,
            });
        }
        let need = region_len(header.config.used_size as usize);
        if shm.region.len() < need {
            return Err(ShmError::TooSmall {
                len: shm.region.len(),
                need,
            });
        }
        Ok(shm)
    }

    fn header(&self) -> &AudioShmHeader {
        unsafe { &*(self.region.as_ptr() as *const AudioShmHeader) }
    }

    fn buffer_ptr(&self, idx: usize) -> *mut u8 {
        let used = self.used_size();
        unsafe { self.region.as_mut_ptr().add(header_len() + idx * used) }
    }

    pub fn frame_bytes(&self) -> usize {
        self.header().config.frame_bytes as usize
    }

    pub fn used_size(&self) -> usize {
        self.header().config.used_size as usize
    }

    /// Frames one buffer can hold.
    pub fn used_frames(&self) -> u32 {
        (self.used_size() / self.frame_bytes()) as u32
    }

    /// Frames both buffers together can hold.
    pub fn capacity_frames(&self) -> u32 {
        self.used_frames() * NUM_BUFFERS as u32
    }

    pub fn frame_rate(&self) -> u32 {
        self.header().config.frame_rate
    }

    // ---- producer side ----

    fn write_buf_idx(&self) -> usize {
        (self.header().write_buf_idx.load(Ordering::Acquire) & 1) as usize
    }

    /// Frames already written into the open (uncommitted) buffer. Zero when
    /// no write session is open; leftovers from an unconsumed buffer are
    /// counted as readable until the next session reclaims them.
    pub fn current_fill(&self) -> u32 {
        if !self.write_started {
            return 0;
        }
        let idx = self.write_buf_idx();
        let off = self.header().write_offset[idx].load(Ordering::Acquire);
        off / self.header().config.frame_bytes
    }

    /// Room left for the producer, in frames. Zero when the next buffer
    /// still holds committed samples the consumer has not drained; writing
    /// would overrun them.
    pub fn writable_frames(&self) -> u32 {
        let idx = self.write_buf_idx();
        let off = self.header().write_offset[idx].load(Ordering::Acquire);
        if !self.write_started && off != 0 {
            return 0;
        }
        self.used_frames() - off / self.header().config.frame_bytes
    }

    /// Open a write session if none is open and return the writable tail of
    /// the current buffer. Detects an overrun (the buffer to write was never
    /// consumed) and reclaims it, bumping `num_overruns`.
    pub fn begin_write(&mut self) -> &mut [u8] {
        let idx = self.write_buf_idx();
        if !self.write_started {
            let header = self.header();
            if header.write_offset[idx].load(Ordering::Acquire) != 0 {
                header.num_overruns.fetch_add(1, Ordering::Relaxed);
                header.write_offset[idx].store(0, Ordering::Release);
            }
            header.write_in_progress[idx].store(1, Ordering::Release);
            self.write_started = true;
        }
        let off = self.header().write_offset[idx].load(Ordering::Relaxed) as usize;
        let used = self.used_size();
        unsafe { std::slice::from_raw_parts_mut(self.buffer_ptr(idx).add(off), used - off) }
    }

    /// Record `frames` appended to the open buffer.
    pub fn buffer_written(&mut self, frames: u32) {
        let idx = self.write_buf_idx();
        let header = self.header();
        let bytes = frames * header.config.frame_bytes;
        let off = header.write_offset[idx].load(Ordering::Relaxed);
        let capped = (off + bytes).min(header.config.used_size);
        header.write_offset[idx].store(capped, Ordering::Release);
    }

    /// Commit the open buffer: publish it to the consumer and flip to the
    /// other buffer. `ts_nanos` stamps the oldest sample of the commit.
    pub fn buffer_write_complete(&mut self, ts_nanos: u64) {
        let idx = self.write_buf_idx();
        self.write_started = false;
        let header = self.header();
        header.read_offset[idx].store(0, Ordering::Relaxed);
        header.ts_nanos.store(ts_nanos, Ordering::Relaxed);
        fence(Ordering::Release);
        header.write_in_progress[idx].store(0, Ordering::Release);
        header
            .write_buf_idx
            .store((idx as u32) ^ 1, Ordering::Release);
    }

    // ---- consumer side ----

    fn read_buf_idx(&self) -> usize {
        (self.header().read_buf_idx.load(Ordering::Acquire) & 1) as usize
    }

    fn committed_frames(&self, idx: usize) -> u32 {
        let header = self.header();
        // A buffer with a produce session open is not readable yet.
        if header.write_in_progress[idx].load(Ordering::Acquire) != 0 {
            return 0;
        }
        fence(Ordering::Acquire);
        let woff = header.write_offset[idx].load(Ordering::Acquire);
        let roff = header.read_offset[idx].load(Ordering::Relaxed);
        woff.saturating_sub(roff) / header.config.frame_bytes
    }

    /// Committed frames the consumer can drain right now.
    pub fn readable_frames(&self) -> u32 {
        (0..NUM_BUFFERS).map(|idx| self.committed_frames(idx)).sum()
    }

    /// Committed plus in-flight frames; the capture-side level used for
    /// scheduling.
    pub fn total_level(&self) -> u32 {
        self.readable_frames() + self.current_fill()
    }

    /// Drain up to `max_frames` committed frames into `out`, returning the
    /// frame count actually copied.
    pub fn read_frames(&mut self, out: &mut [u8], max_frames: u32) -> u32 {
        let header = self.header();
        let fb = self.frame_bytes();
        let mut copied = 0u32;
        for _ in 0..NUM_BUFFERS {
            if copied >= max_frames {
                break;
            }
            let idx = self.read_buf_idx();
            let avail = self.committed_frames(idx);
            if avail == 0 {
                break;
            }
            let take = avail.min(max_frames - copied);
            let roff = header.read_offset[idx].load(Ordering::Relaxed) as usize;
            let src = unsafe {
                std::slice::from_raw_parts(self.buffer_ptr(idx).add(roff), take as usize * fb)
            };
            let dst_base = copied as usize * fb;
            out[dst_base..dst_base + src.len()].copy_from_slice(src);
            header.read_offset[idx]
                .store((roff + src.len()) as u32, Ordering::Release);
            copied += take;

            // Buffer drained: move to the other one.
            if self.committed_frames(idx) == 0 {
                header
                    .read_buf_idx
                    .store((idx as u32) ^ 1, Ordering::Release);
            }
        }
        copied
    }

    // ---- metadata ----

    pub fn volume_scaler(&self) -> f32 {
        f32::from_bits(self.header().volume_scaler.load(Ordering::Relaxed))
    }

    /// Out-of-range values are rejected and the stored scaler is unchanged.
    pub fn set_volume_scaler(&self, scaler: f32) -> Result<(), ShmError> {
        if !(0.0..=1.0).contains(&scaler) {
            return Err(ShmError::Inval("volume scaler outside [0.0, 1.0]"));
        }
        self.header()
            .volume_scaler
            .store(scaler.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    pub fn muted(&self) -> bool {
        self.header().mute.load(Ordering::Relaxed) != 0
    }

    pub fn set_mute(&self, mute: bool) {
        self.header().mute.store(u32::from(mute), Ordering::Relaxed);
    }

    pub fn callback_pending(&self) -> bool {
        self.header().callback_pending.load(Ordering::Acquire) != 0
    }

    pub fn set_callback_pending(&self, pending: bool) {
        self.header()
            .callback_pending
            .store(u32::from(pending), Ordering::Release);
    }

    pub fn num_overruns(&self) -> u32 {
        self.header().num_overruns.load(Ordering::Relaxed)
    }

    pub fn ts_nanos(&self) -> u64 {
        self.header().ts_nanos.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use chorus_dsp::format::{AudioFormat, SampleFormat};

    use crate::region::ShmRegion;

    use super::{region_len, AudioShm};

    fn make_pair(used_size: u32) -> (AudioShm, AudioShm, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shm");
        let fmt = AudioFormat::new(SampleFormat::S16LE, 48000, 2);
        let producer = AudioShm::create(
            ShmRegion::create(&path, region_len(used_size as usize)).unwrap(),
            &fmt,
            used_size,
        )
        .unwrap();
        let consumer = AudioShm::attach(ShmRegion::open(&path).unwrap()).unwrap();
        (producer, consumer, dir)
    }

    #[test]
    fn produce_commit_consume() {
        // 16 frames of 4 bytes per buffer.
        let (mut producer, mut consumer, _dir) = make_pair(64);
        assert_eq!(consumer.readable_frames(), 0);

        let buf = producer.begin_write();
        buf[..16].copy_from_slice(&[7u8; 16]);
        producer.buffer_written(4);
        assert_eq!(producer.current_fill(), 4);
        assert_eq!(consumer.readable_frames(), 0);

        producer.buffer_write_complete(123);
        assert_eq!(producer.current_fill(), 0);
        assert_eq!(consumer.readable_frames(), 4);
        assert_eq!(consumer.ts_nanos(), 123);

        let mut out = vec![0u8; 16];
        assert_eq!(consumer.read_frames(&mut out, 4), 4);
        assert_eq!(out, vec![7u8; 16]);
        assert_eq!(consumer.readable_frames(), 0);
    }

    #[test]
    fn partial_writes_accumulate_until_commit() {
        let (mut producer, consumer, _dir) = make_pair(64);
        producer.begin_write();
        producer.buffer_written(2);
        producer.begin_write();
        producer.buffer_written(3);
        assert_eq!(producer.current_fill(), 5);
        assert_eq!(consumer.readable_frames(), 0);
        producer.buffer_write_complete(0);
        assert_eq!(consumer.readable_frames(), 5);
    }

    #[test]
    fn offsets_never_exceed_used_size() {
        let (mut producer, _consumer, _dir) = make_pair(64);
        producer.begin_write();
        producer.buffer_written(100);
        assert_eq!(producer.current_fill(), 16);
        assert_eq!(producer.writable_frames(), 0);
    }

    #[test]
    fn overrun_reclaims_unread_buffer() {
        let (mut producer, consumer, _dir) = make_pair(64);
        for _ in 0..2 {
            producer.begin_write();
            producer.buffer_written(16);
            producer.buffer_write_complete(0);
        }
        // Both buffers committed and unread; the next session lands on the
        // first one again and reclaims it.
        producer.begin_write();
        assert_eq!(producer.num_overruns(), 1);
        assert_eq!(consumer.num_overruns(), 1);
    }

    #[test]
    fn volume_scaler_is_validated() {
        let (producer, consumer, _dir) = make_pair(64);
        assert_eq!(producer.volume_scaler(), 1.0);
        assert!(producer.set_volume_scaler(1.5).is_err());
        assert_eq!(producer.volume_scaler(), 1.0);
        producer.set_volume_scaler(0.25).unwrap();
        assert_eq!(consumer.volume_scaler(), 0.25);
        consumer.set_mute(true);
        assert!(producer.muted());
    }

    #[test]
    fn read_spans_both_buffers() {
        let (mut producer, mut consumer, _dir) = make_pair(64);
        for fill in [1u8, 2] {
            let buf = producer.begin_write();
            buf[..8].fill(fill);
            producer.buffer_written(2);
            producer.buffer_write_complete(0);
        }
        assert_eq!(consumer.readable_frames(), 4);
        let mut out = vec![0u8; 16];
        assert_eq!(consumer.read_frames(&mut out, 4), 4);
        assert_eq!(&out[..8], &[1u8; 8]);
        assert_eq!(&out[8..], &[2u8; 8]);
    }
}
