//! Read-only server state shared with every client.
//!
//! One global region, written only by the control thread and read by any
//! number of clients. Consistency comes from a sequence lock: the writer
//! bumps `update_count` to odd before mutating and back to even after, so a
//! reader that saw the same even count on both sides of its copy holds a
//! consistent snapshot.

use std::sync::atomic::{fence, AtomicU32, Ordering};

use crate::error::ShmError;
use crate::region::ShmRegion;

pub const SERVER_STATE_MAGIC: u32 = 0x4348_5353;
pub const SERVER_STATE_VERSION: u32 = 1;

pub const MAX_IODEVS: usize = 20;
pub const MAX_IONODES: usize = 40;
pub const MAX_ATTACHED_CLIENTS: usize = 20;

/// Device entry as laid out in shared memory.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ShmDevInfo {
    pub index: u32,
    /// 0 = output, 1 = input.
    pub direction: u32,
    pub name: [u8; 64],
}

/// Node entry as laid out in shared memory.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ShmNodeInfo {
    pub id: u64,
    pub node_type: u32,
    pub plugged: u32,
    pub active: u32,
    pub priority: u32,
    pub volume: u32,
    pub capture_gain: i32,
    pub left_right_swapped: u32,
    pub name: [u8; 64],
}

/// The seq-lock protected payload.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ServerStateData {
    pub volume: u32,
    pub mute: u32,
    pub mute_locked: u32,
    pub capture_gain: i32,
    pub capture_mute: u32,
    pub capture_mute_locked: u32,
    pub num_streams_attached: u32,
    pub num_active_streams: u32,
    pub last_active_stream_time_nanos: u64,
    pub selected_output_node: u64,
    pub selected_input_node: u64,
    pub num_output_devs: u32,
    pub num_input_devs: u32,
    pub output_devs: [ShmDevInfo; MAX_IODEVS],
    pub input_devs: [ShmDevInfo; MAX_IODEVS],
    pub num_output_nodes: u32,
    pub num_input_nodes: u32,
    pub output_nodes: [ShmNodeInfo; MAX_IONODES],
    pub input_nodes: [ShmNodeInfo; MAX_IONODES],
    pub num_attached_clients: u32,
    pub attached_clients: [u32; MAX_ATTACHED_CLIENTS],
}

impl ServerStateData {
    pub fn zeroed() -> Self {
        // Plain-old-data layout with no invalid bit patterns.
        unsafe { std::mem::zeroed() }
    }
}

#[repr(C)]
struct ServerStateHeader {
    magic: u32,
    version: u32,
    update_count: AtomicU32,
    _pad: u32,
    data: ServerStateData,
}

/// Size a server-state region must have.
pub fn region_len() -> usize {
    std::mem::size_of::<ServerStateHeader>()
}

/// Copy a name into a fixed shm field, truncating and nul-terminating.
pub fn set_shm_name(field: &mut [u8; 64], name: &str) {
    let bytes = name.as_bytes();
    let n = bytes.len().min(field.len() - 1);
    field[..n].copy_from_slice(&bytes[..n]);
    field[n..].fill(0);
}

/// Read a name back out of a fixed shm field.
pub fn shm_name(field: &[u8; 64]) -> &str {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end]).unwrap_or("")
}

/// Mapped server-state region. The daemon constructs it with [`create`] and
/// is the only writer; clients attach with [`attach`] and only read.
///
/// [`create`]: ServerStateShm::create
/// [`attach`]: ServerStateShm::attach
pub struct ServerStateShm {
    region: ShmRegion,
}

impl ServerStateShm {
    pub fn create(region: ShmRegion) -> Result<Self, ShmError> {
        if region.len() < region_len() {
            return Err(ShmError::TooSmall {
                len: region.len(),
                need: region_len(),
            });
        }
        unsafe {
            let header = region.as_mut_ptr() as *mut ServerStateHeader;
            std::ptr::write(
                header,
                ServerStateHeader {
                    magic: SERVER_STATE_MAGIC,
                    version: SERVER_STATE_VERSION,
                    update_count: AtomicU32::new(0),
                    _pad: 0,
                    data: ServerStateData::zeroed(),
                },
            );
        }
        Ok(Self { region })
    }

    /// Attach to the daemon's region; a version mismatch detaches and fails.
    pub fn attach(region: ShmRegion) -> Result<Self, ShmError> {
        if region.len() < region_len() {
            return Err(ShmError::TooSmall {
                len: region.len(),
                need: region_len(),
            });
        }
        let shm = Self { region };
        let header = shm.header();
        if header.magic != SERVER_STATE_MAGIC || header.version != SERVER_STATE_VERSION {
            return Err(ShmError::HeaderMismatch {
                magic: header.magic,
                version: header.version,
            });
        }
        Ok(shm)
    }

    fn header(&self) -> &ServerStateHeader {
        unsafe { &*(self.region.as_ptr() as *const ServerStateHeader) }
    }

    fn data_ptr(&self) -> *mut ServerStateData {
        unsafe { &mut (*(self.region.as_mut_ptr() as *mut ServerStateHeader)).data }
    }

    /// Mutate the state under the sequence lock. Only the single writer may
    /// call this; readers spin on the counter meanwhile.
    pub fn update<R>(&mut self, mutate: impl FnOnce(&mut ServerStateData) -> R) -> R {
        let count = &self.header().update_count;
        count.fetch_add(1, Ordering::Relaxed);
        fence(Ordering::Release);

        let mut data = unsafe { std::ptr::read_volatile(self.data_ptr()) };
        let result = mutate(&mut data);
        unsafe { std::ptr::write_volatile(self.data_ptr(), data) };

        fence(Ordering::Release);
        count.fetch_add(1, Ordering::Release);
        result
    }

    /// Take a consistent snapshot, retrying while a write is in flight.
    pub fn snapshot(&self) -> ServerStateData {
        let count = &self.header().update_count;
        loop {
            let before = count.load(Ordering::Acquire);
            if before % 2 != 0 {
                std::hint::spin_loop();
                continue;
            }
            let data = unsafe { std::ptr::read_volatile(self.data_ptr()) };
            fence(Ordering::Acquire);
            let after = count.load(Ordering::Acquire);
            if before == after {
                return data;
            }
        }
    }

    /// Current value of the update counter; odd means writer in progress.
    pub fn update_count(&self) -> u32 {
        self.header().update_count.load(Ordering::Acquire)
    }
}
