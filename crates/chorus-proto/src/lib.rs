//! Wire protocol shared by chorus clients and the daemon.

pub mod audio;
pub mod control;
pub mod error;
pub mod frame;
pub mod ids;
pub mod types;

/// Protocol version; bumped on any incompatible wire or shm layout change.
pub const PROTOCOL_VERSION: u32 = 1;

/// Name of the control socket inside the socket directory.
pub const SERVER_SOCKET_NAME: &str = ".chorus_socket";

/// Per-stream audio socket file name for a given stream id.
pub fn audio_socket_name(stream_id: ids::StreamId) -> String {
    format!("aud-{stream_id}")
}

/// Shm file name backing a stream's audio area.
pub fn stream_shm_name(stream_id: ids::StreamId) -> String {
    format!("stream-{stream_id}")
}

/// Shm file name of the read-only server state region.
pub const SERVER_STATE_SHM_NAME: &str = "state";
