//! Control-plane of the chorus daemon: client sessions, the stream and
//! device registries, system state publication and message dispatch.

pub mod config;
pub mod dsp;
pub mod error;
pub mod iodev_list;
pub mod observer;
pub mod rclient;
pub mod server;
pub mod stream_list;
pub mod system_state;

pub use config::ServerConfig;
pub use error::ServerError;
pub use server::Server;
