//! One connected control client.

use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use tracing::warn;

use chorus_proto::control::{ClientMessage, ServerMessage};
use chorus_proto::error::ProtoError;
use chorus_proto::frame::{decode_frame, encode_frame, FrameBuffer};
use chorus_proto::ids::ClientId;

use crate::error::ServerError;

pub struct Rclient {
    id: ClientId,
    sock: UnixStream,
    inbuf: FrameBuffer,
}

/// Result of pumping a readable client socket.
pub enum ClientRead {
    /// Messages decoded this pass; protocol errors inside a frame are
    /// logged and skipped, the connection stays up.
    Messages(Vec<ServerMessage>),
    /// Peer closed or broke the framing; drop the connection.
    Disconnected,
}

impl Rclient {
    pub fn new(id: ClientId, sock: UnixStream) -> Self {
        Self {
            id,
            sock,
            inbuf: FrameBuffer::new(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    /// Read whatever is available and split out complete messages. Call
    /// only when `poll` reported the socket readable.
    pub fn pump(&mut self) -> ClientRead {
        let mut chunk = [0u8; 4096];
        match self.sock.read(&mut chunk) {
            Ok(0) => return ClientRead::Disconnected,
            Ok(n) => self.inbuf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {},
            Err(e) => {
                warn!(client = self.id, error = %e, "control socket read failed");
                return ClientRead::Disconnected;
            },
        }

        let mut messages = Vec::new();
        loop {
            match self.inbuf.next_frame() {
                Ok(Some((id, body))) => match decode_frame::<ServerMessage>(id, &body) {
                    Ok(msg) => messages.push(msg),
                    Err(e) => {
                        // Bad payload in a well-framed message: drop the
                        // message, keep the client.
                        warn!(client = self.id, error = %e, "dropping malformed message");
                    },
                },
                Ok(None) => break,
                Err(e @ (ProtoError::FrameTooShort { .. } | ProtoError::FrameTooLarge { .. })) => {
                    warn!(client = self.id, error = %e, "framing violation");
                    return ClientRead::Disconnected;
                },
                Err(e) => {
                    warn!(client = self.id, error = %e, "frame error");
                    return ClientRead::Disconnected;
                },
            }
        }
        ClientRead::Messages(messages)
    }

    pub fn send(&mut self, msg: &ClientMessage) -> Result<(), ServerError> {
        let frame = encode_frame(msg)?;
        self.sock.write_all(&frame)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    use chorus_proto::control::ServerMessage;
    use chorus_proto::frame::encode_frame;

    use super::{ClientRead, Rclient};

    #[test]
    fn pump_decodes_pipelined_messages() {
        let (server_end, mut client_end) = UnixStream::pair().unwrap();
        let mut client = Rclient::new(7, server_end);

        let mut bytes = encode_frame(&ServerMessage::SetSystemVolume { volume: 10 }).unwrap();
        bytes.extend(encode_frame(&ServerMessage::SetSystemMute { mute: true }).unwrap());
        client_end.write_all(&bytes).unwrap();

        match client.pump() {
            ClientRead::Messages(msgs) => {
                assert_eq!(msgs.len(), 2);
                assert_eq!(msgs[0], ServerMessage::SetSystemVolume { volume: 10 });
                assert_eq!(msgs[1], ServerMessage::SetSystemMute { mute: true });
            },
            ClientRead::Disconnected => panic!("unexpected disconnect"),
        }
    }

    #[test]
    fn peer_close_disconnects() {
        let (server_end, client_end) = UnixStream::pair().unwrap();
        let mut client = Rclient::new(7, server_end);
        drop(client_end);
        assert!(matches!(client.pump(), ClientRead::Disconnected));
    }

    #[test]
    fn bogus_length_disconnects() {
        let (server_end, mut client_end) = UnixStream::pair().unwrap();
        let mut client = Rclient::new(7, server_end);
        // Declared length shorter than the header itself.
        client_end.write_all(&3u32.to_le_bytes()).unwrap();
        client_end.write_all(&1u32.to_le_bytes()).unwrap();
        assert!(matches!(client.pump(), ClientRead::Disconnected));
    }
}
