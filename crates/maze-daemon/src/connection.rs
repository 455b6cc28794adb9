//! Non-blocking socket wrapper with drain-to-`WouldBlock` reads and writes.
//!
//! The reactor is edge-triggered, so every readable callback must consume all
//! bytes the kernel has and every writable callback must push until the send
//! buffer fills. Both operations report the socket state they observed
//! instead of surfacing disconnects as errors; a peer hanging up is a normal
//! outcome, not a failure.

use std::io::{self, Read, Write};
use std::net::SocketAddr;

use mio::net::TcpStream;
use tracing::trace;

const READ_CHUNK: usize = 4096;

/// State of the inbound half after a read pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// More data may arrive later.
    Open,
    /// The peer closed its sending side (or the connection dropped).
    Closed,
}

/// State of the outbound half after a write pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    /// The buffer was fully written; write interest can be dropped.
    Flushed,
    /// The send buffer filled; data remains and write interest must stay.
    Pending,
    /// The peer is gone; nothing more can be delivered.
    Closed,
}

/// One accepted TCP connection.
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self { stream, peer }
    }

    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn source(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Reads everything currently available, appending it to `buffer` as
    /// text. Bytes that are not valid UTF-8 are replaced; the protocol is
    /// ASCII, so replacement characters cannot form a valid message and the
    /// parser drops the line.
    pub fn read_available(&mut self, buffer: &mut String) -> io::Result<ReadState> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(ReadState::Closed),
                Ok(n) => {
                    trace!(peer = %self.peer, bytes = n, "read");
                    buffer.push_str(&String::from_utf8_lossy(&chunk[..n]));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadState::Open),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if is_disconnect(&e) => return Ok(ReadState::Closed),
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes as much of `buffer` as the socket accepts, draining the written
    /// prefix from the buffer.
    pub fn write_buffered(&mut self, buffer: &mut Vec<u8>) -> io::Result<WriteState> {
        let mut written = 0;
        let state = loop {
            if written == buffer.len() {
                break WriteState::Flushed;
            }
            match self.stream.write(&buffer[written..]) {
                Ok(0) => break WriteState::Closed,
                Ok(n) => {
                    trace!(peer = %self.peer, bytes = n, "wrote");
                    written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break WriteState::Pending,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if is_disconnect(&e) => break WriteState::Closed,
                Err(e) => {
                    buffer.drain(..written);
                    return Err(e);
                }
            }
        };
        buffer.drain(..written);
        Ok(state)
    }
}

fn is_disconnect(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;
    use std::net::TcpListener;

    use super::*;

    fn connected_pair() -> (Connection, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = std::net::TcpStream::connect(addr).unwrap();
        let (accepted, peer) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        let conn = Connection::new(TcpStream::from_std(accepted), peer);
        (conn, client)
    }

    #[test]
    fn test_read_available_appends_and_stays_open() {
        let (mut conn, mut client) = connected_pair();
        client.write_all(b"1|B\n2|").unwrap();

        // Wait for the bytes to land on the accepted side.
        let mut buffer = String::new();
        for _ in 0..100 {
            let state = conn.read_available(&mut buffer).unwrap();
            assert_eq!(state, ReadState::Open);
            if buffer == "1|B\n2|" {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        panic!("data never arrived, got {buffer:?}");
    }

    #[test]
    fn test_read_available_reports_peer_close() {
        let (mut conn, client) = connected_pair();
        drop(client);

        let mut buffer = String::new();
        for _ in 0..100 {
            if conn.read_available(&mut buffer).unwrap() == ReadState::Closed {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        panic!("close never observed");
    }

    #[test]
    fn test_write_buffered_drains_written_prefix() {
        let (mut conn, mut client) = connected_pair();

        let mut buffer = b"hello\n".to_vec();
        let state = conn.write_buffered(&mut buffer).unwrap();
        assert_eq!(state, WriteState::Flushed);
        assert!(buffer.is_empty());

        let mut received = [0u8; 6];
        use std::io::Read as _;
        client.read_exact(&mut received).unwrap();
        assert_eq!(&received, b"hello\n");
    }
}
