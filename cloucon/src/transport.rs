//! TCP link to the reader. Depending on the configured mode the engine
//! either listens and accepts the reader's connection or dials the reader.
//! Reads and writes run under the configured socket timeout; a timeout is
//! folded into the benign `Wait` error so the engine loop just moves on,
//! while every other socket failure is fatal and tears the session down.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Most bytes consumed from the socket in one engine tick.
pub const RECV_CHUNK: usize = 4096;

pub type LinkResult<T> = Result<T, LinkError>;

#[derive(Debug, PartialEq, Eq)]
pub enum LinkError {
    /// Nothing to do right now (timeout or would-block); try again later.
    Wait,
    Fatal(io::ErrorKind),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LinkError::Wait => f.write_str("would block"),
            LinkError::Fatal(kind) => write!(f, "{:?}", kind),
        }
    }
}

impl From<io::Error> for LinkError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
                LinkError::Wait
            }
            kind => LinkError::Fatal(kind),
        }
    }
}

/// Read one chunk from the reader into `buf`.
pub fn ingress<R: Read>(reader: &mut R, buf: &mut [u8]) -> LinkResult<usize> {
    match reader.read(buf) {
        // A clean read of zero bytes means the peer closed the connection.
        Ok(0) => Err(LinkError::Fatal(io::ErrorKind::UnexpectedEof)),
        Ok(count) => Ok(count),
        Err(err) => Err(err.into()),
    }
}

/// Drain as much of `buf` into the writer as it accepts; written bytes are
/// removed from the buffer so a timeout retains exactly the unsent tail.
pub fn egress<W: Write>(writer: &mut W, buf: &mut Vec<u8>) -> LinkResult<usize> {
    let mut written = 0usize;
    let result = loop {
        if written == buf.len() {
            break Ok(written);
        }
        match writer.write(&buf[written..]) {
            Ok(0) => break Err(LinkError::Fatal(io::ErrorKind::WriteZero)),
            Ok(count) => written += count,
            Err(err) => break Err(err.into()),
        }
    };
    buf.drain(..written);
    result
}

/// One established session with the reader.
pub struct Link {
    stream: TcpStream,
}

impl Link {
    fn from_stream(stream: TcpStream, sock_timeout: Duration) -> io::Result<Link> {
        stream.set_read_timeout(Some(sock_timeout))?;
        stream.set_write_timeout(Some(sock_timeout))?;
        Ok(Link { stream })
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> LinkResult<usize> {
        ingress(&mut self.stream, buf)
    }

    pub fn flush(&mut self, buf: &mut Vec<u8>) -> LinkResult<usize> {
        egress(&mut self.stream, buf)
    }

    /// Shut both directions down before dropping the socket.
    pub fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    pub fn peer_label(&self) -> String {
        self.stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| String::from("unknown"))
    }
}

/// Bind the listening socket used when the reader acts as the TCP client.
/// Accepts are polled, so the listener is non-blocking.
pub fn bind_listener(host: &str, port: u16) -> io::Result<TcpListener> {
    let listener = TcpListener::bind((host, port))?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// One poll of the listener for an incoming reader connection.
pub fn try_accept(listener: &TcpListener, sock_timeout: Duration) -> LinkResult<Link> {
    match listener.accept() {
        Ok((stream, _peer)) => {
            stream.set_nonblocking(false).map_err(LinkError::from)?;
            Link::from_stream(stream, sock_timeout).map_err(LinkError::from)
        }
        Err(err) => Err(err.into()),
    }
}

/// Dial the reader when it acts as the TCP server.
pub fn dial(host: &str, port: u16, sock_timeout: Duration) -> LinkResult<Link> {
    let addresses = (host, port)
        .to_socket_addrs()
        .map_err(|err| LinkError::Fatal(err.kind()))?;
    let mut last = LinkError::Fatal(io::ErrorKind::AddrNotAvailable);
    for address in addresses {
        match TcpStream::connect_timeout(&address, sock_timeout) {
            Ok(stream) => return Link::from_stream(stream, sock_timeout).map_err(LinkError::from),
            Err(err) => last = err.into(),
        }
    }
    Err(last)
}
