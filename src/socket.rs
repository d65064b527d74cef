//! Blocking socket primitives with per-call deadlines.
//!
//! Every public function maps the raw `io::Error` zoo into the small
//! [`SocketError`] set so the rest of the engine never branches on
//! `io::ErrorKind`.

use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::time::Duration;

use crate::error::SocketError;

/// Builds a socket address from the `(ip, port)` pair a payload carries.
pub fn parse_endpoint(ip: &str, port: u32) -> Result<SocketAddr, SocketError> {
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| SocketError::Io(format!("invalid peer address: {:?}", ip)))?;
    let port: u16 =
        u16::try_from(port).map_err(|_| SocketError::Io(format!("invalid peer port: {}", port)))?;

    Ok(SocketAddr::new(ip, port))
}

/// Collapses an `io::Error` into the typed socket error set.
pub(crate) fn classify(err: io::Error, timeout_ms: u64) -> SocketError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => SocketError::Timeout(timeout_ms),
        io::ErrorKind::ConnectionRefused => SocketError::ConnectionRefused,
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
            SocketError::ConnectionReset
        }
        io::ErrorKind::BrokenPipe => SocketError::PeerClosed,
        _ => SocketError::Io(err.to_string()),
    }
}

/// Opens a TCP connection to `addr` within `timeout`.
pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, SocketError> {
    let timeout_ms: u64 = timeout.as_millis() as u64;
    let stream: TcpStream =
        TcpStream::connect_timeout(&addr, timeout).map_err(|e| classify(e, timeout_ms))?;

    stream
        .set_nodelay(true)
        .map_err(|e| classify(e, timeout_ms))?;

    Ok(stream)
}

/// Writes the whole buffer, looping over partial writes, within `timeout`
/// per physical write.
pub fn send_all(stream: &mut TcpStream, buf: &[u8], timeout: Duration) -> Result<(), SocketError> {
    let timeout_ms: u64 = timeout.as_millis() as u64;
    stream
        .set_write_timeout(Some(timeout))
        .map_err(|e| classify(e, timeout_ms))?;

    let mut written: usize = 0;
    while written < buf.len() {
        match stream.write(&buf[written..]) {
            Ok(0) => return Err(SocketError::PeerClosed),
            Ok(n) => written += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(classify(e, timeout_ms)),
        }
    }

    Ok(())
}

/// Reads up to `buf.len()` bytes within `timeout`.
///
/// A zero-byte read is surfaced as [`SocketError::PeerClosed`] so callers
/// never have to special-case orderly shutdown.
pub fn receive(
    stream: &mut TcpStream,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<usize, SocketError> {
    let timeout_ms: u64 = timeout.as_millis() as u64;
    stream
        .set_read_timeout(Some(timeout))
        .map_err(|e| classify(e, timeout_ms))?;

    loop {
        match stream.read(buf) {
            Ok(0) => return Err(SocketError::PeerClosed),
            Ok(n) => return Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(classify(e, timeout_ms)),
        }
    }
}

/// Reads exactly `buf.len()` bytes within `timeout` per physical read.
pub fn receive_exact(
    stream: &mut TcpStream,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<(), SocketError> {
    let mut received: usize = 0;
    while received < buf.len() {
        let n: usize = receive(stream, &mut buf[received..], timeout)?;
        received += n;
    }

    Ok(())
}
