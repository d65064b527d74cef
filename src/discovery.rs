//! Local IPv4 discovery.
//!
//! The engine reports its own address inside transfer requests, so it has
//! to know which of the machine's addresses a peer can reach. Candidates
//! come from `getaddrinfo` on the local hostname; a CIDR hint picks the
//! right one on multi-homed machines, and a connected UDP probe serves as
//! the fallback when name resolution yields nothing usable.

use std::ffi::{CStr, CString};
use std::fmt;
use std::io::{self, Error, ErrorKind};
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::ptr;
use std::str::FromStr;

use libc::{addrinfo, c_char, c_int, AF_INET, EAI_SYSTEM, SOCK_STREAM};
use socket2::SockAddr;

/// An IPv4 network in `a.b.c.d/len` notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl Cidr {
    pub fn new(network: Ipv4Addr, prefix_len: u8) -> io::Result<Self> {
        if prefix_len > 32 {
            Err(Error::new(
                ErrorKind::InvalidInput,
                format!("CIDR prefix length out of range: {}", prefix_len),
            ))?;
        }

        Ok(Self {
            network,
            prefix_len,
        })
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        if self.prefix_len == 0 {
            return true;
        }
        let mask: u32 = u32::MAX << (32 - self.prefix_len);

        (u32::from(addr) & mask) == (u32::from(self.network) & mask)
    }
}

impl FromStr for Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (network, prefix) = s
            .split_once('/')
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "CIDR must be <network>/<len>"))?;

        let network: Ipv4Addr = network
            .parse()
            .map_err(|_| Error::new(ErrorKind::InvalidInput, "Invalid CIDR network address"))?;
        let prefix_len: u8 = prefix
            .parse()
            .map_err(|_| Error::new(ErrorKind::InvalidInput, "Invalid CIDR prefix length"))?;

        Self::new(network, prefix_len)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

/// Converts a `getaddrinfo` error code to an `io::Error`.
fn process_gai_error(ret: c_int) -> Error {
    if ret == EAI_SYSTEM {
        return Error::last_os_error();
    }
    // SAFETY: `libc::gai_strerror(ret)` returns a pointer to a static string,
    // which is valid for the lifetime of the program. `CStr::from_ptr(cstr)`
    // is safe as long as `cstr` is non-null and points to a valid
    // NUL-terminated string.
    let cstr: *const c_char = unsafe { libc::gai_strerror(ret) };
    let err_msg: String = unsafe { CStr::from_ptr(cstr) }
        .to_string_lossy()
        .into_owned();

    Error::new(ErrorKind::Other, err_msg)
}

/// The machine's hostname, per `gethostname(2)`.
fn hostname() -> io::Result<String> {
    let mut buf: [u8; 256] = [0; 256];
    let ret: c_int = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut c_char, buf.len()) };
    if ret != 0 {
        Err(Error::last_os_error())?;
    }
    let end: usize = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());

    String::from_utf8(buf[..end].to_vec())
        .map_err(|_| Error::new(ErrorKind::InvalidData, "Hostname is not valid UTF-8"))
}

/// Resolves every IPv4 address `getaddrinfo` reports for `host`.
fn resolve_host_ipv4(host: &str) -> io::Result<Vec<Ipv4Addr>> {
    let host_cstring: CString = CString::new(host)
        .map_err(|_| Error::new(ErrorKind::InvalidInput, "Invalid host string"))?;

    let mut hints: addrinfo = unsafe { std::mem::zeroed() };
    hints.ai_family = AF_INET;
    hints.ai_socktype = SOCK_STREAM;

    let mut res_ptr: *mut addrinfo = ptr::null_mut();
    let ret: c_int =
        unsafe { libc::getaddrinfo(host_cstring.as_ptr(), ptr::null(), &hints, &mut res_ptr) };
    if ret != 0 {
        Err(process_gai_error(ret))?;
    }

    let mut addresses: Vec<Ipv4Addr> = Vec::new();
    let mut cur: *mut addrinfo = res_ptr;
    while let Some(entry) = unsafe { cur.as_ref() } {
        // SAFETY: `ai_addr` points to `ai_addrlen` valid bytes for every
        // entry of the list `getaddrinfo` returned; the bytes are copied
        // into properly allocated sockaddr storage before use.
        let copied: io::Result<((), SockAddr)> = unsafe {
            SockAddr::try_init(|storage, len| {
                *len = entry.ai_addrlen;
                ptr::copy_nonoverlapping(
                    entry.ai_addr as *const u8,
                    storage as *mut u8,
                    entry.ai_addrlen as usize,
                );
                Ok(())
            })
        };
        if let Ok((_, sockaddr)) = copied {
            if let Some(SocketAddr::V4(v4)) = sockaddr.as_socket() {
                addresses.push(*v4.ip());
            }
        }
        cur = entry.ai_next;
    }
    unsafe { libc::freeaddrinfo(res_ptr) };

    Ok(addresses)
}

/// Address a connected UDP socket would use to reach `target`. No packet
/// is sent.
fn probe_local_ipv4(target: SocketAddr) -> io::Result<Ipv4Addr> {
    let socket: UdpSocket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect(target)?;

    match socket.local_addr()? {
        SocketAddr::V4(v4) => Ok(*v4.ip()),
        other => Err(Error::new(
            ErrorKind::Unsupported,
            format!("Probe returned a non-IPv4 address: {}", other),
        )),
    }
}

/// Picks the local IPv4 address this peer should advertise.
///
/// Preference order: an address inside the CIDR hint, any non-loopback
/// hostname address, a UDP probe, and finally loopback. Loopback counts as
/// a candidate so a `127.0.0.0/8` hint pins single-host deployments.
pub fn local_ipv4(cidr_hint: Option<&Cidr>) -> Ipv4Addr {
    let mut candidates: Vec<Ipv4Addr> = vec![Ipv4Addr::LOCALHOST];
    candidates.extend(
        hostname()
            .and_then(|host| resolve_host_ipv4(&host))
            .unwrap_or_default(),
    );

    if let Some(cidr) = cidr_hint {
        if let Some(addr) = candidates.iter().find(|a| cidr.contains(**a)) {
            return *addr;
        }
    }
    if let Some(addr) = candidates.iter().find(|a| !a.is_loopback()) {
        return *addr;
    }

    let probe_target: SocketAddr = "8.8.8.8:80".parse().expect("static address parses");
    match probe_local_ipv4(probe_target) {
        Ok(addr) if !addr.is_unspecified() => addr,
        _ => Ipv4Addr::LOCALHOST,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cidr_parse_and_display_roundtrip() {
        let cidr: Cidr = "192.168.2.0/24".parse().unwrap();
        assert_eq!(cidr.to_string(), "192.168.2.0/24");
    }

    #[test]
    fn test_cidr_membership() {
        let cidr: Cidr = "192.168.2.0/24".parse().unwrap();

        assert!(cidr.contains(Ipv4Addr::new(192, 168, 2, 11)));
        assert!(!cidr.contains(Ipv4Addr::new(192, 168, 3, 11)));
        assert!(!cidr.contains(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn test_zero_prefix_matches_everything() {
        let cidr: Cidr = "0.0.0.0/0".parse().unwrap();
        assert!(cidr.contains(Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[test]
    fn test_invalid_cidr_strings_are_rejected() {
        assert!("192.168.2.0".parse::<Cidr>().is_err());
        assert!("192.168.2.0/33".parse::<Cidr>().is_err());
        assert!("not-an-ip/8".parse::<Cidr>().is_err());
    }

    #[test]
    fn test_local_ipv4_always_yields_an_address() {
        // Worst case the loopback fallback kicks in; the call must not fail.
        let addr: Ipv4Addr = local_ipv4(None);
        assert!(!addr.is_unspecified());
    }

    #[test]
    fn test_loopback_hint_pins_loopback() {
        let cidr: Cidr = "127.0.0.0/8".parse().unwrap();
        assert_eq!(local_ipv4(Some(&cidr)), Ipv4Addr::LOCALHOST);
    }
}
