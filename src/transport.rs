//! Raw L2 frame transport.
//!
//! `RawSocket` owns an AF_PACKET socket bound to one interface, configured
//! promiscuous and non-blocking. Frames are sent and received whole,
//! starting at the destination MAC; the kernel appends the FCS.

use crate::error::SessionError;
use crate::frame::MacAddr;
use std::io;
use std::mem;

const RECV_BUF_LEN: usize = 65536;

/// Seam between the session and the wire. The session opens one endpoint
/// for transmission and, when GOOSE monitoring is on, a second one for the
/// listener task; endpoints are never shared between tasks.
pub trait L2Transport: Sized {
    /// Acquire an endpoint on the named interface. Fails when the interface
    /// does not exist or privileges are insufficient.
    fn open(iface: &str) -> Result<Self, SessionError>;

    /// Transmit one complete Ethernet frame. A send failure is reported to
    /// the caller and is never fatal to the session.
    fn send(&mut self, frame: &[u8]) -> Result<usize, SessionError>;

    /// Receive at most one frame without blocking; `None` means no frame
    /// is ready.
    fn recv(&mut self) -> Result<Option<Vec<u8>>, SessionError>;

    /// The interface's link-layer address; all-zero when unavailable.
    fn local_mac(&self) -> MacAddr;
}

pub struct RawSocket {
    fd: libc::c_int,
    addr: libc::sockaddr_ll,
    mac: MacAddr,
    buf: Vec<u8>,
}

fn transport_err(what: &str, iface: &str) -> SessionError {
    SessionError::Transport(format!("{} on {}: {}", what, iface, io::Error::last_os_error()))
}

impl RawSocket {
    fn init(&mut self, iface: &str) -> Result<(), SessionError> {
        let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
        for (dst, src) in ifr.ifr_name.iter_mut().zip(iface.as_bytes()) {
            *dst = *src as libc::c_char;
        }

        if unsafe { libc::ioctl(self.fd, libc::SIOCGIFINDEX, &mut ifr) } < 0 {
            return Err(transport_err("interface lookup failed", iface));
        }
        let ifindex = unsafe { ifr.ifr_ifru.ifru_ifindex };

        self.addr.sll_family = libc::AF_PACKET as libc::c_ushort;
        self.addr.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
        self.addr.sll_ifindex = ifindex;
        self.addr.sll_halen = libc::ETH_ALEN as u8;

        let bind_addr = self.addr;
        let ret = unsafe {
            libc::bind(
                self.fd,
                &bind_addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(transport_err("failed to bind raw socket", iface));
        }

        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL, 0) };
        if flags < 0 || unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(transport_err("failed to set non-blocking mode", iface));
        }

        // Generous buffers for a sustained 4800 Hz stream.
        let sndbuf: libc::c_int = 1 << 20;
        let rcvbuf: libc::c_int = 2 << 20;
        unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                &sndbuf as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &rcvbuf as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }

        let mut mreq: libc::packet_mreq = unsafe { mem::zeroed() };
        mreq.mr_ifindex = ifindex;
        mreq.mr_type = libc::PACKET_MR_PROMISC as libc::c_ushort;
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_PACKET,
                libc::PACKET_ADD_MEMBERSHIP,
                &mreq as *const libc::packet_mreq as *const libc::c_void,
                mem::size_of::<libc::packet_mreq>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(transport_err("failed to enable promiscuous mode", iface));
        }

        // All-zero MAC is the documented sentinel when detection fails.
        if unsafe { libc::ioctl(self.fd, libc::SIOCGIFHWADDR, &mut ifr) } == 0 {
            let hwaddr = unsafe { ifr.ifr_ifru.ifru_hwaddr };
            let mut octets = [0u8; 6];
            for (dst, src) in octets.iter_mut().zip(hwaddr.sa_data.iter()) {
                *dst = *src as u8;
            }
            self.mac = MacAddr(octets);
        }

        Ok(())
    }
}

impl L2Transport for RawSocket {
    fn open(iface: &str) -> Result<RawSocket, SessionError> {
        if iface.is_empty() || iface.len() >= libc::IFNAMSIZ {
            return Err(SessionError::Transport(format!(
                "invalid interface name '{}'",
                iface
            )));
        }

        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW,
                i32::from((libc::ETH_P_ALL as u16).to_be()),
            )
        };
        if fd < 0 {
            return Err(SessionError::Transport(format!(
                "failed to open raw socket (are you root?): {}",
                io::Error::last_os_error()
            )));
        }

        // Constructed before init so the fd is closed on any failure path.
        let mut socket = RawSocket {
            fd,
            addr: unsafe { mem::zeroed() },
            mac: MacAddr::ZERO,
            buf: vec![0u8; RECV_BUF_LEN],
        };
        socket.init(iface)?;
        Ok(socket)
    }

    fn send(&mut self, frame: &[u8]) -> Result<usize, SessionError> {
        let sent = unsafe {
            libc::sendto(
                self.fd,
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
                &self.addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if sent < 0 {
            return Err(SessionError::Transport(format!(
                "send failed: {}",
                io::Error::last_os_error()
            )));
        }
        Ok(sent as usize)
    }

    fn recv(&mut self) -> Result<Option<Vec<u8>>, SessionError> {
        let n = unsafe {
            libc::recv(
                self.fd,
                self.buf.as_mut_ptr() as *mut libc::c_void,
                self.buf.len(),
                0,
            )
        };
        if n > 0 {
            return Ok(Some(self.buf[..n as usize].to_vec()));
        }
        if n == 0 {
            return Ok(None);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => Ok(None),
            _ => Err(SessionError::Transport(format!("receive failed: {}", err))),
        }
    }

    fn local_mac(&self) -> MacAddr {
        self.mac
    }
}

impl Drop for RawSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
