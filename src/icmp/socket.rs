use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::ptr;

use async_trait::async_trait;
use libc::{c_int, c_uchar, c_void};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::Interest;
use tokio::net::UdpSocket;
use tracing::debug;

use super::engine::{Datagram, EchoSocket, QueuedError};
use super::packet::Family;

/// A nonblocking ICMP socket, raw or datagram, that reports the TTL of each
/// received packet. Tokio's UDP socket only supplies readiness; every read
/// goes through `recvmsg`.
pub(crate) struct IcmpSocket {
    inner: UdpSocket,
    /// ICMP errors arrive on the socket error queue instead of as packets.
    error_queue: bool,
}

impl IcmpSocket {
    pub(crate) fn open(family: Family, raw: bool, ttl: Option<u8>) -> io::Result<Self> {
        let (domain, protocol) = match family {
            Family::V4 => (Domain::IPV4, Protocol::ICMPV4),
            Family::V6 => (Domain::IPV6, Protocol::ICMPV6),
        };
        let kind = if raw { Type::RAW } else { Type::DGRAM };

        let socket = Socket::new(domain, kind, Some(protocol))?;
        match family {
            Family::V4 => {
                set_int_option(&socket, libc::IPPROTO_IP, libc::IP_RECVTTL, 1)?;
                if let Some(ttl) = ttl {
                    set_int_option(&socket, libc::IPPROTO_IP, libc::IP_TTL, ttl as c_int)?;
                }
            }
            Family::V6 => {
                set_int_option(&socket, libc::IPPROTO_IPV6, libc::IPV6_RECVHOPLIMIT, 1)?;
                if let Some(ttl) = ttl {
                    set_int_option(&socket, libc::IPPROTO_IPV6, libc::IPV6_UNICAST_HOPS, ttl as c_int)?;
                }
            }
        }
        let error_queue = enable_error_queue(&socket, family, raw)?;

        debug!(
            "opened {} icmp socket ({:?})",
            if raw { "raw" } else { "datagram" },
            family
        );
        Self::register(socket, error_queue)
    }

    /// Hand the socket to the tokio reactor. The reactor takes ownership of
    /// the descriptor and closes it on drop.
    fn register(socket: Socket, error_queue: bool) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self {
            inner: UdpSocket::from_std(socket.into())?,
            error_queue,
        })
    }
}

#[async_trait]
impl EchoSocket for IcmpSocket {
    async fn send_to(&mut self, packet: &[u8], dest: IpAddr) -> io::Result<usize> {
        self.inner.send_to(packet, SocketAddr::new(dest, 0)).await
    }

    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<Datagram> {
        let fd = self.inner.as_raw_fd();
        let error_queue = self.error_queue;
        let interest = if error_queue {
            Interest::READABLE | Interest::ERROR
        } else {
            Interest::READABLE
        };
        self.inner
            .async_io(interest, || receive(fd, buf, error_queue))
            .await
    }
}

/// Drain the error queue before the regular one. A pending socket error
/// (EHOSTUNREACH and friends) stands for an ICMP error that was queued after
/// the first look.
fn receive(fd: RawFd, buf: &mut [u8], error_queue: bool) -> io::Result<Datagram> {
    if !error_queue {
        return recv_with_ttl(fd, buf);
    }
    match recv_queued_error(fd, buf) {
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        other => return other,
    }
    match recv_with_ttl(fd, buf) {
        Err(e) if e.kind() != io::ErrorKind::WouldBlock => recv_queued_error(fd, buf).or(Err(e)),
        other => other,
    }
}

#[cfg(target_os = "linux")]
fn enable_error_queue(socket: &Socket, family: Family, raw: bool) -> io::Result<bool> {
    // Raw sockets get ICMP errors as ordinary packets.
    if raw {
        return Ok(false);
    }
    match family {
        Family::V4 => set_int_option(socket, libc::IPPROTO_IP, libc::IP_RECVERR, 1)?,
        Family::V6 => set_int_option(socket, libc::IPPROTO_IPV6, libc::IPV6_RECVERR, 1)?,
    }
    Ok(true)
}

#[cfg(not(target_os = "linux"))]
fn enable_error_queue(_socket: &Socket, _family: Family, _raw: bool) -> io::Result<bool> {
    Ok(false)
}

/// Read one entry off the socket error queue. Entries that are not ICMP
/// errors come back empty so the caller skips them.
#[cfg(target_os = "linux")]
fn recv_queued_error(fd: RawFd, buf: &mut [u8]) -> io::Result<Datagram> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut c_void,
        iov_len: buf.len(),
    };
    let mut control = [0u64; 16];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut c_void;
    msg.msg_controllen = mem::size_of_val(&control) as _;

    let n = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_ERRQUEUE) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    match unsafe { icmp_error_from_control(&msg) } {
        Some((error, offender)) => {
            debug!("queued icmp error {:?} from {:?}", error, offender);
            Ok(Datagram {
                len: n as usize,
                ttl: None,
                from: offender,
                queued: Some(error),
            })
        }
        None => {
            debug!("skipping error queue entry without icmp origin");
            Ok(Datagram {
                len: 0,
                ttl: None,
                from: None,
                queued: None,
            })
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn recv_queued_error(_fd: RawFd, _buf: &mut [u8]) -> io::Result<Datagram> {
    Err(io::ErrorKind::WouldBlock.into())
}

/// Find the extended error of an error queue read. Only errors that an
/// ICMP message caused are returned, with the address of the node that
/// sent it.
#[cfg(target_os = "linux")]
unsafe fn icmp_error_from_control(msg: &libc::msghdr) -> Option<(QueuedError, Option<IpAddr>)> {
    let mut cmsg = libc::CMSG_FIRSTHDR(msg);
    while !cmsg.is_null() {
        let header = &*cmsg;
        let recverr = matches!(
            (header.cmsg_level, header.cmsg_type),
            (libc::IPPROTO_IP, libc::IP_RECVERR) | (libc::IPPROTO_IPV6, libc::IPV6_RECVERR)
        );
        if recverr {
            let ee = libc::CMSG_DATA(cmsg) as *const libc::sock_extended_err;
            let err = ptr::read_unaligned(ee);
            if err.ee_origin != libc::SO_EE_ORIGIN_ICMP && err.ee_origin != libc::SO_EE_ORIGIN_ICMP6 {
                return None;
            }
            let error = QueuedError {
                icmp_type: err.ee_type,
                code: err.ee_code,
            };
            return Some((error, ip_from_raw(libc::SO_EE_OFFENDER(ee))));
        }
        cmsg = libc::CMSG_NXTHDR(msg, cmsg);
    }
    None
}

fn set_int_option(socket: &Socket, level: c_int, name: c_int, value: c_int) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            &value as *const c_int as *const c_void,
            mem::size_of::<c_int>() as libc::socklen_t,
        )
    };
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn recv_with_ttl(fd: RawFd, buf: &mut [u8]) -> io::Result<Datagram> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut c_void,
        iov_len: buf.len(),
    };
    // u64 elements keep the control buffer aligned for cmsghdr.
    let mut control = [0u64; 16];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = &mut storage as *mut libc::sockaddr_storage as *mut c_void;
    msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut c_void;
    msg.msg_controllen = mem::size_of_val(&control) as _;

    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(Datagram {
        len: n as usize,
        ttl: unsafe { ttl_from_control(&msg) },
        from: ip_from_sockaddr(&storage),
        queued: None,
    })
}

/// Walk the control messages of a completed `recvmsg` looking for the TTL
/// or hop limit.
unsafe fn ttl_from_control(msg: &libc::msghdr) -> Option<u8> {
    let mut cmsg = libc::CMSG_FIRSTHDR(msg);
    while !cmsg.is_null() {
        let header = &*cmsg;
        let data = libc::CMSG_DATA(cmsg);
        let ttl = match header.cmsg_level {
            libc::IPPROTO_IP => v4_ttl(header.cmsg_type, data),
            libc::IPPROTO_IPV6 if header.cmsg_type == libc::IPV6_HOPLIMIT => {
                Some(ptr::read_unaligned(data as *const c_int) as u8)
            }
            _ => None,
        };
        if ttl.is_some() {
            return ttl;
        }
        cmsg = libc::CMSG_NXTHDR(msg, cmsg);
    }
    None
}

// Linux reports the TTL as an int under IP_TTL.
#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn v4_ttl(kind: c_int, data: *const c_uchar) -> Option<u8> {
    if kind == libc::IP_TTL {
        Some(ptr::read_unaligned(data as *const c_int) as u8)
    } else {
        None
    }
}

// Darwin reports a single byte under IP_RECVTTL.
#[cfg(any(target_os = "macos", target_os = "ios"))]
unsafe fn v4_ttl(kind: c_int, data: *const c_uchar) -> Option<u8> {
    if kind == libc::IP_RECVTTL {
        Some(*data)
    } else {
        None
    }
}

fn ip_from_sockaddr(storage: &libc::sockaddr_storage) -> Option<IpAddr> {
    unsafe { ip_from_raw(storage as *const libc::sockaddr_storage as *const libc::sockaddr) }
}

/// Read the address behind `addr`, which must be as large as its family
/// says. The pointer need not be aligned.
unsafe fn ip_from_raw(addr: *const libc::sockaddr) -> Option<IpAddr> {
    match ptr::read_unaligned(addr).sa_family as c_int {
        libc::AF_INET => {
            let sin = ptr::read_unaligned(addr as *const libc::sockaddr_in);
            Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr))))
        }
        libc::AF_INET6 => {
            let sin6 = ptr::read_unaligned(addr as *const libc::sockaddr_in6);
            Some(IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn udp_loopback() -> Socket {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).unwrap();
        socket.bind(&SocketAddr::from(([127, 0, 0, 1], 0)).into()).unwrap();
        socket
    }

    fn local_addr(socket: &Socket) -> SocketAddr {
        socket.local_addr().unwrap().as_socket().unwrap()
    }

    #[tokio::test]
    async fn registered_socket_reads_through_the_reactor() {
        let socket = udp_loopback();
        set_int_option(&socket, libc::IPPROTO_IP, libc::IP_RECVTTL, 1).unwrap();
        let local = local_addr(&socket);
        let mut socket = IcmpSocket::register(socket, false).unwrap();

        socket.inner.send_to(b"tracker!", local).await.unwrap();
        let mut buf = [0u8; 64];
        let datagram = tokio::time::timeout(Duration::from_secs(2), socket.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..datagram.len], b"tracker!");
        assert_eq!(datagram.from, Some(local.ip()));
        assert!(datagram.ttl.is_some());
        assert_eq!(datagram.queued, None);
    }

    /// A datagram to a closed loopback port draws an ICMP port unreachable,
    /// which the kernel queues with a copy of what was sent.
    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn port_unreachable_arrives_on_the_error_queue() {
        let closed = local_addr(&udp_loopback());
        let socket = udp_loopback();
        assert!(enable_error_queue(&socket, Family::V4, false).unwrap());
        let mut socket = IcmpSocket::register(socket, true).unwrap();

        socket.inner.send_to(b"tracker!", closed).await.unwrap();
        let mut buf = [0u8; 64];
        let datagram = tokio::time::timeout(Duration::from_secs(2), socket.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            datagram.queued,
            Some(QueuedError {
                icmp_type: 3,
                code: 3
            })
        );
        assert_eq!(datagram.from, Some(closed.ip()));
        assert_eq!(&buf[..datagram.len], b"tracker!");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn raw_sockets_skip_the_error_queue() {
        let socket = udp_loopback();
        assert!(!enable_error_queue(&socket, Family::V4, true).unwrap());
    }

    #[test]
    fn reads_sockaddr_families() {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let sin = unsafe { &mut *(&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in) };
        sin.sin_family = libc::AF_INET as libc::sa_family_t;
        sin.sin_addr.s_addr = u32::from(Ipv4Addr::new(127, 0, 0, 1)).to_be();
        assert_eq!(ip_from_sockaddr(&storage), Some("127.0.0.1".parse().unwrap()));

        let empty: libc::sockaddr_storage = unsafe { mem::zeroed() };
        assert_eq!(ip_from_sockaddr(&empty), None);
    }

    /// Lay out an IP_RECVERR control message the way the kernel does: the
    /// extended error followed by the offender's address.
    #[cfg(target_os = "linux")]
    fn recverr_control(control: &mut [u64; 16], origin: u8, icmp_type: u8, code: u8) -> libc::msghdr {
        let data_len = (mem::size_of::<libc::sock_extended_err>() + mem::size_of::<libc::sockaddr_in>()) as u32;
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_control = control.as_mut_ptr() as *mut c_void;
        unsafe {
            msg.msg_controllen = libc::CMSG_SPACE(data_len) as _;
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::IPPROTO_IP;
            (*cmsg).cmsg_type = libc::IP_RECVERR;
            (*cmsg).cmsg_len = libc::CMSG_LEN(data_len) as _;

            let ee = libc::CMSG_DATA(cmsg) as *mut libc::sock_extended_err;
            let mut err: libc::sock_extended_err = mem::zeroed();
            err.ee_errno = libc::EHOSTUNREACH as u32;
            err.ee_origin = origin;
            err.ee_type = icmp_type;
            err.ee_code = code;
            ptr::write_unaligned(ee, err);

            let mut sin: libc::sockaddr_in = mem::zeroed();
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_addr.s_addr = u32::from(Ipv4Addr::new(198, 51, 100, 1)).to_be();
            ptr::write_unaligned(libc::SO_EE_OFFENDER(ee) as *mut libc::sockaddr_in, sin);
        }
        msg
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn reads_icmp_errors_from_error_queue_control() {
        let mut control = [0u64; 16];
        let msg = recverr_control(&mut control, libc::SO_EE_ORIGIN_ICMP, 11, 0);
        let (error, offender) = unsafe { icmp_error_from_control(&msg) }.unwrap();
        assert_eq!(error, QueuedError { icmp_type: 11, code: 0 });
        assert_eq!(offender, Some("198.51.100.1".parse().unwrap()));

        let mut control = [0u64; 16];
        let msg = recverr_control(&mut control, libc::SO_EE_ORIGIN_ICMP6, 1, 4);
        let (error, _) = unsafe { icmp_error_from_control(&msg) }.unwrap();
        assert_eq!(error, QueuedError { icmp_type: 1, code: 4 });

        // Locally raised errors (EMSGSIZE and the like) carry no ICMP message.
        let mut control = [0u64; 16];
        let msg = recverr_control(&mut control, libc::SO_EE_ORIGIN_LOCAL, 0, 0);
        assert_eq!(unsafe { icmp_error_from_control(&msg) }, None);

        let empty: libc::msghdr = unsafe { mem::zeroed() };
        assert_eq!(unsafe { icmp_error_from_control(&empty) }, None);
    }
}
