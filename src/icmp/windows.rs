//! Echo through the iphlpapi helpers, which need no elevated privileges.

use std::ffi::c_void;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ptr;
use std::time::Duration;

use tracing::warn;

use super::engine::{interpret, HelperReply};
use super::packet::EchoRequest;
use crate::error::PingError;
use crate::probe::PingResult;

#[allow(non_snake_case, non_camel_case_types, clippy::upper_case_acronyms)]
mod ffi {
    use std::ffi::c_void;

    pub type HANDLE = *mut c_void;
    pub type IPAddr = u32; // network byte order

    pub const INVALID_HANDLE_VALUE: HANDLE = -1isize as HANDLE;
    pub const AF_INET6: u16 = 23;

    #[repr(C)]
    pub struct IP_OPTION_INFORMATION {
        pub ttl: u8,
        pub tos: u8,
        pub flags: u8,
        pub options_size: u8,
        pub options_data: *mut u8,
    }

    #[repr(C)]
    pub struct ICMP_ECHO_REPLY {
        pub address: IPAddr,
        pub status: u32,
        pub round_trip_time: u32,
        pub data_size: u16,
        pub reserved: u16,
        pub data: *mut c_void,
        pub options: IP_OPTION_INFORMATION,
    }

    #[repr(C)]
    pub struct SOCKADDR_IN6 {
        pub sin6_family: u16,
        pub sin6_port: u16,
        pub sin6_flowinfo: u32,
        pub sin6_addr: [u8; 16],
        pub sin6_scope_id: u32,
    }

    #[repr(C, packed(1))]
    #[derive(Clone, Copy)]
    pub struct IPV6_ADDRESS_EX {
        pub sin6_port: u16,
        pub sin6_flowinfo: u32,
        pub sin6_addr: [u16; 8],
        pub sin6_scope_id: u32,
    }

    #[repr(C)]
    pub struct ICMPV6_ECHO_REPLY {
        pub address: IPV6_ADDRESS_EX,
        pub status: u32,
        pub round_trip_time: u32,
    }

    #[link(name = "iphlpapi")]
    extern "system" {
        pub fn IcmpCreateFile() -> HANDLE;
        pub fn Icmp6CreateFile() -> HANDLE;
        pub fn IcmpCloseHandle(handle: HANDLE) -> i32;
        pub fn IcmpSendEcho2(
            icmp_handle: HANDLE,
            event: HANDLE,
            apc_routine: *mut c_void,
            apc_context: *mut c_void,
            destination_address: IPAddr,
            request_data: *const c_void,
            request_size: u16,
            request_options: *mut IP_OPTION_INFORMATION,
            reply_buffer: *mut c_void,
            reply_size: u32,
            timeout: u32,
        ) -> u32;
        pub fn Icmp6SendEcho2(
            icmp_handle: HANDLE,
            event: HANDLE,
            apc_routine: *mut c_void,
            apc_context: *mut c_void,
            source_address: *const SOCKADDR_IN6,
            destination_address: *const SOCKADDR_IN6,
            request_data: *const c_void,
            request_size: u16,
            request_options: *mut IP_OPTION_INFORMATION,
            reply_buffer: *mut c_void,
            reply_size: u32,
            timeout: u32,
        ) -> u32;
    }

    #[link(name = "kernel32")]
    extern "system" {
        pub fn GetLastError() -> u32;
    }
}

/// Closes the ICMP handle on drop.
struct Handle(ffi::HANDLE);

impl Handle {
    fn open(v6: bool) -> io::Result<Self> {
        let handle = unsafe {
            if v6 {
                ffi::Icmp6CreateFile()
            } else {
                ffi::IcmpCreateFile()
            }
        };
        if handle.is_null() || handle == ffi::INVALID_HANDLE_VALUE {
            return Err(io::Error::last_os_error());
        }
        Ok(Self(handle))
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        unsafe {
            ffi::IcmpCloseHandle(self.0);
        }
    }
}

/// Run one echo through the system helper. The blocking call runs on the
/// blocking pool and is bounded by its own `timeout`.
pub(crate) async fn echo(
    dest: IpAddr,
    request: EchoRequest,
    ttl: Option<u8>,
    timeout: Duration,
) -> PingResult {
    let joined = tokio::task::spawn_blocking(move || {
        let reply = match dest {
            IpAddr::V4(addr) => echo_v4(addr, &request, ttl, timeout),
            IpAddr::V6(addr) => echo_v6(addr, &request, ttl, timeout),
        }?;
        interpret(reply, &request)
    })
    .await;

    joined.unwrap_or_else(|e| Err(PingError::Transport(format!("icmp helper task failed: {}", e))))
}

fn options(ttl: Option<u8>) -> ffi::IP_OPTION_INFORMATION {
    ffi::IP_OPTION_INFORMATION {
        ttl: ttl.unwrap_or(128),
        tos: 0,
        flags: 0,
        options_size: 0,
        options_data: ptr::null_mut(),
    }
}

fn timeout_ms(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX).max(1)
}

/// u64 backing keeps the reply records aligned.
fn reply_buffer(payload_len: usize) -> Vec<u64> {
    vec![0u64; (payload_len + 512) / 8]
}

/// A zero reply count carries the failure in the last error, which is an
/// IP_STATUS code for timeouts and ICMP errors.
fn failed(dest: IpAddr) -> HelperReply {
    let status = unsafe { ffi::GetLastError() };
    warn!("icmp helper for {} returned no reply (status {})", dest, status);
    HelperReply {
        status,
        address: dest,
        rtt: Duration::ZERO,
        ttl: None,
        data: Vec::new(),
    }
}

/// The helper takes the request length as a u16.
fn request_len(request: &EchoRequest) -> Result<u16, PingError> {
    let len = request.payload.len();
    u16::try_from(len).map_err(|_| PingError::protocol(format!("payload of {} bytes is too large", len)))
}

fn echo_v4(
    dest: Ipv4Addr,
    request: &EchoRequest,
    ttl: Option<u8>,
    timeout: Duration,
) -> Result<HelperReply, PingError> {
    let request_len = request_len(request)?;
    let handle = Handle::open(false)?;
    let mut options = options(ttl);
    let mut buffer = reply_buffer(request.payload.len());
    let buffer_len = (buffer.len() * 8) as u32;

    let count = unsafe {
        ffi::IcmpSendEcho2(
            handle.0,
            ptr::null_mut(),
            ptr::null_mut(),
            ptr::null_mut(),
            u32::from_ne_bytes(dest.octets()),
            request.payload.as_ptr() as *const c_void,
            request_len,
            &mut options,
            buffer.as_mut_ptr() as *mut c_void,
            buffer_len,
            timeout_ms(timeout),
        )
    };
    if count == 0 {
        return Ok(failed(IpAddr::V4(dest)));
    }

    let reply = unsafe { &*(buffer.as_ptr() as *const ffi::ICMP_ECHO_REPLY) };
    let data = if reply.data.is_null() {
        Vec::new()
    } else {
        unsafe { std::slice::from_raw_parts(reply.data as *const u8, reply.data_size as usize) }
            .to_vec()
    };
    Ok(HelperReply {
        status: reply.status,
        address: IpAddr::V4(Ipv4Addr::from(reply.address.to_ne_bytes())),
        rtt: Duration::from_millis(reply.round_trip_time as u64),
        ttl: Some(reply.options.ttl),
        data,
    })
}

fn echo_v6(
    dest: Ipv6Addr,
    request: &EchoRequest,
    ttl: Option<u8>,
    timeout: Duration,
) -> Result<HelperReply, PingError> {
    let request_len = request_len(request)?;
    let handle = Handle::open(true)?;
    let mut options = options(ttl);
    let mut buffer = reply_buffer(request.payload.len());
    let buffer_len = (buffer.len() * 8) as u32;

    let source = ffi::SOCKADDR_IN6 {
        sin6_family: ffi::AF_INET6,
        sin6_port: 0,
        sin6_flowinfo: 0,
        sin6_addr: [0; 16],
        sin6_scope_id: 0,
    };
    let destination = ffi::SOCKADDR_IN6 {
        sin6_addr: dest.octets(),
        ..source
    };

    let count = unsafe {
        ffi::Icmp6SendEcho2(
            handle.0,
            ptr::null_mut(),
            ptr::null_mut(),
            ptr::null_mut(),
            &source,
            &destination,
            request.payload.as_ptr() as *const c_void,
            request_len,
            &mut options,
            buffer.as_mut_ptr() as *mut c_void,
            buffer_len,
            timeout_ms(timeout),
        )
    };
    if count == 0 {
        return Ok(failed(IpAddr::V6(dest)));
    }

    let reply = unsafe { ptr::read_unaligned(buffer.as_ptr() as *const ffi::ICMPV6_ECHO_REPLY) };
    let words = reply.address.sin6_addr;
    let mut octets = [0u8; 16];
    for (chunk, word) in octets.chunks_mut(2).zip(words.iter()) {
        chunk.copy_from_slice(&word.to_ne_bytes());
    }
    // The v6 record has neither the TTL nor the echoed data.
    Ok(HelperReply {
        status: reply.status,
        address: IpAddr::V6(Ipv6Addr::from(octets)),
        rtt: Duration::from_millis(reply.round_trip_time as u64),
        ttl: None,
        data: Vec::new(),
    })
}
