use std::io;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::packet::{parse, queued_error, unreachable_reason, Echo, EchoRequest, Message, TRACKER_LEN};
use crate::error::PingError;
use crate::probe::{Detail, PingResult, Reply};

const RECV_BUFFER_LEN: usize = 2048;

/// One packet read from an ICMP socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Datagram {
    pub len: usize,
    /// TTL or hop limit from the control data, when the kernel reported one.
    pub ttl: Option<u8>,
    pub from: Option<IpAddr>,
    /// Set when the packet came off the socket error queue. The buffer then
    /// holds our own request and `from` is the router that rejected it.
    pub queued: Option<QueuedError>,
}

/// Type and code of an ICMP error the kernel matched to the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueuedError {
    pub icmp_type: u8,
    pub code: u8,
}

/// The send and receive primitives the echo exchange needs.
#[async_trait]
pub(crate) trait EchoSocket: Send {
    async fn send_to(&mut self, packet: &[u8], dest: IpAddr) -> io::Result<usize>;
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<Datagram>;
}

/// How a received message relates to the outstanding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Reply,
    Unreachable(u8),
    TimeExceeded,
    Irrelevant,
}

/// Echoed bytes must be at least a tracker long and agree with what was sent
/// over their common prefix.
fn payload_matches(received: &[u8], sent: &[u8]) -> bool {
    let common = received.len().min(sent.len());
    received.len() >= TRACKER_LEN && received[..common] == sent[..common]
}

fn quotes_request(echo: &Echo<'_>, request: &EchoRequest, check_ident: bool) -> bool {
    if check_ident && echo.ident != request.ident {
        return false;
    }
    if echo.payload.len() >= TRACKER_LEN {
        payload_matches(echo.payload, &request.payload)
    } else {
        // Only the echo header was quoted.
        check_ident && echo.sequence == request.sequence
    }
}

/// Decide whether `msg` answers `request`. `check_ident` is set when the
/// identifier is ours to pick, i.e. on raw sockets.
pub(crate) fn correlate(msg: &Message<'_>, request: &EchoRequest, check_ident: bool) -> Verdict {
    match msg {
        Message::EchoReply(echo) => {
            if check_ident && echo.ident != request.ident {
                Verdict::Irrelevant
            } else if payload_matches(echo.payload, &request.payload) {
                Verdict::Reply
            } else {
                Verdict::Irrelevant
            }
        }
        Message::DestinationUnreachable {
            code,
            invoking: Some(echo),
        } if quotes_request(echo, request, check_ident) => Verdict::Unreachable(*code),
        Message::TimeExceeded {
            invoking: Some(echo),
            ..
        } if quotes_request(echo, request, check_ident) => Verdict::TimeExceeded,
        _ => Verdict::Irrelevant,
    }
}

#[cfg(unix)]
fn is_no_buffer_space(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENOBUFS)
}

#[cfg(not(unix))]
fn is_no_buffer_space(_err: &io::Error) -> bool {
    false
}

async fn send<S: EchoSocket + ?Sized>(socket: &mut S, packet: &[u8], dest: IpAddr) -> io::Result<usize> {
    match socket.send_to(packet, dest).await {
        Err(e) if is_no_buffer_space(&e) => {
            warn!("send to {} hit ENOBUFS, retrying once", dest);
            socket.send_to(packet, dest).await
        }
        other => other,
    }
}

/// Send `request` to `dest` and wait until a correlated answer arrives or
/// `timeout` elapses.
pub(crate) async fn exchange<S: EchoSocket + ?Sized>(
    socket: &mut S,
    dest: IpAddr,
    request: &EchoRequest,
    check_ident: bool,
    timeout: Duration,
) -> PingResult {
    let deadline = Instant::now() + timeout;
    let packet = request.to_bytes();
    let mut buf = vec![0u8; RECV_BUFFER_LEN.max(packet.len() + 128)];

    let sent_at = Instant::now();
    send(socket, &packet, dest).await?;
    debug!("sent echo request to {} ({} bytes)", dest, packet.len());

    loop {
        let datagram = match tokio::time::timeout_at(deadline, socket.recv(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => return Err(PingError::Timeout),
        };
        let received_at = Instant::now();
        let from = datagram.from.unwrap_or(dest);

        let data = &buf[..datagram.len];
        let (msg, ident_checked) = match datagram.queued {
            // The kernel picked the identifier on send and routed the error here by it.
            Some(queued) => (
                queued_error(queued.icmp_type, queued.code, data, request.family)
                    .map(|msg| msg.with_ident(request.ident)),
                true,
            ),
            None => (parse(data, request.family), check_ident),
        };
        let Some(msg) = msg else {
            continue;
        };
        match correlate(&msg, request, ident_checked) {
            Verdict::Reply => {
                return Ok(Reply::new(
                    from,
                    received_at - sent_at,
                    Detail::Icmp { ttl: datagram.ttl },
                ))
            }
            Verdict::Unreachable(code) => {
                return Err(PingError::DestinationUnreachable {
                    from,
                    reason: unreachable_reason(request.family, code),
                })
            }
            Verdict::TimeExceeded => return Err(PingError::TimeExceeded { from }),
            Verdict::Irrelevant => debug!("ignoring unrelated icmp packet from {}", from),
        }
    }
}

/// IP_STATUS values reported by the Windows ICMP helper.
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) mod status {
    pub const SUCCESS: u32 = 0;
    pub const DEST_NET_UNREACHABLE: u32 = 11002;
    pub const DEST_HOST_UNREACHABLE: u32 = 11003;
    pub const DEST_PROT_UNREACHABLE: u32 = 11004;
    pub const DEST_PORT_UNREACHABLE: u32 = 11005;
    pub const REQ_TIMED_OUT: u32 = 11010;
    pub const TTL_EXPIRED_TRANSIT: u32 = 11013;
    pub const TTL_EXPIRED_REASSEM: u32 = 11014;
}

/// A reply record from the system echo helper, already copied out of the
/// OS buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) struct HelperReply {
    pub status: u32,
    pub address: IpAddr,
    pub rtt: Duration,
    pub ttl: Option<u8>,
    pub data: Vec<u8>,
}

/// Map a helper reply onto a round result.
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) fn interpret(reply: HelperReply, request: &EchoRequest) -> PingResult {
    let from = reply.address;
    match reply.status {
        status::SUCCESS => {
            // The v6 helper does not echo data back, so only check what came back.
            if !reply.data.is_empty() && !payload_matches(&reply.data, &request.payload) {
                return Err(PingError::protocol("echo reply payload does not match request"));
            }
            Ok(Reply::new(from, reply.rtt, Detail::Icmp { ttl: reply.ttl }))
        }
        status::DEST_NET_UNREACHABLE => unreachable(from, "network unreachable"),
        status::DEST_HOST_UNREACHABLE => unreachable(from, "host unreachable"),
        status::DEST_PROT_UNREACHABLE => unreachable(from, "protocol unreachable"),
        status::DEST_PORT_UNREACHABLE => unreachable(from, "port unreachable"),
        status::TTL_EXPIRED_TRANSIT | status::TTL_EXPIRED_REASSEM => {
            Err(PingError::TimeExceeded { from })
        }
        status::REQ_TIMED_OUT => Err(PingError::Timeout),
        other => Err(PingError::protocol(format!("icmp helper returned status {}", other))),
    }
}

#[cfg_attr(not(windows), allow(dead_code))]
fn unreachable(from: IpAddr, reason: &'static str) -> PingResult {
    Err(PingError::DestinationUnreachable { from, reason })
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::error::ErrorKind;
    use crate::icmp::packet::Family;
    use crate::icmp::packet::tests::{reply_to, v4_error_quoting};
    use crate::icmp::packet::{ICMP_DEST_UNREACHABLE, ICMP_TIME_EXCEEDED};

    /// Replays canned packets, then stays silent.
    struct ScriptedSocket {
        inbox: VecDeque<Vec<u8>>,
        queued: VecDeque<(QueuedError, Vec<u8>)>,
        sent: Vec<Vec<u8>>,
        send_errors: VecDeque<io::Error>,
        ttl: Option<u8>,
    }

    impl ScriptedSocket {
        fn new(inbox: Vec<Vec<u8>>) -> Self {
            Self {
                inbox: inbox.into(),
                queued: VecDeque::new(),
                sent: Vec::new(),
                send_errors: VecDeque::new(),
                ttl: Some(57),
            }
        }
    }

    #[async_trait]
    impl EchoSocket for ScriptedSocket {
        async fn send_to(&mut self, packet: &[u8], _dest: IpAddr) -> io::Result<usize> {
            if let Some(err) = self.send_errors.pop_front() {
                return Err(err);
            }
            self.sent.push(packet.to_vec());
            Ok(packet.len())
        }

        async fn recv(&mut self, buf: &mut [u8]) -> io::Result<Datagram> {
            if let Some((error, quoted)) = self.queued.pop_front() {
                buf[..quoted.len()].copy_from_slice(&quoted);
                return Ok(Datagram {
                    len: quoted.len(),
                    ttl: None,
                    from: Some("198.51.100.1".parse().unwrap()),
                    queued: Some(error),
                });
            }
            match self.inbox.pop_front() {
                Some(packet) => {
                    buf[..packet.len()].copy_from_slice(&packet);
                    Ok(Datagram {
                        len: packet.len(),
                        ttl: self.ttl,
                        from: Some("192.0.2.9".parse().unwrap()),
                        queued: None,
                    })
                }
                None => std::future::pending().await,
            }
        }
    }

    fn request(ident: u16, fill: u8) -> EchoRequest {
        EchoRequest::with_payload(Family::V4, ident, 0, vec![fill; 16])
    }

    fn dest() -> IpAddr {
        "192.0.2.9".parse().unwrap()
    }

    #[tokio::test]
    async fn reply_reports_sender_and_ttl() {
        let req = request(7, 1);
        let mut socket = ScriptedSocket::new(vec![reply_to(&req)]);
        let reply = exchange(&mut socket, dest(), &req, true, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.peer, dest());
        assert_eq!(reply.detail, Detail::Icmp { ttl: Some(57) });
        assert_eq!(socket.sent, vec![req.to_bytes()]);
    }

    #[tokio::test]
    async fn late_reply_from_earlier_round_is_not_attributed() {
        let earlier = request(7, 1);
        let current = request(7, 2);
        let mut socket = ScriptedSocket::new(vec![reply_to(&earlier), reply_to(&current)]);
        let reply = exchange(&mut socket, dest(), &current, false, Duration::from_secs(1)).await;
        assert!(reply.is_ok());
        assert!(socket.inbox.is_empty());
    }

    #[tokio::test]
    async fn mismatched_replies_until_deadline_time_out() {
        let current = request(7, 2);
        let mut socket = ScriptedSocket::new(vec![reply_to(&request(7, 1)), reply_to(&request(8, 2))]);
        let err = exchange(&mut socket, dest(), &current, true, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, PingError::Timeout));
    }

    #[tokio::test]
    async fn correlated_errors_end_the_round() {
        let req = request(7, 3);
        let mut socket = ScriptedSocket::new(vec![v4_error_quoting(ICMP_DEST_UNREACHABLE, 1, &req)]);
        let err = exchange(&mut socket, dest(), &req, true, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Diagnostic);
        assert!(err.to_string().contains("host unreachable"));

        let mut socket = ScriptedSocket::new(vec![
            v4_error_quoting(ICMP_TIME_EXCEEDED, 0, &request(7, 4)),
            v4_error_quoting(ICMP_TIME_EXCEEDED, 0, &req),
        ]);
        let err = exchange(&mut socket, dest(), &req, true, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, PingError::TimeExceeded { .. }));
    }

    #[tokio::test]
    async fn queued_errors_end_the_round_in_datagram_mode() {
        let req = request(7, 8);
        let unreachable = QueuedError {
            icmp_type: ICMP_DEST_UNREACHABLE,
            code: 3,
        };
        // The kernel rewrote the identifier; a stale payload is still not ours.
        let stale = request(4242, 1);
        let mut current = req.clone();
        current.ident = 4242;

        let mut socket = ScriptedSocket::new(vec![]);
        socket.queued.push_back((unreachable, stale.to_bytes()));
        socket.queued.push_back((unreachable, current.to_bytes()));
        let err = exchange(&mut socket, dest(), &req, false, Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            PingError::DestinationUnreachable { from, reason } => {
                assert_eq!(from, "198.51.100.1".parse::<IpAddr>().unwrap());
                assert_eq!(reason, "port unreachable");
            }
            other => panic!("unexpected {:?}", other),
        }

        // A router that quotes only the echo header matches on sequence.
        let header = EchoRequest::with_payload(Family::V4, 4242, req.sequence, Vec::new()).to_bytes();
        let mut socket = ScriptedSocket::new(vec![]);
        socket.queued.push_back((
            QueuedError {
                icmp_type: ICMP_TIME_EXCEEDED,
                code: 0,
            },
            header,
        ));
        let err = exchange(&mut socket, dest(), &req, false, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Diagnostic);
        assert!(matches!(err, PingError::TimeExceeded { .. }));
    }

    #[test]
    fn header_only_quote_matches_on_ident_in_raw_mode() {
        let req = request(7, 5);
        let quoted = Echo {
            ident: 7,
            sequence: 0,
            payload: &[],
        };
        let msg = Message::TimeExceeded {
            code: 0,
            invoking: Some(quoted),
        };
        assert_eq!(correlate(&msg, &req, true), Verdict::TimeExceeded);
        assert_eq!(correlate(&msg, &req, false), Verdict::Irrelevant);
    }

    #[test]
    fn short_echo_payload_is_irrelevant() {
        let req = request(7, 5);
        let msg = Message::EchoReply(Echo {
            ident: 7,
            sequence: 0,
            payload: &[5; 4],
        });
        assert_eq!(correlate(&msg, &req, false), Verdict::Irrelevant);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn retries_once_on_enobufs() {
        let req = request(7, 6);
        let mut socket = ScriptedSocket::new(vec![reply_to(&req)]);
        socket.send_errors.push_back(io::Error::from_raw_os_error(libc::ENOBUFS));
        assert!(exchange(&mut socket, dest(), &req, true, Duration::from_secs(1)).await.is_ok());

        let mut socket = ScriptedSocket::new(vec![]);
        socket.send_errors.push_back(io::Error::from_raw_os_error(libc::ENOBUFS));
        socket.send_errors.push_back(io::Error::from_raw_os_error(libc::ENOBUFS));
        let err = exchange(&mut socket, dest(), &req, true, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[test]
    fn helper_statuses() {
        let req = request(1, 9);
        let reply = |code| HelperReply {
            status: code,
            address: dest(),
            rtt: Duration::from_millis(12),
            ttl: Some(118),
            data: req.payload.clone(),
        };

        let ok = interpret(reply(status::SUCCESS), &req).unwrap();
        assert_eq!(ok.millis(), 12);
        assert_eq!(ok.detail, Detail::Icmp { ttl: Some(118) });

        for code in 11002..=11005 {
            assert_eq!(interpret(reply(code), &req).unwrap_err().kind(), ErrorKind::Diagnostic);
        }
        assert!(matches!(
            interpret(reply(status::TTL_EXPIRED_TRANSIT), &req),
            Err(PingError::TimeExceeded { .. })
        ));
        assert!(matches!(interpret(reply(status::REQ_TIMED_OUT), &req), Err(PingError::Timeout)));
        let err = interpret(reply(11050), &req).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.to_string().contains("11050"));

        let mut garbled = reply(status::SUCCESS);
        garbled.data = vec![0; 16];
        assert!(interpret(garbled, &req).is_err());
    }
}
