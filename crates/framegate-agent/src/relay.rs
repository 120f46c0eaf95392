//! UDP relay hosting the admission filter.
//!
//! Datagrams received on the listen socket are classified as RTP payloads
//! of the target flow, checked against the shared admission state and,
//! when passed, forwarded unchanged to the downstream address.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{bail, Context};
use framegate_core::classify::{FlowMatch, PacketClassifier, RtpPayloadClassifier};
use framegate_core::filter::{AdmissionFilter, Verdict};
use framegate_core::state::AdmissionState;
use tracing::{debug, warn};

/// Largest datagram the relay accepts.
const MAX_DATAGRAM: usize = 65_536;
const READ_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub received: u64,
    pub forwarded: u64,
    pub dropped: u64,
    pub send_errors: u64,
}

pub struct Relay {
    socket: UdpSocket,
    forward: SocketAddr,
    classifier: RtpPayloadClassifier,
}

impl Relay {
    pub fn bind(listen: SocketAddr, forward: SocketAddr, flow: &FlowMatch) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(listen)
            .with_context(|| format!("Failed to bind relay socket on {listen}"))?;
        Self::from_socket(socket, forward, flow)
    }

    /// Wraps an already bound socket. Datagrams reaching it are treated as
    /// addressed to its local address; when that is a wildcard, the flow's
    /// own destination address stands in.
    ///
    /// Fails when the flow does not select the socket's local address, since
    /// every datagram would then be relayed without admission.
    pub fn from_socket(
        socket: UdpSocket,
        forward: SocketAddr,
        flow: &FlowMatch,
    ) -> anyhow::Result<Self> {
        socket
            .set_read_timeout(Some(READ_TIMEOUT))
            .context("Failed to set relay read timeout")?;
        let local = socket
            .local_addr()
            .context("Relay socket has no local address")?;
        let local_ip = match local.ip() {
            IpAddr::V4(ip) if !ip.is_unspecified() => ip,
            _ => flow.dst_addr.unwrap_or(Ipv4Addr::UNSPECIFIED),
        };
        let classifier = RtpPayloadClassifier::new(*flow, local_ip, local.port());
        if !classifier.flow_selected() {
            let dst = match flow.dst_addr {
                Some(ip) => ip.to_string(),
                None => "*".to_string(),
            };
            bail!(
                "relay listens on {local} but the admission flow is {:?} {dst}:{}; \
                 its traffic would bypass admission",
                flow.protocol,
                flow.dst_port
            );
        }
        Ok(Self {
            socket,
            forward,
            classifier,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Relays until `running` is cleared. Checks the flag at least once per
    /// read timeout.
    pub fn run<S>(&self, filter: &AdmissionFilter<S>, running: &AtomicBool) -> RelayStats
    where
        S: AdmissionState + ?Sized,
    {
        let mut stats = RelayStats::default();
        let mut buf = vec![0u8; MAX_DATAGRAM];

        while running.load(Ordering::Relaxed) {
            let len = match self.socket.recv_from(&mut buf) {
                Ok((len, _)) => len,
                Err(ref e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "relay receive failed");
                    continue;
                }
            };
            stats.received += 1;
            let datagram = &buf[..len];

            match filter.decide(&self.classifier.classify(datagram)) {
                Verdict::Pass => match self.socket.send_to(datagram, self.forward) {
                    Ok(_) => stats.forwarded += 1,
                    Err(e) => {
                        stats.send_errors += 1;
                        debug!(error = %e, forward = %self.forward, "relay send failed");
                    }
                },
                Verdict::Drop => stats.dropped += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framegate_core::classify::{frame, Protocol};
    use framegate_core::state::SharedAdmissionState;
    use std::sync::Arc;
    use std::thread;

    fn rtp(marker: bool, payload: usize) -> Vec<u8> {
        let mut datagram = frame::rtp_header(marker).to_vec();
        datagram.resize(datagram.len() + payload, 0xAB);
        datagram
    }

    struct Harness {
        relay_addr: SocketAddr,
        sink: UdpSocket,
        running: Arc<AtomicBool>,
        handle: thread::JoinHandle<RelayStats>,
    }

    fn start(state: Arc<SharedAdmissionState>) -> Harness {
        let sink = UdpSocket::bind("127.0.0.1:0").unwrap();
        sink.set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let relay_addr = socket.local_addr().unwrap();
        let flow = FlowMatch {
            protocol: Protocol::Udp,
            dst_addr: Some(Ipv4Addr::LOCALHOST),
            dst_port: relay_addr.port(),
        };
        let relay = Relay::from_socket(socket, sink.local_addr().unwrap(), &flow).unwrap();
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = thread::spawn(move || {
            let filter = AdmissionFilter::new(state);
            relay.run(&filter, &flag)
        });
        Harness {
            relay_addr,
            sink,
            running,
            handle,
        }
    }

    impl Harness {
        fn send(&self, datagram: &[u8]) {
            let client = UdpSocket::bind("127.0.0.1:0").unwrap();
            client.send_to(datagram, self.relay_addr).unwrap();
        }

        fn receive(&self) -> Option<Vec<u8>> {
            let mut buf = [0u8; 2048];
            self.sink.recv(&mut buf).ok().map(|n| buf[..n].to_vec())
        }

        fn stop(self) -> RelayStats {
            self.running.store(false, Ordering::Relaxed);
            self.handle.join().unwrap()
        }
    }

    #[test]
    fn forwards_within_budget() {
        let h = start(Arc::new(SharedAdmissionState::new(1_000_000)));
        let datagram = rtp(true, 100);
        h.send(&datagram);
        assert_eq!(h.receive(), Some(datagram));
        let stats = h.stop();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.forwarded, 1);
    }

    #[test]
    fn drops_while_frame_is_discarded() {
        let state = Arc::new(SharedAdmissionState::new(0));
        state.set_drop_in_progress(true);
        let h = start(state.clone());

        h.send(&rtp(false, 100));
        assert_eq!(h.receive(), None);

        // Too short for RTP: not the video flow, relayed regardless.
        h.send(&[1, 2, 3]);
        assert_eq!(h.receive(), Some(vec![1, 2, 3]));

        let stats = h.stop();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.forwarded, 1);
        assert_eq!(state.window_bytes(), 0);
    }

    #[test]
    fn charges_wire_size_to_the_window() {
        let state = Arc::new(SharedAdmissionState::new(1_000_000));
        let h = start(state.clone());
        h.send(&rtp(false, 88));
        assert!(h.receive().is_some());
        h.stop();
        // 12-byte RTP header + 88 payload + 42 bytes of Ethernet/IPv4/UDP.
        assert_eq!(state.window_bytes(), 142);
    }

    fn flow(dst_addr: Option<Ipv4Addr>, dst_port: u16) -> FlowMatch {
        FlowMatch {
            protocol: Protocol::Udp,
            dst_addr,
            dst_port,
        }
    }

    fn wrap(socket: UdpSocket, flow: &FlowMatch) -> anyhow::Result<Relay> {
        Relay::from_socket(socket, "127.0.0.1:9".parse().unwrap(), flow)
    }

    fn bound_port(socket: &UdpSocket) -> u16 {
        socket.local_addr().unwrap().port()
    }

    #[test]
    fn rejects_listen_port_outside_flow() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let Err(err) = wrap(socket, &flow(None, 54343)) else {
            panic!("relay accepted a port the flow does not select");
        };
        let msg = format!("{err:#}");
        assert!(msg.contains("54343"), "{msg}");
        assert!(msg.contains("bypass admission"), "{msg}");
    }

    #[test]
    fn rejects_bound_address_outside_flow() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let flow = flow(Some(Ipv4Addr::new(10, 0, 0, 1)), bound_port(&socket));
        assert!(wrap(socket, &flow).is_err());
    }

    #[test]
    fn rejects_tcp_flow() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let flow = FlowMatch {
            protocol: Protocol::Tcp,
            dst_addr: None,
            dst_port: bound_port(&socket),
        };
        assert!(wrap(socket, &flow).is_err());
    }

    #[test]
    fn wildcard_listen_takes_flow_address() {
        let socket = UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = bound_port(&socket);
        let flow = flow(Some(Ipv4Addr::new(192, 168, 21, 104)), port);
        let relay = wrap(socket, &flow).unwrap();
        assert_eq!(relay.local_addr().unwrap().port(), port);
    }
}
