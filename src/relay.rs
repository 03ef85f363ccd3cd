use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::dedup::DedupCache;
use crate::packet::{self, MagicPacket};

/// How long a receive worker blocks in recv_from before rechecking the
/// running flag. Bounds shutdown latency for the receive side.
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Max UDP packet size
const MAX_DATAGRAM_SIZE: usize = 65536;

const SOCKET_BUFFER_SIZE: usize = 1024 * 1024;

/// Queue depth above which enqueueing logs a warning.
const QUEUE_WARN_DEPTH: usize = 10_000;

/// Relay configuration, supplied by the CLI and consumed by the pipeline.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Inbound UDP port, bound on all interfaces.
    pub listen_port: u16,
    /// Broadcast address of the destination subnet.
    pub broadcast_addr: IpAddr,
    /// Destination port packets are forwarded to.
    pub broadcast_port: u16,
    /// Cooldown window per target MAC.
    pub dedup_window: Duration,
    /// Number of receive worker threads sharing the inbound socket.
    pub receive_workers: usize,
}

impl RelayConfig {
    pub fn broadcast_target(&self) -> SocketAddr {
        SocketAddr::new(self.broadcast_addr, self.broadcast_port)
    }
}

#[derive(Default)]
pub struct RelayStats {
    pub received: AtomicU64,
    pub accepted: AtomicU64,
    pub duplicates: AtomicU64,
    pub malformed: AtomicU64,
    pub sent: AtomicU64,
    pub send_errors: AtomicU64,
    pub last_accept: Mutex<Option<Instant>>,
}

/// WOL relay pipeline: a pool of receive workers feeds accepted packets
/// through a closable channel into a single broadcast sender.
pub struct WolRelay {
    config: RelayConfig,
    cache: Arc<DedupCache>,
    stats: Arc<RelayStats>,
    running: Arc<AtomicBool>,
}

/// Worker threads of a started relay, joined on shutdown.
pub struct RelayHandle {
    /// Actual inbound address, resolved after binding.
    pub local_addr: SocketAddr,
    handles: Vec<thread::JoinHandle<()>>,
}

impl RelayHandle {
    /// Block until every worker thread has exited.
    pub fn join(self) {
        for (i, handle) in self.handles.into_iter().enumerate() {
            if let Err(e) = handle.join() {
                warn!("Error joining worker thread {}: {:?}", i, e);
            }
        }
    }
}

impl WolRelay {
    pub fn new(config: RelayConfig) -> Self {
        let cache = Arc::new(DedupCache::new(config.dedup_window));
        Self {
            config,
            cache,
            stats: Arc::new(RelayStats::default()),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn cache(&self) -> &DedupCache {
        &self.cache
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Bind both sockets and spawn the worker threads. Socket setup failures
    /// abort startup; per-packet failures after this point never do.
    pub fn start(&self) -> Result<RelayHandle> {
        let inbound = bind_inbound_socket(self.config.listen_port).with_context(|| {
            format!(
                "failed to bind inbound UDP socket on port {}",
                self.config.listen_port
            )
        })?;
        let local_addr = inbound.local_addr()?;

        let outbound =
            open_broadcast_socket().context("failed to open outbound broadcast socket")?;

        let (queue_tx, queue_rx) = crossbeam_channel::unbounded::<MagicPacket>();
        let inbound = Arc::new(inbound);
        let worker_count = self.config.receive_workers.clamp(1, num_cpus::get());

        let mut handles = Vec::with_capacity(worker_count + 1);
        for worker_id in 0..worker_count {
            let socket = inbound.clone();
            let queue = queue_tx.clone();
            let cache = self.cache.clone();
            let stats = self.stats.clone();
            let running = self.running.clone();

            handles.push(thread::spawn(move || {
                receive_loop(worker_id, socket, queue, cache, stats, running);
            }));
        }
        // Only the receive workers hold producer handles now, so the channel
        // disconnects exactly when the last of them exits.
        drop(queue_tx);

        let target = self.config.broadcast_target();
        let stats = self.stats.clone();
        handles.push(thread::spawn(move || {
            send_loop(outbound, queue_rx, target, stats);
        }));

        info!(
            "WOL relay started: listening on {}, forwarding to {} ({} receive workers)",
            local_addr, target, worker_count
        );

        Ok(RelayHandle { local_addr, handles })
    }

    /// Request shutdown. Receive workers observe the flag within one poll
    /// interval and drop their queue handles; the resulting channel
    /// disconnect wakes the sender, which drains what is left and stops.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

/// Receive worker: accept datagrams, extract the MAC key, gate through the
/// dedup cache, enqueue survivors for transmission.
fn receive_loop(
    worker_id: usize,
    socket: Arc<UdpSocket>,
    queue: Sender<MagicPacket>,
    cache: Arc<DedupCache>,
    stats: Arc<RelayStats>,
    running: Arc<AtomicBool>,
) {
    let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
    debug!("receive worker {} started", worker_id);

    while running.load(Ordering::Relaxed) {
        let (size, source) = match socket.recv_from(&mut buffer) {
            Ok(received) => received,
            Err(e) => match e.kind() {
                ErrorKind::WouldBlock | ErrorKind::TimedOut => {
                    // Read timeout lapsed, recheck the running flag
                    continue;
                }
                _ => {
                    error!("receive worker {}: socket error: {}", worker_id, e);
                    thread::sleep(RECV_POLL_INTERVAL);
                    continue;
                }
            },
        };

        stats.received.fetch_add(1, Ordering::Relaxed);

        let key = match packet::extract_mac_key(&buffer[..size]) {
            Some(key) => key,
            None => {
                stats.malformed.fetch_add(1, Ordering::Relaxed);
                error!(
                    "dropping {}-byte datagram from {}: too short to contain a MAC",
                    size, source
                );
                continue;
            }
        };

        if !cache.accept(key) {
            stats.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!("suppressing duplicate for {} from {}", key, source);
            continue;
        }

        stats.accepted.fetch_add(1, Ordering::Relaxed);
        *stats.last_accept.lock() = Some(Instant::now());
        info!("accepted packet for {} from {} ({} bytes)", key, source, size);

        let depth = queue.len();
        if depth > QUEUE_WARN_DEPTH {
            warn!("send queue backlog: {} packets", depth);
        }

        if queue
            .send(MagicPacket::new(buffer[..size].to_vec(), source))
            .is_err()
        {
            warn!("receive worker {}: send queue closed, stopping", worker_id);
            break;
        }
    }

    debug!("receive worker {} stopped", worker_id);
}

/// Broadcast sender: drain the queue and forward each payload byte-identical
/// to the fixed destination endpoint. Strictly best-effort.
fn send_loop(
    socket: UdpSocket,
    queue: Receiver<MagicPacket>,
    target: SocketAddr,
    stats: Arc<RelayStats>,
) {
    debug!("broadcast sender started, target {}", target);

    // recv blocks while the queue is empty and fails only once every receive
    // worker has dropped its handle, which is the shutdown signal. Packets
    // still queued at disconnect are drained first.
    while let Ok(packet) = queue.recv() {
        match socket.send_to(&packet.payload, target) {
            Ok(bytes) => {
                stats.sent.fetch_add(1, Ordering::Relaxed);
                debug!("forwarded {} bytes from {} to {}", bytes, packet.source, target);
            }
            Err(e) => {
                stats.send_errors.fetch_add(1, Ordering::Relaxed);
                error!("failed to forward packet to {}: {}", target, e);
            }
        }
    }

    debug!("broadcast sender stopped");
}

fn bind_inbound_socket(port: u16) -> Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    if let Err(e) = socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
        warn!("Failed to set large receive buffer: {}", e);
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    socket.bind(&addr.into())?;
    socket.set_read_timeout(Some(RECV_POLL_INTERVAL))?;

    Ok(socket.into())
}

fn open_broadcast_socket() -> Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_broadcast(true)?;
    if let Err(e) = socket.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
        warn!("Failed to set large send buffer: {}", e);
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], 0));
    socket.bind(&addr.into())?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn build_magic_packet(mac: [u8; 6]) -> Vec<u8> {
        let mut payload = vec![0xFFu8; 6];
        for _ in 0..16 {
            payload.extend_from_slice(&mac);
        }
        payload
    }

    fn capture_socket() -> UdpSocket {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        socket
    }

    fn test_relay(broadcast_port: u16) -> WolRelay {
        WolRelay::new(RelayConfig {
            listen_port: 0,
            broadcast_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            broadcast_port,
            dedup_window: Duration::from_secs(30),
            receive_workers: 1,
        })
    }

    #[test]
    fn test_forwards_byte_identical_payload() {
        let capture = capture_socket();
        let relay = test_relay(capture.local_addr().unwrap().port());
        let handle = relay.start().unwrap();

        let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let payload = build_magic_packet([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        assert_eq!(payload.len(), 102);
        sender
            .send_to(&payload, (Ipv4Addr::LOCALHOST, handle.local_addr.port()))
            .unwrap();

        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let (size, _) = capture.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..size], &payload[..]);

        relay.stop();
        handle.join();
    }

    #[test]
    fn test_suppresses_duplicates_within_window() {
        let capture = capture_socket();
        let relay = test_relay(capture.local_addr().unwrap().port());
        let handle = relay.start().unwrap();
        let target = (Ipv4Addr::LOCALHOST, handle.local_addr.port());

        let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let first = build_magic_packet([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let second = build_magic_packet([0x10, 0x20, 0x30, 0x40, 0x50, 0x60]);

        sender.send_to(&first, target).unwrap();
        // Same MAC within the window: must not be forwarded
        sender.send_to(&first, target).unwrap();
        sender.send_to(&second, target).unwrap();

        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let (size, _) = capture.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..size], &first[..]);
        let (size, _) = capture.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..size], &second[..]);

        assert_eq!(relay.stats().duplicates.load(Ordering::Relaxed), 1);

        relay.stop();
        handle.join();
    }

    #[test]
    fn test_drops_short_datagrams() {
        let capture = capture_socket();
        let relay = test_relay(capture.local_addr().unwrap().port());
        let handle = relay.start().unwrap();
        let target = (Ipv4Addr::LOCALHOST, handle.local_addr.port());

        let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        sender.send_to(&[0xFFu8; 8], target).unwrap();
        // The receive loop must survive the malformed datagram
        let valid = build_magic_packet([0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F]);
        sender.send_to(&valid, target).unwrap();

        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let (size, _) = capture.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..size], &valid[..]);

        assert_eq!(relay.stats().malformed.load(Ordering::Relaxed), 1);

        relay.stop();
        handle.join();
    }

    #[test]
    fn test_preserves_acceptance_order() {
        let capture = capture_socket();
        let relay = test_relay(capture.local_addr().unwrap().port());
        let handle = relay.start().unwrap();
        let target = (Ipv4Addr::LOCALHOST, handle.local_addr.port());

        let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let packets: Vec<Vec<u8>> = (0u8..5)
            .map(|i| build_magic_packet([0x02, 0x00, 0x00, 0x00, 0x00, i]))
            .collect();
        for payload in &packets {
            sender.send_to(payload, target).unwrap();
        }

        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        for expected in &packets {
            let (size, _) = capture.recv_from(&mut buf).unwrap();
            assert_eq!(&buf[..size], &expected[..]);
        }

        relay.stop();
        handle.join();
    }

    #[test]
    fn test_shutdown_unblocks_idle_sender() {
        let capture = capture_socket();
        let relay = test_relay(capture.local_addr().unwrap().port());
        let handle = relay.start().unwrap();

        // Sender is blocked on an empty queue at this point
        relay.stop();

        let started = Instant::now();
        handle.join();
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
