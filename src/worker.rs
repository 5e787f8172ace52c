//! Per-queue datapath workers.
//!
//! Each worker owns one OS thread, one queue on the tunnel and socket, and
//! one scratch buffer reused for every packet. Any pipeline step may drop
//! the packet; the drop is recorded and the loop continues. The stop flag
//! is checked at the top of every iteration, and closing the underlying
//! file descriptors unblocks whatever read is in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info};

use crate::crypto;
use crate::device::Device;
use crate::error::Error;
use crate::metric::{DropReason, Recorder};
use crate::payload::{
    Payload, HEADER_SIZE, MAX_PACKET_LENGTH, NONCE_LENGTH, PACKET_START, TAG_LENGTH,
};
use crate::plugin::{Direction, Plugin};
use crate::router::RouteTable;
use crate::socket::Socket;

/// Offset of the destination address within an IPv4 header.
const IPV4_DST_OFFSET: usize = 16;

/// Back-off after an I/O error so a dead queue cannot spin the CPU.
const ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Tunnel → socket pipeline.
pub struct Outgoing {
    local_ip: std::net::Ipv4Addr,
    router: Arc<RouteTable>,
    plugins: Arc<Vec<Arc<dyn Plugin>>>,
    dev: Arc<dyn Device>,
    sock: Arc<dyn Socket>,
}

impl Outgoing {
    pub fn new(
        local_ip: std::net::Ipv4Addr,
        router: Arc<RouteTable>,
        plugins: Arc<Vec<Arc<dyn Plugin>>>,
        dev: Arc<dyn Device>,
        sock: Arc<dyn Socket>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_ip,
            router,
            plugins,
            dev,
            sock,
        })
    }

    /// Start handling packets on the given queue.
    pub fn start(
        self: &Arc<Self>,
        queue: usize,
        recorder: Recorder,
        stop: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let worker = self.clone();
        std::thread::Builder::new()
            .name(format!("shroud-out-{}", queue))
            .spawn(move || {
                let mut buf = vec![0u8; MAX_PACKET_LENGTH];
                while !stop.load(Ordering::Relaxed) {
                    if !worker.pipeline(queue, &mut buf, &recorder) {
                        break;
                    }
                }
                info!("Outgoing worker {} stopped", queue);
            })
            .expect("failed to spawn outgoing worker")
    }

    /// One pipeline round. Returns `false` only when the queue is gone and
    /// the worker must terminate.
    fn pipeline(&self, queue: usize, buf: &mut [u8], recorder: &Recorder) -> bool {
        let mut payload = match self.dev.read(queue, buf) {
            Ok(Some(payload)) => payload,
            Ok(None) => return true,
            Err(e) => {
                if is_closed_fd(&e) {
                    return false;
                }
                debug!("Device read error on queue {}: {}", queue, e);
                recorder.dropped(DropReason::Io, 0, None);
                std::thread::sleep(ERROR_BACKOFF);
                return true;
            }
        };

        // The destination sits in the IPv4 header of the body just read.
        let packet = payload.packet();
        if packet.len() < IPV4_DST_OFFSET + 4 {
            recorder.dropped(DropReason::Malformed, payload.length() as u64, None);
            return true;
        }
        let mut dst = [0u8; 4];
        dst.copy_from_slice(&packet[IPV4_DST_OFFSET..IPV4_DST_OFFSET + 4]);

        let mapping = match self.router.resolve(dst) {
            Some(mapping) => mapping,
            None => {
                recorder.dropped(DropReason::NoRoute, payload.length() as u64, None);
                return true;
            }
        };

        // The wire header carries our own private address so the receiver
        // can attribute the datagram to this node.
        payload
            .peer_ip_mut()
            .copy_from_slice(&self.local_ip.octets());

        for plugin in self.plugins.iter() {
            if !plugin.apply(Direction::Outgoing, &mut payload, &mapping) {
                recorder.dropped(
                    DropReason::Transform,
                    payload.length() as u64,
                    Some(mapping.private_ip),
                );
                return true;
            }
        }

        crypto::fill_nonce(payload.nonce_mut());
        let mut nonce = [0u8; NONCE_LENGTH];
        nonce.copy_from_slice(payload.nonce());

        let body_len = payload.body_len();
        let tag = match mapping.aead.seal_in_place(&nonce, payload.body_mut(body_len)) {
            Ok(tag) => tag,
            Err(e) => {
                debug!("Seal failed for {}: {}", mapping.private_ip, e);
                recorder.dropped(
                    DropReason::Transform,
                    payload.length() as u64,
                    Some(mapping.private_ip),
                );
                return true;
            }
        };
        let tag_start = PACKET_START + body_len;
        payload.raw_mut()[tag_start..tag_start + TAG_LENGTH].copy_from_slice(&tag);
        payload.set_length(HEADER_SIZE + body_len + TAG_LENGTH);

        match self.sock.write(queue, &payload, &mapping) {
            Ok(()) => recorder.forwarded(payload.length() as u64, Some(mapping.private_ip)),
            Err(e) => {
                debug!("Socket write error on queue {}: {}", queue, e);
                recorder.dropped(
                    DropReason::Io,
                    payload.length() as u64,
                    Some(mapping.private_ip),
                );
            }
        }
        true
    }
}

/// Socket → tunnel pipeline.
pub struct Incoming {
    router: Arc<RouteTable>,
    plugins: Arc<Vec<Arc<dyn Plugin>>>,
    dev: Arc<dyn Device>,
    sock: Arc<dyn Socket>,
}

impl Incoming {
    pub fn new(
        router: Arc<RouteTable>,
        plugins: Arc<Vec<Arc<dyn Plugin>>>,
        dev: Arc<dyn Device>,
        sock: Arc<dyn Socket>,
    ) -> Arc<Self> {
        Arc::new(Self {
            router,
            plugins,
            dev,
            sock,
        })
    }

    /// Start handling packets on the given queue.
    pub fn start(
        self: &Arc<Self>,
        queue: usize,
        recorder: Recorder,
        stop: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let worker = self.clone();
        std::thread::Builder::new()
            .name(format!("shroud-in-{}", queue))
            .spawn(move || {
                let mut buf = vec![0u8; MAX_PACKET_LENGTH];
                while !stop.load(Ordering::Relaxed) {
                    if !worker.pipeline(queue, &mut buf, &recorder) {
                        break;
                    }
                }
                info!("Incoming worker {} stopped", queue);
            })
            .expect("failed to spawn incoming worker")
    }

    /// One pipeline round. Returns `false` only when the queue is gone and
    /// the worker must terminate.
    fn pipeline(&self, queue: usize, buf: &mut [u8], recorder: &Recorder) -> bool {
        let (mut payload, _src) = match self.sock.read(queue, buf) {
            Ok(Some(read)) => read,
            Ok(None) => return true,
            Err(e) => {
                if is_closed_fd(&e) {
                    return false;
                }
                debug!("Socket read error on queue {}: {}", queue, e);
                recorder.dropped(DropReason::Io, 0, None);
                std::thread::sleep(ERROR_BACKOFF);
                return true;
            }
        };

        // Too short to even hold a header and tag: never reaches the AEAD.
        if payload.length() < HEADER_SIZE + TAG_LENGTH {
            recorder.dropped(DropReason::Malformed, payload.length() as u64, None);
            return true;
        }

        let mut src = [0u8; 4];
        src.copy_from_slice(payload.peer_ip());
        let mapping = match self.router.resolve_source(src) {
            Some(mapping) => mapping,
            None => {
                recorder.dropped(DropReason::NoRoute, payload.length() as u64, None);
                return true;
            }
        };

        let mut nonce = [0u8; NONCE_LENGTH];
        nonce.copy_from_slice(payload.nonce());

        let wire_len = payload.length();
        let body_len = wire_len - HEADER_SIZE - TAG_LENGTH;
        {
            let raw = payload.raw_mut();
            let (sealed, tag) = raw[..wire_len].split_at_mut(wire_len - TAG_LENGTH);
            let body = &mut sealed[PACKET_START..];
            if let Err(e) = mapping.aead.open_in_place(&nonce, body, tag) {
                match e {
                    Error::AuthFailure => recorder.dropped(
                        DropReason::Auth,
                        wire_len as u64,
                        Some(mapping.private_ip),
                    ),
                    _ => recorder.dropped(
                        DropReason::Transform,
                        wire_len as u64,
                        Some(mapping.private_ip),
                    ),
                }
                return true;
            }
        }
        payload.set_length(HEADER_SIZE + body_len);

        for plugin in self.plugins.iter().rev() {
            if !plugin.apply(Direction::Incoming, &mut payload, &mapping) {
                recorder.dropped(
                    DropReason::Transform,
                    payload.length() as u64,
                    Some(mapping.private_ip),
                );
                return true;
            }
        }

        match self.dev.write(queue, &payload) {
            Ok(()) => recorder.forwarded(payload.length() as u64, Some(mapping.private_ip)),
            Err(e) => {
                debug!("Device write error on queue {}: {}", queue, e);
                recorder.dropped(
                    DropReason::Io,
                    payload.length() as u64,
                    Some(mapping.private_ip),
                );
            }
        }
        true
    }
}

/// Whether an I/O error means the queue's descriptor is gone for good.
fn is_closed_fd(e: &Error) -> bool {
    matches!(e, Error::Io(io) if io.raw_os_error() == Some(libc::EBADF))
}
