//! Multi-queue UDP socket bound to the public endpoint.
//!
//! Each worker queue gets its own file descriptor bound to the same
//! address via `SO_REUSEPORT`, so the kernel fans incoming datagrams out
//! across the workers without any userspace locking.

use std::collections::{HashMap, VecDeque};
use std::mem::ManuallyDrop;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::info;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::mapping::Mapping;
use crate::payload::Payload;

/// Read timeout per queue, so worker loops can observe the stop flag.
const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Capability contract for the public datagram socket.
pub trait Socket: Send + Sync {
    /// Read one whole datagram off the given queue into `buf[0..]`.
    /// Returns `Ok(None)` when nothing arrived within the read timeout.
    fn read<'a>(&self, queue: usize, buf: &'a mut [u8])
        -> Result<Option<(Payload<'a>, SocketAddr)>>;

    /// Send the payload's wire bytes to the mapping's resolved endpoint
    fn write(&self, queue: usize, payload: &Payload, mapping: &Mapping) -> Result<()>;

    /// The underlying per-queue file descriptors, in queue order
    fn queue_fds(&self) -> Vec<RawFd>;

    /// Close all queues. Unblocks any in-flight reads.
    fn close(&self) -> Result<()>;
}

/// Which socket variant to construct
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Udp,
    Mock,
}

/// Construct a socket of the given kind
pub fn new(kind: SocketKind, cfg: &Config) -> Result<Arc<dyn Socket>> {
    match kind {
        SocketKind::Udp => Ok(Arc::new(UdpChannel::open(cfg)?)),
        SocketKind::Mock => {
            let network = MockNetwork::new();
            let addr = SocketAddr::new(cfg.listen_address.into(), cfg.listen_port);
            Ok(network.socket(addr, cfg.num_workers))
        }
    }
}

/// The production multi-queue UDP socket
pub struct UdpChannel {
    queues: Vec<ManuallyDrop<UdpSocket>>,
}

impl UdpChannel {
    /// Bind (or, on a reload, re-adopt) one queue per worker.
    pub fn open(cfg: &Config) -> Result<Self> {
        let mut queues = Vec::with_capacity(cfg.num_workers);
        if cfg.reuse_fds {
            // Socket fds were inherited across exec after the device queues.
            for i in 0..cfg.num_workers {
                let fd = (3 + cfg.num_workers + i) as RawFd;
                let sock = unsafe { UdpSocket::from_raw_fd(fd) };
                sock.set_read_timeout(Some(READ_TIMEOUT))?;
                queues.push(ManuallyDrop::new(sock));
            }
            info!("Reusing {} inherited socket queues", cfg.num_workers);
        } else {
            let addr = SocketAddr::new(cfg.listen_address.into(), cfg.listen_port);
            for _ in 0..cfg.num_workers {
                let sock = Self::bind_reuseport(addr)?;
                sock.set_read_timeout(Some(READ_TIMEOUT))?;
                queues.push(ManuallyDrop::new(sock));
            }
            info!(
                "Listening on UDP {} across {} queues",
                addr, cfg.num_workers
            );
        }
        Ok(Self { queues })
    }

    fn bind_reuseport(addr: SocketAddr) -> Result<UdpSocket> {
        let ipv4 = match addr {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => {
                return Err(Error::Socket("listen address must be IPv4".into()));
            }
        };

        unsafe {
            let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
            if fd < 0 {
                return Err(Error::Socket(format!(
                    "socket creation failed: {}",
                    std::io::Error::last_os_error()
                )));
            }

            let one: libc::c_int = 1;
            if libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEPORT,
                &one as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            ) < 0
            {
                libc::close(fd);
                return Err(Error::Socket(format!(
                    "SO_REUSEPORT failed: {}",
                    std::io::Error::last_os_error()
                )));
            }

            let sa = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: ipv4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(*ipv4.ip()).to_be(),
                },
                sin_zero: [0; 8],
            };
            if libc::bind(
                fd,
                &sa as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            ) < 0
            {
                libc::close(fd);
                return Err(Error::Socket(format!(
                    "bind {} failed: {}",
                    addr,
                    std::io::Error::last_os_error()
                )));
            }

            Ok(UdpSocket::from_raw_fd(fd))
        }
    }
}

impl Socket for UdpChannel {
    fn read<'a>(
        &self,
        queue: usize,
        buf: &'a mut [u8],
    ) -> Result<Option<(Payload<'a>, SocketAddr)>> {
        match self.queues[queue].recv_from(buf) {
            Ok((n, src)) => Ok(Some((Payload::from_socket(buf, n), src))),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                Ok(None)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn write(&self, queue: usize, payload: &Payload, mapping: &Mapping) -> Result<()> {
        self.queues[queue].send_to(payload.wire(), mapping.sockaddr)?;
        Ok(())
    }

    fn queue_fds(&self) -> Vec<RawFd> {
        self.queues.iter().map(|q| q.as_raw_fd()).collect()
    }

    fn close(&self) -> Result<()> {
        for q in &self.queues {
            if unsafe { libc::close(q.as_raw_fd()) } < 0 {
                return Err(Error::Socket(format!(
                    "error closing socket queue: {}",
                    std::io::Error::last_os_error()
                )));
            }
        }
        Ok(())
    }
}

struct MockQueue {
    inbound: Mutex<VecDeque<(Vec<u8>, SocketAddr)>>,
    cond: Condvar,
}

/// An in-memory datagram fabric connecting [`MockSocket`]s by address.
/// Datagrams to unregistered addresses vanish, like UDP.
pub struct MockNetwork {
    sockets: Mutex<HashMap<SocketAddr, std::sync::Weak<MockSocket>>>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sockets: Mutex::new(HashMap::new()),
        })
    }

    /// Register a socket listening on `addr` with the given queue count
    pub fn socket(self: &Arc<Self>, addr: SocketAddr, queues: usize) -> Arc<MockSocket> {
        let sock = Arc::new(MockSocket {
            addr,
            network: self.clone(),
            queues: (0..queues)
                .map(|_| MockQueue {
                    inbound: Mutex::new(VecDeque::new()),
                    cond: Condvar::new(),
                })
                .collect(),
        });
        self.sockets
            .lock()
            .unwrap()
            .insert(addr, Arc::downgrade(&sock));
        sock
    }

    /// Deliver a raw datagram to `dest` as if it came from `from`
    pub fn inject(&self, dest: SocketAddr, queue: usize, data: Vec<u8>, from: SocketAddr) {
        let target = self
            .sockets
            .lock()
            .unwrap()
            .get(&dest)
            .and_then(|w| w.upgrade());
        if let Some(target) = target {
            let q = &target.queues[queue % target.queues.len()];
            q.inbound.lock().unwrap().push_back((data, from));
            q.cond.notify_one();
        }
    }
}

/// In-memory socket for tests, attached to a [`MockNetwork`].
pub struct MockSocket {
    addr: SocketAddr,
    network: Arc<MockNetwork>,
    queues: Vec<MockQueue>,
}

impl MockSocket {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Socket for MockSocket {
    fn read<'a>(
        &self,
        queue: usize,
        buf: &'a mut [u8],
    ) -> Result<Option<(Payload<'a>, SocketAddr)>> {
        let q = &self.queues[queue];
        let mut inbound = q.inbound.lock().unwrap();
        if inbound.is_empty() {
            let (guard, _) = q
                .cond
                .wait_timeout(inbound, Duration::from_millis(50))
                .unwrap();
            inbound = guard;
        }
        match inbound.pop_front() {
            Some((data, src)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(Some((Payload::from_socket(buf, n), src)))
            }
            None => Ok(None),
        }
    }

    fn write(&self, queue: usize, payload: &Payload, mapping: &Mapping) -> Result<()> {
        self.network
            .inject(mapping.sockaddr, queue, payload.wire().to_vec(), self.addr);
        Ok(())
    }

    fn queue_fds(&self) -> Vec<RawFd> {
        Vec::new()
    }

    fn close(&self) -> Result<()> {
        self.network.sockets.lock().unwrap().remove(&self.addr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::mapping::{Mapping, MappingRecord};
    use crate::payload::MAX_PACKET_LENGTH;

    fn mapping_to(addr: SocketAddr) -> Mapping {
        let local = KeyPair::generate();
        let peer = KeyPair::generate();
        let record = MappingRecord {
            private_ip: "10.10.0.3".parse().unwrap(),
            public_key: peer.public_key_base64(),
            ipv4: match addr {
                SocketAddr::V4(v4) => Some(*v4.ip()),
                _ => None,
            },
            ipv6: None,
            port: addr.port(),
            machine_id: "cafe".into(),
            gateway: false,
            plugins: Vec::new(),
            expires_at: 0,
        };
        Mapping::from_record(&record, &local.secret).unwrap()
    }

    #[test]
    fn test_mock_network_delivery() {
        let network = MockNetwork::new();
        let a = network.socket("127.0.0.1:1099".parse().unwrap(), 1);
        let b = network.socket("127.0.0.2:1099".parse().unwrap(), 1);

        let mut buf = vec![0u8; MAX_PACKET_LENGTH];
        let wire = b"datagram".to_vec();
        buf[..wire.len()].copy_from_slice(&wire);
        let payload = Payload::from_socket(&mut buf, wire.len());
        a.write(0, &payload, &mapping_to(b.addr())).unwrap();

        let mut rx = vec![0u8; MAX_PACKET_LENGTH];
        let (payload, src) = b.read(0, &mut rx).unwrap().unwrap();
        assert_eq!(payload.wire(), b"datagram");
        assert_eq!(src, a.addr());
    }

    #[test]
    fn test_unknown_destination_vanishes() {
        let network = MockNetwork::new();
        let a = network.socket("127.0.0.1:1099".parse().unwrap(), 1);

        let mut buf = vec![0u8; 64];
        let payload = Payload::from_socket(&mut buf, 8);
        a.write(0, &payload, &mapping_to("127.0.0.9:1099".parse().unwrap()))
            .unwrap();

        let mut rx = vec![0u8; 64];
        assert!(a.read(0, &mut rx).unwrap().is_none());
    }
}
