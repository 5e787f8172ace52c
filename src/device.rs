//! Multi-queue TUN device management.
//!
//! Creates one queue per worker on a single virtual L3 interface using the
//! Linux TUN driver. Reads land above the payload header region so the
//! pipeline can prepend the cleartext header in place.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::payload::{Payload, MTU, PACKET_START};

// TUNSETIFF = _IOW('T', 202, c_int); PowerPC encodes the ioctl direction
// bits differently from x86/ARM.
#[cfg(any(target_arch = "powerpc", target_arch = "powerpc64"))]
const TUNSETIFF: libc::c_ulong = 0x800454ca;
#[cfg(not(any(target_arch = "powerpc", target_arch = "powerpc64")))]
const TUNSETIFF: libc::c_ulong = 0x400454ca;

const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;
const IFF_MULTI_QUEUE: libc::c_short = 0x0100;

/// How long a queue read blocks before surfacing an empty poll, so worker
/// loops can observe the stop flag.
const READ_POLL_MS: libc::c_int = 500;

/// Capability contract for the virtual L3 interface.
pub trait Device: Send + Sync {
    /// The interface name
    fn name(&self) -> &str;

    /// Read one packet off the given queue into `buf[PACKET_START..]`.
    /// Returns `Ok(None)` when no packet arrived within the poll interval.
    fn read<'a>(&self, queue: usize, buf: &'a mut [u8]) -> Result<Option<Payload<'a>>>;

    /// Write the payload's plaintext body to the given queue
    fn write(&self, queue: usize, payload: &Payload) -> Result<()>;

    /// The underlying per-queue file descriptors, in queue order
    fn queue_fds(&self) -> Vec<RawFd>;

    /// Close all queues. Unblocks any in-flight reads.
    fn close(&self) -> Result<()>;
}

/// Which device variant to construct
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Tun,
    Mock,
}

/// Construct a device of the given kind
pub fn new(kind: DeviceKind, cfg: &Config) -> Result<Arc<dyn Device>> {
    match kind {
        DeviceKind::Tun => Ok(Arc::new(TunDevice::open(cfg)?)),
        DeviceKind::Mock => Ok(Arc::new(MockDevice::new(cfg.num_workers))),
    }
}

/// A Linux multi-queue TUN device
pub struct TunDevice {
    name: String,
    queues: Vec<RawFd>,
}

#[repr(C)]
struct Ifreq {
    ifr_name: [u8; 16],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

impl TunDevice {
    /// Open (or, on a reload, re-adopt) the TUN device with one queue per
    /// worker.
    pub fn open(cfg: &Config) -> Result<Self> {
        if cfg.reuse_fds {
            // Queue fds were inherited across exec at stable slots.
            let name = cfg.real_interface_name.clone().ok_or_else(|| {
                Error::Device("fd reuse requested but no inherited interface name".into())
            })?;
            let queues = (0..cfg.num_workers).map(|i| 3 + i as RawFd).collect();
            info!("Reusing inherited TUN device {}", name);
            return Ok(Self { name, queues });
        }

        let mut name = cfg.interface_name.clone();
        let mut queues = Vec::with_capacity(cfg.num_workers);
        for _ in 0..cfg.num_workers {
            let (actual, fd) = Self::create_queue(&name)?;
            name = actual;
            queues.push(fd);
        }

        let device = Self { name, queues };
        device.configure(cfg)?;
        Ok(device)
    }

    fn create_queue(name: &str) -> Result<(String, RawFd)> {
        let fd = unsafe { libc::open(b"/dev/net/tun\0".as_ptr() as *const _, libc::O_RDWR) };
        if fd < 0 {
            return Err(Error::Device(format!(
                "failed to open /dev/net/tun: {}",
                std::io::Error::last_os_error()
            )));
        }

        let mut req = Ifreq {
            ifr_name: [0u8; 16],
            ifr_flags: IFF_TUN | IFF_NO_PI | IFF_MULTI_QUEUE,
            _pad: [0u8; 22],
        };
        let name_bytes = name.as_bytes();
        let copy_len = name_bytes.len().min(15);
        req.ifr_name[..copy_len].copy_from_slice(&name_bytes[..copy_len]);

        let ret = unsafe { libc::ioctl(fd, TUNSETIFF as _, &mut req as *mut _) };
        if ret < 0 {
            unsafe { libc::close(fd) };
            return Err(Error::Device(format!(
                "ioctl TUNSETIFF failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        let actual = std::str::from_utf8(&req.ifr_name)
            .unwrap_or(name)
            .trim_end_matches('\0')
            .to_string();
        Ok((actual, fd))
    }

    /// Assign the leased private address, set the overlay MTU, and bring the
    /// link up.
    fn configure(&self, cfg: &Config) -> Result<()> {
        let private_ip = cfg.private_ip.ok_or_else(|| {
            Error::Device("device configured before a private address was leased".into())
        })?;
        let cidr = format!("{}/{}", private_ip, cfg.subnet.prefix_len());

        let status = std::process::Command::new("ip")
            .args(["addr", "add", &cidr, "dev", &self.name])
            .status()?;
        if !status.success() {
            return Err(Error::Device(format!(
                "failed to assign {} to {}",
                cidr, self.name
            )));
        }

        let status = std::process::Command::new("ip")
            .args(["link", "set", "dev", &self.name, "mtu", &MTU.to_string()])
            .status()?;
        if !status.success() {
            warn!("Failed to set MTU {} on {}", MTU, self.name);
        }

        let status = std::process::Command::new("ip")
            .args(["link", "set", "dev", &self.name, "up"])
            .status()?;
        if !status.success() {
            return Err(Error::Device(format!("failed to bring up {}", self.name)));
        }

        info!("TUN device {} up at {} mtu {}", self.name, cidr, MTU);
        Ok(())
    }

    fn poll_readable(fd: RawFd) -> Result<bool> {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let n = unsafe { libc::poll(&mut pfd, 1, READ_POLL_MS) };
        match n {
            0 => Ok(false),
            n if n > 0 => Ok(true),
            _ => {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    return Ok(false);
                }
                Err(Error::Io(err))
            }
        }
    }
}

impl Device for TunDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn read<'a>(&self, queue: usize, buf: &'a mut [u8]) -> Result<Option<Payload<'a>>> {
        let fd = self.queues[queue];
        if !TunDevice::poll_readable(fd)? {
            return Ok(None);
        }

        // Bound the read at MTU: the kernel truncates anything larger, and
        // the tag region behind the body stays untouched.
        let body = &mut buf[PACKET_START..PACKET_START + MTU];
        let n = unsafe { libc::read(fd, body.as_mut_ptr() as *mut _, body.len()) };
        if n < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(Some(Payload::from_tunnel(buf, n as usize)))
    }

    fn write(&self, queue: usize, payload: &Payload) -> Result<()> {
        let packet = payload.packet();
        let n = unsafe {
            libc::write(
                self.queues[queue],
                packet.as_ptr() as *const _,
                packet.len(),
            )
        };
        if n < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn queue_fds(&self) -> Vec<RawFd> {
        self.queues.clone()
    }

    fn close(&self) -> Result<()> {
        for &fd in &self.queues {
            if unsafe { libc::close(fd) } < 0 {
                return Err(Error::Device(format!(
                    "error closing device queue: {}",
                    std::io::Error::last_os_error()
                )));
            }
        }
        Ok(())
    }
}

struct MockQueue {
    inbound: Mutex<VecDeque<Vec<u8>>>,
    delivered: Mutex<Vec<Vec<u8>>>,
    cond: Condvar,
}

/// In-memory device for tests: injected packets are handed to `read`,
/// written packets are captured for inspection.
pub struct MockDevice {
    queues: Vec<MockQueue>,
}

impl MockDevice {
    pub fn new(num_queues: usize) -> Self {
        Self {
            queues: (0..num_queues)
                .map(|_| MockQueue {
                    inbound: Mutex::new(VecDeque::new()),
                    delivered: Mutex::new(Vec::new()),
                    cond: Condvar::new(),
                })
                .collect(),
        }
    }

    /// Queue a packet for the next `read` on the given queue
    pub fn inject(&self, queue: usize, packet: Vec<u8>) {
        let q = &self.queues[queue];
        q.inbound.lock().unwrap().push_back(packet);
        q.cond.notify_one();
    }

    /// Drain everything written to the given queue so far
    pub fn take_delivered(&self, queue: usize) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.queues[queue].delivered.lock().unwrap())
    }
}

impl Device for MockDevice {
    fn name(&self) -> &str {
        "mock0"
    }

    fn read<'a>(&self, queue: usize, buf: &'a mut [u8]) -> Result<Option<Payload<'a>>> {
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
            Some(packet) => {
                let n = packet.len().min(MTU);
                buf[PACKET_START..PACKET_START + n].copy_from_slice(&packet[..n]);
                Ok(Some(Payload::from_tunnel(buf, n)))
            }
            None => Ok(None),
        }
    }

    fn write(&self, queue: usize, payload: &Payload) -> Result<()> {
        self.queues[queue]
            .delivered
            .lock()
            .unwrap()
            .push(payload.packet().to_vec());
        Ok(())
    }

    fn queue_fds(&self) -> Vec<RawFd> {
        Vec::new()
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
