//! Process lifecycle: startup order, signals, drain, and reload.
//!
//! The supervisor owns the shared stop flag and the signal handlers.
//! SIGINT/SIGTERM trigger a graceful stop: the lease is released, the flag
//! is set, the tunnel and socket queues are closed to unblock in-flight
//! reads, and every component thread is joined under a bounded drain
//! timeout. SIGHUP execs the binary over itself with the tunnel and socket
//! file descriptors inherited at stable slots, so the kernel queues carry
//! traffic across the restart.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::config::{write_pid, Config, REAL_INTERFACE_NAME_ENV};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::plugin::Plugin;
use crate::socket::Socket;
use crate::store::StoreClient;

/// How long each component gets to drain before its thread is abandoned.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

static STOP_SIGNAL: AtomicBool = AtomicBool::new(false);
static RELOAD_SIGNAL: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_stop(_sig: libc::c_int) {
    STOP_SIGNAL.store(true, Ordering::SeqCst);
}

extern "C" fn handle_reload(_sig: libc::c_int) {
    RELOAD_SIGNAL.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    let stop = handle_stop as extern "C" fn(libc::c_int);
    let reload = handle_reload as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, stop as libc::sighandler_t);
        libc::signal(libc::SIGTERM, stop as libc::sighandler_t);
        libc::signal(libc::SIGHUP, reload as libc::sighandler_t);
    }
}

/// Owns every running component and decides when the process ends.
pub struct Supervisor {
    cfg: Arc<Config>,
    dev: Arc<dyn Device>,
    sock: Arc<dyn Socket>,
    client: Arc<StoreClient>,
    plugins: Arc<Vec<Arc<dyn Plugin>>>,
    stop: Arc<AtomicBool>,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl Supervisor {
    pub fn new(
        cfg: Arc<Config>,
        dev: Arc<dyn Device>,
        sock: Arc<dyn Socket>,
        client: Arc<StoreClient>,
        plugins: Arc<Vec<Arc<dyn Plugin>>>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            cfg,
            dev,
            sock,
            client,
            plugins,
            stop,
            handles: Vec::new(),
        }
    }

    /// Track a component thread for drain at shutdown. Registration order is
    /// start order; threads are joined in reverse.
    pub fn register(&mut self, name: &str, handle: JoinHandle<()>) {
        self.handles.push((name.to_string(), handle));
    }

    /// Block until a shutdown condition, then drain.
    pub fn run(mut self) -> Result<()> {
        install_signal_handlers();

        loop {
            std::thread::sleep(Duration::from_millis(200));

            if STOP_SIGNAL.load(Ordering::SeqCst) {
                info!("Received termination signal, shutting down");
                self.shutdown(true);
                return Ok(());
            }

            if self.client.lost() {
                error!("Lease lost, terminating so the node re-registers cleanly");
                self.shutdown(false);
                return Err(Error::LeaseLost { attempts: 3 });
            }

            if RELOAD_SIGNAL.swap(false, Ordering::SeqCst) {
                info!("Received reload signal, handing over to a new process");
                match self.exec_successor() {
                    Ok(child) => {
                        write_pid(&self.cfg.pid_file, child as u32)?;
                        // The child owns the lease and the fds now; drain
                        // without touching either.
                        self.shutdown(false);
                        return Ok(());
                    }
                    Err(e) => error!("Reload failed, continuing: {}", e),
                }
            }
        }
    }

    fn shutdown(&mut self, release_lease: bool) {
        if release_lease {
            if let Err(e) = self.client.release() {
                warn!("Lease release failed: {}", e);
            }
        }

        self.stop.store(true, Ordering::SeqCst);
        for plugin in self.plugins.iter() {
            if let Err(e) = plugin.close() {
                warn!("Plugin {} close failed: {}", plugin.name(), e);
            }
        }
        if let Err(e) = self.sock.close() {
            warn!("Socket close failed: {}", e);
        }
        if let Err(e) = self.dev.close() {
            warn!("Device close failed: {}", e);
        }

        for (name, handle) in self.handles.drain(..).rev() {
            let deadline = Instant::now() + DRAIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("Component {} did not drain in time, abandoning", name);
            }
        }
        info!("Shutdown complete");
    }

    /// Fork and exec this binary with the tunnel and socket queue fds at
    /// stable slots `3..3+2N`, the tunnel name in the environment, and the
    /// original arguments. Returns the child pid.
    fn exec_successor(&self) -> Result<libc::pid_t> {
        let tun_fds = self.dev.queue_fds();
        let sock_fds = self.sock.queue_fds();
        if tun_fds.is_empty() || sock_fds.is_empty() {
            return Err(Error::Config(
                "reload requires real device and socket queues".into(),
            ));
        }

        let exe = std::env::current_exe()?;
        let argv0 = CString::new(exe.to_string_lossy().as_bytes())
            .map_err(|_| Error::Config("executable path contains a NUL byte".into()))?;
        let args: Vec<CString> = std::env::args()
            .skip(1)
            .filter_map(|a| CString::new(a).ok())
            .collect();
        let mut argv: Vec<*const libc::c_char> = Vec::with_capacity(args.len() + 2);
        argv.push(argv0.as_ptr());
        argv.extend(args.iter().map(|a| a.as_ptr()));
        argv.push(std::ptr::null());

        // Build the child environment up front; nothing is allocated
        // between fork and exec.
        let mut env_strings: Vec<CString> = std::env::vars()
            .filter(|(k, _)| k != REAL_INTERFACE_NAME_ENV)
            .filter_map(|(k, v)| CString::new(format!("{}={}", k, v)).ok())
            .collect();
        env_strings.push(
            CString::new(format!("{}={}", REAL_INTERFACE_NAME_ENV, self.dev.name()))
                .map_err(|_| Error::Config("interface name contains a NUL byte".into()))?,
        );
        let mut envp: Vec<*const libc::c_char> =
            env_strings.iter().map(|e| e.as_ptr()).collect();
        envp.push(std::ptr::null());

        let inherited: Vec<RawFd> = tun_fds.iter().chain(sock_fds.iter()).copied().collect();
        let mut staged: Vec<RawFd> = vec![-1; inherited.len()];

        unsafe {
            let pid = libc::fork();
            if pid < 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
            if pid == 0 {
                // Child. Only async-signal-safe calls from here to exec.
                // Move the inherited fds clear of the target slots, then pin
                // them at 3..3+2N; dup2 leaves CLOEXEC unset.
                let base = 3 + inherited.len() as RawFd;
                for (slot, &fd) in staged.iter_mut().zip(inherited.iter()) {
                    *slot = libc::fcntl(fd, libc::F_DUPFD, base);
                }
                for (i, &fd) in staged.iter().enumerate() {
                    if fd < 0 || libc::dup2(fd, 3 + i as RawFd) < 0 {
                        libc::_exit(1);
                    }
                    libc::close(fd);
                }
                libc::execve(argv0.as_ptr(), argv.as_ptr(), envp.as_ptr());
                libc::_exit(1);
            }
            info!("Spawned successor process {}", pid);
            Ok(pid)
        }
    }
}
