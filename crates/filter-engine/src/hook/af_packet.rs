//! Observe-only Linux hook backed by an `AF_PACKET` raw socket.
//!
//! The socket sees a copy of each frame, so the verdict is recorded in the
//! counter table but the kernel still delivers the packet. Outgoing frames
//! looped back to the socket are skipped so only ingress is classified.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use portwarden_core::error::SetupError;

use super::IngressHook;
use super::sys::{if_nametoindex, is_transient, set_recv_timeout};
use crate::classifier::Classify;

const ETH_P_ALL: u16 = 0x0003;
const DEFAULT_BUFFER_SIZE: usize = 65_536;
const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_millis(200);

struct Worker {
    interface: String,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Classifies a copy of every frame arriving on an interface.
pub struct AfPacketHook {
    worker: Option<Worker>,
    buffer_size: usize,
    recv_timeout: Duration,
}

impl AfPacketHook {
    pub fn new() -> Self {
        Self {
            worker: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
        }
    }

    /// Upper bound on how long `detach` waits for the receive loop.
    pub fn recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(2048);
        self
    }
}

impl Default for AfPacketHook {
    fn default() -> Self {
        Self::new()
    }
}

impl IngressHook for AfPacketHook {
    fn attach(
        &mut self,
        interface: &str,
        classifier: Arc<dyn Classify>,
    ) -> Result<(), SetupError> {
        if let Some(worker) = &self.worker {
            return Err(SetupError::AlreadyAttached {
                interface: worker.interface.clone(),
            });
        }

        let if_index = if_nametoindex(interface)?;
        let fd = open_socket(interface, if_index, self.recv_timeout)?;

        let stop = Arc::new(AtomicBool::new(false));
        let loop_stop = Arc::clone(&stop);
        let loop_interface = interface.to_owned();
        let buffer_size = self.buffer_size;

        let handle = thread::Builder::new()
            .name(format!("portwarden-rx-{interface}"))
            .spawn(move || receive_loop(fd, classifier, loop_stop, &loop_interface, buffer_size))
            .map_err(|e| SetupError::AttachFailed {
                interface: interface.to_owned(),
                reason: format!("failed to spawn receive thread: {e}"),
            })?;

        info!(interface, if_index, "AF_PACKET hook attached");
        self.worker = Some(Worker {
            interface: interface.to_owned(),
            stop,
            handle,
        });
        Ok(())
    }

    fn detach(&mut self) -> Result<(), SetupError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };

        worker.stop.store(true, Ordering::Release);
        worker.handle.join().map_err(|_| SetupError::DetachFailed {
            interface: worker.interface.clone(),
            reason: "receive thread panicked".to_owned(),
        })?;

        info!(interface = %worker.interface, "AF_PACKET hook detached");
        Ok(())
    }

    fn is_attached(&self) -> bool {
        self.worker.is_some()
    }

    fn kind(&self) -> &'static str {
        "af-packet"
    }

    fn enforces_verdicts(&self) -> bool {
        false
    }
}

impl Drop for AfPacketHook {
    fn drop(&mut self) {
        if let Err(e) = self.detach() {
            warn!(error = %e, "AF_PACKET hook detach on drop failed");
        }
    }
}

fn receive_loop(
    fd: OwnedFd,
    classifier: Arc<dyn Classify>,
    stop: Arc<AtomicBool>,
    interface: &str,
    buffer_size: usize,
) {
    let mut buffer = vec![0u8; buffer_size];

    while !stop.load(Ordering::Acquire) {
        // SAFETY: zeroed sockaddr_ll is a valid out-parameter.
        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        let mut addr_len = std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;

        // SAFETY: buffer and addr outlive the call; lengths match the allocations.
        let n = unsafe {
            libc::recvfrom(
                fd.as_raw_fd(),
                buffer.as_mut_ptr() as *mut libc::c_void,
                buffer.len(),
                0,
                &mut addr as *mut libc::sockaddr_ll as *mut libc::sockaddr,
                &mut addr_len,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if is_transient(&err) {
                continue;
            }
            warn!(interface, error = %err, "recvfrom failed, stopping receive loop");
            break;
        }

        if addr.sll_pkttype == libc::PACKET_OUTGOING {
            continue;
        }

        let len = (n as usize).min(buffer.len());
        classifier.classify(&buffer[..len]);
    }

    debug!(interface, "receive loop exited");
}

fn open_socket(interface: &str, if_index: u32, timeout: Duration) -> Result<OwnedFd, SetupError> {
    let failed = |what: &str| SetupError::AttachFailed {
        interface: interface.to_owned(),
        reason: format!("{what}: {}", io::Error::last_os_error()),
    };

    // SAFETY: plain syscall, result checked below.
    let raw = unsafe {
        libc::socket(
            libc::AF_PACKET,
            libc::SOCK_RAW,
            i32::from(ETH_P_ALL.to_be()),
        )
    };
    if raw < 0 {
        return Err(failed("socket(AF_PACKET)"));
    }
    // SAFETY: raw is a fresh descriptor owned by nobody else.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    // SAFETY: zeroed sockaddr_ll is valid; fields set below.
    let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    sll.sll_family = libc::AF_PACKET as u16;
    sll.sll_protocol = ETH_P_ALL.to_be();
    sll.sll_ifindex = if_index as i32;

    // SAFETY: sll is a valid sockaddr_ll for the given length.
    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(failed("bind"));
    }

    // Without a timeout detach would wait for the next packet.
    set_recv_timeout(fd.as_raw_fd(), timeout).map_err(|e| SetupError::AttachFailed {
        interface: interface.to_owned(),
        reason: format!("setsockopt(SO_RCVTIMEO): {e}"),
    })?;

    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_hook_is_detached_and_observe_only() {
        let mut hook = AfPacketHook::new().recv_timeout(Duration::from_millis(50));
        assert!(!hook.is_attached());
        assert!(!hook.enforces_verdicts());
        assert_eq!(hook.link_type(), None);
        hook.detach().unwrap();
    }

    #[test]
    fn attach_to_unknown_interface_fails() {
        struct PassAll;
        impl Classify for PassAll {
            fn classify(&self, _frame: &[u8]) -> crate::classifier::Action {
                crate::classifier::Action::Pass
            }
        }

        let mut hook = AfPacketHook::new();
        let err = hook.attach("pw-no-such-if0", Arc::new(PassAll)).unwrap_err();
        assert!(matches!(err, SetupError::InterfaceNotFound { .. }));
        assert!(!hook.is_attached());
    }
}
