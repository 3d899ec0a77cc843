//! Enforcing Linux hook backed by a netfilter queue.
//!
//! Packets reach user space only through a firewall rule that sends them to
//! the queue, for example
//! `iptables -I INPUT -i lo -p tcp -j NFQUEUE --queue-num 0 --queue-bypass`.
//! Each queued packet is held by the kernel until the receive thread returns
//! the classifier's verdict, so a DROP really discards the packet.
//!
//! Queued packets carry no link-layer header; the hook reports
//! [`LinkType::Raw`] framing. Packets that entered through another interface
//! are accepted without being classified. The queue is opened fail-open, so
//! the kernel accepts packets instead of dropping them when it overflows.

use std::io;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nfq::{Queue, Verdict};
use tracing::{debug, info, warn};

use portwarden_core::error::SetupError;

use super::IngressHook;
use super::sys::{if_nametoindex, is_transient, set_recv_timeout};
use crate::classifier::{Action, Classify};
use crate::packet::LinkType;

const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_millis(200);

struct Worker {
    interface: String,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Returns the classifier's verdict for every queued packet of an interface.
pub struct NfQueueHook {
    queue_num: u16,
    worker: Option<Worker>,
    recv_timeout: Duration,
}

impl NfQueueHook {
    pub fn new(queue_num: u16) -> Self {
        Self {
            queue_num,
            worker: None,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
        }
    }

    /// Upper bound on how long `detach` waits for the receive loop.
    pub fn recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }

    pub fn queue_num(&self) -> u16 {
        self.queue_num
    }
}

impl IngressHook for NfQueueHook {
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
        let queue_num = self.queue_num;
        let recv_timeout = self.recv_timeout;
        let stop = Arc::new(AtomicBool::new(false));
        let loop_stop = Arc::clone(&stop);
        let loop_interface = interface.to_owned();
        let attach_failed = |reason: String| SetupError::AttachFailed {
            interface: interface.to_owned(),
            reason,
        };

        // The queue is opened on the receive thread; the outcome of binding
        // is reported back before attach returns.
        let (ready_tx, ready_rx) = mpsc::sync_channel::<io::Result<()>>(1);
        let handle = thread::Builder::new()
            .name(format!("portwarden-nfq-{queue_num}"))
            .spawn(move || {
                let mut queue = match open_queue(queue_num, recv_timeout) {
                    Ok(queue) => {
                        let _ = ready_tx.send(Ok(()));
                        queue
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                receive_loop(&mut queue, if_index, classifier, &loop_stop, &loop_interface);
                if let Err(e) = queue.unbind(queue_num) {
                    debug!(queue_num, error = %e, "queue unbind failed");
                }
            })
            .map_err(|e| attach_failed(format!("failed to spawn receive thread: {e}")))?;

        let bound = match ready_rx.recv() {
            Ok(result) => result.map_err(|e| format!("nfqueue {queue_num}: {e}")),
            Err(_) => Err(format!("nfqueue {queue_num}: receive thread exited")),
        };
        if let Err(reason) = bound {
            let _ = handle.join();
            return Err(attach_failed(reason));
        }

        info!(interface, if_index, queue_num, "nfqueue hook attached");
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

        info!(interface = %worker.interface, queue_num = self.queue_num, "nfqueue hook detached");
        Ok(())
    }

    fn is_attached(&self) -> bool {
        self.worker.is_some()
    }

    fn kind(&self) -> &'static str {
        "nfqueue"
    }

    fn link_type(&self) -> Option<LinkType> {
        Some(LinkType::Raw)
    }
}

impl Drop for NfQueueHook {
    fn drop(&mut self) {
        if let Err(e) = self.detach() {
            warn!(error = %e, "nfqueue hook detach on drop failed");
        }
    }
}

fn open_queue(queue_num: u16, timeout: Duration) -> io::Result<Queue> {
    let mut queue = Queue::open()?;
    queue.bind(queue_num)?;
    queue.set_fail_open(queue_num, true)?;
    set_recv_timeout(queue.as_raw_fd(), timeout)?;
    Ok(queue)
}

/// Kernel verdict for a classifier action.
fn verdict_for(action: Action) -> Verdict {
    match action {
        Action::Pass => Verdict::Accept,
        Action::Drop => Verdict::Drop,
    }
}

fn receive_loop(
    queue: &mut Queue,
    if_index: u32,
    classifier: Arc<dyn Classify>,
    stop: &AtomicBool,
    interface: &str,
) {
    while !stop.load(Ordering::Acquire) {
        let mut msg = match queue.recv() {
            Ok(msg) => msg,
            Err(e) if is_transient(&e) => continue,
            Err(e) => {
                warn!(interface, error = %e, "queue receive failed, stopping receive loop");
                break;
            }
        };

        let verdict = if msg.get_indev() == if_index {
            verdict_for(classifier.classify(msg.get_payload()))
        } else {
            Verdict::Accept
        };
        msg.set_verdict(verdict);
        if let Err(e) = queue.verdict(msg) {
            warn!(interface, error = %e, "failed to return verdict");
        }
    }

    debug!(interface, "queue receive loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PassAll;

    impl Classify for PassAll {
        fn classify(&self, _frame: &[u8]) -> Action {
            Action::Pass
        }
    }

    #[test]
    fn actions_map_to_kernel_verdicts() {
        assert!(matches!(verdict_for(Action::Drop), Verdict::Drop));
        assert!(matches!(verdict_for(Action::Pass), Verdict::Accept));
    }

    #[test]
    fn new_hook_enforces_raw_ip_verdicts() {
        let mut hook = NfQueueHook::new(3).recv_timeout(Duration::from_millis(50));
        assert!(!hook.is_attached());
        assert!(hook.enforces_verdicts());
        assert_eq!(hook.link_type(), Some(LinkType::Raw));
        assert_eq!(hook.queue_num(), 3);
        hook.detach().unwrap();
    }

    #[test]
    fn attach_to_unknown_interface_fails_before_binding() {
        let mut hook = NfQueueHook::new(0);
        let err = hook.attach("pw-no-such-if0", Arc::new(PassAll)).unwrap_err();
        assert!(matches!(err, SetupError::InterfaceNotFound { .. }));
        assert!(!hook.is_attached());
    }
}
