//! Ingress hooks: attach a classifier to an interface.
//!
//! Attach and detach are all-or-nothing. A hook that fails to attach leaves
//! nothing running; once `detach` returns, the classifier sees no more
//! packets from that hook.
//!
//! - [`InProcessHook`]: frames are delivered by the caller through a
//!   [`HookTap`], which hands the verdict back. Used for replay, tests and
//!   benches.
//! - [`NfQueueHook`] (Linux): returns the verdict for every packet a
//!   netfilter queue holds. Drops are enforced.
//! - [`AfPacketHook`] (Linux): classifies a copy of every frame received on
//!   the interface. Drops are counted only.

#[cfg(target_os = "linux")]
mod af_packet;
#[cfg(target_os = "linux")]
mod nfqueue;
#[cfg(target_os = "linux")]
mod sys;

use std::sync::Arc;
use std::thread;

use arc_swap::ArcSwapOption;

use portwarden_core::config::HookKind;
use portwarden_core::error::SetupError;

use crate::classifier::{Action, Classify};
use crate::packet::LinkType;

#[cfg(target_os = "linux")]
pub use af_packet::AfPacketHook;
#[cfg(target_os = "linux")]
pub use nfqueue::NfQueueHook;

/// Connects a classifier to the packets of one interface.
pub trait IngressHook: Send {
    /// Starts feeding `interface`'s ingress packets to `classifier`.
    fn attach(&mut self, interface: &str, classifier: Arc<dyn Classify>)
    -> Result<(), SetupError>;

    /// Stops feeding packets. Detaching an unattached hook is a no-op.
    fn detach(&mut self) -> Result<(), SetupError>;

    fn is_attached(&self) -> bool;

    /// Short name for logs.
    fn kind(&self) -> &'static str;

    /// Whether a DROP verdict keeps the packet from being delivered.
    fn enforces_verdicts(&self) -> bool {
        true
    }

    /// Framing this hook delivers, when it dictates one.
    fn link_type(&self) -> Option<LinkType> {
        None
    }
}

/// The platform's packet hook of the given kind.
pub fn platform_hook(kind: HookKind, queue_num: u16) -> Result<Box<dyn IngressHook>, SetupError> {
    #[cfg(target_os = "linux")]
    {
        let hook: Box<dyn IngressHook> = match kind {
            HookKind::Nfqueue => Box::new(NfQueueHook::new(queue_num)),
            HookKind::AfPacket => Box::new(AfPacketHook::new()),
        };
        Ok(hook)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = queue_num;
        Err(SetupError::Unsupported(format!(
            "{kind} hooks are only available on Linux"
        )))
    }
}

struct Attached {
    interface: String,
    classifier: Arc<dyn Classify>,
}

/// Hook whose packets come from the caller.
pub struct InProcessHook {
    state: Arc<ArcSwapOption<Attached>>,
    interfaces: Option<Vec<String>>,
}

impl InProcessHook {
    /// Accepts any non-empty interface name.
    pub fn new() -> Self {
        Self {
            state: Arc::new(ArcSwapOption::empty()),
            interfaces: None,
        }
    }

    /// Accepts only the listed interface names.
    pub fn with_interfaces<I, S>(interfaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            state: Arc::new(ArcSwapOption::empty()),
            interfaces: Some(interfaces.into_iter().map(Into::into).collect()),
        }
    }

    /// Handle for delivering frames. Valid across attach/detach cycles.
    pub fn tap(&self) -> HookTap {
        HookTap {
            state: Arc::clone(&self.state),
        }
    }

    fn knows(&self, interface: &str) -> bool {
        match &self.interfaces {
            Some(known) => known.iter().any(|name| name == interface),
            None => !interface.is_empty(),
        }
    }
}

impl Default for InProcessHook {
    fn default() -> Self {
        Self::new()
    }
}

impl IngressHook for InProcessHook {
    fn attach(
        &mut self,
        interface: &str,
        classifier: Arc<dyn Classify>,
    ) -> Result<(), SetupError> {
        if let Some(current) = self.state.load().as_ref() {
            return Err(SetupError::AlreadyAttached {
                interface: current.interface.clone(),
            });
        }
        if !self.knows(interface) {
            return Err(SetupError::InterfaceNotFound {
                name: interface.to_owned(),
            });
        }
        self.state.store(Some(Arc::new(Attached {
            interface: interface.to_owned(),
            classifier,
        })));
        Ok(())
    }

    /// Waits for deliveries already inside the classifier.
    ///
    /// Must not be called from within `classify`.
    fn detach(&mut self) -> Result<(), SetupError> {
        let Some(mut previous) = self.state.swap(None) else {
            return Ok(());
        };
        // every in-flight HookTap::deliver holds a clone
        loop {
            match Arc::try_unwrap(previous) {
                Ok(_) => return Ok(()),
                Err(shared) => {
                    previous = shared;
                    thread::yield_now();
                }
            }
        }
    }

    fn is_attached(&self) -> bool {
        self.state.load().is_some()
    }

    fn kind(&self) -> &'static str {
        "in-process"
    }
}

/// Delivers frames to whatever classifier an [`InProcessHook`] holds.
#[derive(Clone)]
pub struct HookTap {
    state: Arc<ArcSwapOption<Attached>>,
}

impl HookTap {
    /// Classifies one frame. `None` when the hook is detached.
    pub fn deliver(&self, frame: &[u8]) -> Option<Action> {
        self.state
            .load_full()
            .map(|attached| attached.classifier.classify(frame))
    }

    pub fn is_attached(&self) -> bool {
        self.state.load().is_some()
    }

    /// Interface the hook is attached to.
    pub fn interface(&self) -> Option<String> {
        self.state.load().as_ref().map(|a| a.interface.clone())
    }
}
