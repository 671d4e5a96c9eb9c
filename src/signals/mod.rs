use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[cfg(unix)]
use signal_hook::SigId;
#[cfg(unix)]
use signal_hook::consts::signal::{SIGINT, SIGTERM, SIGTSTP};
#[cfg(unix)]
use signal_hook::flag;
#[cfg(unix)]
use signal_hook::low_level::unregister;

/// What the worker should do in response to an external signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalAction {
    Stop,
    Quiet,
}

/// Source of stop/quiet requests, installed for the lifetime of one
/// `Worker::work` call and polled by the worker's signal watcher.
pub trait SignalSource: Send + Sync {
    fn install(&self) -> io::Result<()>;
    fn poll(&self) -> Option<SignalAction>;
    fn uninstall(&self);
}

#[derive(Default)]
struct OsFlags {
    stop: Arc<AtomicBool>,
    quiet: Arc<AtomicBool>,
    #[cfg(unix)]
    ids: Vec<SigId>,
    #[cfg(unix)]
    terminators: Vec<SigId>,
}

/// SIGTERM and SIGINT request a stop, SIGTSTP requests quiet.
///
/// A stop request stays pending once seen. Any further SIGTERM or SIGINT,
/// including one that arrives after [`SignalSource::uninstall`], takes the
/// default action and terminates the process. Those terminating handlers are
/// only dropped by the next `install`.
#[derive(Default)]
pub struct OsSignals {
    installed: Mutex<Option<OsFlags>>,
    #[cfg(unix)]
    lingering: Mutex<Vec<SigId>>,
}

impl OsSignals {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SignalSource for OsSignals {
    fn install(&self) -> io::Result<()> {
        let mut installed = self.installed.lock().expect("os signals lock poisoned");
        if installed.is_some() {
            return Ok(());
        }

        #[allow(unused_mut)]
        let mut flags = OsFlags::default();
        #[cfg(unix)]
        {
            for id in self
                .lingering
                .lock()
                .expect("os signals lock poisoned")
                .drain(..)
            {
                unregister(id);
            }
            // Registered first so they see the flag as it was before this
            // delivery set it.
            for signal in [SIGTERM, SIGINT] {
                flags
                    .terminators
                    .push(flag::register_conditional_default(signal, Arc::clone(&flags.stop))?);
            }
            flags.ids.push(flag::register(SIGTERM, Arc::clone(&flags.stop))?);
            flags.ids.push(flag::register(SIGINT, Arc::clone(&flags.stop))?);
            flags.ids.push(flag::register(SIGTSTP, Arc::clone(&flags.quiet))?);
        }
        *installed = Some(flags);
        Ok(())
    }

    fn poll(&self) -> Option<SignalAction> {
        let installed = self.installed.lock().expect("os signals lock poisoned");
        let flags = installed.as_ref()?;
        if flags.stop.load(Ordering::SeqCst) {
            return Some(SignalAction::Stop);
        }
        if flags.quiet.swap(false, Ordering::SeqCst) {
            return Some(SignalAction::Quiet);
        }
        None
    }

    fn uninstall(&self) {
        let flags = self
            .installed
            .lock()
            .expect("os signals lock poisoned")
            .take();
        #[cfg(unix)]
        if let Some(mut flags) = flags {
            for id in flags.ids.drain(..) {
                unregister(id);
            }
            flags.stop.store(true, Ordering::SeqCst);
            self.lingering
                .lock()
                .expect("os signals lock poisoned")
                .append(&mut flags.terminators);
        }
        #[cfg(not(unix))]
        drop(flags);
    }
}

impl Drop for OsSignals {
    fn drop(&mut self) {
        self.uninstall();
    }
}

/// In-process signal source; [`ManualSignals::raise`] queues an action that
/// is delivered only while installed.
#[derive(Default)]
pub struct ManualSignals {
    installed: AtomicBool,
    installs: AtomicUsize,
    pending: Mutex<VecDeque<SignalAction>>,
}

impl ManualSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self, action: SignalAction) {
        self.pending
            .lock()
            .expect("manual signals lock poisoned")
            .push_back(action);
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    pub fn install_count(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }
}

impl SignalSource for ManualSignals {
    fn install(&self) -> io::Result<()> {
        self.installed.store(true, Ordering::SeqCst);
        self.installs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn poll(&self) -> Option<SignalAction> {
        if !self.is_installed() {
            return None;
        }
        self.pending
            .lock()
            .expect("manual signals lock poisoned")
            .pop_front()
    }

    fn uninstall(&self) {
        self.installed.store(false, Ordering::SeqCst);
    }
}
