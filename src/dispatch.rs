use tokio::sync::mpsc;

use crate::bridge::Bridge;

/// Work that must run on the tick, the only context allowed to touch bridge state.
pub type MainThreadAction = Box<dyn FnOnce(&mut Bridge) + Send + 'static>;

/// Upper bound on callbacks run per tick so a flood cannot stall the host.
const MAX_ACTIONS_PER_TICK: usize = 256;

/// Cloneable handle for posting closures to the tick from any thread or task.
#[derive(Clone, Debug)]
pub struct MainThreadDispatcher {
    tx: mpsc::UnboundedSender<MainThreadAction>,
}

impl MainThreadDispatcher {
    /// Returns false once the bridge has been dropped.
    pub fn post<F>(&self, action: F) -> bool
    where
        F: FnOnce(&mut Bridge) + Send + 'static,
    {
        self.tx.send(Box::new(action)).is_ok()
    }
}

pub(crate) struct ActionQueue {
    rx: mpsc::UnboundedReceiver<MainThreadAction>,
}

impl ActionQueue {
    pub(crate) fn drain(&mut self) -> Vec<MainThreadAction> {
        let mut out = Vec::new();
        while out.len() < MAX_ACTIONS_PER_TICK {
            match self.rx.try_recv() {
                Ok(action) => out.push(action),
                Err(_) => break,
            }
        }
        out
    }
}

pub(crate) fn channel() -> (MainThreadDispatcher, ActionQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MainThreadDispatcher { tx }, ActionQueue { rx })
}
