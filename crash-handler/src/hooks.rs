//! Embedder callbacks fired at fixed points of exception handling.
//!
//! A [`HookRegistry`] holds two single-slot callbacks:
//!
//! * the *dump event* callback runs as early as possible after a crash, right after the
//!   snapshot has been captured and before anything else happens to it;
//! * the *after dump* callback runs once report persistence has finished, whether or not it
//!   succeeded.
//!
//! Setting a callback requires `&mut HookRegistry`, so all callbacks have to be installed before
//! the registry is shared with a handler. Setting a slot twice replaces the earlier callback.
//! Callbacks run synchronously on the thread handling the fault and must not block for long.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use crash_handler_common::ProcessId;
use tracing::warn;
use uuid::Uuid;

/// What a callback is told about the run it is observing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DumpEvent {
    pub client_process_id: ProcessId,
    /// The report being written, once one exists.
    pub report_id: Option<Uuid>,
    /// Whether persistence succeeded. `None` before persistence has been attempted.
    pub succeeded: Option<bool>,
}

pub type UserCallback = Box<dyn Fn(&DumpEvent) + Send + Sync>;

#[derive(Default)]
pub struct HookRegistry {
    on_dump_event: Option<UserCallback>,
    after_dump: Option<UserCallback>,
}

impl HookRegistry {
    pub fn new() -> HookRegistry {
        Default::default()
    }

    pub fn set_on_dump_event<F>(&mut self, callback: F)
    where
        F: Fn(&DumpEvent) + Send + Sync + 'static,
    {
        self.on_dump_event = Some(Box::new(callback));
    }

    pub fn set_after_dump<F>(&mut self, callback: F)
    where
        F: Fn(&DumpEvent) + Send + Sync + 'static,
    {
        self.after_dump = Some(Box::new(callback));
    }

    pub fn run_on_dump_event(&self, event: &DumpEvent) {
        run_callback("dump event", self.on_dump_event.as_ref(), event);
    }

    pub fn run_after_dump(&self, event: &DumpEvent) {
        run_callback("after dump", self.after_dump.as_ref(), event);
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("on_dump_event", &self.on_dump_event.is_some())
            .field("after_dump", &self.after_dump.is_some())
            .finish()
    }
}

fn run_callback(slot: &str, callback: Option<&UserCallback>, event: &DumpEvent) {
    let Some(callback) = callback else {
        return;
    };
    // Callback panics never propagate into the handler.
    if panic::catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
        warn!("{} callback panicked, continuing", slot);
    }
}
