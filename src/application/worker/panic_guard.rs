use std::{cell::Cell, panic, sync::Once};

use tracing::{error, trace};

thread_local! {
    static IN_WORKER: Cell<bool> = const { Cell::new(false) };
    static SILENCED: Cell<bool> = const { Cell::new(false) };
}

static INSTALL_HOOK: Once = Once::new();

/// Install the process-wide panic hook once. Panics on worker threads are
/// logged instead of printed; every other thread keeps the previous hook.
pub(crate) fn install_hook() {
    INSTALL_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if SILENCED.with(Cell::get) {
                trace!(
                    target = "application::worker::panic_guard",
                    panic = %info,
                    "Contained panic during conversion"
                );
                return;
            }
            if IN_WORKER.with(Cell::get) {
                error!(
                    target = "application::worker::panic_guard",
                    panic = %info,
                    "Uncaught panic in conversion worker"
                );
                return;
            }
            previous(info);
        }));
    });
}

/// Route panics raised on the current thread through the worker hook.
pub(crate) fn mark_worker_thread() {
    IN_WORKER.with(|flag| flag.set(true));
}

/// Suppresses panic reporting on the current thread until dropped, then
/// restores whatever was in place before.
pub(crate) struct SilenceGuard {
    previous: bool,
}

impl SilenceGuard {
    pub(crate) fn engage() -> Self {
        let previous = SILENCED.with(|flag| flag.replace(true));
        Self { previous }
    }
}

impl Drop for SilenceGuard {
    fn drop(&mut self) {
        SILENCED.with(|flag| flag.set(self.previous));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn silenced() -> bool {
        SILENCED.with(Cell::get)
    }

    #[test]
    fn guards_restore_the_previous_state() {
        assert!(!silenced());
        {
            let _outer = SilenceGuard::engage();
            assert!(silenced());
            {
                let _inner = SilenceGuard::engage();
                assert!(silenced());
            }
            assert!(silenced());
        }
        assert!(!silenced());
    }

    #[test]
    fn installing_twice_is_harmless() {
        install_hook();
        install_hook();
        let _guard = SilenceGuard::engage();
        let caught = std::panic::catch_unwind(|| panic!("contained"));
        assert!(caught.is_err());
    }
}
