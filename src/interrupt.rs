//! Scoped SIGINT handling.
//!
//! The OS hook is installed once; it dispatches to the innermost handler
//! pushed by a live [`InterruptScope`]. Dropping the scope restores whatever
//! was active before it, and with no scope alive the process exits.

use crate::error::{HsslError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tracing::warn;

type Handler = Arc<dyn Fn() + Send + Sync>;

static HANDLERS: Mutex<Vec<(u64, Handler)>> = Mutex::new(Vec::new());
static NEXT_ID: AtomicU64 = AtomicU64::new(0);
static HOOK: OnceLock<std::result::Result<(), String>> = OnceLock::new();

/// Exit status used when SIGINT arrives with no scoped handler.
const INTERRUPTED_EXIT_CODE: i32 = 130;

fn ensure_hook() -> Result<()> {
    HOOK.get_or_init(|| ctrlc::set_handler(dispatch).map_err(|err| err.to_string()))
        .clone()
        .map_err(HsslError::Signal)
}

/// Run the innermost scoped handler, or exit if there is none.
pub fn dispatch() {
    let handler = HANDLERS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .last()
        .map(|(_, handler)| handler.clone());
    match handler {
        Some(handler) => handler(),
        None => {
            warn!("interrupted");
            std::process::exit(INTERRUPTED_EXIT_CODE);
        }
    }
}

/// Guard keeping a SIGINT handler active for its lifetime.
#[must_use = "the handler is removed when the scope is dropped"]
pub struct InterruptScope {
    id: u64,
}

impl InterruptScope {
    pub fn install(handler: impl Fn() + Send + Sync + 'static) -> Result<Self> {
        ensure_hook()?;
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        HANDLERS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(handler)));
        Ok(Self { id })
    }
}

impl Drop for InterruptScope {
    fn drop(&mut self) {
        HANDLERS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(id, _)| *id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn innermost_scope_handles_and_outer_is_restored() {
        let outer_calls = Arc::new(AtomicUsize::new(0));
        let inner_calls = Arc::new(AtomicUsize::new(0));

        let outer = {
            let calls = outer_calls.clone();
            InterruptScope::install(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        };
        {
            let calls = inner_calls.clone();
            let _inner = InterruptScope::install(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
            dispatch();
            assert_eq!(inner_calls.load(Ordering::SeqCst), 1);
            assert_eq!(outer_calls.load(Ordering::SeqCst), 0);
        }

        dispatch();
        assert_eq!(outer_calls.load(Ordering::SeqCst), 1);
        assert_eq!(inner_calls.load(Ordering::SeqCst), 1);
        drop(outer);
    }
}
