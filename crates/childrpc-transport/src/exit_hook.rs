//! Process-wide exit hooks
//!
//! Rust has no `atexit` equivalent that runs for every way a program can
//! end, so the host opts in: it keeps an [`ExitHookGuard`] alive in `main`
//! (or calls [`run_exit_hooks`] from its own shutdown path) and every hook
//! registered in the meantime runs exactly once when that happens.
//!
//! [`ProcessSupervisor`](crate::subprocess::ProcessSupervisor) registers its
//! `close` here when started with `auto_terminate_at_exit = true`, so a
//! child is not orphaned when the host exits without closing it.
//!
//! # Example
//!
//! ```no_run
//! # #[tokio::main]
//! # async fn main() {
//! let _exit_hooks = childrpc_transport::exit_hook::install();
//! // ... start channels with auto_terminate_at_exit = true ...
//! # }
//! // every still-running child is closed here
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

type ExitHook = Box<dyn FnOnce() + Send + 'static>;

/// Identifies a registered hook so it can be removed again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static HOOKS: OnceLock<Mutex<Vec<(HookId, ExitHook)>>> = OnceLock::new();

fn hooks() -> MutexGuard<'static, Vec<(HookId, ExitHook)>> {
    HOOKS
        .get_or_init(|| Mutex::new(Vec::new()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Register a hook to run at host shutdown
pub fn register(hook: impl FnOnce() + Send + 'static) -> HookId {
    let id = HookId(NEXT_ID.fetch_add(1, Ordering::Relaxed));
    hooks().push((id, Box::new(hook)));
    id
}

/// Remove a previously registered hook without running it.
///
/// Returns `false` if the hook already ran or was never registered.
pub fn unregister(id: HookId) -> bool {
    let removed = {
        let mut hooks = hooks();
        hooks
            .iter()
            .position(|(hook_id, _)| *hook_id == id)
            .map(|index| hooks.remove(index))
    };
    // Dropped outside the lock: the closure's captures may run arbitrary Drop code
    removed.is_some()
}

/// Whether a hook is still pending
pub fn is_registered(id: HookId) -> bool {
    hooks().iter().any(|(hook_id, _)| *hook_id == id)
}

/// Run and drain every registered hook, most recently registered first.
///
/// Returns the number of hooks that ran. Hooks registered while this runs
/// are left for the next call.
pub fn run_exit_hooks() -> usize {
    let drained: Vec<(HookId, ExitHook)> = std::mem::take(&mut *hooks());
    let count = drained.len();

    tracing::debug!(count, "Running exit hooks");

    for (_, hook) in drained.into_iter().rev() {
        hook();
    }

    count
}

/// Runs all registered exit hooks when dropped.
#[must_use = "exit hooks run when the guard is dropped"]
#[derive(Debug)]
pub struct ExitHookGuard {
    _private: (),
}

impl Drop for ExitHookGuard {
    fn drop(&mut self) {
        run_exit_hooks();
    }
}

/// Create a guard that runs the exit hooks when it goes out of scope
pub fn install() -> ExitHookGuard {
    ExitHookGuard { _private: () }
}
