use core_affinity::CoreId;
use tracing::warn;

/// Number of logical CPUs visible to this process, falling back to 1 when
/// the topology cannot be queried.
pub fn logical_cpus() -> usize {
    core_affinity::get_core_ids().map_or(1, |ids| ids.len().max(1))
}

fn set_thread_affinity(core: usize) {
    if !core_affinity::set_for_current(CoreId { id: core }) {
        warn!(?core, "couldn't set core affinity");
    }
}

/// Per-worker setup run at the top of every worker thread.
/// Pins the thread when a core is given; execution continues unpinned if the
/// OS refuses.
pub fn thread_boot(core: Option<usize>) {
    if let Some(core) = core {
        set_thread_affinity(core);
    }
}
