//! Process RSS soft-instrumentation gauge (spec §5 "Resource ceilings").
//!
//! This is observability, not enforcement: the engine never kills its own
//! process over memory pressure. `main.rs`'s background loop samples this
//! alongside the retention sweep and logs at `warn`/`error` when the fixed
//! budgets are crossed, the same cached-`System` pattern the teacher's
//! `performance/memory.rs` uses for its dashboard sampling.

use std::sync::OnceLock;

use parking_lot::Mutex;
use sysinfo::{Pid, ProcessRefreshKind, System};

/// CI mode enforces a tighter ceiling than local runs.
const CI_FAIL_MB: f64 = 1536.0;
/// Local warn threshold.
const LOCAL_WARN_MB: f64 = 2048.0;
/// Local fail threshold.
const LOCAL_FAIL_MB: f64 = 3072.0;

static CACHED_SYSTEM: OnceLock<Mutex<System>> = OnceLock::new();

/// Current process resident set size in MiB, or `None` if the OS didn't
/// report a process entry (e.g. under some sandboxes).
pub fn process_rss_mb() -> Option<f64> {
    let sys_mutex = CACHED_SYSTEM.get_or_init(|| Mutex::new(System::new()));
    let mut sys = sys_mutex.lock();
    let pid = Pid::from_u32(std::process::id());
    sys.refresh_processes_specifics(
        sysinfo::ProcessesToUpdate::Some(&[pid]),
        ProcessRefreshKind::new().with_memory(),
    );
    sys.process(pid)
        .map(|p| p.memory() as f64 / (1024.0 * 1024.0))
}

/// CI mode is detected the same way the rest of the Rust ecosystem detects
/// it: the `CI` environment variable CI runners set, not a bespoke `AF_*`
/// flag — spec §6's enumerated configuration surface doesn't name one.
fn ci_mode() -> bool {
    std::env::var("CI").map(|v| v != "0" && !v.is_empty()).unwrap_or(false)
}

fn thresholds() -> (f64, f64) {
    if ci_mode() {
        (CI_FAIL_MB, CI_FAIL_MB)
    } else {
        (LOCAL_WARN_MB, LOCAL_FAIL_MB)
    }
}

/// Sample RSS and log a `warn`/`error` if it crosses the relevant ceiling.
/// Call this periodically from a background loop; it's cheap (cached
/// `System`, single-process refresh) but not free, so don't call it
/// per-event.
pub fn check_rss_ceiling() {
    let Some(rss_mb) = process_rss_mb() else {
        return;
    };
    let (warn_mb, fail_mb) = thresholds();
    if rss_mb >= fail_mb {
        tracing::error!(rss_mb, fail_mb, ci = ci_mode(), "process RSS over the fail ceiling");
    } else if rss_mb >= warn_mb {
        tracing::warn!(rss_mb, warn_mb, ci = ci_mode(), "process RSS over the warn ceiling");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_rss_mb_returns_a_positive_sample() {
        let rss = process_rss_mb();
        assert!(rss.is_none() || rss.unwrap() > 0.0);
    }

    #[test]
    fn ci_mode_collapses_warn_and_fail_to_the_tighter_budget() {
        let previous = std::env::var("CI").ok();
        std::env::set_var("CI", "1");
        let (warn, fail) = thresholds();
        assert_eq!(warn, CI_FAIL_MB);
        assert_eq!(fail, CI_FAIL_MB);
        match previous {
            Some(v) => std::env::set_var("CI", v),
            None => std::env::remove_var("CI"),
        }
    }
}
