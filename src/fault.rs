//! Fault injection for durability and replication testing.
//!
//! Faults are named knobs that production code consults at well-defined
//! points. A knob can be a plain switch, a countdown that fires a fixed
//! number of times, or carry a numeric parameter (a delay in seconds, an
//! LSN to corrupt). All knobs are disabled unless armed, either at runtime
//! from a test or through the `RILLDB_FAULT` environment variable
//! (comma-separated knob names).
//!
//! Knob checks are cheap when nothing is armed: a single relaxed atomic
//! load guards the slow path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

/// All defined fault knob names.
pub mod knobs {
    /// Fail the next segment rotation.
    pub const WAL_ROTATE: &str = "wal-rotate";
    /// Fail `sync()` before it reaches the WAL thread.
    pub const WAL_SYNC: &str = "wal-sync";
    /// Countdown: simulate out-of-space in preallocation N times.
    pub const WAL_FALLOCATE: &str = "wal-fallocate";
    /// Fail `write()` on arrival.
    pub const WAL_IO: &str = "wal-io";
    /// Param: sleep this many seconds at the head of batch processing.
    pub const WAL_DELAY: &str = "wal-delay";
    /// Param: when a row with this LSN is written, decrement its LSN.
    pub const WAL_BREAK_LSN: &str = "wal-break-lsn";
    /// Param: sleep this many seconds before each relay send.
    pub const RELAY_SEND_DELAY: &str = "relay-send-delay";
    /// Param: sleep this many seconds after each relay send.
    pub const RELAY_TIMEOUT: &str = "relay-timeout";
    /// Param: when the relay sends a row with this LSN, decrement it.
    pub const RELAY_BREAK_LSN: &str = "relay-break-lsn";
    /// Pretend the in-memory row window does not cover the position.
    pub const RELAY_MEMORY_IGNORE: &str = "relay-memory-ignore";
    /// Param: sleep this many seconds before the relay thread exits.
    pub const RELAY_EXIT_DELAY: &str = "relay-exit-delay";
    /// Param: override the heartbeat interval in seconds.
    pub const RELAY_REPORT_INTERVAL: &str = "relay-report-interval";

    /// All knob names, for diagnostics.
    pub fn all() -> &'static [&'static str] {
        &[
            WAL_ROTATE,
            WAL_SYNC,
            WAL_FALLOCATE,
            WAL_IO,
            WAL_DELAY,
            WAL_BREAK_LSN,
            RELAY_SEND_DELAY,
            RELAY_TIMEOUT,
            RELAY_BREAK_LSN,
            RELAY_MEMORY_IGNORE,
            RELAY_EXIT_DELAY,
            RELAY_REPORT_INTERVAL,
        ]
    }
}

#[derive(Debug, Clone, Copy)]
struct Knob {
    enabled: bool,
    /// Remaining firings for countdown knobs; `None` means unlimited.
    count: Option<u64>,
    /// Numeric parameter for delay/LSN knobs.
    param: f64,
}

impl Knob {
    fn armed() -> Self {
        Knob { enabled: true, count: None, param: 0.0 }
    }
}

static ANY_ARMED: AtomicBool = AtomicBool::new(false);

fn registry() -> &'static Mutex<HashMap<&'static str, Knob>> {
    static REGISTRY: OnceLock<Mutex<HashMap<&'static str, Knob>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map = HashMap::new();
        if let Ok(armed) = std::env::var("RILLDB_FAULT") {
            for name in armed.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                if let Some(known) = knobs::all().iter().find(|k| **k == name) {
                    map.insert(*known, Knob::armed());
                    ANY_ARMED.store(true, Ordering::Relaxed);
                }
            }
        }
        Mutex::new(map)
    })
}

/// Arm a plain switch knob.
pub fn arm(name: &'static str) {
    registry().lock().unwrap().insert(name, Knob::armed());
    ANY_ARMED.store(true, Ordering::Relaxed);
}

/// Arm a countdown knob that fires `count` times and then disarms.
pub fn arm_count(name: &'static str, count: u64) {
    let mut knob = Knob::armed();
    knob.count = Some(count);
    registry().lock().unwrap().insert(name, knob);
    ANY_ARMED.store(true, Ordering::Relaxed);
}

/// Arm a knob carrying a numeric parameter.
pub fn arm_param(name: &'static str, param: f64) {
    let mut knob = Knob::armed();
    knob.param = param;
    registry().lock().unwrap().insert(name, knob);
    ANY_ARMED.store(true, Ordering::Relaxed);
}

/// Disarm a knob.
pub fn disarm(name: &'static str) {
    registry().lock().unwrap().remove(name);
}

/// Disarm everything. Tests call this between scenarios.
pub fn disarm_all() {
    registry().lock().unwrap().clear();
    ANY_ARMED.store(false, Ordering::Relaxed);
}

/// Check a switch knob. Countdown knobs decrement and disarm at zero.
pub fn is_armed(name: &str) -> bool {
    if !ANY_ARMED.load(Ordering::Relaxed) {
        return false;
    }
    let mut map = registry().lock().unwrap();
    match map.get_mut(name) {
        Some(knob) if knob.enabled => match knob.count {
            None => true,
            Some(0) => {
                knob.enabled = false;
                false
            }
            Some(ref mut n) => {
                *n -= 1;
                if *n == 0 {
                    knob.enabled = false;
                }
                true
            }
        },
        _ => false,
    }
}

/// Read the parameter of an armed knob without consuming it.
pub fn param(name: &str) -> Option<f64> {
    if !ANY_ARMED.load(Ordering::Relaxed) {
        return None;
    }
    let map = registry().lock().unwrap();
    map.get(name).filter(|k| k.enabled).map(|k| k.param)
}

/// Sleep for the parameter of an armed delay knob, if any.
pub fn maybe_sleep(name: &str) {
    if let Some(secs) = param(name) {
        if secs > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(secs));
        }
    }
}

/// If the `name` knob is armed with a parameter equal to `lsn`, return the
/// corrupted replacement (`lsn - 1`).
pub fn maybe_break_lsn(name: &str, lsn: i64) -> Option<i64> {
    match param(name) {
        Some(p) if p as i64 == lsn => Some(lsn - 1),
        _ => None,
    }
}
