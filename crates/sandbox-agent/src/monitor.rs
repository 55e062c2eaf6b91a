//! Background memory sampling of the runtime's process tree.
//!
//! The monitor only observes. A breach is logged once per episode and the
//! last sample is exposed through `server_info`.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemorySample {
    pub rss_bytes: u64,
    pub processes: usize,
    pub sampled_at_unix_ms: u64,
}

/// Edge detector for the memory ceiling.
#[derive(Debug, Clone)]
pub struct BreachTracker {
    limit_bytes: Option<u64>,
    in_breach: bool,
}

impl BreachTracker {
    pub fn new(limit_bytes: Option<u64>) -> Self {
        Self {
            limit_bytes,
            in_breach: false,
        }
    }

    /// True only for the first sample of a breach episode.
    pub fn observe(&mut self, rss_bytes: u64) -> bool {
        let Some(limit) = self.limit_bytes else {
            return false;
        };
        let over = rss_bytes > limit;
        let started = over && !self.in_breach;
        if !over && self.in_breach {
            info!(rss_bytes, limit_bytes = limit, "memory back under limit");
        }
        self.in_breach = over;
        started
    }
}

pub struct ResourceMonitor {
    root: Pid,
    interval: Duration,
    tracker: BreachTracker,
}

impl ResourceMonitor {
    pub fn new(root_pid: u32, limit_bytes: Option<u64>, interval: Duration) -> Self {
        Self {
            root: Pid::from_u32(root_pid),
            interval,
            tracker: BreachTracker::new(limit_bytes),
        }
    }

    pub fn spawn(mut self) -> MonitorHandle {
        let latest = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&latest);
        let task = tokio::spawn(async move {
            let mut system = System::new();
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                let sample = sample_tree(&mut system, self.root);
                if self.tracker.observe(sample.rss_bytes) {
                    warn!(
                        rss_bytes = sample.rss_bytes,
                        processes = sample.processes,
                        limit_bytes = self.tracker.limit_bytes,
                        "memory limit exceeded"
                    );
                }
                debug!(rss_bytes = sample.rss_bytes, "memory sample");
                if let Ok(mut guard) = slot.lock() {
                    *guard = Some(sample);
                }
            }
        });
        MonitorHandle { latest, task }
    }
}

pub struct MonitorHandle {
    latest: Arc<Mutex<Option<MemorySample>>>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn latest(&self) -> Option<MemorySample> {
        self.latest.lock().ok().and_then(|guard| *guard)
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn sample_tree(system: &mut System, root: Pid) -> MemorySample {
    system.refresh_processes(ProcessesToUpdate::All, true);
    let (rss_bytes, processes) = process_tree_memory(system, root);
    let sampled_at_unix_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default();
    MemorySample {
        rss_bytes,
        processes,
        sampled_at_unix_ms,
    }
}

fn process_tree_memory(system: &System, root: Pid) -> (u64, usize) {
    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in system.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }

    let mut stack = vec![root];
    let mut seen: HashSet<Pid> = HashSet::new();
    while let Some(current) = stack.pop() {
        if !seen.insert(current) {
            continue;
        }
        if let Some(kids) = children.get(&current) {
            stack.extend(kids.iter().filter(|kid| !seen.contains(*kid)));
        }
    }

    seen.iter()
        .filter_map(|pid| system.process(*pid))
        .fold((0u64, 0usize), |(bytes, count), process| {
            (bytes.saturating_add(process.memory()), count + 1)
        })
}
