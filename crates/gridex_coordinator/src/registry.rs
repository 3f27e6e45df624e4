//! In-memory registry of currently connected workers.
//!
//! The store is the durable truth; this map only tracks live sessions and
//! their outbound channels. Entries are updated copy-out/copy-in under a
//! short-lived lock which is never held across a store call.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use gridex_protocol::types::{CoordinatorMessage, WorkerSpecs, WorkerStatus};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Connected worker state. `sender` feeds the session's writer task.
#[derive(Debug, Clone)]
pub struct ConnectedWorker {
    pub worker_id: String,
    pub owner_id: Option<String>,
    pub specs: WorkerSpecs,
    pub status: WorkerStatus,
    pub assigned_job_id: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub sender: mpsc::Sender<CoordinatorMessage>,
}

#[derive(Default)]
pub struct Registry {
    workers: Mutex<HashMap<String, ConnectedWorker>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session. A reconnect replaces the stale entry for the same
    /// worker id.
    pub fn attach(&self, worker: ConnectedWorker) {
        let mut workers = self.workers.lock().expect("registry lock");
        if workers.insert(worker.worker_id.clone(), worker).is_some() {
            warn!("Registry replaced a stale session for a reconnecting worker");
        }
    }

    /// Record a heartbeat. The reported status is honored except that a
    /// coordinator-side `busy` (an assignment in flight) is never
    /// downgraded by a worker still reporting idle.
    pub fn heartbeat(&self, worker_id: &str, reported: WorkerStatus, now: DateTime<Utc>) -> bool {
        let mut workers = self.workers.lock().expect("registry lock");
        let Some(entry) = workers.get_mut(worker_id) else {
            debug!("Heartbeat from unregistered worker {}", worker_id);
            return false;
        };
        entry.last_heartbeat = now;
        if entry.assigned_job_id.is_some() {
            entry.status = WorkerStatus::Busy;
        } else if reported != WorkerStatus::Offline {
            entry.status = reported;
        }
        true
    }

    /// Mark a worker busy on a job. Called only after the assignment
    /// transaction commits.
    pub fn begin_assignment(&self, worker_id: &str, job_id: &str) {
        let mut workers = self.workers.lock().expect("registry lock");
        if let Some(entry) = workers.get_mut(worker_id) {
            entry.status = WorkerStatus::Busy;
            entry.assigned_job_id = Some(job_id.to_string());
        }
    }

    /// Clear the busy mark after settle or rollback. Busy goes back to
    /// idle; an offline mark is left alone.
    pub fn clear_assignment(&self, worker_id: &str) {
        let mut workers = self.workers.lock().expect("registry lock");
        if let Some(entry) = workers.get_mut(worker_id) {
            entry.assigned_job_id = None;
            if entry.status == WorkerStatus::Busy {
                entry.status = WorkerStatus::Idle;
            }
        }
    }

    /// Workers whose last heartbeat predates `cutoff` and that are not
    /// already marked offline. The reaper sweeps these; a half-open socket
    /// never closes, so the heartbeat gap is the only signal.
    pub fn stale(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let workers = self.workers.lock().expect("registry lock");
        workers
            .values()
            .filter(|w| w.status != WorkerStatus::Offline && w.last_heartbeat < cutoff)
            .map(|w| w.worker_id.clone())
            .collect()
    }

    /// Flip a heartbeat-stale entry to offline. The entry stays until its
    /// session tears down; a late heartbeat brings it back.
    pub fn mark_offline(&self, worker_id: &str) {
        let mut workers = self.workers.lock().expect("registry lock");
        if let Some(entry) = workers.get_mut(worker_id) {
            entry.status = WorkerStatus::Offline;
        }
    }

    /// Remove a session. Returns the entry so the caller can see any job
    /// that was still assigned.
    pub fn detach(&self, worker_id: &str) -> Option<ConnectedWorker> {
        let mut workers = self.workers.lock().expect("registry lock");
        workers.remove(worker_id)
    }

    pub fn get(&self, worker_id: &str) -> Option<ConnectedWorker> {
        let workers = self.workers.lock().expect("registry lock");
        workers.get(worker_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<ConnectedWorker> {
        let workers = self.workers.lock().expect("registry lock");
        workers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.workers.lock().expect("registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn entry(id: &str) -> (ConnectedWorker, mpsc::Receiver<CoordinatorMessage>) {
        let (tx, rx) = mpsc::channel(4);
        (
            ConnectedWorker {
                worker_id: id.to_string(),
                owner_id: None,
                specs: WorkerSpecs {
                    cpu_cores: 2,
                    ram_gb: 2.0,
                    gpu_name: None,
                    docker_available: false,
                    tags: BTreeMap::new(),
                },
                status: WorkerStatus::Idle,
                assigned_job_id: None,
                last_heartbeat: Utc::now(),
                sender: tx,
            },
            rx,
        )
    }

    #[test]
    fn attach_get_detach() {
        let registry = Registry::new();
        let (worker, _rx) = entry("w1");
        registry.attach(worker);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("w1").is_some());
        assert!(registry.detach("w1").is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn heartbeat_never_downgrades_inflight_busy() {
        let registry = Registry::new();
        let (worker, _rx) = entry("w1");
        registry.attach(worker);

        registry.begin_assignment("w1", "job-1");
        // Worker hasn't seen the job yet and still reports idle.
        assert!(registry.heartbeat("w1", WorkerStatus::Idle, Utc::now()));
        let entry = registry.get("w1").unwrap();
        assert_eq!(entry.status, WorkerStatus::Busy);
        assert_eq!(entry.assigned_job_id.as_deref(), Some("job-1"));

        registry.clear_assignment("w1");
        assert!(registry.heartbeat("w1", WorkerStatus::Busy, Utc::now()));
        assert_eq!(registry.get("w1").unwrap().status, WorkerStatus::Busy);
    }

    #[test]
    fn heartbeat_from_unknown_worker_is_reported() {
        let registry = Registry::new();
        assert!(!registry.heartbeat("ghost", WorkerStatus::Idle, Utc::now()));
    }

    #[test]
    fn stale_returns_heartbeat_gapped_workers() {
        let registry = Registry::new();
        let (mut silent, _rx1) = entry("w1");
        silent.last_heartbeat = Utc::now() - chrono::Duration::seconds(600);
        registry.attach(silent);
        let (fresh, _rx2) = entry("w2");
        registry.attach(fresh);

        let cutoff = Utc::now() - chrono::Duration::seconds(60);
        assert_eq!(registry.stale(cutoff), vec!["w1".to_string()]);

        registry.mark_offline("w1");
        assert_eq!(registry.get("w1").unwrap().status, WorkerStatus::Offline);
        // Already-offline entries are not reported again.
        assert!(registry.stale(cutoff).is_empty());
    }

    #[test]
    fn clear_assignment_preserves_an_offline_mark() {
        let registry = Registry::new();
        let (worker, _rx) = entry("w1");
        registry.attach(worker);

        registry.begin_assignment("w1", "job-1");
        registry.mark_offline("w1");
        registry.clear_assignment("w1");

        let entry = registry.get("w1").unwrap();
        assert_eq!(entry.status, WorkerStatus::Offline);
        assert!(entry.assigned_job_id.is_none());

        // A late heartbeat revives the entry.
        assert!(registry.heartbeat("w1", WorkerStatus::Idle, Utc::now()));
        assert_eq!(registry.get("w1").unwrap().status, WorkerStatus::Idle);
    }

    #[test]
    fn reconnect_replaces_stale_session() {
        let registry = Registry::new();
        let (first, _rx1) = entry("w1");
        registry.attach(first);
        registry.begin_assignment("w1", "job-1");

        let (second, _rx2) = entry("w1");
        registry.attach(second);
        assert_eq!(registry.len(), 1);
        assert!(registry.get("w1").unwrap().assigned_job_id.is_none());
    }
}
