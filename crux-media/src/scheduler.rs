use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

/// FIFO admission gate in front of the transcode and transfer stages.
///
/// A job holds a slot from the moment it leaves pending until it reaches
/// a terminal status. Queue mutations happen under one lock so a burst of
/// submissions cannot admit more than the configured ceiling.
#[derive(Debug)]
pub struct AdmissionScheduler {
    max_active: usize,
    state: Mutex<SchedulerState>,
}

#[derive(Debug, Default)]
struct SchedulerState {
    active: HashSet<String>,
    pending: VecDeque<String>,
}

impl AdmissionScheduler {
    pub fn new(max_active: usize) -> Self {
        Self {
            max_active: max_active.max(1),
            state: Mutex::new(SchedulerState::default()),
        }
    }

    /// Claims a slot if one is free. Callers that get `false` park the
    /// job with [`enqueue`](Self::enqueue).
    pub fn try_admit(&self, session_id: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.active.len() >= self.max_active {
            return false;
        }
        state.active.insert(session_id.to_string());
        true
    }

    pub fn enqueue(&self, session_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.pending.push_back(session_id.to_string());
    }

    /// Releases the job's slot and promotes queued jobs in arrival order.
    /// Returns the session ids that just gained a slot; the caller starts
    /// them.
    pub fn on_job_terminal(&self, session_id: &str) -> Vec<String> {
        let mut state = self.state.lock().unwrap();
        state.active.remove(session_id);
        state.pending.retain(|queued| queued != session_id);

        let mut admitted = Vec::new();
        while state.active.len() < self.max_active {
            match state.pending.pop_front() {
                Some(next) => {
                    state.active.insert(next.clone());
                    admitted.push(next);
                }
                None => break,
            }
        }
        admitted
    }

    /// Drops a queued job before it gains a slot. Returns whether the job
    /// was still waiting.
    pub fn remove_pending(&self, session_id: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let before = state.pending.len();
        state.pending.retain(|queued| queued != session_id);
        state.pending.len() < before
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().unwrap().active.len()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }
}
