//! Script queue policy.
//!
//! Pure bookkeeping: which job runs next, what happens on exit, when to
//! retry and when to give up. The [`ScriptRunner`](crate::ScriptRunner)
//! supplies real processes; tests supply a synthetic clock.

use std::collections::VecDeque;

use vigil_types::constants::{
    SCRIPT_MAX_RETRY, SCRIPT_MAX_RUNNING, SCRIPT_MAX_RUNTIME_MS, SCRIPT_QUEUE_MAX,
    SCRIPT_RETRY_DELAY_MS,
};

/// One queued or running script job.
#[derive(Debug, Clone)]
pub struct ScriptJob {
    pub id: u64,
    /// Full argument vector; `argv[0]` is the executable path.
    pub argv: Vec<String>,
    /// Attempts so far (0 for a job that has never run).
    pub retry: u32,
    /// Earliest time the job may be dispatched.
    pub start_after: u64,
    pub running: bool,
    /// Pid of the child once spawned.
    pub pid: Option<u32>,
    /// Dispatch time of the current attempt.
    pub started_at: u64,
    /// A kill was already issued for this attempt.
    pub kill_sent: bool,
}

/// How a reaped job was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitDisposition {
    /// Requeued for another attempt after the given delay.
    Retried { delay_ms: u64 },
    /// Removed from the queue. `clean` is true for exit code 0.
    Finished { clean: bool },
}

/// FIFO of script jobs, bounded to [`SCRIPT_QUEUE_MAX`].
#[derive(Debug, Default)]
pub struct ScriptQueue {
    jobs: VecDeque<ScriptJob>,
    next_id: u64,
}

impl ScriptQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn running_count(&self) -> usize {
        self.jobs.iter().filter(|j| j.running).count()
    }

    pub fn jobs(&self) -> impl Iterator<Item = &ScriptJob> {
        self.jobs.iter()
    }

    /// Enqueues a job. Over the bound, the oldest non-running job is
    /// dropped to make room; its argv is returned so the caller can log it.
    pub fn push(&mut self, argv: Vec<String>, now: u64) -> Option<Vec<String>> {
        let dropped = if self.jobs.len() >= SCRIPT_QUEUE_MAX {
            self.jobs
                .iter()
                .position(|j| !j.running)
                .and_then(|idx| self.jobs.remove(idx))
                .map(|j| j.argv)
        } else {
            None
        };

        self.next_id += 1;
        self.jobs.push_back(ScriptJob {
            id: self.next_id,
            argv,
            retry: 0,
            start_after: now,
            running: false,
            pid: None,
            started_at: 0,
            kill_sent: false,
        });
        dropped
    }

    /// The oldest dispatchable job, if the running cap allows one more.
    pub fn next_runnable(&self, now: u64) -> Option<u64> {
        if self.running_count() >= SCRIPT_MAX_RUNNING {
            return None;
        }
        self.jobs
            .iter()
            .find(|j| !j.running && j.start_after <= now)
            .map(|j| j.id)
    }

    /// Marks a job as dispatched. The pid arrives via [`Self::set_pid`]
    /// once the spawn succeeds.
    pub fn mark_running(&mut self, id: u64, now: u64) {
        if let Some(job) = self.job_mut(id) {
            job.running = true;
            job.started_at = now;
            job.retry += 1;
            job.kill_sent = false;
        }
    }

    pub fn set_pid(&mut self, id: u64, pid: Option<u32>) {
        if let Some(job) = self.job_mut(id) {
            job.pid = pid;
        }
    }

    /// Spawn failed: the attempt is abandoned but the job stays queued for
    /// the next dispatch round.
    pub fn spawn_failed(&mut self, id: u64) {
        if let Some(job) = self.job_mut(id) {
            job.running = false;
            job.pid = None;
        }
    }

    /// Resolves a terminated child, looked up by pid.
    ///
    /// Death by signal or exit code 1 is retried with exponential backoff
    /// (`base × 2^(retry-1)`) until the retry cap; anything else removes
    /// the job.
    pub fn reap(
        &mut self,
        pid: u32,
        exit_code: Option<i32>,
        by_signal: bool,
        now: u64,
    ) -> Option<(ScriptJob, ExitDisposition)> {
        let idx = self
            .jobs
            .iter()
            .position(|j| j.running && j.pid == Some(pid))?;

        let retryable = by_signal || exit_code == Some(1);
        let job = &mut self.jobs[idx];

        if retryable && job.retry < SCRIPT_MAX_RETRY {
            let delay_ms = SCRIPT_RETRY_DELAY_MS * (1 << (job.retry - 1));
            job.running = false;
            job.pid = None;
            job.start_after = now + delay_ms;
            let snapshot = job.clone();
            Some((snapshot, ExitDisposition::Retried { delay_ms }))
        } else {
            let job = self.jobs.remove(idx).expect("index just found");
            let clean = !by_signal && exit_code == Some(0);
            Some((job, ExitDisposition::Finished { clean }))
        }
    }

    /// Running jobs past the runtime cap that have not been killed yet.
    pub fn overtime(&self, now: u64) -> Vec<(u64, u32)> {
        self.jobs
            .iter()
            .filter(|j| {
                j.running
                    && !j.kill_sent
                    && j.pid.is_some()
                    && now.saturating_sub(j.started_at) > SCRIPT_MAX_RUNTIME_MS
            })
            .map(|j| (j.id, j.pid.expect("filtered on pid")))
            .collect()
    }

    pub fn mark_kill_sent(&mut self, id: u64) {
        if let Some(job) = self.job_mut(id) {
            job.kill_sent = true;
        }
    }

    fn job_mut(&mut self, id: u64) -> Option<&mut ScriptJob> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(tag: &str) -> Vec<String> {
        vec!["/bin/true".to_string(), tag.to_string()]
    }

    #[test]
    fn dispatch_is_fifo() {
        let mut q = ScriptQueue::new();
        q.push(argv("a"), 100);
        q.push(argv("b"), 100);

        let first = q.next_runnable(100).unwrap();
        q.mark_running(first, 100);
        let second = q.next_runnable(100).unwrap();
        assert_ne!(first, second);
        assert_eq!(q.jobs().find(|j| j.id == first).unwrap().argv[1], "a");
    }

    #[test]
    fn jobs_wait_for_their_start_time() {
        let mut q = ScriptQueue::new();
        q.push(argv("a"), 100);
        q.job_mut(1).unwrap().start_after = 500;
        assert_eq!(q.next_runnable(100), None);
        assert_eq!(q.next_runnable(500), Some(1));
    }

    #[test]
    fn running_cap_is_sixteen() {
        let mut q = ScriptQueue::new();
        for i in 0..20 {
            q.push(argv(&i.to_string()), 0);
        }
        for _ in 0..SCRIPT_MAX_RUNNING {
            let id = q.next_runnable(0).unwrap();
            q.mark_running(id, 0);
        }
        assert_eq!(q.running_count(), SCRIPT_MAX_RUNNING);
        assert_eq!(q.next_runnable(0), None);
    }

    #[test]
    fn queue_cap_drops_oldest_non_running() {
        let mut q = ScriptQueue::new();
        q.push(argv("first"), 0);
        let running_id = q.next_runnable(0).unwrap();
        q.mark_running(running_id, 0);

        q.push(argv("second"), 0);
        for i in 0..SCRIPT_QUEUE_MAX - 2 {
            q.push(argv(&format!("fill-{i}")), 0);
        }
        assert_eq!(q.len(), SCRIPT_QUEUE_MAX);

        // Next push evicts "second": it is the oldest job not running.
        let dropped = q.push(argv("overflow"), 0).unwrap();
        assert_eq!(dropped[1], "second");
        assert_eq!(q.len(), SCRIPT_QUEUE_MAX);
        assert!(q.jobs().any(|j| j.id == running_id));
    }

    #[test]
    fn exit_one_retries_with_doubling_backoff() {
        let mut q = ScriptQueue::new();
        q.push(argv("flaky"), 0);

        let mut now = 0;
        let mut delays = Vec::new();
        for _ in 0..3 {
            let id = q.next_runnable(now).unwrap();
            q.mark_running(id, now);
            q.set_pid(id, Some(4242));
            let (_, disposition) = q.reap(4242, Some(1), false, now).unwrap();
            let ExitDisposition::Retried { delay_ms } = disposition else {
                panic!("expected retry");
            };
            delays.push(delay_ms);
            now += delay_ms;
        }
        assert_eq!(delays, [30_000, 60_000, 120_000]);

        // Fourth attempt succeeds and the queue drains without error.
        let id = q.next_runnable(now).unwrap();
        q.mark_running(id, now);
        q.set_pid(id, Some(4242));
        let (_, disposition) = q.reap(4242, Some(0), false, now).unwrap();
        assert_eq!(disposition, ExitDisposition::Finished { clean: true });
        assert!(q.is_empty());
    }

    #[test]
    fn signal_death_is_retryable() {
        let mut q = ScriptQueue::new();
        q.push(argv("killed"), 0);
        let id = q.next_runnable(0).unwrap();
        q.mark_running(id, 0);
        q.set_pid(id, Some(7));

        let (_, disposition) = q.reap(7, None, true, 0).unwrap();
        assert!(matches!(disposition, ExitDisposition::Retried { .. }));
    }

    #[test]
    fn exit_code_two_is_removed_unclean() {
        let mut q = ScriptQueue::new();
        q.push(argv("broken"), 0);
        let id = q.next_runnable(0).unwrap();
        q.mark_running(id, 0);
        q.set_pid(id, Some(7));

        let (_, disposition) = q.reap(7, Some(2), false, 0).unwrap();
        assert_eq!(disposition, ExitDisposition::Finished { clean: false });
        assert!(q.is_empty());
    }

    #[test]
    fn retry_cap_removes_the_job() {
        let mut q = ScriptQueue::new();
        q.push(argv("hopeless"), 0);

        let mut now = 0;
        for attempt in 1..=SCRIPT_MAX_RETRY {
            let id = q.next_runnable(now).unwrap();
            q.mark_running(id, now);
            q.set_pid(id, Some(9));
            let (_, disposition) = q.reap(9, Some(1), false, now).unwrap();
            if attempt < SCRIPT_MAX_RETRY {
                let ExitDisposition::Retried { delay_ms } = disposition else {
                    panic!("expected retry on attempt {attempt}");
                };
                now += delay_ms;
            } else {
                assert_eq!(disposition, ExitDisposition::Finished { clean: false });
            }
        }
        assert!(q.is_empty());
    }

    #[test]
    fn overtime_reports_each_attempt_once() {
        let mut q = ScriptQueue::new();
        q.push(argv("slow"), 0);
        let id = q.next_runnable(0).unwrap();
        q.mark_running(id, 0);
        q.set_pid(id, Some(11));

        assert!(q.overtime(SCRIPT_MAX_RUNTIME_MS).is_empty());
        let over = q.overtime(SCRIPT_MAX_RUNTIME_MS + 1);
        assert_eq!(over, vec![(id, 11)]);
        q.mark_kill_sent(id);
        assert!(q.overtime(SCRIPT_MAX_RUNTIME_MS + 1).is_empty());
    }

    #[test]
    fn spawn_failure_leaves_job_queued() {
        let mut q = ScriptQueue::new();
        q.push(argv("a"), 0);
        let id = q.next_runnable(0).unwrap();
        q.mark_running(id, 0);
        q.spawn_failed(id);

        assert_eq!(q.running_count(), 0);
        assert_eq!(q.next_runnable(0), Some(id));
    }
}
