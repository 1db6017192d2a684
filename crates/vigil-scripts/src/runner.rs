//! Process execution for script jobs.

use std::collections::HashMap;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::{debug, warn};
use vigil_types::{Event, EventLevel};

use crate::queue::{ExitDisposition, ScriptJob, ScriptQueue};

/// Owns the script queue and the child processes spawned for it.
///
/// Single-threaded like the rest of the supervisor: [`ScriptRunner::tick`]
/// is called from the timer loop and performs one round of reap, timeout
/// kill, and dispatch.
#[derive(Debug, Default)]
pub struct ScriptRunner {
    queue: ScriptQueue,
    children: HashMap<u64, Child>,
}

/// Snapshot of one queued or running job, for the operator surface.
#[derive(Debug, Clone)]
pub struct PendingScript {
    pub argv: Vec<String>,
    pub running: bool,
    pub pid: Option<u32>,
    pub retry: u32,
    /// Milliseconds of runtime (running) or until eligible (queued).
    pub ms: u64,
}

impl ScriptRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a job for execution.
    pub fn schedule(&mut self, argv: Vec<String>, now: u64) {
        debug!(script = %argv.join(" "), "scheduling script");
        if let Some(dropped) = self.queue.push(argv, now) {
            warn!(script = %dropped.join(" "), "script queue full, dropped oldest job");
        }
    }

    /// One scheduler round. Returned events are script failures that the
    /// caller should log and fan out like any other engine event.
    pub fn tick(&mut self, now: u64) -> Vec<Event> {
        let mut events = Vec::new();
        self.reap(now, &mut events);
        self.kill_overtime(now);
        self.dispatch(now, &mut events);
        events
    }

    /// Snapshot for `PENDING-SCRIPTS`.
    pub fn pending(&self, now: u64) -> Vec<PendingScript> {
        self.queue
            .jobs()
            .map(|job| PendingScript {
                argv: job.argv.clone(),
                running: job.running,
                pid: job.pid,
                retry: job.retry,
                ms: if job.running {
                    now.saturating_sub(job.started_at)
                } else {
                    job.start_after.saturating_sub(now)
                },
            })
            .collect()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn running_count(&self) -> usize {
        self.queue.running_count()
    }

    fn dispatch(&mut self, now: u64, events: &mut Vec<Event>) {
        while let Some(id) = self.queue.next_runnable(now) {
            let argv = self
                .queue
                .jobs()
                .find(|j| j.id == id)
                .map(|j| j.argv.clone())
                .expect("runnable id exists");

            self.queue.mark_running(id, now);
            match spawn(&argv) {
                Ok(child) => {
                    self.queue.set_pid(id, child.id());
                    self.children.insert(id, child);
                }
                Err(err) => {
                    warn!(script = %argv[0], %err, "failed to spawn script");
                    events.push(script_error(&argv[0], 99, 0));
                    self.queue.spawn_failed(id);
                    // Leave the job queued; the next tick retries the spawn.
                    break;
                }
            }
        }
    }

    fn reap(&mut self, now: u64, events: &mut Vec<Event>) {
        let mut finished = Vec::new();
        for (id, child) in &mut self.children {
            match child.try_wait() {
                Ok(Some(status)) => finished.push((*id, Some(status))),
                Ok(None) => {}
                Err(err) => {
                    warn!(job = id, %err, "failed to poll script child");
                    finished.push((*id, None));
                }
            }
        }

        for (id, status) in finished {
            // tokio reports no pid once the child is reaped; the queue
            // remembers the pid it was dispatched with.
            let pid = pid_of(&self.queue, id);
            let Some(child) = self.children.remove(&id) else {
                continue;
            };
            let Some(pid) = pid.or_else(|| child.id()) else {
                continue;
            };

            let (exit_code, by_signal) = match status {
                Some(status) => (status.code(), exit_signal(&status).is_some()),
                // Poll error: treat like signal death so the retry policy
                // applies.
                None => (None, true),
            };

            match self.queue.reap(pid, exit_code, by_signal, now) {
                Some((job, ExitDisposition::Retried { delay_ms })) => {
                    debug!(
                        script = %job.argv[0],
                        retry = job.retry,
                        delay_ms,
                        "script failed, retrying"
                    );
                }
                Some((job, ExitDisposition::Finished { clean })) => {
                    if !clean {
                        let signal = status.and_then(|s| exit_signal(&s)).unwrap_or(0);
                        events.push(script_error(
                            &job.argv[0],
                            signal,
                            exit_code.unwrap_or(0),
                        ));
                    }
                }
                None => {}
            }
        }
    }

    fn kill_overtime(&mut self, now: u64) {
        for (id, pid) in self.queue.overtime(now) {
            warn!(job = id, pid, "script exceeded max runtime, killing");
            if let Some(child) = self.children.get_mut(&id) {
                child.start_kill().ok();
            }
            self.queue.mark_kill_sent(id);
        }
    }
}

fn pid_of(queue: &ScriptQueue, id: u64) -> Option<u32> {
    queue.jobs().find(|j| j.id == id).and_then(|j| j.pid)
}

fn spawn(argv: &[String]) -> std::io::Result<Child> {
    Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
}

fn script_error(path: &str, signal: i32, exit_code: i32) -> Event {
    Event::new(
        EventLevel::Warning,
        "-script-error",
        format!("{path} {signal} {exit_code}"),
        None,
    )
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    async fn drain(runner: &mut ScriptRunner) -> Vec<Event> {
        let mut events = Vec::new();
        let mut now = 0;
        let deadline = Instant::now() + Duration::from_secs(10);
        while runner.queue_len() > 0 {
            assert!(Instant::now() < deadline, "script never finished");
            events.extend(runner.tick(now));
            now += 100;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        events
    }

    #[tokio::test]
    async fn clean_exit_drains_without_error() {
        let mut runner = ScriptRunner::new();
        runner.schedule(vec!["/bin/true".to_string()], 0);
        let events = drain(&mut runner).await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn hard_failure_emits_script_error() {
        let mut runner = ScriptRunner::new();
        // Exit code 2 is not retryable, so the job is removed immediately.
        runner.schedule(
            vec!["/bin/sh".to_string(), "-c".to_string(), "exit 2".to_string()],
            0,
        );
        let events = drain(&mut runner).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "-script-error");
    }

    #[tokio::test]
    async fn unspawnable_script_stays_queued() {
        let mut runner = ScriptRunner::new();
        runner.schedule(vec!["/no/such/script".to_string()], 0);
        let events = runner.tick(0);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "-script-error");
        assert!(events[0].body.contains(" 99 "));
        assert_eq!(runner.queue_len(), 1);
        assert_eq!(runner.running_count(), 0);
    }

    #[tokio::test]
    async fn pending_reports_queued_jobs() {
        let mut runner = ScriptRunner::new();
        runner.schedule(vec!["/bin/true".to_string()], 500);
        let pending = runner.pending(500);
        assert_eq!(pending.len(), 1);
        assert!(!pending[0].running);
        assert_eq!(pending[0].retry, 0);
    }
}
