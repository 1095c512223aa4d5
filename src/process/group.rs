//! Supervision and reaping of the pipeline's child processes.
//!
//! A [`ProcessGroup`] owns the children once they are spawned. A supervisor
//! thread polls them; when one exits unsuccessfully on its own the rest are
//! terminated so that a reader blocked on the output pipe sees end-of-file
//! instead of waiting forever. Every child is reaped exactly once, on
//! whichever path reaches [`PipelineControl::close`] first (or on drop).

use crate::error::Result;
use crate::process::{CloseMode, PipelineControl, ProcessFailure};
use std::io::{BufRead, BufReader};
use std::process::{Child, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How long to wait for stderr forwarders to drain after the children exit.
const STDERR_DRAIN: Duration = Duration::from_millis(250);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Supervised {
    name: String,
    child: Child,
    status: Option<ExitStatus>,
    /// Asked to stop by us before it exited on its own.
    signalled: bool,
    stderr_tail: Arc<Mutex<Option<String>>>,
    stderr_thread: Option<JoinHandle<()>>,
}

impl Supervised {
    fn new(name: String, mut child: Child) -> Self {
        let stderr_tail = Arc::new(Mutex::new(None));
        let stderr_thread = child.stderr.take().and_then(|stderr| {
            let tail = stderr_tail.clone();
            let process = name.clone();
            thread::Builder::new()
                .name(format!("voxrelay-stderr-{name}"))
                .spawn(move || {
                    for line in BufReader::new(stderr).lines() {
                        let Ok(line) = line else { break };
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        tracing::debug!(process = %process, "{line}");
                        *lock(&tail) = Some(line.to_string());
                    }
                })
                .map_err(|e| tracing::warn!(process = %name, error = %e, "stderr forwarder not started"))
                .ok()
        });

        Self {
            name,
            child,
            status: None,
            signalled: false,
            stderr_tail,
            stderr_thread,
        }
    }

    /// Non-blocking exit check; reaps the child the first time it has exited.
    fn poll(&mut self) -> Option<ExitStatus> {
        if self.status.is_none() {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    tracing::debug!(process = %self.name, %status, "child exited");
                    self.status = Some(status);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(process = %self.name, error = %e, "failed to poll child"),
            }
        }
        self.status
    }

    fn signal_stop(&mut self) {
        if self.poll().is_none() {
            self.signalled = true;
            send_terminate(&mut self.child, &self.name);
        }
    }

    fn force_kill(&mut self) {
        if self.poll().is_none() {
            self.signalled = true;
            if let Err(e) = self.child.kill() {
                tracing::debug!(process = %self.name, error = %e, "kill failed");
            }
        }
    }

    /// Blocking reap; a no-op when the status is already known.
    fn reap(&mut self) {
        if self.status.is_none() {
            match self.child.wait() {
                Ok(status) => self.status = Some(status),
                Err(e) => tracing::warn!(process = %self.name, error = %e, "failed to reap child"),
            }
        }
    }

    fn failure(&self) -> Option<ProcessFailure> {
        let status = self.status?;
        if status.success() || self.signalled {
            return None;
        }
        let mut message = describe(status);
        if let Some(line) = lock(&self.stderr_tail).clone() {
            message = format!("{message}: {line}");
        }
        Some(ProcessFailure::new(&self.name, message))
    }

    /// Died writing to a closed pipe: a consequence of a downstream exit.
    fn broken_pipe(&self) -> bool {
        self.status.is_some_and(killed_by_sigpipe)
    }
}

#[cfg(unix)]
fn killed_by_sigpipe(status: ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal() == Some(libc::SIGPIPE)
}

#[cfg(not(unix))]
fn killed_by_sigpipe(_status: ExitStatus) -> bool {
    false
}

/// The failure to report for a set of exited children. Broken-pipe deaths
/// rank below any other failure.
fn first_failure<'a>(children: impl IntoIterator<Item = &'a Supervised>) -> Option<ProcessFailure> {
    let mut secondary = None;
    for child in children {
        if let Some(failure) = child.failure() {
            if !child.broken_pipe() {
                return Some(failure);
            }
            secondary.get_or_insert(failure);
        }
    }
    secondary
}

#[cfg(unix)]
fn send_terminate(child: &mut Child, name: &str) {
    let Ok(pid) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    // SAFETY: the child has not been reaped (poll just returned None), so the
    // pid still names our own child and cannot have been recycled.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        tracing::debug!(
            process = %name,
            error = %std::io::Error::last_os_error(),
            "SIGTERM failed"
        );
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child, name: &str) {
    if let Err(e) = child.kill() {
        tracing::debug!(process = %name, error = %e, "kill failed");
    }
}

fn describe(status: ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("killed by signal {signal}");
        }
    }
    match status.code() {
        Some(code) => format!("exit status {code}"),
        None => status.to_string(),
    }
}

struct Shared {
    children: Mutex<Vec<Supervised>>,
    failure: Mutex<Option<ProcessFailure>>,
    terminate_requested: Mutex<Option<Instant>>,
    stop: AtomicBool,
    grace: Duration,
    poll_interval: Duration,
}

impl Shared {
    fn terminate(&self) {
        {
            let mut requested = lock(&self.terminate_requested);
            if requested.is_some() {
                return;
            }
            *requested = Some(Instant::now());
        }
        tracing::debug!("terminating pipeline processes");
        for child in lock(&self.children).iter_mut() {
            child.signal_stop();
        }
    }

    fn force_kill(&self) {
        for child in lock(&self.children).iter_mut() {
            child.force_kill();
        }
    }

    fn grace_expired(&self) -> bool {
        lock(&self.terminate_requested).is_some_and(|since| since.elapsed() >= self.grace)
    }

    fn all_exited(&self) -> bool {
        lock(&self.children)
            .iter_mut()
            .all(|child| child.poll().is_some())
    }

    /// One supervisor pass. Returns true once every child has exited.
    fn sweep(&self) -> bool {
        let force = self.grace_expired();
        let mut all_exited = true;
        let failure = {
            let mut children = lock(&self.children);
            for child in children.iter_mut() {
                if child.poll().is_none() {
                    all_exited = false;
                    if force {
                        child.force_kill();
                    }
                }
            }
            first_failure(children.iter())
        };

        if let Some(failure) = failure {
            let newly_recorded = {
                let mut slot = lock(&self.failure);
                if slot.is_none() {
                    *slot = Some(failure.clone());
                    true
                } else {
                    false
                }
            };
            if newly_recorded && !all_exited {
                tracing::warn!(process = %failure.process, reason = %failure.message, "pipeline process failed, stopping the rest");
                self.terminate();
            }
        }

        all_exited
    }

    fn wait_all(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.all_exited() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(self.poll_interval.min(deadline - now));
        }
    }
}

/// Owns and supervises a set of chained child processes.
pub struct ProcessGroup {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    outcome: OnceLock<std::result::Result<(), ProcessFailure>>,
}

impl ProcessGroup {
    /// Takes ownership of already spawned children (named for error
    /// reporting) and starts supervising them.
    pub fn start(children: Vec<(String, Child)>, grace: Duration, poll_interval: Duration) -> Self {
        let shared = Arc::new(Shared {
            children: Mutex::new(
                children
                    .into_iter()
                    .map(|(name, child)| Supervised::new(name, child))
                    .collect(),
            ),
            failure: Mutex::new(None),
            terminate_requested: Mutex::new(None),
            stop: AtomicBool::new(false),
            grace,
            poll_interval,
        });

        let supervisor = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("voxrelay-supervisor".to_string())
                .spawn(move || {
                    while !shared.stop.load(Ordering::SeqCst) {
                        if shared.sweep() {
                            break;
                        }
                        thread::sleep(shared.poll_interval);
                    }
                })
                .map_err(|e| tracing::warn!(error = %e, "process supervisor not started"))
                .ok()
        };

        Self {
            shared,
            supervisor: Mutex::new(supervisor),
            outcome: OnceLock::new(),
        }
    }

    fn shutdown(&self, mode: CloseMode) -> std::result::Result<(), ProcessFailure> {
        let shared = &self.shared;
        match mode {
            CloseMode::Abort => shared.terminate(),
            CloseMode::Drain => {
                if !shared.wait_all(shared.grace) {
                    tracing::debug!("pipeline still running after end of stream");
                    shared.terminate();
                }
            }
        }
        if !shared.wait_all(shared.grace) {
            tracing::warn!("pipeline processes ignored SIGTERM, killing");
            shared.force_kill();
        }

        shared.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = lock(&self.supervisor).take()
            && handle.join().is_err()
        {
            tracing::warn!("process supervisor panicked");
        }

        let forwarders: Vec<JoinHandle<()>> = {
            let mut children = lock(&shared.children);
            for child in children.iter_mut() {
                child.reap();
            }
            children
                .iter_mut()
                .filter_map(|child| child.stderr_thread.take())
                .collect()
        };
        join_forwarders(forwarders);

        // Re-describe the recorded failure now that its stderr tail is complete.
        let recorded = lock(&shared.failure).clone();
        let failure = {
            let children = lock(&shared.children);
            match recorded {
                Some(recorded) => Some(
                    children
                        .iter()
                        .filter(|child| child.name == recorded.process)
                        .find_map(Supervised::failure)
                        .unwrap_or(recorded),
                ),
                None => first_failure(children.iter()),
            }
        };

        for child in lock(&shared.children).iter() {
            tracing::debug!(
                process = %child.name,
                status = ?child.status,
                signalled = child.signalled,
                "reaped"
            );
        }

        match failure {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

/// Joins stderr forwarders that finish promptly; the rest are detached (a
/// grandchild may still hold the pipe open).
fn join_forwarders(forwarders: Vec<JoinHandle<()>>) {
    let deadline = Instant::now() + STDERR_DRAIN;
    while Instant::now() < deadline && forwarders.iter().any(|h| !h.is_finished()) {
        thread::sleep(Duration::from_millis(10));
    }
    for handle in forwarders {
        if handle.is_finished() && handle.join().is_err() {
            tracing::debug!("stderr forwarder panicked");
        }
    }
}

impl PipelineControl for ProcessGroup {
    fn failure(&self) -> Option<ProcessFailure> {
        lock(&self.shared.failure).clone()
    }

    fn terminate(&self) {
        self.shared.terminate();
    }

    fn close(&self, mode: CloseMode) -> Result<()> {
        self.outcome
            .get_or_init(|| self.shutdown(mode))
            .clone()
            .map_err(Into::into)
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if self.outcome.get().is_none()
            && let Err(e) = self.close(CloseMode::Abort)
        {
            tracing::debug!(error = %e, "pipeline closed on drop");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use std::process::{Command, Stdio};

    fn spawn(program: &str, args: &[&str]) -> Child {
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap()
    }

    fn group(children: Vec<(&str, Child)>) -> ProcessGroup {
        ProcessGroup::start(
            children
                .into_iter()
                .map(|(name, child)| (name.to_string(), child))
                .collect(),
            Duration::from_millis(500),
            Duration::from_millis(10),
        )
    }

    #[test]
    fn successful_children_close_cleanly() {
        let group = group(vec![("a", spawn("true", &[])), ("b", spawn("true", &[]))]);
        assert!(group.close(CloseMode::Drain).is_ok());
        assert!(group.failure().is_none());
    }

    #[test]
    fn failing_child_is_reported_with_stderr() {
        let group = group(vec![(
            "fetch",
            spawn("sh", &["-c", "echo 'ERROR: video unavailable' >&2; exit 3"]),
        )]);
        let err = group.close(CloseMode::Drain).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Pipeline);
        let text = err.to_string();
        assert!(text.contains("fetch"), "{text}");
        assert!(text.contains("exit status 3"), "{text}");
        assert!(text.contains("video unavailable"), "{text}");
    }

    #[test]
    fn supervisor_stops_siblings_of_a_failed_child() {
        let group = group(vec![
            ("fetch", spawn("sh", &["-c", "exit 1"])),
            ("transcode", spawn("sleep", &["30"])),
        ]);

        let started = Instant::now();
        while group.failure().is_none() && started.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(10));
        }
        let failure = group.failure().unwrap();
        assert_eq!(failure.process, "fetch");

        // The sleeping sibling was terminated, so closing does not wait 30s.
        assert!(group.shared.wait_all(Duration::from_secs(5)));
        assert!(group.close(CloseMode::Drain).is_err());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn abort_terminates_without_reporting_failure() {
        let group = group(vec![("transcode", spawn("sleep", &["30"]))]);
        let started = Instant::now();
        assert!(group.close(CloseMode::Abort).is_ok());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn close_runs_once() {
        let group = group(vec![("fetch", spawn("sh", &["-c", "exit 2"]))]);
        let first = group.close(CloseMode::Drain).unwrap_err().to_string();
        let second = group.close(CloseMode::Abort).unwrap_err().to_string();
        assert_eq!(first, second);
    }

    #[test]
    fn sigterm_ignoring_child_is_killed_after_grace() {
        let group = group(vec![(
            "stubborn",
            spawn("sh", &["-c", "trap '' TERM; sleep 30"]),
        )]);
        let started = Instant::now();
        assert!(group.close(CloseMode::Abort).is_ok());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn describe_reports_signal() {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(describe(ExitStatus::from_raw(9)), "killed by signal 9");
        assert_eq!(describe(ExitStatus::from_raw(1 << 8)), "exit status 1");
    }
}
