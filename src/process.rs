//! Unix signal helpers for managing spawned processes.
//!
//! The executor and kernel manager own their children through tokio and
//! reap them in supervisor tasks; these helpers only deliver signals and
//! poll for liveness from the side. Jobs run as the leaders of their own
//! process groups and are signalled as groups, so children forked by a
//! shell wrapper die with it; kernels are bare interpreters and are
//! signalled by pid.

use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;

/// Sends `signal` to `pid`. A process that is already gone counts as
/// signalled; any other delivery failure is logged and reported false.
pub fn deliver(pid: u32, signal: Signal) -> bool {
    if pid == 0 {
        return false;
    }
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => true,
        Err(err) => {
            tracing::warn!(pid, signal = %signal, error = %err, "Failed to signal process");
            false
        }
    }
}

/// Sends `signal` to every process in the group led by `pgid`. A group
/// that is already gone counts as signalled.
pub fn deliver_group(pgid: u32, signal: Signal) -> bool {
    if pgid == 0 {
        return false;
    }
    match killpg(Pid::from_raw(pgid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => true,
        Err(err) => {
            tracing::warn!(pgid, signal = %signal, error = %err, "Failed to signal process group");
            false
        }
    }
}

/// Probes `pid` with the null signal. An unreaped zombie still counts
/// as alive, so callers must have a concurrent reaper.
pub fn alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// A group is alive while any member is, children the leader forked
/// included.
pub fn group_alive(pgid: u32) -> bool {
    if pgid == 0 {
        return false;
    }
    killpg(Pid::from_raw(pgid as i32), None).is_ok()
}

/// Polls until `pid` exits or `grace` elapses. Returns true once the
/// process is gone.
pub async fn wait_for_exit(pid: u32, grace: Duration, poll: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !alive(pid) {
            return true;
        }
        tokio::time::sleep(poll).await;
    }
    !alive(pid)
}

/// Polls until every process in the group exits or `grace` elapses.
pub async fn wait_for_group_exit(pgid: u32, grace: Duration, poll: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !group_alive(pgid) {
            return true;
        }
        tokio::time::sleep(poll).await;
    }
    !group_alive(pgid)
}

/// SIGTERM to the whole group, a grace period, then SIGKILL for any
/// survivor. Shell jobs fork their workload, so the signals must reach
/// the group rather than the wrapper pid alone.
pub async fn terminate_group_with_grace(pgid: u32, grace: Duration, poll: Duration) {
    deliver_group(pgid, Signal::SIGTERM);
    if wait_for_group_exit(pgid, grace, poll).await {
        return;
    }
    tracing::warn!(pgid, "Process group survived SIGTERM, sending SIGKILL");
    deliver_group(pgid, Signal::SIGKILL);
}

#[cfg(test)]
mod tests {
    use std::os::unix::process::ExitStatusExt;

    use super::*;

    #[test]
    fn pid_zero_is_never_signalled() {
        assert!(!deliver(0, Signal::SIGTERM));
        assert!(!deliver_group(0, Signal::SIGTERM));
        assert!(!alive(0));
        assert!(!group_alive(0));
    }

    #[test]
    fn signalling_a_reaped_pid_reports_delivered() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        assert!(deliver(pid, Signal::SIGTERM));
        assert!(!alive(pid));
    }

    #[tokio::test]
    async fn alive_tracks_process_lifetime() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("5")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        assert!(alive(pid));

        child.start_kill().unwrap();
        child.wait().await.unwrap();
        assert!(!alive(pid));
    }

    #[tokio::test]
    async fn terminate_group_with_grace_prefers_sigterm() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        let reaper = tokio::spawn(async move { child.wait().await });

        let start = std::time::Instant::now();
        terminate_group_with_grace(pid, Duration::from_secs(5), Duration::from_millis(50)).await;
        assert!(start.elapsed() < Duration::from_secs(2));

        let status = reaper.await.unwrap().unwrap();
        assert_eq!(status.signal(), Some(15));
    }

    #[tokio::test]
    async fn terminate_group_with_grace_escalates_to_sigkill() {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("trap '' TERM; while true; do sleep 1; done")
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        let reaper = tokio::spawn(async move { child.wait().await });

        terminate_group_with_grace(pid, Duration::from_millis(400), Duration::from_millis(50))
            .await;

        let status = reaper.await.unwrap().unwrap();
        assert!(!alive(pid));
        assert_eq!(status.signal(), Some(9));
    }

    /// The shell backgrounds its workload, so the wrapper pid alone is
    /// not enough: the whole group has to go down.
    #[tokio::test]
    async fn group_signals_reach_forked_children() {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("sleep 30 & wait")
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        let reaper = tokio::spawn(async move { child.wait().await });
        assert!(group_alive(pid));

        terminate_group_with_grace(pid, Duration::from_secs(2), Duration::from_millis(50)).await;

        reaper.await.unwrap().unwrap();
        assert!(wait_for_group_exit(pid, Duration::from_secs(2), Duration::from_millis(50)).await);
    }
}
