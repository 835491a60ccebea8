//! Process-tree isolation and termination.
//!
//! Every external tool is started as the leader of a fresh process group
//! (a new process group on Windows), so the whole subtree it forks can be
//! signalled as one unit. Termination is graceful first, forceful after a
//! grace period.

use std::time::Duration;

use tokio::process::{Child, Command};

use crate::{slog_debug, slog_warn};

/// Put the command in its own process group before it is spawned.
pub(crate) fn isolate_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }

    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }
}

/// Terminate the process tree rooted at `child`.
///
/// `pid` is the root pid captured at spawn time; it is also the process
/// group id because the child was isolated with [`isolate_process_group`].
/// Returns once the root process has been reaped.
#[cfg(unix)]
pub async fn terminate_tree(child: &mut Child, pid: u32, grace: Duration) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        slog_warn!("terminate_tree: pid {} out of range, killing root only", pid);
        kill_root(child).await;
        return;
    };
    let group = Pid::from_raw(raw);

    slog_debug!("terminate_tree: SIGTERM to process group {}", raw);
    match killpg(group, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => {
            // Group already empty; only the zombie root is left to reap.
            let _ = child.wait().await;
            return;
        }
        Err(e) => {
            slog_warn!("terminate_tree: killpg({}) failed: {}, killing root only", raw, e);
            kill_root(child).await;
            return;
        }
    }

    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        slog_warn!(
            "terminate_tree: group {} survived {:?} grace period, sending SIGKILL",
            raw,
            grace
        );
    }

    // Descendants can outlive the root, so the group is always force-killed.
    match killpg(group, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => slog_warn!("terminate_tree: SIGKILL to group {} failed: {}", raw, e),
    }
    let _ = child.wait().await;
}

/// Terminate the process tree rooted at `child` with `taskkill /T`.
#[cfg(windows)]
pub async fn terminate_tree(child: &mut Child, pid: u32, grace: Duration) {
    use std::process::Stdio;

    let status = Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    match status {
        Ok(status) if status.success() => {
            slog_debug!("terminate_tree: taskkill removed tree of {}", pid);
        }
        other => {
            slog_warn!("terminate_tree: taskkill for {} failed: {:?}", pid, other);
            kill_root(child).await;
            return;
        }
    }

    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        kill_root(child).await;
    }
}

/// Wait for the root to exit, kill whatever it left in its group, then reap it.
///
/// A tool that backgrounds helpers and exits would otherwise leave them
/// running (and holding its output pipes open). On Linux the exit is
/// observed with `WNOWAIT`, so the unreaped root keeps its pid, and with it
/// the group id, reserved until the sweep is done.
pub(crate) async fn wait_and_sweep(
    child: &mut Child,
    pid: Option<u32>,
) -> std::io::Result<std::process::ExitStatus> {
    #[cfg(target_os = "linux")]
    {
        if let Some(pid) = pid {
            root_exited(pid).await;
            sweep_group(pid);
        }
        child.wait().await
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    {
        // No WNOWAIT here: the sweep follows the reap and only fires while
        // leftovers keep the group alive.
        let status = child.wait().await;
        if let Some(pid) = pid {
            if group_alive(pid) {
                sweep_group(pid);
            }
        }
        status
    }

    // Processes in a new Windows process group are not tied to the root,
    // so there is nothing to sweep once it is gone.
    #[cfg(windows)]
    {
        let _ = pid;
        child.wait().await
    }
}

/// Resolve once `pid` has exited, leaving it unreaped.
#[cfg(target_os = "linux")]
async fn root_exited(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::wait::{waitid, Id, WaitPidFlag, WaitStatus};
    use nix::unistd::Pid;
    use tokio::signal::unix::{signal, SignalKind};

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    // Registered before the first check, so an exit in between still wakes us.
    let mut sigchld = signal(SignalKind::child()).ok();
    let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT | WaitPidFlag::WNOHANG;

    loop {
        match waitid(Id::Pid(Pid::from_raw(raw)), flags) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(_) => return,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                slog_debug!("root_exited: waitid({}) failed: {}", raw, e);
                return;
            }
        }
        let closed = match sigchld.as_mut() {
            Some(stream) => stream.recv().await.is_none(),
            None => {
                tokio::time::sleep(EXIT_POLL).await;
                false
            }
        };
        if closed {
            sigchld = None;
        }
    }
}

/// Fallback poll interval when SIGCHLD cannot be subscribed to.
#[cfg(target_os = "linux")]
const EXIT_POLL: Duration = Duration::from_millis(20);

#[cfg(all(unix, not(target_os = "linux")))]
fn group_alive(pid: u32) -> bool {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    i32::try_from(pid)
        .map(|raw| killpg(Pid::from_raw(raw), None).is_ok())
        .unwrap_or(false)
}

#[cfg(unix)]
fn sweep_group(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => slog_debug!("sweep_group: killed leftovers in group {}", raw),
        Err(Errno::ESRCH) => {}
        Err(e) => slog_warn!("sweep_group: SIGKILL to group {} failed: {}", raw, e),
    }
}

/// Last resort: kill only the root process.
async fn kill_root(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        slog_debug!("kill_root: {}", e);
    }
    let _ = child.wait().await;
}
