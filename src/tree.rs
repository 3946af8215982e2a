//! Process-tree termination.
//!
//! Toolchains such as `npm` and `dotnet run` fork the actual server, so signalling only
//! the direct child leaves listeners behind. Unix hosts signal the child's process group
//! and every descendant found through `pgrep -P`; Windows shells out to `taskkill /T`.

use std::time::Duration;

use tracing::{debug, warn};

use crate::platform::{child_query_command, kill_tree_command, Platform};

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Parses one pid per line, ignoring anything that is not a number.
pub fn parse_pids(text: &str) -> Vec<u32> {
    text.lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

/// Direct children of `pid`. An empty list when `pgrep` finds none or is unavailable.
pub async fn child_pids(pid: u32) -> Vec<u32> {
    match child_query_command(pid).capture(QUERY_TIMEOUT).await {
        Ok(output) => parse_pids(&String::from_utf8_lossy(&output.stdout)),
        Err(err) => {
            debug!(pid, error = %err, "failed to list child processes");
            Vec::new()
        }
    }
}

/// All descendants of `pid`, without `pid` itself.
pub async fn descendant_pids(pid: u32) -> Vec<u32> {
    let mut found = Vec::new();
    let mut frontier = vec![pid];
    while let Some(parent) = frontier.pop() {
        for child in child_pids(parent).await {
            if child != pid && !found.contains(&child) {
                found.push(child);
                frontier.push(child);
            }
        }
    }
    found
}

/// Best-effort termination of `pid` and everything it spawned. Never fails.
pub async fn terminate_tree(platform: Platform, pid: u32) {
    if let Some(command) = kill_tree_command(platform, pid) {
        match command.capture(QUERY_TIMEOUT).await {
            Ok(output) if output.status.success() => {}
            Ok(output) => warn!(
                pid,
                command = %command,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "tree kill reported failure"
            ),
            Err(err) => warn!(pid, command = %command, error = %err, "tree kill failed"),
        }
        return;
    }
    let descendants = if cfg!(unix) {
        descendant_pids(pid).await
    } else {
        Vec::new()
    };
    debug!(pid, ?descendants, "terminating process tree");
    terminate_group(pid, &descendants);
}

#[cfg(unix)]
fn terminate_group(pid: u32, descendants: &[u32]) {
    let Ok(leader) = libc::pid_t::try_from(pid) else {
        return;
    };
    // Children are spawned as group leaders, so the group id is the pid.
    unsafe {
        if libc::killpg(leader, libc::SIGTERM) != 0 {
            let _ = libc::kill(leader, libc::SIGTERM);
        }
    }
    for descendant in descendants {
        if let Ok(descendant) = libc::pid_t::try_from(*descendant) {
            unsafe {
                let _ = libc::kill(descendant, libc::SIGTERM);
            }
        }
    }
}

#[cfg(not(unix))]
fn terminate_group(_pid: u32, _descendants: &[u32]) {}
