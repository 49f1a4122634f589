//! Platform-specific process signalling
//!
//! Supervised processes are started as session leaders, so their PID doubles
//! as the process group id and signals reach the whole tree (`make` spawns the
//! actual simulator as a grandchild).

#[cfg(unix)]
mod unix;

use anyhow::Result;

/// Ask a process group to shut down (SIGTERM)
pub fn terminate_group(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        unix::signal_group(pid, libc::SIGTERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        anyhow::bail!("Unsupported platform")
    }
}

/// Force kill a process group (SIGKILL)
pub fn kill_group(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        unix::signal_group(pid, libc::SIGKILL)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        anyhow::bail!("Unsupported platform")
    }
}

/// SIGKILL whatever is left of a group whose leader already exited
///
/// Only the group is signalled, never a bare PID that may have been reused.
pub fn sweep_group(pid: u32) {
    #[cfg(unix)]
    {
        unix::sweep_group(pid)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

/// Check if a process exists
pub fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        unix::is_process_running(pid)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Make the spawned child a session leader, detached from our terminal
pub fn detach_command(cmd: &mut tokio::process::Command) {
    #[cfg(unix)]
    {
        unix::detach_command(cmd)
    }
    #[cfg(not(unix))]
    {
        let _ = cmd;
    }
}
