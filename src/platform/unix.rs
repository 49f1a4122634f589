//! Unix process groups via libc

use anyhow::Result;

/// Send a signal to the process group led by `pid`
pub fn signal_group(pid: u32, signal: libc::c_int) -> Result<()> {
    let pgid = pid as libc::pid_t;
    if pgid <= 0 {
        anyhow::bail!("Refusing to signal process group {}", pgid);
    }
    if unsafe { libc::killpg(pgid, signal) } == 0 {
        Ok(())
    } else {
        anyhow::bail!(
            "Failed to signal process group {}: {}",
            pgid,
            std::io::Error::last_os_error()
        )
    }
}

pub fn sweep_group(pid: u32) {
    let pgid = pid as libc::pid_t;
    if pgid > 0 {
        // ESRCH just means the group is already empty
        unsafe {
            libc::killpg(pgid, libc::SIGKILL);
        }
    }
}

/// Check if a process is running
pub fn is_process_running(pid: u32) -> bool {
    let pid = pid as libc::pid_t;
    if pid <= 0 {
        return false;
    }
    // kill with signal 0 checks if process exists without sending a signal
    unsafe { libc::kill(pid, 0) == 0 }
}

pub fn detach_command(cmd: &mut tokio::process::Command) {
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}
