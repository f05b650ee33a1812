// The fork-exec backend.
// Everything that runs in the child must be async-signal safe.
// That means no locking, no allocating, no freeing memory, etc!
use super::flog_safe::FLOG_SAFE;
use super::{SpawnRequest, DEFAULT_SIGNALS};
use crate::common::exit_without_destructors;
use crate::fds::make_autoclose_pipes;
use crate::flog::FLOG;
use crate::redirection::Dup2List;
use errno::{errno, Errno};
use libc::pid_t;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

/// The number of times to try to call fork() before giving up.
const FORK_LAPS: usize = 5;

/// The number of nanoseconds to sleep between attempts to call fork().
const FORK_SLEEP_TIME: Duration = Duration::from_nanos(1000000);

/// Exit status of a child whose exec failed. The parent learns the real errno over the report
/// pipe, so this is only seen if that pipe is lost.
const EXEC_FAILED_STATUS: libc::c_int = 127;

/// Clear FD_CLOEXEC on a file descriptor.
fn clear_cloexec(fd: i32) -> i32 {
    // Note we don't want to overwrite existing flags like O_NONBLOCK which may be set. So fetch the
    // existing flags and modify them.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD, 0) };
    if flags < 0 {
        return -1;
    }
    let new_flags = flags & !libc::FD_CLOEXEC;
    if flags == new_flags {
        0
    } else {
        unsafe { libc::fcntl(fd, libc::F_SETFD, new_flags) }
    }
}

/// Set up redirections and signal handling in the forked child.
/// Return 0 on success, or the value of errno on failure.
pub fn child_setup_process(dup2s: &Dup2List) -> i32 {
    for act in &dup2s.actions {
        let err = if act.target < 0 {
            unsafe { libc::close(act.src) }
        } else if act.target != act.src {
            // Normal redirection.
            unsafe { libc::dup2(act.src, act.target) }
        } else {
            // The descriptor (which is CLO_EXEC) wants to be dup2'd to itself.
            // We need to unset the CLO_EXEC flag.
            clear_cloexec(act.src)
        };
        if err < 0 {
            let err = errno().0;
            FLOG_SAFE!(
                warning,
                "failed to set up file descriptors in child_setup_process"
            );
            return err;
        }
    }
    unsafe {
        // Our signal mask was inherited from whichever thread forked; the child starts clean.
        let mut sigmask = std::mem::MaybeUninit::uninit();
        libc::sigemptyset(sigmask.as_mut_ptr());
        libc::sigprocmask(libc::SIG_SETMASK, sigmask.as_ptr(), std::ptr::null_mut());

        for sig in DEFAULT_SIGNALS {
            libc::signal(sig, libc::SIG_DFL);
        }
    }
    0
}

/// This function is a wrapper around fork. If the fork calls fails with EAGAIN, it is retried
/// FORK_LAPS times, with a very slight delay between each lap.
pub fn execute_fork() -> Result<pid_t, Errno> {
    let mut err = 0;
    for i in 0..FORK_LAPS {
        let pid = unsafe { libc::fork() };
        if pid >= 0 {
            return Ok(pid);
        }
        err = errno().0;
        if err != libc::EAGAIN {
            break;
        }
        // Don't sleep on the final lap
        if i != FORK_LAPS - 1 {
            std::thread::sleep(FORK_SLEEP_TIME);
        }
    }

    match err {
        libc::EAGAIN => {
            FLOG!(
                error,
                "fork: Out of resources. Check RLIMIT_NPROC and pid_max."
            );
        }
        libc::ENOMEM => {
            FLOG!(error, "fork: Out of memory.");
        }
        _ => {
            FLOG!(error, "fork: Unknown error number", err);
        }
    }
    Err(Errno(err))
}

/// Write the exec errno to the report pipe, as four native-endian bytes.
fn report_exec_error(fd: RawFd, err: i32) {
    let bytes = err.to_ne_bytes();
    unsafe {
        let _ = libc::write(fd, bytes.as_ptr().cast(), bytes.len());
    }
}

/// Called in a forked child! Do not allocate memory, etc.
fn run_child(req: &SpawnRequest, report_fd: RawFd) -> ! {
    let mut err = child_setup_process(&req.dup2s);
    if err == 0 {
        unsafe { libc::execve(req.program.as_ptr(), req.argv.get().cast(), req.envp.get().cast()) };
        err = errno().0;
        // The parent may still run a script refused with ENOEXEC under /bin/sh.
        if err != libc::ENOEXEC {
            FLOG_SAFE!(
                exec,
                "Failed to execute process '",
                req.program.as_c_str(),
                "': errno ",
                err
            );
        }
    }
    report_exec_error(report_fd, err);
    exit_without_destructors(EXEC_FAILED_STATUS)
}

fn reap(pid: pid_t) {
    loop {
        let ret = unsafe { libc::waitpid(pid, std::ptr::null_mut(), 0) };
        if ret >= 0 || errno().0 != libc::EINTR {
            break;
        }
    }
}

/// Fork and exec `req`. The child reports a failed exec over a close-on-exec pipe, so that
/// success is observed as EOF and failure as the errno; a failed child is reaped before
/// returning.
pub fn fork_exec(req: &SpawnRequest) -> Result<pid_t, Errno> {
    let report = make_autoclose_pipes().map_err(|err| Errno(err as i32))?;
    let pid = execute_fork()?;
    if pid == 0 {
        run_child(req, report.write.as_raw_fd());
    }
    FLOG!(exec_fork, "Fork #", pid, ", executing", req.program.to_string_lossy());
    drop(report.write);

    let mut buf = [0u8; 4];
    let mut report = File::from(report.read);
    match report.read_exact(&mut buf) {
        Ok(()) => {
            reap(pid);
            Err(Errno(i32::from_ne_bytes(buf)))
        }
        // The pipe closed on exec with nothing written.
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => Ok(pid),
        Err(err) => {
            FLOG!(warning, "Could not read exec status of pid", pid, ":", err);
            unsafe { libc::kill(pid, libc::SIGKILL) };
            reap(pid);
            Err(Errno(err.raw_os_error().unwrap_or(libc::EIO)))
        }
    }
}
