//! The last-resort backend: `std::process::Command`.

use super::SpawnRequest;
use errno::Errno;
use std::ffi::OsStr;
use std::io;
use std::os::fd::BorrowedFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

fn io_errno(err: io::Error) -> Errno {
    Errno(err.raw_os_error().unwrap_or(libc::EIO))
}

/// A Stdio for standard stream slot `target`: a duplicate of the request's descriptor, or
/// inherited if it has none. The duplicate is closed once the Command is dropped.
fn stdio_for(req: &SpawnRequest, target: i32) -> Result<Stdio, Errno> {
    let Some(fd) = req.stream(target) else {
        return Ok(Stdio::inherit());
    };
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    Ok(Stdio::from(fd.try_clone_to_owned().map_err(io_errno)?))
}

pub fn spawn_command(req: &SpawnRequest) -> Result<libc::pid_t, Errno> {
    let mut cmd = Command::new(OsStr::from_bytes(req.program.to_bytes()));
    if let Some(arg0) = req.args.first() {
        cmd.arg0(arg0);
    }
    cmd.args(req.args.iter().skip(1))
        .env_clear()
        .envs(req.env.iter())
        .stdin(stdio_for(req, libc::STDIN_FILENO)?)
        .stdout(stdio_for(req, libc::STDOUT_FILENO)?)
        .stderr(stdio_for(req, libc::STDERR_FILENO)?);
    let child = cmd.spawn().map_err(io_errno)?;
    // Dropping a Child neither kills nor reaps it; we wait on the pid ourselves.
    Ok(child.id() as libc::pid_t)
}
