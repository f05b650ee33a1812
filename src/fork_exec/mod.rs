// The exec side of launching a child.
// A child can be started three ways: posix_spawn, our own fork and exec, or std's Command.
// Each backend takes the same prepared SpawnRequest and reports a pid or an errno.

pub mod command;
pub mod flog_safe;
pub mod postfork;
#[cfg(have_posix_spawn)]
pub mod spawn;

use crate::env::Env;
use crate::fds::open_cloexec;
use crate::flog::FLOG;
use crate::null_terminated_array::OwningNullTerminatedArray;
use crate::redirection::Dup2List;
use errno::Errno;
use libc::pid_t;
use nix::fcntl::OFlag;
use nix::sys::stat;
use nix::unistd::AccessFlags;
use once_cell::sync::Lazy;
use std::ffi::{CStr, CString, OsStr, OsString};
use std::fmt;
use std::io::Read;
use std::os::fd::RawFd;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// The environment variable consulted once for the process-wide default backend.
pub const BACKEND_VAR: &str = "PROCPIPE_SPAWN_BACKEND";

// Bravely define _PATH_BSHELL. On practice it's /bin/sh everywhere, except on Android.
#[cfg(not(target_os = "android"))]
pub static PATH_BSHELL: &[u8] = b"/bin/sh\0";

#[cfg(target_os = "android")]
pub static PATH_BSHELL: &[u8] = b"/system/bin/sh\0";

pub fn bshell() -> &'static CStr {
    // PATH_BSHELL has exactly one NUL, at the end.
    unsafe { CStr::from_bytes_with_nul_unchecked(PATH_BSHELL) }
}

/// How a child process is created.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum SpawnBackend {
    /// Try each available backend in [`SpawnBackend::FALLBACK_ORDER`].
    #[default]
    Auto,
    PosixSpawn,
    ForkExec,
    /// `std::process::Command`.
    Command,
}

impl SpawnBackend {
    pub const FALLBACK_ORDER: [SpawnBackend; 3] = [
        SpawnBackend::PosixSpawn,
        SpawnBackend::ForkExec,
        SpawnBackend::Command,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SpawnBackend::Auto => "auto",
            SpawnBackend::PosixSpawn => "posix-spawn",
            SpawnBackend::ForkExec => "fork-exec",
            SpawnBackend::Command => "command",
        }
    }

    /// Whether this backend was built into this platform's binary.
    pub fn is_available(self) -> bool {
        #[cfg(test)]
        if disabled_for_test(self) {
            return false;
        }
        match self {
            SpawnBackend::PosixSpawn => cfg!(have_posix_spawn),
            SpawnBackend::Auto | SpawnBackend::ForkExec | SpawnBackend::Command => true,
        }
    }

    /// The backends to attempt, in order. A forced backend is its own only candidate.
    pub fn candidates(self) -> Vec<SpawnBackend> {
        match self {
            SpawnBackend::Auto => Self::FALLBACK_ORDER
                .into_iter()
                .filter(|b| b.is_available())
                .collect(),
            forced => vec![forced],
        }
    }
}

/// Backends that tests pretend this platform lacks.
#[cfg(test)]
pub(crate) static DISABLED_BACKENDS: std::sync::Mutex<Vec<SpawnBackend>> =
    std::sync::Mutex::new(Vec::new());

#[cfg(test)]
fn disabled_for_test(backend: SpawnBackend) -> bool {
    DISABLED_BACKENDS
        .lock()
        .map_or(false, |disabled| disabled.contains(&backend))
}

impl fmt::Display for SpawnBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParseBackendError(String);

impl fmt::Display for ParseBackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown spawn backend '{}' (expected auto, posix-spawn, fork-exec or command)",
            self.0
        )
    }
}

impl std::error::Error for ParseBackendError {}

impl FromStr for SpawnBackend {
    type Err = ParseBackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        [SpawnBackend::Auto]
            .into_iter()
            .chain(Self::FALLBACK_ORDER)
            .find(|b| b.name() == normalized)
            .ok_or_else(|| ParseBackendError(s.to_owned()))
    }
}

static DEFAULT_BACKEND: Lazy<SpawnBackend> = Lazy::new(|| {
    let Some(value) = std::env::var_os(BACKEND_VAR) else {
        return SpawnBackend::Auto;
    };
    match value.to_string_lossy().parse::<SpawnBackend>() {
        Ok(backend) => {
            FLOG!(spawn, "default backend from", BACKEND_VAR, "is", backend);
            backend
        }
        Err(err) => {
            FLOG!(warning, err);
            SpawnBackend::Auto
        }
    }
});

/// The backend new processes use unless told otherwise. Read once from [`BACKEND_VAR`].
pub fn default_backend() -> SpawnBackend {
    *DEFAULT_BACKEND
}

/// Signals a child gets back at their default disposition before exec.
/// Ignored signals survive exec, and the Rust runtime ignores SIGPIPE.
pub const DEFAULT_SIGNALS: [libc::c_int; 2] = [libc::SIGPIPE, libc::SIGXFSZ];

/// [`DEFAULT_SIGNALS`] as a sigset.
pub static SIGNALS_TO_DEFAULT: Lazy<libc::sigset_t> = Lazy::new(|| {
    let mut set = std::mem::MaybeUninit::uninit();
    unsafe {
        libc::sigemptyset(set.as_mut_ptr());
        for sig in DEFAULT_SIGNALS {
            libc::sigaddset(set.as_mut_ptr(), sig);
        }
        set.assume_init()
    }
});

/// Everything a backend needs to start a child, prepared before any backend runs so the fork
/// path never has to allocate.
pub struct SpawnRequest {
    /// The program to execute, after PATH lookup.
    pub program: CString,
    pub argv: OwningNullTerminatedArray,
    pub envp: OwningNullTerminatedArray,
    /// The argument vector as given; `args[0]` is passed to the child as its argv[0].
    pub args: Vec<OsString>,
    pub env: Env,
    pub dup2s: Dup2List,
    /// Set when a bare program name is not on the search path. Every backend then fails with
    /// it instead of resolving the name against our working directory.
    pub lookup_error: Option<Errno>,
}

impl SpawnRequest {
    /// Prepare a request. `streams` holds the descriptors to install as the child's stdin,
    /// stdout and stderr; `None` leaves the slot inherited from us.
    /// Fails with EINVAL for an empty argument vector or one containing NUL.
    pub fn new(args: &[OsString], env: &Env, streams: [Option<RawFd>; 3]) -> Result<Self, Errno> {
        let Some(name) = args.first() else {
            return Err(Errno(libc::EINVAL));
        };
        let (program, lookup_error) = match find_program(name, &env.search_path()) {
            Some(path) => (path, None),
            None => (PathBuf::from(name), Some(Errno(libc::ENOENT))),
        };
        let program =
            CString::new(program.into_os_string().into_vec()).map_err(|_| Errno(libc::EINVAL))?;
        let argv = OwningNullTerminatedArray::from_os_strs(args).ok_or(Errno(libc::EINVAL))?;
        Ok(SpawnRequest {
            program,
            argv,
            envp: env.export(),
            args: args.to_vec(),
            env: env.clone(),
            dup2s: Dup2List::for_std_streams(streams),
            lookup_error,
        })
    }

    /// The request that runs our program as a script under /bin/sh, for a kernel that refused
    /// it with ENOEXEC. None if the file does not look like a script.
    pub fn thompson_fallback(&self) -> Option<SpawnRequest> {
        if !is_thompson_shell_script(&self.program) {
            return None;
        }
        let shell = OsStr::from_bytes(bshell().to_bytes()).to_owned();
        let mut args = vec![shell, OsStr::from_bytes(self.program.to_bytes()).to_owned()];
        args.extend(self.args.iter().skip(1).cloned());
        Some(SpawnRequest {
            program: bshell().to_owned(),
            argv: OwningNullTerminatedArray::from_os_strs(&args)?,
            envp: self.env.export(),
            args,
            env: self.env.clone(),
            dup2s: self.dup2s.clone(),
            lookup_error: None,
        })
    }

    /// The descriptor to install in standard stream slot `target`, if any.
    pub fn stream(&self, target: RawFd) -> Option<RawFd> {
        let src = self.dup2s.fd_for_target_fd(target);
        (src != target).then_some(src)
    }
}

/// Look `name` up on a colon-separated search path. Names containing a slash are used as-is.
/// An empty path entry means the current directory.
pub fn find_program(name: &OsStr, search_path: &OsStr) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }
    if name.as_bytes().contains(&b'/') {
        return Some(PathBuf::from(name));
    }
    search_path
        .as_bytes()
        .split(|&c| c == b':')
        .map(|dir| {
            if dir.is_empty() {
                Path::new(".")
            } else {
                Path::new(OsStr::from_bytes(dir))
            }
        })
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable_file(candidate))
}

fn is_executable_file(path: &Path) -> bool {
    path.metadata().is_ok_and(|md| md.is_file())
        && nix::unistd::access(path, AccessFlags::X_OK).is_ok()
}

/// This is a 'looks like text' check.
/// Return true if either there is no NUL byte, or there is a line containing a lowercase letter
/// before the first NUL byte.
fn is_thompson_shell_payload(p: &[u8]) -> bool {
    if !p.contains(&b'\0') {
        return true;
    };
    let mut haslower = false;
    for c in p {
        if c.is_ascii_lowercase() || *c == b'$' || *c == b'`' {
            haslower = true;
        }
        if haslower && *c == b'\n' {
            return true;
        }
    }
    false
}

/// Check the beginning of a file to see if it's safe to pass to the system shell when exec
/// fails with ENOEXEC.
///
/// This lets classic shell scripts without a shebang run, while refusing binary files. We look
/// for lowercase letters because the ASCII magic of binary files is usually uppercase, e.g.
/// PNG, JFIF, MZ.
pub fn is_thompson_shell_script(path: &CStr) -> bool {
    let Ok(mut file) = open_cloexec(path, OFlag::O_RDONLY | OFlag::O_NOCTTY, stat::Mode::empty())
    else {
        return false;
    };
    let mut buf = [b'\0'; 256];
    match file.read(&mut buf) {
        Ok(got) => is_thompson_shell_payload(&buf[..got]),
        Err(_) => false,
    }
}

/// Start `req` with exactly one backend, retrying under /bin/sh for shebang-less scripts.
fn spawn_with(backend: SpawnBackend, req: &SpawnRequest) -> Result<pid_t, Errno> {
    if let Some(err) = req.lookup_error {
        return Err(err);
    }
    let launch = |req: &SpawnRequest| match backend {
        #[cfg(have_posix_spawn)]
        SpawnBackend::PosixSpawn => spawn::PosixSpawner::new(&req.dup2s)?.spawn(req),
        SpawnBackend::ForkExec => postfork::fork_exec(req),
        SpawnBackend::Command => command::spawn_command(req),
        _ => Err(Errno(libc::ENOSYS)),
    };
    match launch(req) {
        Err(err) if err.0 == libc::ENOEXEC => {
            let Some(fallback) = req.thompson_fallback() else {
                return Err(err);
            };
            FLOG!(
                spawn,
                "retrying",
                req.program.to_string_lossy(),
                "under",
                bshell().to_string_lossy()
            );
            launch(&fallback)
        }
        res => res,
    }
}

/// Why no child was started.
#[derive(Debug)]
pub enum SpawnFailure {
    /// A forced backend that this platform does not have.
    Unavailable(SpawnBackend),
    /// Every candidate backend was tried; each failed with the given errno.
    Failed(Vec<(SpawnBackend, Errno)>),
}

/// Start a child for `req`, trying the candidates for `selector` in order until one succeeds.
/// Return the child's pid and the backend that started it.
pub fn spawn_child(
    selector: SpawnBackend,
    req: &SpawnRequest,
) -> Result<(pid_t, SpawnBackend), SpawnFailure> {
    if !selector.is_available() {
        FLOG!(spawn, "backend", selector, "is not available on this platform");
        return Err(SpawnFailure::Unavailable(selector));
    }
    let mut failures = vec![];
    for backend in selector.candidates() {
        match spawn_with(backend, req) {
            Ok(pid) => {
                FLOG!(
                    spawn,
                    backend,
                    "started",
                    req.program.to_string_lossy(),
                    "as pid",
                    pid
                );
                return Ok((pid, backend));
            }
            Err(err) => {
                FLOG!(
                    spawn,
                    backend,
                    "failed to start",
                    req.program.to_string_lossy(),
                    "-",
                    err
                );
                failures.push((backend, err));
            }
        }
    }
    Err(SpawnFailure::Failed(failures))
}

#[cfg(test)]
mod tests {
    use super::{find_program, is_thompson_shell_payload, SpawnBackend, SpawnRequest};
    use crate::env::Env;
    use errno::Errno;
    use std::ffi::{OsStr, OsString};

    #[test]
    fn test_backend_names() {
        for backend in [SpawnBackend::Auto]
            .into_iter()
            .chain(SpawnBackend::FALLBACK_ORDER)
        {
            assert_eq!(backend.to_string().parse::<SpawnBackend>(), Ok(backend));
        }
        assert_eq!("FORK_EXEC".parse::<SpawnBackend>(), Ok(SpawnBackend::ForkExec));
        assert!("vfork".parse::<SpawnBackend>().is_err());
    }

    #[test]
    fn test_candidates() {
        assert_eq!(
            SpawnBackend::ForkExec.candidates(),
            [SpawnBackend::ForkExec]
        );
        let auto = SpawnBackend::Auto.candidates();
        assert_eq!(auto.last(), Some(&SpawnBackend::Command));
        #[cfg(have_posix_spawn)]
        assert_eq!(auto.first(), Some(&SpawnBackend::PosixSpawn));
    }

    #[test]
    fn test_thompson_payload() {
        assert!(is_thompson_shell_payload(b"echo hello\n"));
        assert!(is_thompson_shell_payload(b""));
        assert!(!is_thompson_shell_payload(b"\x7fELF\x02\x01\x01\0\0\0"));
        assert!(is_thompson_shell_payload(b"echo $x\n\0binary"));
    }

    #[test]
    fn test_find_program() {
        let path = OsStr::new("/nonexistent-dir:/bin:/usr/bin");
        let sh = find_program(OsStr::new("sh"), path).unwrap();
        assert!(sh.ends_with("sh"));
        assert_eq!(
            find_program(OsStr::new("./x/y"), path).unwrap(),
            std::path::Path::new("./x/y")
        );
        assert_eq!(
            find_program(OsStr::new("procpipe-no-such-program"), path),
            None
        );
    }

    #[test]
    fn test_request_wiring() {
        let args: Vec<OsString> = vec!["sh".into(), "-c".into(), "true".into()];
        let req = SpawnRequest::new(&args, &Env::new(), [Some(12), None, Some(14)]).unwrap();
        assert_eq!(req.argv.len(), 3);
        assert!(req.envp.is_empty());
        assert_eq!(req.stream(0), Some(12));
        assert_eq!(req.stream(1), None);
        assert_eq!(req.stream(2), Some(14));
        assert_eq!(req.lookup_error, None);
        assert!(SpawnRequest::new(&[], &Env::new(), [None; 3]).is_err());

        let args: Vec<OsString> = vec!["procpipe-no-such-program".into()];
        let req = SpawnRequest::new(&args, &Env::new(), [None; 3]).unwrap();
        assert_eq!(req.lookup_error, Some(Errno(libc::ENOENT)));
    }
}
