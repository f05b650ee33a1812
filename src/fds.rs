use crate::flog::{FloggableDebug, FLOG};
use libc::{c_int, EBADF, FD_CLOEXEC, F_GETFD, F_SETFD};
use nix::fcntl::{FcntlArg, OFlag};
use std::ffi::CStr;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// The first "high fd". Descriptors we create are moved at or above this, so they never collide
/// with the standard streams while a child's descriptors are being rearranged.
pub const FIRST_HIGH_FD: RawFd = 10;

/// The direction a descriptor was opened for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FdMode {
    Read,
    Write,
}

impl FdMode {
    fn oflags(self) -> OFlag {
        match self {
            FdMode::Read => OFlag::O_RDONLY,
            FdMode::Write => OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
        }
    }
}

fn closed_error() -> io::Error {
    io::Error::from_raw_os_error(EBADF)
}

fn wrong_mode_error(mode: FdMode) -> io::Error {
    let msg = match mode {
        FdMode::Read => "descriptor was opened for reading",
        FdMode::Write => "descriptor was opened for writing",
    };
    io::Error::new(io::ErrorKind::PermissionDenied, msg)
}

/// An owned OS descriptor tagged with the direction it may be used in.
///
/// Closing is idempotent: once closed, every operation except the `closed()`/`readable()`/
/// `writable()` queries fails with EBADF.
pub struct FileDescriptor {
    fd: Option<OwnedFd>,
    mode: FdMode,
}

impl FileDescriptor {
    /// Take ownership of `fd`.
    pub fn new(fd: OwnedFd, mode: FdMode) -> Self {
        Self { fd: Some(fd), mode }
    }

    /// A descriptor that has not been opened yet; it behaves as closed.
    pub fn unset(mode: FdMode) -> Self {
        Self { fd: None, mode }
    }

    /// Open a file or device. Write mode creates or truncates the file.
    pub fn open_path(path: &Path, mode: FdMode) -> nix::Result<Self> {
        let path = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|_| nix::Error::EINVAL)?;
        let file = open_cloexec(&path, mode.oflags(), nix::sys::stat::Mode::from_bits_truncate(0o666))?;
        Ok(Self::new(OwnedFd::from(file), mode))
    }

    /// Duplicate a descriptor we do not own, e.g. our own stdout, into a new close-on-exec one
    /// in the high range.
    pub fn duplicate(fd: BorrowedFd<'_>, mode: FdMode) -> io::Result<Self> {
        let newfd = nix::fcntl::fcntl(fd, FcntlArg::F_DUPFD_CLOEXEC(FIRST_HIGH_FD))?;
        Ok(Self::new(unsafe { OwnedFd::from_raw_fd(newfd) }, mode))
    }

    pub fn mode(&self) -> FdMode {
        self.mode
    }

    pub fn closed(&self) -> bool {
        self.fd.is_none()
    }

    pub fn readable(&self) -> bool {
        self.mode == FdMode::Read && !self.closed()
    }

    pub fn writable(&self) -> bool {
        self.mode == FdMode::Write && !self.closed()
    }

    /// The raw descriptor value, or None once closed.
    pub fn raw(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    pub fn borrow(&self) -> io::Result<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd()).ok_or_else(closed_error)
    }

    /// Return a handle for reading or writing according to our mode.
    /// Dropping the handle does not close the descriptor.
    pub fn open(&self) -> io::Result<FdHandle<'_>> {
        let fd = self.borrow()?;
        Ok(FdHandle {
            file: unsafe { BorrowedFdFile::from_raw_fd(fd.as_raw_fd()) },
            mode: self.mode,
            _owner: PhantomData,
        })
    }

    /// Close the descriptor. Safe to call any number of times.
    pub fn close(&mut self) {
        if let Some(fd) = self.fd.take() {
            FLOG!(pipe, "closing fd", fd.as_raw_fd());
            drop(fd);
        }
    }

    /// Give up ownership of the descriptor, leaving this one closed.
    pub fn take(&mut self) -> Option<OwnedFd> {
        self.fd.take()
    }

    /// Duplicate into an independent descriptor with the same mode.
    pub fn try_clone(&self) -> io::Result<Self> {
        Self::duplicate(self.borrow()?, self.mode)
    }
}

impl fmt::Debug for FileDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.raw() {
            Some(fd) => write!(f, "FileDescriptor({}, {:?})", fd, self.mode),
            None => write!(f, "FileDescriptor(closed, {:?})", self.mode),
        }
    }
}

impl FloggableDebug for FileDescriptor {}

impl From<File> for FileDescriptor {
    /// Files handed over without a known mode are assumed readable.
    fn from(file: File) -> Self {
        Self::new(OwnedFd::from(file), FdMode::Read)
    }
}

/// A scoped, file-like view of a [`FileDescriptor`]. It borrows the descriptor, so it cannot
/// outlive it, and it never closes it.
pub struct FdHandle<'a> {
    file: BorrowedFdFile,
    mode: FdMode,
    _owner: PhantomData<&'a FileDescriptor>,
}

impl Read for FdHandle<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.mode != FdMode::Read {
            return Err(wrong_mode_error(self.mode));
        }
        self.file.read(buf)
    }
}

impl Write for FdHandle<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.mode != FdMode::Write {
            return Err(wrong_mode_error(self.mode));
        }
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for FdHandle<'_> {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Helper type returned from make_autoclose_pipes.
pub struct AutoClosePipes {
    /// Read end of the pipe.
    pub read: OwnedFd,

    /// Write end of the pipe.
    pub write: OwnedFd,
}

/// Construct a pair of connected pipes, set to close-on-exec.
/// Fails on fd exhaustion.
pub fn make_autoclose_pipes() -> nix::Result<AutoClosePipes> {
    #[allow(unused_mut, unused_assignments)]
    let mut already_cloexec = false;

    #[cfg(have_pipe2)]
    let pipes = match nix::unistd::pipe2(OFlag::O_CLOEXEC) {
        Ok(pipes) => {
            already_cloexec = true;
            pipes
        }
        Err(err) => {
            FLOG!(warning, "An error occurred while setting up pipe:", err);
            return Err(err);
        }
    };
    #[cfg(not(have_pipe2))]
    let pipes = match nix::unistd::pipe() {
        Ok(pipes) => pipes,
        Err(err) => {
            FLOG!(warning, "An error occurred while setting up pipe:", err);
            return Err(err);
        }
    };

    // Ensure our fds are out of the standard stream range.
    let readp = heightenize_fd(pipes.0, already_cloexec)?;
    let writep = heightenize_fd(pipes.1, already_cloexec)?;
    FLOG!(pipe, "created pipe", readp.as_raw_fd(), "->", writep.as_raw_fd());

    Ok(AutoClosePipes {
        read: readp,
        write: writep,
    })
}

/// If the given fd is below [`FIRST_HIGH_FD`], move it to a new fd in the "high range".
/// `input_has_cloexec` describes whether the input has CLOEXEC already set, so we can avoid
/// setting it again.
/// Return the fd, which always has CLOEXEC set. On failure the input fd is closed.
fn heightenize_fd(fd: OwnedFd, input_has_cloexec: bool) -> nix::Result<OwnedFd> {
    let raw_fd = fd.as_raw_fd();

    if raw_fd >= FIRST_HIGH_FD {
        if !input_has_cloexec {
            set_cloexec(raw_fd, true);
        }
        return Ok(fd);
    }

    // Here we are asking the kernel to give us a cloexec fd.
    let newfd = match nix::fcntl::fcntl(&fd, FcntlArg::F_DUPFD_CLOEXEC(FIRST_HIGH_FD)) {
        Ok(newfd) => newfd,
        Err(err) => {
            FLOG!(warning, "fcntl(F_DUPFD_CLOEXEC) failed:", err);
            return Err(err);
        }
    };

    Ok(unsafe { OwnedFd::from_raw_fd(newfd) })
}

/// Sets CLO_EXEC on a given fd according to the value of `should_set`.
pub fn set_cloexec(fd: RawFd, should_set: bool) -> c_int {
    // Note we don't want to overwrite existing flags like O_NONBLOCK which may be set. So fetch the
    // existing flags and modify them.
    let flags = unsafe { libc::fcntl(fd, F_GETFD, 0) };
    if flags < 0 {
        return -1;
    }
    let mut new_flags = flags;
    if should_set {
        new_flags |= FD_CLOEXEC;
    } else {
        new_flags &= !FD_CLOEXEC;
    }
    if flags == new_flags {
        0
    } else {
        unsafe { libc::fcntl(fd, F_SETFD, new_flags) }
    }
}

/// Open a path with the close-on-exec flag set atomically, retrying on EINTR.
pub fn open_cloexec(path: &CStr, flags: OFlag, mode: nix::sys::stat::Mode) -> nix::Result<File> {
    loop {
        let ret = nix::fcntl::open(path, flags | OFlag::O_CLOEXEC, mode);
        match ret.map(File::from) {
            Ok(file) => return Ok(file),
            Err(nix::Error::EINTR) => continue,
            Err(err) => return Err(err),
        }
    }
}

/// List the descriptors currently open in this process, in ascending order.
pub fn lsof() -> io::Result<Vec<RawFd>> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let dir = "/proc/self/fd";
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let dir = "/dev/fd";

    let mut fds = vec![];
    for entry in std::fs::read_dir(dir)? {
        let name = entry?.file_name();
        if let Some(fd) = name.to_str().and_then(|s| s.parse::<RawFd>().ok()) {
            fds.push(fd);
        }
    }
    // The listing includes the directory handle itself, which is closed by now.
    fds.retain(|&fd| unsafe { libc::fcntl(fd, F_GETFD, 0) } >= 0);
    fds.sort_unstable();
    Ok(fds)
}

/// A helper type for a File that does not close on drop.
/// Note the underlying file is never dropped; this is equivalent to mem::forget.
pub struct BorrowedFdFile(ManuallyDrop<File>);

impl Deref for BorrowedFdFile {
    type Target = File;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for BorrowedFdFile {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl FromRawFd for BorrowedFdFile {
    // Note this does NOT take ownership.
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self(ManuallyDrop::new(unsafe { File::from_raw_fd(fd) }))
    }
}

impl AsRawFd for BorrowedFdFile {
    #[inline]
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::{lsof, make_autoclose_pipes, BorrowedFdFile, FdMode, FileDescriptor, FIRST_HIGH_FD};
    use crate::tests::prelude::*;
    use libc::{FD_CLOEXEC, F_GETFD};
    use std::io::{Read, Write};
    use std::os::fd::{AsRawFd, FromRawFd};

    #[test]
    #[serial]
    fn test_pipes() {
        let _cleanup = test_init();
        // Here we just test that each pipe has CLOEXEC set and is in the high range.
        // Note pipe creation may fail due to fd exhaustion; don't fail in that case.
        let mut pipes = vec![];
        for _i in 0..10 {
            if let Ok(pipe) = make_autoclose_pipes() {
                pipes.push(pipe);
            }
        }
        for pipe in pipes {
            for fd in [&pipe.read, &pipe.write] {
                let fd = fd.as_raw_fd();
                assert!(fd >= FIRST_HIGH_FD);
                let flags = unsafe { libc::fcntl(fd, F_GETFD, 0) };
                assert!(flags >= 0);
                assert_ne!(flags & FD_CLOEXEC, 0);
            }
        }
    }

    #[test]
    #[serial]
    fn test_borrowed_fd_file_does_not_close() {
        let file = std::fs::File::open("/dev/null").unwrap();
        let fd = file.as_raw_fd();
        let borrowed = unsafe { BorrowedFdFile::from_raw_fd(fd) };
        #[allow(clippy::drop_non_drop)]
        drop(borrowed);
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD, 0) };
        assert!(flags >= 0);
        drop(file);
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD, 0) };
        assert!(flags < 0);
    }

    #[test]
    #[serial]
    fn test_descriptor_open_and_close() {
        let _cleanup = test_init();
        let pipes = make_autoclose_pipes().unwrap();
        let mut rfd = FileDescriptor::new(pipes.read, FdMode::Read);
        let mut wfd = FileDescriptor::new(pipes.write, FdMode::Write);
        assert!(rfd.readable() && !rfd.writable());
        assert!(wfd.writable() && !wfd.readable());

        {
            let mut handle = wfd.open().unwrap();
            assert_eq!(handle.write(b"test").unwrap(), 4);
            // Wrong direction for this descriptor.
            assert!(handle.read(&mut [0u8; 4]).is_err());
        }
        // The handle is gone but the descriptor is still open.
        assert!(!wfd.closed());
        wfd.close();
        wfd.close();
        assert!(wfd.closed());
        assert!(!wfd.writable());
        assert_eq!(wfd.open().err().and_then(|e| e.raw_os_error()), Some(libc::EBADF));

        let mut contents = String::new();
        rfd.open().unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "test");
        rfd.close();
        assert!(rfd.raw().is_none());
    }

    #[test]
    #[serial]
    fn test_open_path() {
        let _cleanup = test_init();
        let path = std::env::temp_dir().join(format!("procpipe-fds-{}", std::process::id()));
        let wfd = FileDescriptor::open_path(&path, FdMode::Write).unwrap();
        assert!(wfd.raw().unwrap() >= 3);
        wfd.open().unwrap().write_all(b"on disk").unwrap();
        drop(wfd);

        let rfd = FileDescriptor::open_path(&path, FdMode::Read).unwrap();
        let mut contents = String::new();
        rfd.open().unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "on disk");
        std::fs::remove_file(&path).unwrap();
        assert!(FileDescriptor::open_path(&path, FdMode::Read).is_err());
    }

    #[test]
    #[serial]
    fn test_lsof_tracks_descriptors() {
        let _cleanup = test_init();
        let before = lsof().unwrap();
        let pipes = make_autoclose_pipes().unwrap();
        let during = lsof().unwrap();
        assert!(during.contains(&pipes.read.as_raw_fd()));
        assert!(during.contains(&pipes.write.as_raw_fd()));
        drop(pipes);
        assert_eq!(lsof().unwrap(), before);
    }
}
