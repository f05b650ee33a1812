//! Unidirectional pipes, and the two directed flavors a child process uses:
//! [`InputPipe`] feeds a child's stdin from a background writer, [`OutputPipe`] captures a
//! child's stdout or stderr.

use crate::fds::{make_autoclose_pipes, FdMode, FileDescriptor};
use crate::flog::{FloggableDebug, FLOG};
use crate::threads::BackgroundTask;
use std::fmt;
use std::io::{self, Read, Write};
use std::mem;

/// Pipe capacity assumed when the kernel cannot tell us.
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// Writing callback given to [`WriteSource::Callback`].
pub type WriteCallback = Box<dyn FnOnce(&mut dyn Write) -> io::Result<()> + Send>;

/// The kinds of data a pipe can be fed from.
pub enum WriteSource {
    /// A fixed buffer.
    Bytes(Vec<u8>),
    /// A lazy sequence of chunks, pulled one at a time as the pipe drains.
    Chunks(Box<dyn Iterator<Item = Vec<u8>> + Send>),
    /// A function which performs its own writes.
    Callback(WriteCallback),
}

impl WriteSource {
    pub fn chunks<I>(chunks: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Vec<u8>> + 'static,
        I::IntoIter: Send + 'static,
    {
        WriteSource::Chunks(Box::new(chunks.into_iter().map(Into::into)))
    }

    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce(&mut dyn Write) -> io::Result<()> + Send + 'static,
    {
        WriteSource::Callback(Box::new(f))
    }

    /// Copy everything from `reader`, e.g. a file or another pipe's read end.
    pub fn from_reader<R: Read + Send + 'static>(mut reader: R) -> Self {
        WriteSource::callback(move |out| io::copy(&mut reader, out).map(|_| ()))
    }

    fn kind(&self) -> &'static str {
        match self {
            WriteSource::Bytes(_) => "bytes",
            WriteSource::Chunks(_) => "chunks",
            WriteSource::Callback(_) => "callback",
        }
    }

    /// Write everything into `fd`, returning the number of bytes written.
    /// A reader that goes away early is not an error: we stop at the first failed write,
    /// discard whatever is left and report what made it through.
    fn feed(self, fd: &FileDescriptor) -> io::Result<usize> {
        let mut out = CountingWriter {
            inner: fd.open()?,
            count: 0,
        };
        let res = match self {
            WriteSource::Bytes(data) => out.write_all(&data),
            WriteSource::Chunks(mut chunks) => chunks.try_for_each(|chunk| out.write_all(&chunk)),
            WriteSource::Callback(callback) => callback(&mut out),
        };
        match res {
            Ok(()) => Ok(out.count),
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                FLOG!(pipe, "reader closed early, stopped after", out.count, "bytes");
                Ok(out.count)
            }
            Err(err) => Err(err),
        }
    }
}

impl fmt::Debug for WriteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteSource::Bytes(data) => write!(f, "WriteSource::Bytes({} bytes)", data.len()),
            other => write!(f, "WriteSource::{}", other.kind()),
        }
    }
}

impl FloggableDebug for WriteSource {}

impl From<Vec<u8>> for WriteSource {
    fn from(data: Vec<u8>) -> Self {
        WriteSource::Bytes(data)
    }
}

impl From<&[u8]> for WriteSource {
    fn from(data: &[u8]) -> Self {
        WriteSource::Bytes(data.to_vec())
    }
}

impl<const N: usize> From<&[u8; N]> for WriteSource {
    fn from(data: &[u8; N]) -> Self {
        WriteSource::Bytes(data.to_vec())
    }
}

impl From<&str> for WriteSource {
    fn from(data: &str) -> Self {
        WriteSource::Bytes(data.as_bytes().to_vec())
    }
}

struct CountingWriter<W> {
    inner: W,
    count: usize,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// The outcome of [`Pipe::write`].
pub enum WriteHandle {
    /// The data was written synchronously.
    Done(usize),
    /// A background writer is still feeding the pipe.
    Running(BackgroundTask<io::Result<usize>>),
}

impl WriteHandle {
    /// Wait for the write to finish and return the number of bytes written.
    pub fn join(self) -> io::Result<usize> {
        match self {
            WriteHandle::Done(n) => Ok(n),
            WriteHandle::Running(mut task) => join_writer(&mut task),
        }
    }
}

fn join_writer(task: &mut BackgroundTask<io::Result<usize>>) -> io::Result<usize> {
    match task.join() {
        Some(res) => res?,
        None => Err(io::Error::new(
            io::ErrorKind::Other,
            "pipe writer already joined",
        )),
    }
}

/// A copy of `err` for reporting the same failure again.
pub(crate) fn replay_io_error(err: &io::Error) -> io::Error {
    match err.raw_os_error() {
        Some(code) => io::Error::from_raw_os_error(code),
        None => io::Error::new(err.kind(), err.to_string()),
    }
}

/// A connected read/write descriptor pair from a single pipe() call.
#[derive(Debug)]
pub struct Pipe {
    read: FileDescriptor,
    write: FileDescriptor,
}

impl Pipe {
    /// Allocate a fresh pipe. Both ends are close-on-exec.
    pub fn new() -> nix::Result<Pipe> {
        let pipes = make_autoclose_pipes()?;
        Ok(Pipe {
            read: FileDescriptor::new(pipes.read, FdMode::Read),
            write: FileDescriptor::new(pipes.write, FdMode::Write),
        })
    }

    pub fn read_fd(&self) -> &FileDescriptor {
        &self.read
    }

    pub fn write_fd(&self) -> &FileDescriptor {
        &self.write
    }

    /// Hand the read end to someone else; the pipe keeps no reference to it.
    pub fn take_read_fd(&mut self) -> FileDescriptor {
        mem::replace(&mut self.read, FileDescriptor::unset(FdMode::Read))
    }

    /// Hand the write end to someone else; the pipe keeps no reference to it.
    pub fn take_write_fd(&mut self) -> FileDescriptor {
        mem::replace(&mut self.write, FileDescriptor::unset(FdMode::Write))
    }

    pub fn readable(&self) -> bool {
        self.read.readable()
    }

    pub fn writable(&self) -> bool {
        self.write.writable()
    }

    /// Feed `source` into the pipe and close the write end once it is exhausted.
    ///
    /// Bytes are written synchronously: this blocks while the pipe is full, so a buffer larger
    /// than the pipe capacity needs a concurrent reader. Chunks and callbacks are handed to a
    /// background writer which owns the write end from then on.
    pub fn write(&mut self, source: impl Into<WriteSource>) -> io::Result<WriteHandle> {
        match source.into() {
            source @ WriteSource::Bytes(_) => {
                let written = source.feed(&self.write);
                self.write.close();
                written.map(WriteHandle::Done)
            }
            source => self.write_in_background(source).map(WriteHandle::Running),
        }
    }

    /// Convenience for [`Pipe::write`] with a byte buffer.
    pub fn write_bytes(&mut self, data: &[u8]) -> io::Result<usize> {
        self.write(data)?.join()
    }

    /// Move the write end onto a new background writer which feeds `source` into it, then closes
    /// it. The writer is running by the time this returns.
    pub fn write_in_background(
        &mut self,
        source: WriteSource,
    ) -> io::Result<BackgroundTask<io::Result<usize>>> {
        if self.write.closed() {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        let mut fd = self.take_write_fd();
        FLOG!(pipe, "starting writer for", source, "on", fd);
        BackgroundTask::start("pipe-writer", move || {
            let res = source.feed(&fd);
            fd.close();
            res
        })
    }

    /// Read until every copy of the write end is closed, then close the read end.
    /// This blocks the calling thread for that long.
    pub fn read(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = vec![];
        self.read.open()?.read_to_end(&mut buf)?;
        self.read.close();
        Ok(buf)
    }

    /// Close both ends.
    pub fn close(&mut self) {
        self.read.close();
        self.write.close();
    }

    /// The size of the kernel buffer backing this pipe.
    pub fn capacity(&self) -> usize {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        if let Some(fd) = self.read.raw().or(self.write.raw()) {
            let size = unsafe { libc::fcntl(fd, libc::F_GETPIPE_SZ) };
            if size > 0 {
                return size as usize;
            }
        }
        DEFAULT_PIPE_CAPACITY
    }
}

/// A pipe with one end meant for a child process (remote) and one kept by us (local).
pub trait DirectedPipe {
    /// The end to be duplicated into the child.
    fn remote(&self) -> &FileDescriptor;

    /// Close our copy of the remote end. Call this right after the child has inherited it;
    /// otherwise the child never sees end-of-stream or a broken pipe.
    fn close_remote(&mut self);

    /// Close the local end, first finishing whatever is using it.
    fn close_local(&mut self) -> io::Result<()>;
}

/// A pipe feeding a child's stdin. A background writer streams the source into the write end
/// concurrently with the child draining the read end, so the source may be arbitrarily large.
///
/// ```
/// use procpipe::pipe::InputPipe;
/// let mut pipe = InputPipe::new(vec![b'X'; 1_000_000]).unwrap();
/// assert_eq!(pipe.read().unwrap().len(), 1_000_000);
/// ```
pub struct InputPipe {
    pipe: Pipe,
    writer: Option<BackgroundTask<io::Result<usize>>>,
    /// The writer's outcome, once joined.
    outcome: Option<io::Result<usize>>,
}

impl InputPipe {
    /// Allocate the pipe and start the writer.
    pub fn new(source: impl Into<WriteSource>) -> io::Result<Self> {
        let mut result = InputPipe {
            pipe: Pipe::new()?,
            writer: None,
            outcome: None,
        };
        result.start(source.into())?;
        Ok(result)
    }

    fn start(&mut self, source: WriteSource) -> io::Result<()> {
        assert!(self.writer.is_none(), "writer already started");
        self.writer = Some(self.pipe.write_in_background(source)?);
        Ok(())
    }

    /// Read back what was written, for pipes that were never handed to a child.
    pub fn read(&mut self) -> io::Result<Vec<u8>> {
        let data = self.pipe.read()?;
        self.wait()?;
        Ok(data)
    }

    /// Wait for the writer and return how many bytes it wrote. Broken pipes are not errors.
    /// Later calls return the same outcome.
    pub fn wait(&mut self) -> io::Result<usize> {
        let outcome = match self.outcome.take() {
            Some(outcome) => outcome,
            None => {
                let Some(mut writer) = self.writer.take() else {
                    return Err(io::Error::new(io::ErrorKind::Other, "writer never started"));
                };
                join_writer(&mut writer)
            }
        };
        let res = match &outcome {
            Ok(n) => Ok(*n),
            Err(err) => Err(replay_io_error(err)),
        };
        self.outcome = Some(outcome);
        res
    }
}

impl DirectedPipe for InputPipe {
    fn remote(&self) -> &FileDescriptor {
        self.pipe.read_fd()
    }

    fn close_remote(&mut self) {
        self.pipe.read.close();
    }

    /// The writer owns the write end and closes it when the source is exhausted (or the reader is
    /// gone), so this joins the writer and re-raises its failure, if any.
    fn close_local(&mut self) -> io::Result<()> {
        self.wait().map(|_| ())
    }
}

impl fmt::Debug for InputPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputPipe")
            .field("read", &self.pipe.read)
            .field("writer_running", &self.writer.as_ref().map(|w| !w.is_finished()))
            .field("outcome", &self.outcome)
            .finish()
    }
}

/// A pipe capturing a child's stdout or stderr.
#[derive(Debug)]
pub struct OutputPipe {
    pipe: Pipe,
}

impl OutputPipe {
    pub fn new() -> nix::Result<Self> {
        Ok(OutputPipe { pipe: Pipe::new()? })
    }

    /// Read the captured output to completion. This returns once every copy of the write end is
    /// closed, i.e. once the child (and anything it passed the descriptor on to) has exited.
    /// Each output pipe can be read exactly once.
    pub fn read(&mut self) -> io::Result<Vec<u8>> {
        self.pipe.read()
    }

    /// Start reading to completion on a background thread.
    pub fn read_in_background(&mut self) -> io::Result<BackgroundTask<io::Result<Vec<u8>>>> {
        let mut reader = Pipe {
            read: self.pipe.take_read_fd(),
            write: FileDescriptor::unset(FdMode::Write),
        };
        if reader.read.closed() {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        BackgroundTask::start("pipe-reader", move || reader.read())
    }

    /// Give away the read end, e.g. to become the stdin of the next process in a chain.
    pub fn take_reader(&mut self) -> FileDescriptor {
        self.pipe.take_read_fd()
    }

    pub fn readable(&self) -> bool {
        self.pipe.readable()
    }
}

impl DirectedPipe for OutputPipe {
    fn remote(&self) -> &FileDescriptor {
        self.pipe.write_fd()
    }

    fn close_remote(&mut self) {
        self.pipe.write.close();
    }

    fn close_local(&mut self) -> io::Result<()> {
        self.pipe.read.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{DirectedPipe, InputPipe, OutputPipe, Pipe, WriteHandle, WriteSource};
    use crate::tests::prelude::*;
    use std::io::Write;

    #[test]
    #[serial]
    fn test_write_then_read() {
        let _cleanup = test_init();
        let mut pipe = Pipe::new().unwrap();
        assert_eq!(pipe.write_bytes(b"hello").unwrap(), 5);
        assert!(!pipe.writable());
        assert_eq!(pipe.read().unwrap(), b"hello");
        assert!(!pipe.readable());
        // Both ends are gone; a second read is invalid.
        assert!(pipe.read().is_err());
    }

    #[test]
    #[serial]
    fn test_write_callback() {
        let _cleanup = test_init();
        let mut pipe = Pipe::new().unwrap();
        let handle = pipe
            .write(WriteSource::callback(|out| out.write_all(b"123")))
            .unwrap();
        assert!(matches!(handle, WriteHandle::Running(_)));
        assert_eq!(pipe.read().unwrap(), b"123");
        assert_eq!(handle.join().unwrap(), 3);
    }

    #[test]
    #[serial]
    fn test_write_from_another_pipe() {
        let _cleanup = test_init();
        let mut first = Pipe::new().unwrap();
        first.write_bytes(b"123").unwrap();
        let mut reader = first.take_read_fd();
        let mut second = Pipe::new().unwrap();
        let handle = second
            .write(WriteSource::from_reader(std::fs::File::from(reader.take().unwrap())))
            .unwrap();
        assert_eq!(second.read().unwrap(), b"123");
        assert_eq!(handle.join().unwrap(), 3);
    }

    #[test]
    #[serial]
    fn test_broken_pipe_stops_writer_silently() {
        let _cleanup = test_init();
        let mut pipe = Pipe::new().unwrap();
        let capacity = pipe.capacity();
        // Far more than fits in the pipe, and nobody will read it.
        let chunks = std::iter::repeat(vec![b'x'; 4096]).take(4 * capacity / 4096);
        let handle = pipe.write(WriteSource::chunks(chunks)).unwrap();
        drop(pipe.take_read_fd());
        let written = handle.join().unwrap();
        assert!(written < 4 * capacity);
    }

    #[test]
    #[serial]
    fn test_input_pipe_larger_than_capacity() {
        let _cleanup = test_init();
        let mut pipe = InputPipe::new(vec![b'X'; 12_345_678]).unwrap();
        assert_eq!(pipe.read().unwrap().len(), 12_345_678);
        assert_eq!(pipe.wait().unwrap(), 12_345_678);
        // Joining again reports the cached count.
        pipe.close_local().unwrap();
    }

    #[test]
    #[serial]
    fn test_output_pipe_halves() {
        let _cleanup = test_init();
        let mut pipe = OutputPipe::new().unwrap();
        {
            let mut out = pipe.remote().open().unwrap();
            out.write_all(b"captured").unwrap();
        }
        pipe.close_remote();
        pipe.close_remote();
        assert_eq!(pipe.read().unwrap(), b"captured");
        pipe.close_local().unwrap();
        assert!(!pipe.readable());
    }
}
