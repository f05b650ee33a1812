use crate::pipe::{DirectedPipe, InputPipe, Pipe, WriteSource, DEFAULT_PIPE_CAPACITY};
use crate::tests::prelude::*;

#[test]
#[serial]
fn test_bytes_below_capacity_round_trip() {
    let _cleanup = test_init();
    let capacity = Pipe::new().unwrap().capacity();
    for len in [0, 1, 7, 4095, 4096, 4097, capacity / 2, capacity - 1] {
        let data: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
        let mut pipe = Pipe::new().unwrap();
        assert_eq!(pipe.write_bytes(&data).unwrap(), len);
        assert_eq!(pipe.read().unwrap(), data, "length {}", len);
    }
}

#[test]
#[serial]
fn test_lazy_chunks_ten_times_capacity() {
    let _cleanup = test_init();
    let before = open_fds();
    let rx = in_background(|| {
        let mut pipe = Pipe::new().unwrap();
        let total = 10 * pipe.capacity() + 123;
        // Chunks are generated on demand, as the reader drains the pipe.
        let chunks = (0..total).step_by(1000).map(move |start| {
            (start..(start + 1000).min(total))
                .map(|i| (i % 256) as u8)
                .collect::<Vec<u8>>()
        });
        let handle = pipe.write(WriteSource::chunks(chunks)).unwrap();
        let data = pipe.read().unwrap();
        (total, data, handle.join().unwrap())
    });
    let (total, data, written) = rx.recv_timeout(LONG_TIMEOUT).expect("pipe deadlocked");
    assert_eq!(written, total);
    assert_eq!(data.len(), total);
    assert!(data.iter().enumerate().all(|(i, &b)| b == (i % 256) as u8));
    assert_eq!(open_fds(), before);
}

#[test]
#[serial]
fn test_callback_source_larger_than_capacity() {
    let _cleanup = test_init();
    let rx = in_background(|| {
        let mut pipe = Pipe::new().unwrap();
        let handle = pipe
            .write(WriteSource::callback(|out| {
                for _ in 0..64 {
                    out.write_all(&[b'y'; 16 * 1024])?;
                }
                Ok(())
            }))
            .unwrap();
        let data = pipe.read().unwrap();
        (data.len(), handle.join().unwrap())
    });
    let (read, written) = rx.recv_timeout(LONG_TIMEOUT).expect("pipe deadlocked");
    assert_eq!(read, 64 * 16 * 1024);
    assert_eq!(written, read);
}

#[test]
#[serial]
fn test_callback_error_is_reported_on_join() {
    let _cleanup = test_init();
    let mut pipe = InputPipe::new(WriteSource::callback(|out| {
        out.write_all(b"partial")?;
        Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "source failed"))
    }))
    .unwrap();
    assert_eq!(pipe.read().unwrap_err().kind(), std::io::ErrorKind::InvalidData);
    // The writer is joined; later joins report the same failure.
    let err = pipe.wait().unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    assert_eq!(err.to_string(), "source failed");
    assert_eq!(pipe.close_local().unwrap_err().kind(), std::io::ErrorKind::InvalidData);
}

#[test]
#[serial]
fn test_capacity_is_sane() {
    let _cleanup = test_init();
    let pipe = Pipe::new().unwrap();
    assert!(pipe.capacity() >= 4096);
    assert!(DEFAULT_PIPE_CAPACITY >= 4096);
}
