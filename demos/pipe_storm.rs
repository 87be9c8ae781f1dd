//! A hundred pipes fed by eight producer threads while a closer shuts their
//! write ends one at a time. Every read end is owned by its registration and
//! removes itself once it reads end of file.
//!
//! Run with `RUST_LOG=info cargo run --example pipe-storm`.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use epoll_listener::{Listener, Ready, DEFAULT_HANDLERS};
use log::{info, warn};
use rand::seq::SliceRandom;

const PIPES: usize = 100;
const PRODUCERS: usize = 8;
const MESSAGE: &[u8] = b"hello, world!";

type Writers = Arc<Vec<Mutex<Option<File>>>>;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let listener = Listener::new(DEFAULT_HANDLERS)?;
    let received = Arc::new(AtomicUsize::new(0));

    let mut writers = Vec::with_capacity(PIPES);
    for _ in 0..PIPES {
        let (reader, writer) = pipe()?;
        listener.add(reader.as_raw_fd(), (reader, received.clone()), on_data)?;
        writers.push(Mutex::new(Some(writer)));
    }
    let writers: Writers = Arc::new(writers);

    listener.start()?;
    info!("Registered {PIPES} pipes across {DEFAULT_HANDLERS} handlers");
    let started = Instant::now();

    let remaining = Arc::new(AtomicUsize::new(PIPES));
    let indices: Vec<usize> = (0..PIPES).collect();
    let producers: Vec<_> = indices
        .chunks((PIPES + PRODUCERS - 1) / PRODUCERS)
        .map(|subset| produce(subset.to_vec(), writers.clone(), remaining.clone()))
        .collect();

    let mut order = indices;
    order.shuffle(&mut rand::thread_rng());
    for index in order {
        thread::sleep(Duration::from_millis(100));
        if let Some(writer) = lock(&writers[index]).take() {
            info!("Closing pipe {index} (fd {})", writer.as_raw_fd());
        }
        remaining.fetch_sub(1, Ordering::SeqCst);
    }

    for producer in producers {
        if producer.join().is_err() {
            warn!("A producer panicked");
        }
    }

    while listener.registered_counts().iter().sum::<usize>() > 0 {
        thread::sleep(Duration::from_millis(10));
    }
    info!(
        "All pipes released after {:?}, {} bytes received",
        started.elapsed(),
        received.load(Ordering::Relaxed)
    );

    listener.stop()?;
    listener.destroy()?;
    Ok(())
}

fn on_data(ready: &Ready<'_>, (reader, received): &mut (File, Arc<AtomicUsize>)) {
    let mut buf = [0; 512];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                info!("fd {} reached end of file", ready.fd());
                if let Err(e) = ready.del() {
                    warn!("Failed to remove fd {}: {e}", ready.fd());
                }
                return;
            }
            Ok(n) => {
                received.fetch_add(n, Ordering::Relaxed);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!("Read from fd {} failed: {e}", ready.fd());
                return;
            }
        }
    }
}

fn produce(
    subset: Vec<usize>,
    writers: Writers,
    remaining: Arc<AtomicUsize>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while remaining.load(Ordering::SeqCst) > 0 {
            for &index in &subset {
                if let Some(writer) = lock(&writers[index]).as_mut() {
                    if let Err(e) = writer.write_all(MESSAGE) {
                        warn!("Write to pipe {index} failed: {e}");
                    }
                }
            }
            thread::sleep(Duration::from_millis(10));
        }
    })
}

fn pipe() -> io::Result<(File, File)> {
    let mut fds = [0; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    unsafe {
        Ok((
            File::from(OwnedFd::from_raw_fd(fds[0])),
            File::from(OwnedFd::from_raw_fd(fds[1])),
        ))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
