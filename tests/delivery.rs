mod common;

use std::fs::File;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use common::{drain, pipe, wait_until};
use epoll_listener::{Config, Error, Listener};

const TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn test_undrained_level_is_not_redelivered() {
    common::init_logger();
    let listener = Listener::new(1).unwrap();
    let (reader, mut writer) = pipe();
    let calls = Arc::new(AtomicUsize::new(0));

    listener
        .add(reader.as_raw_fd(), calls.clone(), |_, calls| {
            calls.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    listener.start().unwrap();

    writer.write_all(b"hello").unwrap();
    assert!(wait_until(TIMEOUT, || calls.load(Ordering::SeqCst) == 1));

    thread::sleep(Duration::from_millis(100));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    listener.stop().unwrap();
    listener.destroy().unwrap();
    drop(reader);
}

#[test]
fn test_every_drained_edge_is_delivered_once() {
    let listener = Listener::new(2).unwrap();
    let (reader, mut writer) = pipe();
    let (tx, rx) = mpsc::channel();

    listener
        .add(reader.as_raw_fd(), (reader, tx), |ready, (reader, tx)| {
            assert!(ready.event().is_readable());
            let _ = tx.send(drain(&*reader).bytes);
        })
        .unwrap();
    listener.start().unwrap();

    for message in [&b"one"[..], b"two", b"three"] {
        writer.write_all(message).unwrap();
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), message);
    }
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    listener.stop().unwrap();
}

#[test]
fn test_readd_after_removal_is_a_fresh_registration() {
    let listener = Listener::new(2).unwrap();
    let (reader, mut writer) = pipe();
    let reader = Arc::new(reader);
    let fd = reader.as_raw_fd();
    let (tx, rx) = mpsc::channel::<(&'static str, Vec<u8>)>();

    let register = |tag: &'static str| {
        let context = (tag, Arc::clone(&reader), tx.clone());
        listener.add(fd, context, |_, (tag, reader, tx)| {
            let _ = tx.send((*tag, drain(&**reader).bytes));
        })
    };

    register("first").unwrap();
    listener.start().unwrap();

    writer.write_all(b"a").unwrap();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), ("first", b"a".to_vec()));

    let removed = listener.del_with_notify(fd).unwrap();
    removed.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(listener.registered_counts().iter().sum::<usize>(), 0);
    // The removal dropped the first context, and its clone of the reader.
    assert_eq!(Arc::strong_count(&reader), 1);

    register("second").unwrap();
    writer.write_all(b"b").unwrap();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), ("second", b"b".to_vec()));
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    listener.stop().unwrap();
    listener.destroy().unwrap();
}

#[test]
fn test_registrations_are_balanced() {
    const HANDLERS: usize = 4;
    let listener = Listener::new(HANDLERS).unwrap();

    let pipes: Vec<(File, File)> = (0..3 * HANDLERS).map(|_| pipe()).collect();
    for (reader, _) in &pipes {
        listener.add(reader.as_raw_fd(), (), |_, _| {}).unwrap();
    }
    assert_eq!(listener.registered_counts(), vec![3; HANDLERS]);

    let extra: Vec<(File, File)> = (0..3).map(|_| pipe()).collect();
    for (reader, _) in &extra {
        listener.add(reader.as_raw_fd(), (), |_, _| {}).unwrap();
    }
    let counts = listener.registered_counts();
    let max = counts.iter().max().unwrap();
    let min = counts.iter().min().unwrap();
    assert!(max - min <= 1, "{counts:?}");
    assert_eq!(counts, vec![4, 4, 4, 3]);
}

#[test]
fn test_balance_follows_removals() {
    let listener = Listener::new(2).unwrap();
    let pipes: Vec<(File, File)> = (0..4).map(|_| pipe()).collect();
    for (reader, _) in &pipes {
        listener.add(reader.as_raw_fd(), (), |_, _| {}).unwrap();
    }
    listener.start().unwrap();

    // pipes[0] and pipes[2] went to handler 0.
    for index in [0, 2] {
        let removed = listener.del_with_notify(pipes[index].0.as_raw_fd()).unwrap();
        removed.recv_timeout(TIMEOUT).unwrap();
    }
    assert_eq!(listener.registered_counts(), vec![0, 2]);

    let (reader, _writer) = pipe();
    listener.add(reader.as_raw_fd(), (), |_, _| {}).unwrap();
    assert_eq!(listener.registered_counts(), vec![1, 2]);
    listener.stop().unwrap();
}

#[test]
fn test_callback_can_register_another_descriptor() {
    let listener = Listener::with_config(Config::new(2).event_capacity(4)).unwrap();
    let (first_reader, mut first_writer) = pipe();
    let (second_reader, mut second_writer) = pipe();
    let (tx, rx) = mpsc::channel();

    let second = Some((second_reader, tx.clone()));
    listener
        .add(
            first_reader.as_raw_fd(),
            (first_reader, second),
            |ready, (reader, second)| {
                drain(&*reader);
                if let Some((second_reader, tx)) = second.take() {
                    let fd = second_reader.as_raw_fd();
                    ready
                        .registry()
                        .add(fd, (second_reader, tx), |ready, (reader, tx)| {
                            let _ = tx.send((ready.fd(), drain(&*reader).bytes));
                        })
                        .unwrap();
                }
            },
        )
        .unwrap();
    listener.start().unwrap();

    first_writer.write_all(b"register").unwrap();
    assert!(wait_until(TIMEOUT, || {
        listener.registered_counts().iter().sum::<usize>() == 2
    }));

    second_writer.write_all(b"hi").unwrap();
    let (_, bytes) = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(bytes, b"hi");
    listener.stop().unwrap();
}

#[test]
fn test_del_from_the_callback_stops_delivery() {
    let listener = Listener::new(1).unwrap();
    let (reader, mut writer) = pipe();
    let fd = reader.as_raw_fd();
    let calls = Arc::new(AtomicUsize::new(0));

    listener
        .add(fd, (reader, calls.clone()), |ready, (reader, calls)| {
            calls.fetch_add(1, Ordering::SeqCst);
            if drain(&*reader).bytes == b"bye" {
                ready.del().unwrap();
                assert!(matches!(ready.del(), Err(Error::NotFound(_))));
            }
        })
        .unwrap();
    listener.start().unwrap();

    writer.write_all(b"bye").unwrap();
    assert!(wait_until(TIMEOUT, || listener.registered_counts() == [0]));

    // The read end was owned by the released context, so writing now fails.
    assert!(writer.write_all(b"more").is_err());
    thread::sleep(Duration::from_millis(50));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    listener.stop().unwrap();
}
