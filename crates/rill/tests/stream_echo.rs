mod common;

use std::{
    cell::RefCell,
    rc::Rc,
    sync::Arc,
    time::{Duration, Instant},
};

use rill::{
    ConnectOptions, Driver, Endpoint, Error, QueueEventKind, ReceiveOptions, SendOptions,
    ShutdownEventKind, SocketOptions, StreamHandle, StreamSocket, Target,
};

use common::{Recorder, STEP, drive_until, tcp_pair};

#[test]
fn tcp_echo_roundtrip() {
    let mut driver = Driver::new().unwrap();
    let server_session = Recorder::new();
    let (client, server) = tcp_pair(
        &mut driver,
        SocketOptions::default(),
        SocketOptions::default(),
        None,
        Some(Arc::clone(&server_session)),
    );

    let message = *b"the quick brown fox jumps over a";
    assert_eq!(message.len(), 32);

    // Server asks for exactly 32 bytes.
    let received: Rc<RefCell<Option<Vec<u8>>>> = Rc::new(RefCell::new(None));
    {
        let received = Rc::clone(&received);
        let (socket, reactor) = driver.entry(server).unwrap();
        socket
            .receive_with(
                reactor,
                &ReceiveOptions { min_size: 32, max_size: 32, ..ReceiveOptions::default() },
                Box::new(move |result| {
                    let (_, data) = result.unwrap();
                    *received.borrow_mut() = Some(data.to_vec());
                }),
            )
            .unwrap();
    }

    let sent = Rc::new(RefCell::new(false));
    {
        let sent = Rc::clone(&sent);
        let (socket, reactor) = driver.entry(client).unwrap();
        socket
            .send(
                reactor,
                message.to_vec(),
                &SendOptions::default(),
                Some(Box::new(move |result| {
                    result.unwrap();
                    *sent.borrow_mut() = true;
                })),
            )
            .unwrap();
    }

    drive_until(&mut driver, Duration::from_secs(5), || {
        received.borrow().is_some() && *sent.borrow()
    });
    assert_eq!(received.borrow().as_deref(), Some(&message[..]));
    assert!(server_session.saw_read_event(QueueEventKind::LowWatermark));

    // Client closes; the server side observes EOF and completes its own
    // shutdown, then further receives are invalid on the closed socket.
    let closed = Rc::new(RefCell::new(false));
    {
        let closed = Rc::clone(&closed);
        let (socket, reactor) = driver.entry(client).unwrap();
        socket.close(reactor, Some(Box::new(move || *closed.borrow_mut() = true)));
    }
    drive_until(&mut driver, Duration::from_secs(5), || *closed.borrow());

    drive_until(&mut driver, Duration::from_secs(5), || {
        server_session
            .shutdown_events
            .borrow()
            .iter()
            .any(|kind| *kind == ShutdownEventKind::Complete)
    });
    let (socket, reactor) = driver.entry(server).unwrap();
    assert_eq!(socket.receive(reactor, &ReceiveOptions::default()).unwrap_err(), Error::Invalid);
}

#[cfg(unix)]
#[test]
fn local_domain_echo() {
    use std::os::unix::net::UnixListener;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rill.sock");
    let listener = UnixListener::bind(&path).unwrap();
    listener.set_nonblocking(true).unwrap();

    let mut driver = Driver::new().unwrap();

    let connected = Rc::new(RefCell::new(false));
    let client = {
        let mut socket = StreamSocket::open(driver.reactor(), SocketOptions::default());
        let connected = Rc::clone(&connected);
        socket
            .connect(
                driver.reactor(),
                Target::Endpoint(Endpoint::Local(path.clone())),
                &ConnectOptions::default(),
                Box::new(move |result| {
                    result.unwrap();
                    *connected.borrow_mut() = true;
                }),
            )
            .unwrap();
        driver.insert(socket)
    };

    let mut server = None;
    let deadline = Instant::now() + Duration::from_secs(5);
    while !*connected.borrow() || server.is_none() {
        driver.poll(Some(STEP)).unwrap();
        if server.is_none()
            && let Ok((stream, _)) = listener.accept()
        {
            stream.set_nonblocking(true).unwrap();
            let handle = StreamHandle::from(mio::net::UnixStream::from_std(stream));
            let socket =
                StreamSocket::adopt(driver.reactor(), handle, SocketOptions::default()).unwrap();
            server = Some(driver.insert(socket));
        }
        assert!(Instant::now() < deadline, "local pair never established");
    }
    let server = server.unwrap();

    let payload = b"over the local transport".to_vec();
    {
        let (socket, reactor) = driver.entry(client).unwrap();
        socket.send(reactor, payload.clone(), &SendOptions::default(), None).unwrap();
        assert!(socket.remote_endpoint().is_some());
    }

    let received: Rc<RefCell<Option<Vec<u8>>>> = Rc::new(RefCell::new(None));
    {
        let received = Rc::clone(&received);
        let (socket, reactor) = driver.entry(server).unwrap();
        socket
            .receive_with(
                reactor,
                &ReceiveOptions {
                    min_size: payload.len(),
                    max_size: payload.len(),
                    ..ReceiveOptions::default()
                },
                Box::new(move |result| {
                    let (_, data) = result.unwrap();
                    *received.borrow_mut() = Some(data.to_vec());
                }),
            )
            .unwrap();
    }

    drive_until(&mut driver, Duration::from_secs(5), || received.borrow().is_some());
    assert_eq!(received.borrow().as_deref(), Some(&payload[..]));
}

/// Zero-copy engagement over loopback: the kernel typically reports the
/// copies as deferred (disposition "copied"), which must disable the
/// mechanism while still completing every outstanding send exactly once.
#[cfg(target_os = "linux")]
#[test]
fn zero_copy_sends_complete() {
    let mut driver = Driver::new().unwrap();
    let options = SocketOptions { zero_copy_threshold: Some(1024), ..SocketOptions::default() };
    let (client, server) = tcp_pair(
        &mut driver,
        options,
        SocketOptions::default(),
        None,
        None,
    );

    let completions = Rc::new(RefCell::new(0usize));
    for _ in 0..4 {
        let completions = Rc::clone(&completions);
        let (socket, reactor) = driver.entry(client).unwrap();
        socket
            .send(
                reactor,
                vec![0x5au8; 64 * 1024],
                &SendOptions::default(),
                Some(Box::new(move |result| {
                    result.unwrap();
                    *completions.borrow_mut() += 1;
                })),
            )
            .unwrap();
    }

    // Drain the peer so the kernel can retire every in-flight buffer.
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut drained = 0usize;
    while *completions.borrow() < 4 || drained < 4 * 64 * 1024 {
        driver.poll(Some(STEP)).unwrap();
        let (socket, reactor) = driver.entry(server).unwrap();
        while let Ok((_, data)) = socket.receive(reactor, &ReceiveOptions::default()) {
            drained += data.len();
        }
        assert!(Instant::now() < deadline, "zero-copy sends never completed");
    }
    assert_eq!(*completions.borrow(), 4);
}
