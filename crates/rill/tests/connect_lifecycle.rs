mod common;

use std::{
    cell::RefCell,
    net::TcpListener,
    rc::Rc,
    sync::Arc,
    time::Duration,
};

use rill::{
    ConnectOptions, Driver, Error, OpenState, Resolver, ShutdownDirection, ShutdownEventKind,
    ShutdownMode, SocketOptions, StreamSocket, Target,
};

use common::{Recorder, drive_until, tcp_pair};

/// Connecting to a dead port retries as configured and then reports the
/// terminal error exactly once.
#[test]
fn refused_connect_reports_terminal_error_once() {
    // Grab a port nobody listens on.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let mut driver = Driver::new().unwrap();
    let fired = Rc::new(RefCell::new(0usize));
    let outcome: Rc<RefCell<Option<Error>>> = Rc::new(RefCell::new(None));
    let token = {
        let mut socket = StreamSocket::open(driver.reactor(), SocketOptions::default());
        let fired = Rc::clone(&fired);
        let outcome = Rc::clone(&outcome);
        socket
            .connect(
                driver.reactor(),
                Target::from(addr),
                &ConnectOptions {
                    retry_count: Some(2),
                    retry_interval: Some(Duration::from_millis(50)),
                    deadline: Some(Duration::from_secs(2)),
                    token: None,
                },
                Box::new(move |result| {
                    *fired.borrow_mut() += 1;
                    *outcome.borrow_mut() = Some(result.unwrap_err());
                }),
            )
            .unwrap();
        driver.insert(socket)
    };

    drive_until(&mut driver, Duration::from_secs(10), || *fired.borrow() > 0);
    // A few more passes to catch any double dispatch.
    for _ in 0..10 {
        driver.poll(Some(common::STEP)).unwrap();
    }
    assert_eq!(*fired.borrow(), 1);
    assert!(outcome.borrow().is_some());

    let (socket, _) = driver.entry(token).unwrap();
    assert_eq!(socket.open_state(), OpenState::Closed);
}

/// Shutting down while a name resolution is still outstanding cancels the
/// connect; its callback fires once and the socket ends closed.
#[test]
fn shutdown_while_resolving_cancels_connect() {
    struct NeverResolver;
    impl Resolver for NeverResolver {
        fn resolve(&self, _name: &str, _done: rill::resolver::ResolveDone) {
            // Drops the completion: the lookup never answers.
        }
    }

    let mut driver = Driver::new().unwrap();
    let fired = Rc::new(RefCell::new(0usize));
    let outcome: Rc<RefCell<Option<Error>>> = Rc::new(RefCell::new(None));
    let token = {
        let mut socket = StreamSocket::open(driver.reactor(), SocketOptions::default());
        socket.set_resolver(Arc::new(NeverResolver));
        let fired = Rc::clone(&fired);
        let outcome = Rc::clone(&outcome);
        socket
            .connect(
                driver.reactor(),
                Target::Name("peer.example.invalid:9999".into()),
                &ConnectOptions::default(),
                Box::new(move |result| {
                    *fired.borrow_mut() += 1;
                    *outcome.borrow_mut() = Some(result.unwrap_err());
                }),
            )
            .unwrap();
        driver.insert(socket)
    };

    // Let the first attempt start and park on the resolver.
    for _ in 0..3 {
        driver.poll(Some(common::STEP)).unwrap();
    }
    {
        let (socket, reactor) = driver.entry(token).unwrap();
        socket.shutdown(reactor, ShutdownDirection::Both, ShutdownMode::Graceful).unwrap();
    }
    drive_until(&mut driver, Duration::from_secs(5), || *fired.borrow() > 0);
    for _ in 0..5 {
        driver.poll(Some(common::STEP)).unwrap();
    }

    assert_eq!(*fired.borrow(), 1);
    assert_eq!(*outcome.borrow(), Some(Error::Cancelled));
    let (socket, _) = driver.entry(token).unwrap();
    assert_eq!(socket.open_state(), OpenState::Closed);
}

/// A close issued while the shutdown detachment is in flight is deferred and
/// runs right after detachment completes, after the shutdown announcements.
#[test]
fn close_during_detachment_is_deferred() {
    let mut driver = Driver::new().unwrap();
    let session = Recorder::new();
    let (client, _server) = tcp_pair(
        &mut driver,
        SocketOptions::default(),
        SocketOptions::default(),
        Some(Arc::clone(&session)),
        None,
    );

    let closed = Rc::new(RefCell::new(false));
    {
        let (socket, reactor) = driver.entry(client).unwrap();
        socket.shutdown(reactor, ShutdownDirection::Both, ShutdownMode::Immediate).unwrap();
        // Detachment is now in flight; this close must wait for it.
        let closed = Rc::clone(&closed);
        socket.close(reactor, Some(Box::new(move || *closed.borrow_mut() = true)));
    }

    drive_until(&mut driver, Duration::from_secs(5), || *closed.borrow());
    assert_eq!(
        session.shutdown_events.borrow().as_slice(),
        &[
            ShutdownEventKind::Initiated,
            ShutdownEventKind::Send,
            ShutdownEventKind::Receive,
            ShutdownEventKind::Complete,
        ],
    );
    let (socket, _) = driver.entry(client).unwrap();
    assert_eq!(socket.open_state(), OpenState::Closed);
}
