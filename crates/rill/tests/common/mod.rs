#![allow(dead_code)]

use std::{
    cell::RefCell,
    net::TcpListener,
    rc::Rc,
    sync::Arc,
    time::{Duration, Instant},
};

use mio::Token;
use rill::{
    ConnectOptions, Driver, DowngradeEventKind, Error, QueueEvent, QueueEventKind,
    SessionObserver, ShutdownEvent, ShutdownEventKind, SocketOptions, StreamHandle, StreamSocket,
    Target,
};

pub const STEP: Duration = Duration::from_millis(10);

/// Session observer that records everything it sees.
#[derive(Default)]
pub struct Recorder {
    pub write_events: RefCell<Vec<QueueEventKind>>,
    pub read_events: RefCell<Vec<QueueEventKind>>,
    pub shutdown_events: RefCell<Vec<ShutdownEventKind>>,
    pub downgrade_events: RefCell<Vec<DowngradeEventKind>>,
    pub errors: RefCell<Vec<Error>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn saw_write_event(&self, kind: QueueEventKind) -> bool {
        self.write_events.borrow().contains(&kind)
    }

    pub fn saw_read_event(&self, kind: QueueEventKind) -> bool {
        self.read_events.borrow().contains(&kind)
    }

    pub fn count_write_events(&self, kind: QueueEventKind) -> usize {
        self.write_events.borrow().iter().filter(|k| **k == kind).count()
    }

    pub fn saw_downgrade(&self, kind: DowngradeEventKind) -> bool {
        self.downgrade_events.borrow().contains(&kind)
    }
}

impl SessionObserver for Recorder {
    fn on_write_queue_event(&self, event: QueueEvent) {
        self.write_events.borrow_mut().push(event.kind);
    }

    fn on_read_queue_event(&self, event: QueueEvent) {
        self.read_events.borrow_mut().push(event.kind);
    }

    fn on_shutdown_event(&self, event: ShutdownEvent) {
        self.shutdown_events.borrow_mut().push(event.kind);
    }

    fn on_downgrade_event(&self, kind: DowngradeEventKind) {
        self.downgrade_events.borrow_mut().push(kind);
    }

    fn on_transport_error(&self, error: Error) {
        self.errors.borrow_mut().push(error);
    }
}

/// Poll the driver until `done` holds, panicking after `timeout`.
pub fn drive_until(driver: &mut Driver, timeout: Duration, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !done() {
        driver.poll(Some(STEP)).unwrap();
        assert!(Instant::now() < deadline, "timed out driving the reactor");
    }
}

/// Connect two sockets over loopback inside one driver: a connecting client
/// and an adopted server-side socket.
pub fn tcp_pair(
    driver: &mut Driver,
    client_options: SocketOptions,
    server_options: SocketOptions,
    client_session: Option<Arc<Recorder>>,
    server_session: Option<Arc<Recorder>>,
) -> (Token, Token) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();

    let connected: Rc<RefCell<Option<Result<(), Error>>>> = Rc::new(RefCell::new(None));
    let client_token = {
        let mut socket = StreamSocket::open(driver.reactor(), client_options);
        if let Some(session) = client_session {
            socket.set_session(session);
        }
        let connected = Rc::clone(&connected);
        socket
            .connect(
                driver.reactor(),
                Target::from(addr),
                &ConnectOptions::default(),
                Box::new(move |result| {
                    *connected.borrow_mut() = Some(result.map(|_| ()));
                }),
            )
            .unwrap();
        driver.insert(socket)
    };

    let mut server_token = None;
    let deadline = Instant::now() + Duration::from_secs(5);
    while connected.borrow().is_none() || server_token.is_none() {
        driver.poll(Some(STEP)).unwrap();
        if server_token.is_none()
            && let Ok((stream, _)) = listener.accept()
        {
            stream.set_nonblocking(true).unwrap();
            let handle = StreamHandle::from(mio::net::TcpStream::from_std(stream));
            let mut socket =
                StreamSocket::adopt(driver.reactor(), handle, server_options.clone()).unwrap();
            if let Some(session) = &server_session {
                socket.set_session(session.clone());
            }
            server_token = Some(driver.insert(socket));
        }
        assert!(Instant::now() < deadline, "connection pair never established");
    }
    connected.borrow().as_ref().unwrap().as_ref().expect("connect failed");

    (client_token, server_token.unwrap())
}
