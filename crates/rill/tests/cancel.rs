mod common;

use std::{
    cell::RefCell,
    rc::Rc,
    time::{Duration, Instant},
};

use rill::{Driver, Error, OpToken, ReceiveOptions, SendOptions, SocketOptions};

use common::{STEP, drive_until, tcp_pair};

/// A queued send cancelled by token completes with `Cancelled`; the entries
/// around it still reach the peer intact.
#[test]
fn cancel_queued_send_by_token() {
    const BIG: usize = 2 * 1024 * 1024;
    const TAIL: usize = 64 * 1024;

    let mut driver = Driver::new().unwrap();
    let client_options =
        SocketOptions { send_buffer_size: Some(32 * 1024), ..SocketOptions::default() };
    let server_options = SocketOptions {
        receive_buffer_size: Some(32 * 1024),
        receive_high_watermark: 64 * 1024,
        ..SocketOptions::default()
    };
    let (client, server) = tcp_pair(&mut driver, client_options, server_options, None, None);

    let token = OpToken::next();
    let a_done = Rc::new(RefCell::new(false));
    let b_outcome: Rc<RefCell<Option<Result<(), Error>>>> = Rc::new(RefCell::new(None));
    let c_done = Rc::new(RefCell::new(false));
    {
        let (socket, reactor) = driver.entry(client).unwrap();
        let a = Rc::clone(&a_done);
        socket
            .send(
                reactor,
                vec![0xaau8; BIG],
                &SendOptions::default(),
                Some(Box::new(move |result| {
                    result.unwrap();
                    *a.borrow_mut() = true;
                })),
            )
            .unwrap();
        let b = Rc::clone(&b_outcome);
        socket
            .send(
                reactor,
                vec![0xbbu8; 1024],
                &SendOptions { token: Some(token), ..SendOptions::default() },
                Some(Box::new(move |result| *b.borrow_mut() = Some(result))),
            )
            .unwrap();
        let c = Rc::clone(&c_done);
        socket
            .send(
                reactor,
                vec![0xccu8; TAIL],
                &SendOptions::default(),
                Some(Box::new(move |result| {
                    result.unwrap();
                    *c.borrow_mut() = true;
                })),
            )
            .unwrap();
    }

    // Let the queue stall behind the undrained peer, then cancel B.
    for _ in 0..10 {
        driver.poll(Some(STEP)).unwrap();
    }
    {
        let (socket, reactor) = driver.entry(client).unwrap();
        socket.cancel(reactor, token).unwrap();
        // The token is gone now.
        assert_eq!(socket.cancel(reactor, token).unwrap_err(), Error::Invalid);
    }
    drive_until(&mut driver, Duration::from_secs(5), || b_outcome.borrow().is_some());
    assert_eq!(*b_outcome.borrow(), Some(Err(Error::Cancelled)));

    let mut arrived = Vec::with_capacity(BIG + TAIL);
    let deadline = Instant::now() + Duration::from_secs(30);
    while arrived.len() < BIG + TAIL {
        driver.poll(Some(STEP)).unwrap();
        let (socket, reactor) = driver.entry(server).unwrap();
        while let Ok((_, data)) = socket.receive(reactor, &ReceiveOptions::default()) {
            arrived.extend_from_slice(&data);
        }
        assert!(Instant::now() < deadline, "payload never fully arrived");
    }
    assert!(arrived[..BIG].iter().all(|b| *b == 0xaa));
    assert!(arrived[BIG..].iter().all(|b| *b == 0xcc));
    assert!(*a_done.borrow());
    assert!(*c_done.borrow());
}

/// Cancelling a pending callback receive fires it once with `Cancelled`.
#[test]
fn cancel_pending_receive_by_token() {
    let mut driver = Driver::new().unwrap();
    let (_client, server) =
        tcp_pair(&mut driver, SocketOptions::default(), SocketOptions::default(), None, None);

    let token = OpToken::next();
    let outcome: Rc<RefCell<Option<Error>>> = Rc::new(RefCell::new(None));
    {
        let outcome = Rc::clone(&outcome);
        let (socket, reactor) = driver.entry(server).unwrap();
        socket
            .receive_with(
                reactor,
                &ReceiveOptions { token: Some(token), ..ReceiveOptions::default() },
                Box::new(move |result| {
                    *outcome.borrow_mut() = Some(result.unwrap_err());
                }),
            )
            .unwrap();
    }
    {
        let (socket, reactor) = driver.entry(server).unwrap();
        socket.cancel(reactor, token).unwrap();
    }
    drive_until(&mut driver, Duration::from_secs(5), || outcome.borrow().is_some());
    assert_eq!(*outcome.borrow(), Some(Error::Cancelled));
}
