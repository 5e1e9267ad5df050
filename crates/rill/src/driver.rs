use std::{io, time::Duration};

use mio::{Events, Token};
use rill_reactor::WAKER_TOKEN;

use crate::{
    socket::{SocketReactor, StreamSocket},
    soft_panic,
};

/// Owns one reactor and the sockets attached to it, routing readiness
/// events, timers, remote completions and detach notifications by token.
///
/// Drive it from a loop: one [`Driver::poll`] per iteration dispatches
/// everything that became ready and then runs the deferred announcements
/// collected along the way.
pub struct Driver {
    reactor: SocketReactor,
    events: Events,
    sockets: Vec<(Token, StreamSocket)>,
}

impl Driver {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            reactor: SocketReactor::new()?,
            events: Events::with_capacity(128),
            sockets: Vec::new(),
        })
    }

    pub fn reactor(&mut self) -> &mut SocketReactor {
        &mut self.reactor
    }

    /// Add a socket to the routing table and announce it if it was adopted
    /// already-established.
    pub fn insert(&mut self, socket: StreamSocket) -> Token {
        let token = socket.token();
        socket.announce_adopted(&mut self.reactor);
        self.sockets.push((token, socket));
        token
    }

    pub fn remove(&mut self, token: Token) -> Option<StreamSocket> {
        let index = self.sockets.iter().position(|(t, _)| *t == token)?;
        Some(self.sockets.swap_remove(index).1)
    }

    /// Borrow a socket together with the reactor, for issuing operations.
    pub fn entry(&mut self, token: Token) -> Option<(&mut StreamSocket, &mut SocketReactor)> {
        let Self { reactor, sockets, .. } = self;
        let socket = sockets.iter_mut().find(|(t, _)| *t == token).map(|(_, s)| s)?;
        Some((socket, reactor))
    }

    /// One reactor pass: wait for readiness (bounded by `timeout` and the
    /// earliest timer), dispatch to sockets, run deferred work.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let Self { reactor, events, sockets } = self;
        reactor.poll(events, timeout)?;

        for event in events.iter() {
            let token = event.token();
            if token == WAKER_TOKEN {
                continue;
            }
            match sockets.iter_mut().find(|(t, _)| *t == token) {
                Some((_, socket)) => socket.process_io(reactor, event),
                None => soft_panic!("driver: readiness event for unknown token {token:?}"),
            }
        }

        for (token, tag) in reactor.take_expired() {
            if let Some((_, socket)) = sockets.iter_mut().find(|(t, _)| *t == token) {
                socket.process_tag(reactor, tag);
            }
        }

        for token in reactor.take_detached() {
            if let Some((_, socket)) = sockets.iter_mut().find(|(t, _)| *t == token) {
                socket.process_detached(reactor);
            }
        }

        reactor.run_deferred();
        Ok(())
    }
}
