use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use mio::{Events, Interest, Poll, Token, Waker, event::Source};
use tracing::{debug, trace};

use crate::timer::{TimerId, TimerQueue};

/// Token reserved for the cross-thread waker. Never handed out by
/// [`Reactor::allocate_token`]; poll-loop drivers skip events carrying it.
pub const WAKER_TOKEN: Token = Token(0);

const DEFAULT_MAX_HANDLES: usize = 65_536;

#[derive(Clone, Copy, Default)]
struct InterestState {
    want_read: bool,
    want_write: bool,
    registered: bool,
}

impl InterestState {
    fn wanted(self) -> Option<Interest> {
        match (self.want_read, self.want_write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// Readiness reactor: a `mio::Poll` wrapper owning interest bookkeeping,
/// one-shot timers, a waker-fed remote completion queue, asynchronous socket
/// detachment and a deferred-execution queue.
///
/// `T` is the caller's routing tag, delivered back with expired timers and
/// remote completions. The reactor never interprets it.
///
/// Detachment is asynchronous by contract: `detach` deregisters the source
/// immediately but the completion is only observable through
/// [`Reactor::take_detached`] after the next [`Reactor::poll`], so a caller
/// can rely on no further readiness events for that token arriving in
/// between.
pub struct Reactor<T> {
    poll: Poll,
    timers: TimerQueue<T>,
    expired: Vec<(Token, T)>,
    remote: Arc<Mutex<Vec<(Token, T)>>>,
    waker: Arc<Waker>,
    interests: HashMap<Token, InterestState>,
    pending_detach: Vec<Token>,
    detached: Vec<Token>,
    deferred: VecDeque<Box<dyn FnOnce()>>,
    reservations: usize,
    max_handles: usize,
    next_token: usize,
}

impl<T: Send + 'static> Reactor<T> {
    pub fn new() -> io::Result<Self> {
        Self::with_handle_limit(DEFAULT_MAX_HANDLES)
    }

    pub fn with_handle_limit(max_handles: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(Self {
            poll,
            timers: TimerQueue::new(),
            expired: Vec::new(),
            remote: Arc::new(Mutex::new(Vec::new())),
            waker,
            interests: HashMap::new(),
            pending_detach: Vec::new(),
            detached: Vec::new(),
            deferred: VecDeque::new(),
            reservations: 0,
            max_handles,
            next_token: WAKER_TOKEN.0 + 1,
        })
    }

    pub fn allocate_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Reserve one handle slot. Callers must pair a successful reservation
    /// with [`Reactor::release_handle_reservation`] when the handle closes.
    pub fn acquire_handle_reservation(&mut self) -> bool {
        if self.reservations >= self.max_handles {
            debug!(limit = self.max_handles, "reactor: handle reservations exhausted");
            return false;
        }
        self.reservations += 1;
        true
    }

    pub fn release_handle_reservation(&mut self) {
        self.reservations = self.reservations.saturating_sub(1);
    }

    /// Start tracking `token`. No readiness is requested until a
    /// `show_readable`/`show_writable` call asks for it.
    pub fn attach<S: Source + ?Sized>(&mut self, _source: &mut S, token: Token) -> io::Result<()> {
        self.interests.insert(token, InterestState::default());
        trace!(?token, "reactor: socket attached");
        Ok(())
    }

    pub fn show_readable<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
    ) -> io::Result<()> {
        self.set_interest(source, token, |s| s.want_read = true)
    }

    pub fn hide_readable<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
    ) -> io::Result<()> {
        self.set_interest(source, token, |s| s.want_read = false)
    }

    pub fn show_writable<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
    ) -> io::Result<()> {
        self.set_interest(source, token, |s| s.want_write = true)
    }

    pub fn hide_writable<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
    ) -> io::Result<()> {
        self.set_interest(source, token, |s| s.want_write = false)
    }

    /// Re-register with the current interest set. With edge-triggered
    /// polling a re-registration reports a fresh event if the source is
    /// still ready, which is what a non-greedy iteration needs after
    /// deliberately leaving data behind.
    pub fn rearm<S: Source + ?Sized>(&mut self, source: &mut S, token: Token) -> io::Result<()> {
        let Some(state) = self.interests.get(&token).copied() else {
            return Ok(());
        };
        if let Some(interest) = state.wanted()
            && state.registered
        {
            self.poll.registry().reregister(source, token, interest)?;
        }
        Ok(())
    }

    fn set_interest<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
        change: impl FnOnce(&mut InterestState),
    ) -> io::Result<()> {
        let Some(state) = self.interests.get_mut(&token) else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "token not attached"));
        };
        let before = *state;
        change(state);
        let after = *state;
        if before.want_read == after.want_read && before.want_write == after.want_write {
            return Ok(());
        }
        match (after.wanted(), before.registered) {
            (Some(interest), true) => self.poll.registry().reregister(source, token, interest)?,
            (Some(interest), false) => {
                self.poll.registry().register(source, token, interest)?;
                self.interests.get_mut(&token).unwrap().registered = true;
            }
            (None, true) => {
                self.poll.registry().deregister(source)?;
                self.interests.get_mut(&token).unwrap().registered = false;
            }
            (None, false) => {}
        }
        Ok(())
    }

    /// Remove the source from the readiness set. Completion surfaces through
    /// [`Reactor::take_detached`] after the next poll.
    pub fn detach<S: Source + ?Sized>(&mut self, source: &mut S, token: Token) -> io::Result<()> {
        if let Some(state) = self.interests.remove(&token)
            && state.registered
        {
            self.poll.registry().deregister(source)?;
        }
        self.pending_detach.push(token);
        trace!(?token, "reactor: socket detaching");
        Ok(())
    }

    pub fn schedule_timer(&mut self, deadline: Instant, token: Token, tag: T) -> TimerId {
        self.timers.schedule(deadline, token, tag)
    }

    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        self.timers.cancel(id)
    }

    /// Handle for posting completions from other threads; posting wakes the
    /// poll.
    pub fn remote_handle(&self) -> RemoteHandle<T> {
        RemoteHandle { queue: Arc::clone(&self.remote), waker: Arc::clone(&self.waker) }
    }

    /// Queue a closure to run at the end of the current dispatch cycle.
    pub fn execute(&mut self, f: Box<dyn FnOnce()>) {
        self.deferred.push_back(f);
    }

    /// Runs queued closures in arrival order.
    pub fn run_deferred(&mut self) {
        while let Some(f) = self.deferred.pop_front() {
            f();
        }
    }

    /// Wait for readiness, clamped to the earliest timer deadline. Pending
    /// detachments and deferred work force an immediate pass.
    pub fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let now = Instant::now();
        let mut effective = timeout;
        if let Some(deadline) = self.timers.next_deadline() {
            let until = deadline.saturating_duration_since(now);
            effective = Some(effective.map_or(until, |t| t.min(until)));
        }
        if !self.pending_detach.is_empty() || !self.deferred.is_empty() {
            effective = Some(Duration::ZERO);
        }

        loop {
            match self.poll.poll(events, effective) {
                Ok(()) => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        let now = Instant::now();
        while let Some(fired) = self.timers.pop_expired(now) {
            self.expired.push(fired);
        }
        {
            let mut queue = self.remote.lock().unwrap_or_else(|e| e.into_inner());
            if !queue.is_empty() {
                self.expired.reserve(queue.len());
                // keep remote completions behind already-expired timers
                for item in queue.drain(..) {
                    self.expired.push(item);
                }
            }
        }
        self.detached.append(&mut self.pending_detach);
        Ok(())
    }

    /// Expired timers and remote completions collected by the last poll, in
    /// firing order.
    pub fn take_expired(&mut self) -> Vec<(Token, T)> {
        std::mem::take(&mut self.expired)
    }

    /// Tokens whose detachment completed during the last poll.
    pub fn take_detached(&mut self) -> Vec<Token> {
        std::mem::take(&mut self.detached)
    }
}

/// Cloneable cross-thread poster paired with one reactor.
pub struct RemoteHandle<T> {
    queue: Arc<Mutex<Vec<(Token, T)>>>,
    waker: Arc<Waker>,
}

impl<T> Clone for RemoteHandle<T> {
    fn clone(&self) -> Self {
        Self { queue: Arc::clone(&self.queue), waker: Arc::clone(&self.waker) }
    }
}

impl<T: Send> RemoteHandle<T> {
    pub fn post(&self, token: Token, tag: T) {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).push((token, tag));
        let _ = self.waker.wake();
    }
}
