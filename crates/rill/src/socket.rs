//! The per-connection runtime: connect machine, send/receive paths, TLS
//! pipeline, zero-copy accounting and the shutdown/detach sequence, driven
//! by reactor readiness events and timers.

use std::{
    io::IoSlice,
    net::{Shutdown as NetShutdown, SocketAddr},
    num::NonZeroU32,
    os::fd::AsRawFd,
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use bytes::Bytes;
use governor::{DefaultDirectRateLimiter, clock::Clock};
use mio::Token;
use rill_reactor::Reactor;
use tracing::{debug, trace, warn};

use crate::{
    endpoint::Endpoint,
    error::Error,
    event::{
        BindCallback, BindContext, CloseCallback, ConnectCallback, ConnectContext, Manager,
        QueueEventKind, ReceiveCallback, ReceiveContext, SendCallback, SessionObserver,
        ShutdownEvent, ShutdownEventKind, UpgradeCallback, UpgradeContext,
    },
    handle::StreamHandle,
    notify::{Notification, TxTimestamp, ZeroCopyDisposition, ZeroCopyNotice},
    options::{
        ConnectOptions, OpToken, ReceiveOptions, SendOptions, ShutdownDirection, ShutdownMode,
        ShutdownOrigin, SocketOptions, UpgradeOptions,
    },
    queue::{
        receive::{ReceiveCallbackEntry, ReceiveQueue},
        send::{SendEntry, SendQueue},
    },
    resolver::{Resolver, SystemResolver},
    state::{DetachState, FlowControlState, OpenState, ShutdownContext, ShutdownState},
    sys,
    timestamp::TimestampCorrelator,
    tls::{TlsPipeline, UpgradeMode},
    zerocopy::ZeroCopyQueue,
};

/// Reactor instantiated with this socket's routing tags.
pub type SocketReactor = Reactor<SocketTag>;

/// Timer and remote-completion payloads routed back to a socket.
pub enum SocketTag {
    ConnectRetry,
    ConnectDeadline,
    UpgradeDeadline,
    SendRate,
    ReceiveRate,
    SendDeadline(u64),
    ReceiveDeadline(u64),
    ConnectResolved { attempt: u64, result: Result<SocketAddr, Error> },
    BindResolved(Result<SocketAddr, Error>),
}

/// Remote target of a bind or connect.
#[derive(Clone, Debug)]
pub enum Target {
    Endpoint(Endpoint),
    Name(String),
}

impl From<SocketAddr> for Target {
    fn from(addr: SocketAddr) -> Self {
        Self::Endpoint(Endpoint::Ip(addr))
    }
}

impl From<Endpoint> for Target {
    fn from(endpoint: Endpoint) -> Self {
        Self::Endpoint(endpoint)
    }
}

/// Work to run once the in-flight reactor detachment completes.
enum DetachFollowup {
    ShutdownSequence(ShutdownContext),
    ConnectCleanup { terminal: bool },
}

/// Top-level operations observed while detaching, replayed in arrival order
/// once detachment completes.
enum DeferredOp {
    Shutdown(ShutdownDirection, ShutdownMode),
    Close(Option<CloseCallback>),
    ConnectDeadline,
}

struct SendOutcome {
    bytes: usize,
    zero_copy: bool,
}

const SEND_BUFFER_REFRESH_INTERVAL: u64 = 64;
const SEND_BUFFER_REFRESH_SIZE_THRESHOLD: usize = 64 * 1024;
const DEFAULT_MAX_BYTES_PER_SEND: usize = 128 * 1024;
const MAX_BUFFERS_PER_SEND: usize = 64;
const MIN_RECEIVE_TRANSFER: usize = 4096;
const INITIAL_RECEIVE_TRANSFER: usize = 8192;

/// Reactor-driven stream socket.
///
/// All operations take the reactor explicitly; the socket stores no
/// back-reference. One reactor event is dispatched at a time, so every state
/// transition happens on the driving thread.
pub struct StreamSocket {
    token: Token,
    options: SocketOptions,
    io: Option<StreamHandle>,
    attached: bool,
    reserved: bool,

    open_state: OpenState,
    detach_state: DetachState,
    shutdown_state: ShutdownState,
    flow_control: FlowControlState,
    detach_followup: Option<DetachFollowup>,
    deferred_ops: Vec<DeferredOp>,

    source_endpoint: Option<Endpoint>,
    remote_endpoint: Option<Endpoint>,

    send_queue: SendQueue,
    receive_queue: ReceiveQueue,
    zero_copy_queue: ZeroCopyQueue,
    zero_copy_threshold: Option<usize>,

    correlator: TimestampCorrelator,
    timestamp_outgoing: bool,
    timestamp_incoming: bool,
    timestamp_counter: u32,

    send_counter: u64,
    max_bytes_per_send: usize,
    max_buffers_per_send: usize,
    total_bytes_sent: u64,
    total_bytes_received: u64,
    receive_feedback: usize,

    send_limiter: Option<Arc<DefaultDirectRateLimiter>>,
    receive_limiter: Option<Arc<DefaultDirectRateLimiter>>,
    send_rate_timer: Option<rill_reactor::TimerId>,
    receive_rate_timer: Option<rill_reactor::TimerId>,

    connect_in_progress: bool,
    connect_name: Option<String>,
    connect_endpoint: Option<Endpoint>,
    connect_options: ConnectOptions,
    connect_attempts: u64,
    connect_start: Option<Instant>,
    connect_deadline_timer: Option<rill_reactor::TimerId>,
    connect_retry_timer: Option<rill_reactor::TimerId>,
    connect_callback: Option<ConnectCallback>,
    connect_error: Option<Error>,
    retry_pending: bool,

    bind_name: Option<String>,
    bind_callback: Option<BindCallback>,

    tls: Option<TlsPipeline>,
    tls_scratch: Vec<u8>,
    upgrade_in_progress: bool,
    upgrade_callback: Option<UpgradeCallback>,
    upgrade_timer: Option<rill_reactor::TimerId>,
    upgrade_token: Option<OpToken>,

    session: Option<Arc<dyn SessionObserver>>,
    manager: Option<Arc<dyn Manager>>,
    close_callback: Option<CloseCallback>,
    resolver: Arc<dyn Resolver>,
}

impl StreamSocket {
    /// Create an unconnected socket. The kernel socket is opened per connect
    /// attempt.
    pub fn open(re: &mut SocketReactor, options: SocketOptions) -> Self {
        let token = re.allocate_token();
        Self {
            token,
            send_queue: SendQueue::new(options.send_low_watermark, options.send_high_watermark),
            receive_queue: ReceiveQueue::new(
                options.receive_low_watermark,
                options.receive_high_watermark,
            ),
            options,
            io: None,
            attached: false,
            reserved: false,
            open_state: OpenState::Default,
            detach_state: DetachState::Idle,
            shutdown_state: ShutdownState::new(),
            flow_control: FlowControlState::new(),
            detach_followup: None,
            deferred_ops: Vec::new(),
            source_endpoint: None,
            remote_endpoint: None,
            zero_copy_queue: ZeroCopyQueue::new(),
            zero_copy_threshold: None,
            correlator: TimestampCorrelator::new(),
            timestamp_outgoing: false,
            timestamp_incoming: false,
            timestamp_counter: 0,
            send_counter: 0,
            max_bytes_per_send: DEFAULT_MAX_BYTES_PER_SEND,
            max_buffers_per_send: MAX_BUFFERS_PER_SEND,
            total_bytes_sent: 0,
            total_bytes_received: 0,
            receive_feedback: INITIAL_RECEIVE_TRANSFER,
            send_limiter: None,
            receive_limiter: None,
            send_rate_timer: None,
            receive_rate_timer: None,
            connect_in_progress: false,
            connect_name: None,
            connect_endpoint: None,
            connect_options: ConnectOptions::default(),
            connect_attempts: 0,
            connect_start: None,
            connect_deadline_timer: None,
            connect_retry_timer: None,
            connect_callback: None,
            connect_error: None,
            retry_pending: false,
            bind_name: None,
            bind_callback: None,
            tls: None,
            tls_scratch: Vec::new(),
            upgrade_in_progress: false,
            upgrade_callback: None,
            upgrade_timer: None,
            upgrade_token: None,
            session: None,
            manager: None,
            close_callback: None,
            resolver: Arc::new(SystemResolver),
        }
    }

    /// Adopt an already-connected kernel socket (typically from a listener):
    /// attach to the reactor, apply options and announce establishment.
    pub fn adopt(
        re: &mut SocketReactor,
        handle: StreamHandle,
        options: SocketOptions,
    ) -> Result<Self, Error> {
        let mut socket = Self::open(re, options);
        if !re.acquire_handle_reservation() {
            return Err(Error::Limit);
        }
        socket.reserved = true;
        sys::set_buffer_sizes(
            handle.as_raw_fd(),
            socket.options.send_buffer_size,
            socket.options.receive_buffer_size,
        );
        socket.source_endpoint = handle.local_endpoint().ok();
        socket.remote_endpoint = handle.peer_endpoint().ok();
        socket.io = Some(handle);
        re.attach(socket.io.as_mut().unwrap(), socket.token)?;
        socket.attached = true;
        socket.open_state = OpenState::Connected;
        socket.refresh_send_budget();
        socket.apply_post_connect_options();
        socket.relax_flow_control(re, ShutdownDirection::Receive, true, false);
        trace!(token = ?socket.token, "socket: adopted");
        Ok(socket)
    }

    /// Announce establishment to the manager. Drivers call this once the
    /// adopted socket is in their routing table; sockets still connecting
    /// announce through the connect machine instead.
    pub fn announce_adopted(&self, re: &mut SocketReactor) {
        if self.open_state != OpenState::Connected {
            return;
        }
        if let Some(manager) = &self.manager {
            let manager = Arc::clone(manager);
            let token = self.token;
            re.execute(Box::new(move || manager.stream_socket_established(token)));
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn set_session(&mut self, session: Arc<dyn SessionObserver>) {
        self.session = Some(session);
    }

    pub fn set_manager(&mut self, manager: Arc<dyn Manager>) {
        self.manager = Some(manager);
    }

    pub fn set_resolver(&mut self, resolver: Arc<dyn Resolver>) {
        self.resolver = resolver;
    }

    pub fn set_send_rate_limiter(&mut self, limiter: Arc<DefaultDirectRateLimiter>) {
        self.send_limiter = Some(limiter);
    }

    pub fn set_receive_rate_limiter(&mut self, limiter: Arc<DefaultDirectRateLimiter>) {
        self.receive_limiter = Some(limiter);
    }

    pub fn set_send_queue_watermarks(&mut self, low: usize, high: usize) {
        self.send_queue.set_watermarks(low, high);
    }

    pub fn set_receive_queue_watermarks(&mut self, low: usize, high: usize) {
        self.receive_queue.set_watermarks(low, high);
    }

    /// Engage (or disengage with `None`) kernel zero-copy for sends at or
    /// above `threshold` bytes.
    pub fn set_zero_copy_threshold(&mut self, threshold: Option<usize>) -> Result<(), Error> {
        match threshold {
            Some(value) => self.engage_zero_copy(value),
            None => {
                self.options.zero_copy_threshold = None;
                self.zero_copy_threshold = None;
                Ok(())
            }
        }
    }

    /// Enable kernel TX timestamping. Only valid before the first send.
    pub fn timestamp_outgoing_data(&mut self, enable: bool) -> Result<(), Error> {
        if !enable {
            self.options.timestamp_outgoing_data = Some(false);
            self.timestamp_outgoing = false;
            self.correlator.reset();
            return Ok(());
        }
        self.options.timestamp_outgoing_data = Some(true);
        let Some(io) = self.io.as_ref() else { return Ok(()) };
        if self.send_counter != 0 {
            debug!("socket: outgoing timestamping requested after data was sent");
            return Err(Error::Invalid);
        }
        sys::enable_tx_timestamping(io.as_raw_fd())?;
        self.timestamp_outgoing = true;
        self.timestamp_counter = 0;
        Ok(())
    }

    pub fn timestamp_incoming_data(&mut self, enable: bool) -> Result<(), Error> {
        self.options.timestamp_incoming_data = Some(enable);
        if !enable {
            self.timestamp_incoming = false;
            return Ok(());
        }
        let Some(io) = self.io.as_ref() else { return Ok(()) };
        sys::enable_rx_timestamping(io.as_raw_fd())?;
        self.timestamp_incoming = true;
        Ok(())
    }

    pub fn source_endpoint(&self) -> Option<&Endpoint> {
        self.source_endpoint.as_ref()
    }

    pub fn remote_endpoint(&self) -> Option<&Endpoint> {
        self.remote_endpoint.as_ref()
    }

    pub fn peer_certificate(&self) -> Option<rustls_pki_types::CertificateDer<'static>> {
        self.tls.as_ref().and_then(TlsPipeline::peer_certificate)
    }

    pub fn open_state(&self) -> OpenState {
        self.open_state
    }

    pub fn write_queue_size(&self) -> usize {
        self.send_queue.size()
    }

    pub fn write_queue_watermarks(&self) -> (usize, usize) {
        (self.send_queue.low_watermark(), self.send_queue.high_watermark())
    }

    pub fn read_queue_size(&self) -> usize {
        self.receive_queue.size()
    }

    pub fn read_queue_watermarks(&self) -> (usize, usize) {
        (self.receive_queue.low_watermark(), self.receive_queue.high_watermark())
    }

    pub fn total_bytes_sent(&self) -> u64 {
        self.total_bytes_sent
    }

    pub fn total_bytes_received(&self) -> u64 {
        self.total_bytes_received
    }

    // ---------------------------------------------------------------- bind

    /// Record the source endpoint for subsequent connects. Names resolve
    /// asynchronously and complete through the callback.
    pub fn bind(
        &mut self,
        re: &mut SocketReactor,
        target: Target,
        callback: BindCallback,
    ) -> Result<(), Error> {
        match target {
            Target::Endpoint(endpoint) => {
                self.options.source = Some(endpoint.clone());
                re.execute(Box::new(move || {
                    callback(Ok(BindContext { endpoint: Some(endpoint), name: None }));
                }));
                Ok(())
            }
            Target::Name(name) => {
                if name.is_empty() || self.bind_callback.is_some() {
                    return Err(Error::Invalid);
                }
                self.bind_callback = Some(callback);
                self.bind_name = Some(name.clone());
                let remote = re.remote_handle();
                let token = self.token;
                self.resolver.resolve(
                    &name,
                    Box::new(move |result| remote.post(token, SocketTag::BindResolved(result))),
                );
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------- connect

    /// Begin connecting. The first attempt runs off an immediate timer;
    /// retries are paced by `retry_interval` and bounded by `retry_count`
    /// and `deadline`. The callback fires exactly once with the terminal
    /// outcome.
    pub fn connect(
        &mut self,
        re: &mut SocketReactor,
        target: Target,
        options: &ConnectOptions,
        callback: ConnectCallback,
    ) -> Result<(), Error> {
        if !self.open_state.can_connect()
            || self.connect_in_progress
            || self.remote_endpoint.is_some()
        {
            return Err(Error::Invalid);
        }
        match &target {
            Target::Endpoint(endpoint) => {
                if endpoint.is_trivially_invalid() {
                    return Err(Error::Invalid);
                }
                self.connect_endpoint = Some(endpoint.clone());
                self.connect_name = None;
            }
            Target::Name(name) => {
                if name.is_empty() {
                    return Err(Error::Invalid);
                }
                self.connect_name = Some(name.clone());
                self.connect_endpoint = None;
            }
        }

        self.open_state = OpenState::Waiting;
        self.connect_in_progress = true;
        self.connect_callback = Some(callback);
        self.connect_error = None;
        self.connect_attempts = 0;
        self.shutdown_state.reset();
        self.flow_control.reset();

        let mut options = options.clone();
        // The initial attempt consumes one retry slot.
        options.retry_count = Some(options.retry_count.unwrap_or(0) + 1);
        if options.retry_count.unwrap_or(0) > 1 && options.retry_interval.is_none() {
            options.retry_interval = Some(Duration::ZERO);
        }
        self.connect_options = options;
        self.connect_start = Some(Instant::now());

        if let Some(deadline) = self.connect_options.deadline {
            self.connect_deadline_timer = Some(re.schedule_timer(
                Instant::now() + deadline,
                self.token,
                SocketTag::ConnectDeadline,
            ));
        }
        self.connect_retry_timer =
            Some(re.schedule_timer(Instant::now(), self.token, SocketTag::ConnectRetry));
        Ok(())
    }

    fn retry_connect(&mut self, re: &mut SocketReactor) {
        if self.open_state != OpenState::Waiting || !self.connect_in_progress {
            return;
        }
        let remaining = self.connect_options.retry_count.unwrap_or(0);
        if remaining == 0 {
            return;
        }

        self.source_endpoint = None;
        self.remote_endpoint = None;
        self.flow_control.reset();
        self.shutdown_state.reset();
        self.connect_error = None;

        self.open_state = OpenState::Connecting;
        self.connect_attempts += 1;
        self.connect_options.retry_count = Some(remaining - 1);

        let result = if self.connect_endpoint.is_some() {
            self.start_connect_attempt(re)
        } else {
            self.start_connect_resolution(re)
        };
        if let Err(error) = result {
            self.fail_connect(re, error, false);
        }
    }

    fn start_connect_attempt(&mut self, re: &mut SocketReactor) -> Result<(), Error> {
        let endpoint = self.connect_endpoint.clone().ok_or(Error::Invalid)?;
        let handle = StreamHandle::start_connect(
            &endpoint,
            self.options.source.as_ref(),
            self.options.reuse_address,
        )?;
        if !self.reserved {
            if !re.acquire_handle_reservation() {
                return Err(Error::Limit);
            }
            self.reserved = true;
        }
        sys::set_buffer_sizes(
            handle.as_raw_fd(),
            self.options.send_buffer_size,
            self.options.receive_buffer_size,
        );
        self.source_endpoint = handle.local_endpoint().ok();
        self.io = Some(handle);
        re.attach(self.io.as_mut().unwrap(), self.token)?;
        self.attached = true;
        re.show_writable(self.io.as_mut().unwrap(), self.token)?;
        trace!(attempt = self.connect_attempts, %endpoint, "socket: connect attempt started");
        Ok(())
    }

    fn start_connect_resolution(&mut self, re: &mut SocketReactor) -> Result<(), Error> {
        let name = self.connect_name.clone().ok_or(Error::Invalid)?;
        let remote = re.remote_handle();
        let token = self.token;
        let attempt = self.connect_attempts;
        self.resolver.resolve(
            &name,
            Box::new(move |result| {
                remote.post(token, SocketTag::ConnectResolved { attempt, result });
            }),
        );
        Ok(())
    }

    /// Writable while connecting: the kernel connect finished one way or the
    /// other.
    fn complete_connect_attempt(&mut self, re: &mut SocketReactor) {
        let Some(io) = self.io.as_ref() else { return };
        let pending = io.take_error().ok().flatten();
        let remote = match io.peer_endpoint() {
            Ok(remote) => remote,
            Err(peer_err) => {
                let error = pending.map_or_else(|| Error::from(peer_err), Error::from);
                self.fail_connect(re, error, false);
                return;
            }
        };
        self.remote_endpoint = Some(remote);
        self.source_endpoint = io.local_endpoint().ok();

        self.refresh_send_budget();

        let latency = self.connect_start.map(|start| start.elapsed());
        self.connect_in_progress = false;
        self.connect_options.retry_count = Some(0);
        self.open_state = OpenState::Connected;

        if let Some(timer) = self.connect_deadline_timer.take() {
            re.cancel_timer(timer);
        }
        if let Some(timer) = self.connect_retry_timer.take() {
            re.cancel_timer(timer);
        }
        if let Some(io) = self.io.as_mut() {
            let _ = re.hide_writable(io, self.token);
        }

        self.apply_post_connect_options();
        self.relax_flow_control(re, ShutdownDirection::Receive, false, false);

        let context = ConnectContext {
            endpoint: self.connect_endpoint.clone(),
            name: self.connect_name.clone(),
            source: self.source_endpoint.clone(),
            latency,
            attempts_remaining: 0,
        };
        debug!(remote = ?self.remote_endpoint, ?latency, "socket: connected");

        if let Some(callback) = self.connect_callback.take() {
            callback(Ok(context));
        }
        if let Some(manager) = &self.manager {
            manager.stream_socket_established(self.token);
        }
    }

    /// Connect attempt (or the whole operation, with `close`) failed.
    ///
    /// Recording only the first error per attempt cycle keeps a retry-timer
    /// timeout from masking the real failure. The user callback fires only
    /// on the terminal outcome.
    fn fail_connect(&mut self, re: &mut SocketReactor, error: Error, close: bool) {
        if !self.connect_in_progress {
            return;
        }
        if close {
            self.connect_options.retry_count = Some(0);
        }
        if self.connect_error.is_none() || close {
            debug!(?error, close, "socket: connect attempt failed");
            self.connect_error = Some(error);
            let terminal = self.connect_options.retry_count.unwrap_or(0) == 0;

            if terminal {
                self.connect_in_progress = false;
                if let Some(timer) = self.connect_deadline_timer.take() {
                    re.cancel_timer(timer);
                }
                if let Some(timer) = self.connect_retry_timer.take() {
                    re.cancel_timer(timer);
                }
                self.open_state = OpenState::Closed;
                self.flow_control.close();
                self.shutdown_state.close();
            } else {
                self.open_state = OpenState::Waiting;
            }

            if self.io.is_some() && self.attached {
                let _ = re.detach(self.io.as_mut().unwrap(), self.token);
                self.attached = false;
                self.detach_state = DetachState::Initiated;
                self.detach_followup = Some(DetachFollowup::ConnectCleanup { terminal });
                return;
            }
            self.fail_connect_finish(re, terminal);
        } else if self.retry_pending {
            self.retry_pending = false;
            self.retry_connect(re);
        }
    }

    fn fail_connect_finish(&mut self, re: &mut SocketReactor, terminal: bool) {
        if self.io.is_some() {
            if self.reserved {
                re.release_handle_reservation();
                self.reserved = false;
            }
            self.io = None;
        }
        if terminal {
            let error = self.connect_error.clone().unwrap_or(Error::Invalid);
            if let Some(callback) = self.connect_callback.take() {
                re.execute(Box::new(move || callback(Err(error))));
            }
            if let Some(callback) = self.close_callback.take() {
                re.execute(Box::new(callback));
            }
        }
        if self.retry_pending {
            self.retry_pending = false;
            self.retry_connect(re);
        }
        self.drain_deferred_ops(re);
    }

    // ------------------------------------------------------------- upgrade

    /// Start a TLS handshake over the established connection. Bytes already
    /// buffered in the receive queue are reinterpreted as ciphertext.
    pub fn upgrade(
        &mut self,
        re: &mut SocketReactor,
        mode: UpgradeMode,
        options: &UpgradeOptions,
        callback: UpgradeCallback,
    ) -> Result<(), Error> {
        if !self.open_state.can_send() || self.tls.is_some() || self.upgrade_in_progress {
            return Err(Error::Invalid);
        }
        self.tls = Some(TlsPipeline::new(mode)?);
        self.upgrade_in_progress = true;
        self.upgrade_callback = Some(callback);
        self.upgrade_token = options.token;
        if let Some(deadline) = options.deadline {
            self.upgrade_timer = Some(re.schedule_timer(
                Instant::now() + deadline,
                self.token,
                SocketTag::UpgradeDeadline,
            ));
        }
        if let Err(error) = self.private_upgrade(re) {
            self.fail_upgrade(re, error, "handshake initiation failed");
        }
        Ok(())
    }

    fn private_upgrade(&mut self, re: &mut SocketReactor) -> Result<(), Error> {
        if self.receive_queue.has_entry() {
            // Data raced ahead of the upgrade: reinterpret it as ciphertext,
            // keeping the earliest entry's timestamp for the reformed entry.
            let (bytes, kernel_time) = self.receive_queue.take_all();
            self.tls.as_mut().unwrap().push_incoming_ciphertext(&bytes)?;
            self.tls_scratch.clear();
            let mut plain = std::mem::take(&mut self.tls_scratch);
            self.tls.as_mut().unwrap().pop_incoming_plaintext(&mut plain)?;
            if !plain.is_empty() {
                self.receive_queue.append_entry(&plain, kernel_time);
            }
            plain.clear();
            self.tls_scratch = plain;
            self.check_upgrade_progress(re);
        }
        self.flush_tls_output(re)?;
        Ok(())
    }

    fn check_upgrade_progress(&mut self, re: &mut SocketReactor) {
        if !self.upgrade_in_progress {
            return;
        }
        let Some(done) = self.tls.as_mut().and_then(TlsPipeline::poll_handshake_complete) else {
            return;
        };
        self.upgrade_in_progress = false;
        if let Some(timer) = self.upgrade_timer.take() {
            re.cancel_timer(timer);
        }
        debug!("socket: tls upgrade complete");
        if let Some(callback) = self.upgrade_callback.take() {
            callback(Ok(UpgradeContext { peer_certificate: done }));
        }
    }

    fn fail_upgrade(&mut self, re: &mut SocketReactor, error: Error, description: &str) {
        if !self.upgrade_in_progress {
            return;
        }
        warn!(?error, description, "socket: tls upgrade failed");
        self.tls = None;
        self.upgrade_in_progress = false;
        if let Some(timer) = self.upgrade_timer.take() {
            re.cancel_timer(timer);
        }
        self.apply_flow_control(re, ShutdownDirection::Both, false, true);
        self.flow_control.close();
        if let Some(callback) = self.upgrade_callback.take() {
            callback(Err(error));
        }
        self.private_shutdown(re, ShutdownDirection::Both, ShutdownMode::Immediate);
    }

    /// Send a TLS close-notify and, once the peer answers, drop the session
    /// and fall back to plaintext.
    pub fn downgrade(&mut self, re: &mut SocketReactor) -> Result<(), Error> {
        if self.upgrade_in_progress || self.tls.is_none() {
            return Err(Error::Invalid);
        }
        self.tls.as_mut().unwrap().shutdown();
        self.flush_tls_output(re)?;
        if self.tls.as_ref().unwrap().is_shutdown_finished() {
            self.tls = None;
            self.announce_downgrade(re, crate::event::DowngradeEventKind::Complete, false);
        } else {
            self.announce_downgrade(re, crate::event::DowngradeEventKind::Initiated, false);
        }
        Ok(())
    }

    /// Route TLS-produced ciphertext through the normal send path.
    fn flush_tls_output(&mut self, re: &mut SocketReactor) -> Result<(), Error> {
        loop {
            let mut cipher = Vec::new();
            match self.tls.as_mut() {
                Some(tls) if tls.has_outgoing_ciphertext() => {
                    tls.pop_outgoing_ciphertext(&mut cipher)?;
                }
                _ => break,
            }
            if cipher.is_empty() {
                break;
            }
            let group = self.send_counter;
            self.send_counter += 1;
            self.send_raw(re, Bytes::from(cipher), group, &SendOptions::default(), None)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------- send

    /// Queue outgoing bytes. On a per-call high-watermark violation the
    /// high-watermark event is announced (latched against the override) and
    /// `WouldBlock` returned.
    pub fn send(
        &mut self,
        re: &mut SocketReactor,
        data: impl Into<Bytes>,
        options: &SendOptions,
        callback: Option<SendCallback>,
    ) -> Result<(), Error> {
        if !self.open_state.can_send() || !self.shutdown_state.can_send() {
            return Err(Error::Invalid);
        }
        if self.upgrade_in_progress {
            return Err(Error::Invalid);
        }
        let group = self.send_counter;
        self.send_counter += 1;

        if self.send_queue.is_high_watermark_violated(options.high_watermark) {
            if self.send_queue.authorize_high_watermark_event(options.high_watermark) {
                self.announce_write_queue(re, QueueEventKind::HighWatermark, true);
            }
            return Err(Error::WouldBlock);
        }

        let data = data.into();
        if self.tls.is_some() {
            self.send_via_tls(re, data, group, options, callback)
        } else {
            self.send_raw(re, data, group, options, callback)
        }
    }

    fn send_via_tls(
        &mut self,
        re: &mut SocketReactor,
        data: Bytes,
        group: u64,
        options: &SendOptions,
        callback: Option<SendCallback>,
    ) -> Result<(), Error> {
        self.tls.as_mut().unwrap().push_outgoing_plaintext(&data)?;
        let mut cipher = Vec::new();
        self.tls.as_mut().unwrap().pop_outgoing_ciphertext(&mut cipher)?;
        self.send_raw(re, Bytes::from(cipher), group, options, callback)
    }

    fn send_raw(
        &mut self,
        re: &mut SocketReactor,
        data: Bytes,
        group: u64,
        options: &SendOptions,
        callback: Option<SendCallback>,
    ) -> Result<(), Error> {
        let mut callback = callback;
        if data.is_empty() {
            if let Some(cb) = callback.take() {
                dispatch_send(re, cb, Ok(()), !options.recurse);
            }
            return Ok(());
        }

        let mut outcome = SendOutcome { bytes: 0, zero_copy: false };
        if !self.send_queue.has_entry() {
            match self.enqueue_send_buffer(re, &[IoSlice::new(&data)], options.zero_copy) {
                Ok(o) => outcome = o,
                Err(Error::WouldBlock) => {}
                Err(error) => return Err(error),
            }
        }

        if outcome.bytes == data.len() {
            if outcome.zero_copy {
                self.zero_copy_queue.push(group, data, callback.take());
                self.zero_copy_queue.frame(group);
            } else if let Some(cb) = callback.take() {
                dispatch_send(re, cb, Ok(()), !options.recurse);
            }
            return Ok(());
        }

        if outcome.zero_copy {
            self.zero_copy_queue.push(group, data.clone(), callback.take());
        }
        let mut entry = SendEntry::new(group, data);
        entry.offset = outcome.bytes;
        entry.token = options.token;
        entry.zero_copy = outcome.zero_copy;
        entry.zero_copy_hint = options.zero_copy;
        entry.callback = callback;
        if let Some(deadline) = options.deadline
            && outcome.bytes == 0
        {
            entry.timer = Some(re.schedule_timer(
                Instant::now() + deadline,
                self.token,
                SocketTag::SendDeadline(group),
            ));
        }
        let became_non_empty = self.send_queue.push_entry(entry);
        trace!(size = self.send_queue.size(), "socket: write queue filled");
        if became_non_empty {
            self.relax_flow_control(re, ShutdownDirection::Send, true, false);
        }
        Ok(())
    }

    /// One kernel send attempt. Consults the rate limiter, keeps the
    /// send-buffer budget fresh, decides zero-copy, records the pre-send
    /// timestamp and accounts the bytes.
    fn enqueue_send_buffer(
        &mut self,
        re: &mut SocketReactor,
        bufs: &[IoSlice<'_>],
        zero_copy_hint: Option<bool>,
    ) -> Result<SendOutcome, Error> {
        if self.io.is_none() {
            return Err(Error::Invalid);
        }
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        if self.send_limiter.is_some() {
            self.throttle_send(re, total)?;
        }
        if self.send_counter % SEND_BUFFER_REFRESH_INTERVAL == 0
            && total >= SEND_BUFFER_REFRESH_SIZE_THRESHOLD
        {
            self.refresh_send_budget();
        }

        let want_zero_copy = match zero_copy_hint {
            Some(false) => false,
            Some(true) => self.zero_copy_threshold.is_some(),
            None => self.zero_copy_threshold.is_some_and(|threshold| total >= threshold),
        };

        let pre_send = self.timestamp_outgoing.then(SystemTime::now);

        let io = self.io.as_mut().unwrap();
        let result = if want_zero_copy {
            sys::send_zero_copy(io.as_raw_fd(), bufs)
        } else {
            io.write_vectored(bufs)
        };
        let (bytes, zero_copy) = match result {
            Ok(n) => (n, want_zero_copy),
            Err(ref e) if want_zero_copy && e.kind() == std::io::ErrorKind::Unsupported => {
                match self.io.as_mut().unwrap().write_vectored(bufs) {
                    Ok(n) => (n, false),
                    Err(e) => return Err(send_error(e)),
                }
            }
            Err(e) => return Err(send_error(e)),
        };

        if want_zero_copy != zero_copy && self.zero_copy_threshold.is_some() {
            debug!("socket: zero copy declined, disabling");
            self.zero_copy_threshold = None;
        }
        if bytes == 0 {
            trace!("socket: send buffer overflow");
            return Err(Error::WouldBlock);
        }

        if let Some(at) = pre_send {
            self.timestamp_counter = self.timestamp_counter.wrapping_add(bytes as u32);
            self.correlator.save_before_send(self.timestamp_counter.wrapping_sub(1), at);
        }
        self.total_bytes_sent += bytes as u64;
        trace!(bytes, zero_copy, "socket: sent");
        Ok(SendOutcome { bytes, zero_copy })
    }

    fn refresh_send_budget(&mut self) {
        if let Some(io) = self.io.as_ref()
            && let Ok(size) = sys::send_buffer_size(io.as_raw_fd())
            && size > 0
        {
            self.max_bytes_per_send = size * 2;
        }
    }

    /// Reserve `bytes` from the send limiter. When the bucket cannot cover
    /// them yet, send flow control is applied and the rate timer scheduled
    /// for the limiter's earliest permissible instant.
    fn throttle_send(&mut self, re: &mut SocketReactor, bytes: usize) -> Result<(), Error> {
        let Some(limiter) = self.send_limiter.clone() else { return Ok(()) };
        let mut chunk = u32::try_from(bytes).unwrap_or(u32::MAX).max(1);
        loop {
            let Some(n) = NonZeroU32::new(chunk) else { return Ok(()) };
            match limiter.check_n(n) {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(not_until)) => {
                    let wait =
                        not_until.wait_time_from(governor::clock::QuantaClock::default().now());
                    debug!(?wait, "socket: send rate limit reached");
                    self.apply_flow_control(re, ShutdownDirection::Send, false, true);
                    if !self.shutdown_state.can_send() {
                        return Err(Error::Invalid);
                    }
                    if self.send_rate_timer.is_none() {
                        self.send_rate_timer = Some(re.schedule_timer(
                            Instant::now() + wait,
                            self.token,
                            SocketTag::SendRate,
                        ));
                    }
                    self.announce_write_queue(re, QueueEventKind::RateLimitApplied, true);
                    return Err(Error::WouldBlock);
                }
                // Payload larger than the burst capacity: reserve what fits.
                Err(_) => chunk /= 2,
            }
        }
    }

    fn throttle_receive(&mut self, re: &mut SocketReactor, bytes: usize) -> Result<(), Error> {
        let Some(limiter) = self.receive_limiter.clone() else { return Ok(()) };
        let mut chunk = u32::try_from(bytes).unwrap_or(u32::MAX).max(1);
        loop {
            let Some(n) = NonZeroU32::new(chunk) else { return Ok(()) };
            match limiter.check_n(n) {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(not_until)) => {
                    let wait =
                        not_until.wait_time_from(governor::clock::QuantaClock::default().now());
                    debug!(?wait, "socket: receive rate limit reached");
                    self.apply_flow_control(re, ShutdownDirection::Receive, false, true);
                    if !self.shutdown_state.can_receive() {
                        return Err(Error::Invalid);
                    }
                    if self.receive_rate_timer.is_none() {
                        self.receive_rate_timer = Some(re.schedule_timer(
                            Instant::now() + wait,
                            self.token,
                            SocketTag::ReceiveRate,
                        ));
                    }
                    self.announce_read_queue(re, QueueEventKind::RateLimitApplied, true);
                    return Err(Error::WouldBlock);
                }
                Err(_) => chunk /= 2,
            }
        }
    }

    // ------------------------------------------------------------- receive

    /// Synchronous receive: returns buffered bytes when at least `min_size`
    /// are available, `WouldBlock` otherwise.
    pub fn receive(
        &mut self,
        re: &mut SocketReactor,
        options: &ReceiveOptions,
    ) -> Result<(ReceiveContext, Bytes), Error> {
        if !self.open_state.can_receive() {
            return Err(Error::Invalid);
        }
        if self.receive_queue.size() == 0 && !self.shutdown_state.can_receive() {
            return Err(Error::Eof);
        }
        if self.receive_queue.size() >= options.min_size.max(1) {
            let violated_before = self.receive_queue.is_high_watermark_violated();
            let timestamp = self.receive_queue.front_kernel_time();
            let data = self.receive_queue.extract(options.max_size);
            if violated_before && !self.receive_queue.is_high_watermark_violated() {
                self.relax_flow_control(re, ShutdownDirection::Receive, true, false);
            }
            Ok((ReceiveContext { endpoint: self.remote_endpoint.clone(), timestamp }, data))
        } else {
            self.relax_flow_control(re, ShutdownDirection::Receive, true, false);
            Err(Error::WouldBlock)
        }
    }

    /// Callback receive: fires once at least `min_size` bytes are buffered,
    /// or with `WouldBlock` on deadline / `Cancelled` on cancel.
    pub fn receive_with(
        &mut self,
        re: &mut SocketReactor,
        options: &ReceiveOptions,
        callback: ReceiveCallback,
    ) -> Result<(), Error> {
        if !self.open_state.can_receive() {
            return Err(Error::Invalid);
        }
        if self.receive_queue.size() == 0 && !self.shutdown_state.can_receive() {
            return Err(Error::Eof);
        }
        let min_size = options.min_size.max(1);
        if !self.receive_queue.has_callback() && self.receive_queue.size() >= min_size {
            let violated_before = self.receive_queue.is_high_watermark_violated();
            let timestamp = self.receive_queue.front_kernel_time();
            let data = self.receive_queue.extract(options.max_size);
            let context = ReceiveContext { endpoint: self.remote_endpoint.clone(), timestamp };
            dispatch_receive(re, callback, Ok((context, data)), !options.recurse);
            if violated_before && !self.receive_queue.is_high_watermark_violated() {
                self.relax_flow_control(re, ShutdownDirection::Receive, true, false);
            }
        } else {
            let id = self.receive_queue.generate_callback_id();
            let timer = options.deadline.map(|deadline| {
                re.schedule_timer(
                    Instant::now() + deadline,
                    self.token,
                    SocketTag::ReceiveDeadline(id),
                )
            });
            self.receive_queue.push_callback(ReceiveCallbackEntry {
                id,
                min_size,
                max_size: options.max_size,
                timer,
                token: options.token,
                callback,
            });
            self.relax_flow_control(re, ShutdownDirection::Receive, true, false);
        }
        Ok(())
    }

    fn receive_reserve(&self) -> usize {
        self.receive_feedback
            .max(self.receive_queue.low_watermark())
            .clamp(MIN_RECEIVE_TRANSFER, self.options.max_incoming_transfer_size)
    }

    fn update_receive_feedback(&mut self, reserved: usize, filled: usize) {
        // Feedback sizing: grow while the kernel fills everything we offer,
        // shrink toward what it actually delivers.
        if filled == reserved {
            self.receive_feedback =
                (reserved * 2).min(self.options.max_incoming_transfer_size);
        } else {
            self.receive_feedback = filled.max(MIN_RECEIVE_TRANSFER);
        }
    }

    fn readable_iteration(&mut self, re: &mut SocketReactor) -> Result<(), Error> {
        if self.receive_queue.is_high_watermark_violated() {
            return Err(Error::WouldBlock);
        }
        let reserve = self.receive_reserve();
        if self.receive_limiter.is_some() {
            self.throttle_receive(re, reserve)?;
        }
        self.dequeue_receive_buffer(re, reserve)?;
        crate::soft_assert_eq!(self.receive_queue.total_entry_length(), self.receive_queue.size());

        self.deliver_receive_callbacks(re);

        if self.receive_queue.authorize_low_watermark_event() {
            self.announce_read_queue(re, QueueEventKind::LowWatermark, false);
        }
        if self.receive_queue.authorize_high_watermark_event() {
            self.apply_flow_control(re, ShutdownDirection::Receive, false, false);
            self.announce_read_queue(re, QueueEventKind::HighWatermark, false);
        }
        Ok(())
    }

    /// One kernel receive, routed through the TLS pipeline when active.
    fn dequeue_receive_buffer(
        &mut self,
        re: &mut SocketReactor,
        reserve: usize,
    ) -> Result<usize, Error> {
        if self.io.is_none() {
            return Err(Error::Invalid);
        }

        if self.tls.is_none() {
            let use_kernel_time = self.timestamp_incoming;
            let fd = self.io.as_ref().unwrap().as_raw_fd();
            let buf = self.receive_queue.fill_buffer(reserve);
            let result = if use_kernel_time {
                sys::recv_with_timestamp(fd, buf)
            } else {
                self.io.as_mut().unwrap().read(buf).map(|n| (n, None))
            };
            return match result {
                Ok((0, _)) => {
                    self.receive_queue.commit_fill(0, None);
                    Err(Error::Eof)
                }
                Ok((n, kernel_time)) => {
                    self.receive_queue.commit_fill(n, kernel_time);
                    self.update_receive_feedback(reserve, n);
                    self.total_bytes_received += n as u64;
                    trace!(bytes = n, "socket: read queue filled");
                    Ok(n)
                }
                Err(e) => {
                    self.receive_queue.commit_fill(0, None);
                    Err(Error::from(e))
                }
            };
        }

        // TLS: ciphertext lands in the scratch buffer, plaintext in the
        // receive queue.
        if self.tls_scratch.len() < reserve {
            self.tls_scratch.resize(reserve, 0);
        }
        let n = match self.io.as_mut().unwrap().read(&mut self.tls_scratch[..reserve]) {
            Ok(0) => return Err(Error::Eof),
            Ok(n) => n,
            Err(e) => return Err(Error::from(e)),
        };
        self.update_receive_feedback(reserve, n);
        self.total_bytes_received += n as u64;

        let mut plain = Vec::new();
        {
            let tls = self.tls.as_mut().unwrap();
            let scratch = &self.tls_scratch[..n];
            tls.push_incoming_ciphertext(scratch)?;
            tls.pop_incoming_plaintext(&mut plain)?;
        }
        let produced = plain.len();
        if produced > 0 {
            self.receive_queue.append_entry(&plain, None);
        }

        self.check_upgrade_progress(re);

        let (shutdown_received, shutdown_sent) = {
            let tls = self.tls.as_ref().unwrap();
            (tls.is_shutdown_received(), tls.is_shutdown_sent())
        };
        if shutdown_received && !shutdown_sent {
            self.tls.as_mut().unwrap().shutdown();
            self.announce_downgrade(re, crate::event::DowngradeEventKind::Initiated, false);
        }
        self.flush_tls_output(re)?;
        if self.tls.as_ref().is_some_and(TlsPipeline::is_shutdown_finished) {
            self.tls = None;
            self.announce_downgrade(re, crate::event::DowngradeEventKind::Complete, false);
        }
        Ok(produced)
    }

    fn deliver_receive_callbacks(&mut self, re: &mut SocketReactor) {
        while let Some(entry) = self.receive_queue.pop_ready_callback() {
            if let Some(timer) = entry.timer {
                re.cancel_timer(timer);
            }
            let timestamp = self.receive_queue.front_kernel_time();
            let data = self.receive_queue.extract(entry.max_size);
            let context = ReceiveContext { endpoint: self.remote_endpoint.clone(), timestamp };
            (entry.callback)(Ok((context, data)));
        }
    }

    // ------------------------------------------------------ event handlers

    /// Dispatch one reactor readiness event for this socket.
    pub fn process_io(&mut self, re: &mut SocketReactor, event: &mio::event::Event) {
        if event.is_error() {
            self.process_error_event(re);
        }
        if event.is_writable() {
            self.process_writable(re);
        }
        if event.is_readable() || event.is_read_closed() {
            self.process_readable(re);
        }
    }

    fn process_readable(&mut self, re: &mut SocketReactor) {
        if self.detach_state == DetachState::Initiated {
            return;
        }
        if !self.shutdown_state.can_receive() {
            return;
        }
        let mut failure = None;
        loop {
            if let Err(error) = self.readable_iteration(re) {
                failure = Some(error);
                break;
            }
            if !self.options.receive_greedily || !self.shutdown_state.can_receive() {
                break;
            }
        }
        match failure {
            None | Some(Error::WouldBlock) => self.rearm_after_receive(re),
            Some(Error::Eof) => {
                self.private_shutdown_receive(re, ShutdownOrigin::Remote, false);
            }
            Some(error) => self.fail(re, error),
        }
    }

    fn process_writable(&mut self, re: &mut SocketReactor) {
        if self.detach_state == DetachState::Initiated {
            return;
        }
        if self.connect_in_progress {
            self.complete_connect_attempt(re);
            return;
        }
        if !self.shutdown_state.can_send() {
            return;
        }
        let mut failure = None;
        while self.send_queue.has_entry() {
            if let Err(error) = self.writable_iteration(re) {
                failure = Some(error);
                break;
            }
            if !self.options.send_greedily || !self.shutdown_state.can_send() {
                break;
            }
        }
        match failure {
            None | Some(Error::WouldBlock) => self.rearm_after_send(re),
            Some(error) => self.fail(re, error),
        }
    }

    fn process_error_event(&mut self, re: &mut SocketReactor) {
        if self.detach_state == DetachState::Initiated {
            return;
        }
        let Some(io) = self.io.as_ref() else { return };

        let notifications = sys::drain_error_queue(io.as_raw_fd());
        if !notifications.is_empty() {
            for notification in notifications {
                match notification {
                    Notification::ZeroCopy(notice) => self.process_zero_copy(re, &notice),
                    Notification::Timestamp(stamp) => {
                        if self.timestamp_outgoing {
                            self.process_tx_timestamp(&stamp);
                        }
                    }
                }
            }
            return;
        }

        let error = self
            .io
            .as_ref()
            .and_then(|io| io.take_error().ok().flatten())
            .map_or(Error::ConnectionDead, Error::from);
        if self.connect_in_progress {
            self.fail_connect(re, error, false);
        } else if self.upgrade_in_progress {
            self.fail_upgrade(re, error, "transport error");
        } else {
            self.fail(re, error);
        }
    }

    fn process_zero_copy(&mut self, _re: &mut SocketReactor, notice: &ZeroCopyNotice) {
        trace!(from = notice.from, thru = notice.thru, "socket: zero copy complete");
        if notice.disposition != ZeroCopyDisposition::Avoided && self.zero_copy_threshold.is_some()
        {
            debug!("socket: kernel copied a zero-copy send, disabling zero copy");
            self.zero_copy_threshold = None;
        }
        self.zero_copy_queue.update(notice);
        self.pop_zero_copy_completions();
    }

    fn pop_zero_copy_completions(&mut self) {
        while self.zero_copy_queue.ready() {
            if let Some(slot) = self.zero_copy_queue.pop()
                && let Some(callback) = slot
            {
                callback(Ok(()));
            }
        }
    }

    fn process_tx_timestamp(&mut self, stamp: &TxTimestamp) {
        match self.correlator.timestamp_received(stamp) {
            Some(delay) => trace!(kind = ?stamp.kind, ?delay, "socket: tx timestamp"),
            None => trace!(id = stamp.id, "socket: uncorrelated tx timestamp"),
        }
    }

    /// Timer deadline or remote completion routed to this socket.
    pub fn process_tag(&mut self, re: &mut SocketReactor, tag: SocketTag) {
        if self.detach_state == DetachState::Initiated {
            match tag {
                SocketTag::ConnectDeadline => {
                    self.retry_pending = false;
                    self.deferred_ops.push(DeferredOp::ConnectDeadline);
                }
                SocketTag::ConnectRetry => {
                    self.connect_retry_timer = None;
                    if self.connect_in_progress {
                        // Keep the cadence alive across the detachment.
                        if let Some(interval) = self.connect_options.retry_interval {
                            self.connect_retry_timer = Some(re.schedule_timer(
                                Instant::now() + interval,
                                self.token,
                                SocketTag::ConnectRetry,
                            ));
                        }
                        if self.connect_attempts > 0 {
                            self.retry_pending = true;
                        }
                    }
                }
                _ => {}
            }
            return;
        }
        match tag {
            SocketTag::ConnectRetry => self.process_connect_retry_timer(re),
            SocketTag::ConnectDeadline => self.process_connect_deadline_timer(re),
            SocketTag::UpgradeDeadline => {
                if self.upgrade_in_progress {
                    self.fail_upgrade(re, Error::WouldBlock, "upgrade deadline reached");
                }
            }
            SocketTag::SendRate => {
                self.send_rate_timer = None;
                self.relax_flow_control(re, ShutdownDirection::Send, false, true);
                self.announce_write_queue(re, QueueEventKind::RateLimitRelaxed, false);
            }
            SocketTag::ReceiveRate => {
                self.receive_rate_timer = None;
                self.relax_flow_control(re, ShutdownDirection::Receive, false, true);
                self.announce_read_queue(re, QueueEventKind::RateLimitRelaxed, false);
            }
            SocketTag::SendDeadline(id) => {
                if let Some((mut entry, became_empty)) = self.send_queue.remove_by_id(id) {
                    entry.timer = None;
                    if became_empty {
                        self.apply_flow_control(re, ShutdownDirection::Send, false, false);
                    }
                    if let Some(callback) = entry.callback.take() {
                        callback(Err(Error::WouldBlock));
                    }
                }
            }
            SocketTag::ReceiveDeadline(id) => {
                if let Some(mut entry) = self.receive_queue.remove_callback_by_id(id) {
                    entry.timer = None;
                    (entry.callback)(Err(Error::WouldBlock));
                }
            }
            SocketTag::ConnectResolved { attempt, result } => {
                if !self.connect_in_progress || attempt != self.connect_attempts {
                    return;
                }
                match result {
                    Ok(addr) => {
                        self.connect_endpoint = Some(Endpoint::Ip(addr));
                        if let Err(error) = self.start_connect_attempt(re) {
                            self.fail_connect(re, error, false);
                        }
                    }
                    Err(error) => self.fail_connect(re, error, false),
                }
            }
            SocketTag::BindResolved(result) => {
                let name = self.bind_name.take();
                if let Some(callback) = self.bind_callback.take() {
                    match result {
                        Ok(addr) => {
                            self.options.source = Some(Endpoint::Ip(addr));
                            callback(Ok(BindContext {
                                endpoint: Some(Endpoint::Ip(addr)),
                                name,
                            }));
                        }
                        Err(error) => callback(Err(error)),
                    }
                }
            }
        }
    }

    fn process_connect_retry_timer(&mut self, re: &mut SocketReactor) {
        self.connect_retry_timer = None;
        if !self.connect_in_progress {
            return;
        }
        // Keep the periodic cadence while the operation is alive.
        if let Some(interval) = self.connect_options.retry_interval {
            self.connect_retry_timer = Some(re.schedule_timer(
                Instant::now() + interval,
                self.token,
                SocketTag::ConnectRetry,
            ));
        }
        if self.connect_attempts > 0 {
            self.retry_pending = true;
            self.fail_connect(re, Error::ConnectionTimeout, false);
        } else {
            self.retry_connect(re);
        }
    }

    fn process_connect_deadline_timer(&mut self, re: &mut SocketReactor) {
        if self.connect_in_progress {
            self.fail_connect(re, Error::ConnectionTimeout, true);
        }
    }

    /// Reactor detachment completed: run the pending followup and replay
    /// operations deferred while detaching.
    pub fn process_detached(&mut self, re: &mut SocketReactor) {
        if self.detach_state != DetachState::Initiated {
            return;
        }
        self.detach_state = DetachState::Idle;
        match self.detach_followup.take() {
            Some(DetachFollowup::ShutdownSequence(context)) => {
                self.shutdown_sequence_complete(re, context);
            }
            Some(DetachFollowup::ConnectCleanup { terminal }) => {
                self.fail_connect_finish(re, terminal);
            }
            None => self.drain_deferred_ops(re),
        }
    }

    fn rearm_after_send(&mut self, re: &mut SocketReactor) {
        if !self.options.send_greedily
            && self.attached
            && self.send_queue.has_entry()
            && let Some(io) = self.io.as_mut()
        {
            let _ = re.rearm(io, self.token);
        }
    }

    fn rearm_after_receive(&mut self, re: &mut SocketReactor) {
        if !self.options.receive_greedily
            && self.attached
            && let Some(io) = self.io.as_mut()
        {
            let _ = re.rearm(io, self.token);
        }
    }

    // ------------------------------------------------------- write path

    fn writable_iteration(&mut self, re: &mut SocketReactor) -> Result<(), Error> {
        // Batching is only safe while zero-copy is disengaged: a zero-copy
        // syscall consumes one counter per send entry, not per batch.
        let batch = if self.zero_copy_threshold.is_none() {
            self.send_queue.batch_front(self.max_buffers_per_send, self.max_bytes_per_send)
        } else {
            None
        };
        match batch {
            Some(count) => self.writable_iteration_batch(re, count),
            None => self.writable_iteration_front(re),
        }
    }

    fn writable_iteration_front(&mut self, re: &mut SocketReactor) -> Result<(), Error> {
        let Some(front) = self.send_queue.front() else {
            return Err(Error::WouldBlock);
        };
        if front.is_sentinel() {
            self.send_queue.pop_entry();
            self.private_shutdown_send(re, false);
            if !self.send_queue.has_entry() {
                self.apply_flow_control(re, ShutdownDirection::Send, false, false);
            }
            return Ok(());
        }

        let data = front.data.clone();
        let offset = front.offset;
        let hint = if front.zero_copy { Some(true) } else { front.zero_copy_hint };
        let outcome = self.enqueue_send_buffer(re, &[IoSlice::new(&data[offset..])], hint)?;

        {
            let front = self.send_queue.front_mut().unwrap();
            if let Some(timer) = front.timer.take() {
                re.cancel_timer(timer);
            }
            if outcome.zero_copy {
                if front.zero_copy {
                    self.zero_copy_queue.push_extend(front.id);
                } else {
                    let callback = front.callback.take();
                    self.zero_copy_queue.push(front.id, front.data.clone(), callback);
                    front.zero_copy = true;
                }
            }
        }

        let front_len = self.send_queue.front().unwrap().len();
        if outcome.bytes == front_len {
            let entry = self.send_queue.pop_entry().unwrap();
            if entry.zero_copy {
                self.zero_copy_queue.frame(entry.id);
                self.pop_zero_copy_completions();
            } else if let Some(callback) = entry.callback {
                callback(Ok(()));
            }
        } else {
            self.send_queue.pop_size(outcome.bytes);
        }

        if self.send_queue.authorize_low_watermark_event() {
            self.announce_write_queue(re, QueueEventKind::LowWatermark, true);
        }
        if !self.send_queue.has_entry() {
            self.apply_flow_control(re, ShutdownDirection::Send, false, false);
        }
        Ok(())
    }

    fn writable_iteration_batch(
        &mut self,
        re: &mut SocketReactor,
        count: usize,
    ) -> Result<(), Error> {
        let datas: Vec<(Bytes, usize)> =
            self.send_queue.iter().take(count).map(|e| (e.data.clone(), e.offset)).collect();
        let slices: Vec<IoSlice<'_>> =
            datas.iter().map(|(data, offset)| IoSlice::new(&data[*offset..])).collect();
        let outcome = self.enqueue_send_buffer(re, &slices, Some(false))?;
        drop(slices);

        let mut remaining = outcome.bytes;
        let mut callbacks: Vec<SendCallback> = Vec::new();
        while remaining > 0 {
            {
                let front = self.send_queue.front_mut().unwrap();
                if let Some(timer) = front.timer.take() {
                    re.cancel_timer(timer);
                }
            }
            let front_len = self.send_queue.front().unwrap().len();
            if remaining >= front_len {
                remaining -= front_len;
                let entry = self.send_queue.pop_entry().unwrap();
                if let Some(callback) = entry.callback {
                    callbacks.push(callback);
                }
            } else {
                self.send_queue.pop_size(remaining);
                remaining = 0;
            }
        }
        for callback in callbacks {
            callback(Ok(()));
        }

        if self.send_queue.authorize_low_watermark_event() {
            self.announce_write_queue(re, QueueEventKind::LowWatermark, true);
        }
        if !self.send_queue.has_entry() {
            self.apply_flow_control(re, ShutdownDirection::Send, false, false);
        }
        Ok(())
    }

    // ------------------------------------------------------------- cancel

    /// Cancel the pending operation carrying `token`; its callback fires
    /// with `Cancelled`. Teardown already in flight cancels everything on
    /// its own.
    pub fn cancel(&mut self, re: &mut SocketReactor, token: OpToken) -> Result<(), Error> {
        if self.detach_state == DetachState::Initiated {
            return Err(Error::Invalid);
        }
        if self.connect_in_progress && self.connect_options.token == Some(token) {
            self.fail_connect(re, Error::Cancelled, true);
            return Ok(());
        }
        if self.upgrade_in_progress && self.upgrade_token == Some(token) {
            self.fail_upgrade(re, Error::Cancelled, "cancelled by token");
            return Ok(());
        }
        if let Some((mut entry, became_empty)) = self.send_queue.remove_by_token(token) {
            if let Some(timer) = entry.timer.take() {
                re.cancel_timer(timer);
            }
            if became_empty {
                self.apply_flow_control(re, ShutdownDirection::Send, false, false);
            }
            if let Some(callback) = entry.callback.take() {
                callback(Err(Error::Cancelled));
            }
            return Ok(());
        }
        if let Some(mut entry) = self.receive_queue.remove_callback_by_token(token) {
            if let Some(timer) = entry.timer.take() {
                re.cancel_timer(timer);
            }
            (entry.callback)(Err(Error::Cancelled));
            return Ok(());
        }
        Err(Error::Invalid)
    }

    // ------------------------------------------------- shutdown and close

    /// Shut down one or both halves. While a detachment is in flight the
    /// request is deferred and replayed in arrival order afterwards.
    pub fn shutdown(
        &mut self,
        re: &mut SocketReactor,
        direction: ShutdownDirection,
        mode: ShutdownMode,
    ) -> Result<(), Error> {
        if self.detach_state == DetachState::Initiated {
            self.deferred_ops.push(DeferredOp::Shutdown(direction, mode));
            return Ok(());
        }
        if self.connect_in_progress && direction.includes_send() {
            self.fail_connect(re, Error::Cancelled, true);
            return Ok(());
        }
        if self.open_state != OpenState::Connected {
            return Ok(());
        }
        self.private_shutdown(re, direction, mode);
        Ok(())
    }

    /// Initiate full teardown. The callback fires after the kernel handle is
    /// closed and the reactor reservation released.
    pub fn close(&mut self, re: &mut SocketReactor, callback: Option<CloseCallback>) {
        if self.detach_state == DetachState::Initiated {
            self.deferred_ops.push(DeferredOp::Close(callback));
            return;
        }
        if self.open_state == OpenState::Closed {
            if let Some(callback) = callback {
                re.execute(Box::new(callback));
            }
            return;
        }
        if let Some(callback) = callback {
            self.close_callback = match self.close_callback.take() {
                None => Some(callback),
                Some(previous) => Some(Box::new(move || {
                    previous();
                    callback();
                })),
            };
        }
        if self.connect_in_progress {
            self.fail_connect(re, Error::Cancelled, true);
            return;
        }
        if self.open_state == OpenState::Default {
            self.open_state = OpenState::Closed;
            if let Some(callback) = self.close_callback.take() {
                re.execute(Box::new(callback));
            }
            return;
        }
        self.private_shutdown(re, ShutdownDirection::Both, ShutdownMode::Immediate);
    }

    fn private_shutdown(
        &mut self,
        re: &mut SocketReactor,
        direction: ShutdownDirection,
        mode: ShutdownMode,
    ) {
        let close_announcement_required =
            self.close_callback.is_some() && self.shutdown_state.completed();

        if direction.includes_receive() && self.shutdown_state.can_receive() {
            self.private_shutdown_receive(re, ShutdownOrigin::Source, true);
        }
        if direction.includes_send() && self.shutdown_state.can_send() {
            if mode == ShutdownMode::Graceful && self.send_queue.has_entry() {
                // Flush what is queued first; the sentinel closes the half
                // when it reaches the front.
                let id = self.send_queue.generate_entry_id();
                self.send_queue.push_entry(SendEntry::sentinel(id));
                self.relax_flow_control(re, ShutdownDirection::Send, true, true);
            } else {
                self.private_shutdown_send(re, true);
            }
        }

        if close_announcement_required && let Some(callback) = self.close_callback.take() {
            re.execute(Box::new(callback));
        }
    }

    fn effective_keep_half_open(&self) -> bool {
        !self.options.abortive_close && self.options.keep_half_open
    }

    fn private_shutdown_send(&mut self, re: &mut SocketReactor, _defer: bool) {
        let keep_half_open = self.effective_keep_half_open();
        if let Some(context) = self.shutdown_state.try_shutdown_send(keep_half_open) {
            self.shutdown_sequence(re, context);
        }
    }

    fn private_shutdown_receive(
        &mut self,
        re: &mut SocketReactor,
        origin: ShutdownOrigin,
        _defer: bool,
    ) {
        let keep_half_open = self.effective_keep_half_open();
        if let Some(context) = self.shutdown_state.try_shutdown_receive(keep_half_open, origin) {
            self.shutdown_sequence(re, context);
        }
    }

    /// First phase of the shutdown sequence: flow control off, and when the
    /// socket completed, asynchronous detachment from the reactor.
    /// Announcements are always deferred so the user observes them in order
    /// regardless of which thread completed the shutdown.
    fn shutdown_sequence(&mut self, re: &mut SocketReactor, context: ShutdownContext) {
        if context.completed {
            if let Some(fc) = self.flow_control.apply(ShutdownDirection::Both, true) {
                if !fc.enable_send {
                    self.announce_write_queue(re, QueueEventKind::FlowControlApplied, true);
                }
                if !fc.enable_receive {
                    self.announce_read_queue(re, QueueEventKind::FlowControlApplied, true);
                }
            }
            if self.io.is_some() && self.attached {
                let _ = re.detach(self.io.as_mut().unwrap(), self.token);
                self.attached = false;
                self.detach_state = DetachState::Initiated;
                self.detach_followup = Some(DetachFollowup::ShutdownSequence(context));
                return;
            }
            self.shutdown_sequence_complete(re, context);
        } else {
            if context.send {
                self.apply_flow_control(re, ShutdownDirection::Send, true, true);
            }
            if context.receive {
                self.apply_flow_control(re, ShutdownDirection::Receive, true, true);
            }
            self.shutdown_sequence_complete(re, context);
        }
    }

    /// Second phase, after any detachment: kernel shutdown, queue teardown,
    /// announcements, close.
    fn shutdown_sequence_complete(&mut self, re: &mut SocketReactor, context: ShutdownContext) {
        let origin = context.origin.unwrap_or(ShutdownOrigin::Source);

        if !self.options.abortive_close && let Some(io) = self.io.as_ref() {
            if context.send {
                let _ = io.shutdown(NetShutdown::Write);
            }
            if context.receive {
                let _ = io.shutdown(NetShutdown::Read);
            }
        }

        if context.initiated {
            self.announce_shutdown(re, ShutdownEventKind::Initiated, origin);
        }

        if context.send {
            debug!("socket: send half shut down");
            if let Some(timer) = self.send_rate_timer.take() {
                re.cancel_timer(timer);
            }

            let mut cancelled = self.zero_copy_queue.clear();
            let (entries, discarded) = self.send_queue.drain_all();
            for mut entry in entries {
                if let Some(timer) = entry.timer.take() {
                    re.cancel_timer(timer);
                }
                if let Some(callback) = entry.callback.take() {
                    cancelled.push(callback);
                }
            }

            if self.upgrade_in_progress {
                let error = if origin == ShutdownOrigin::Source {
                    Error::Cancelled
                } else {
                    Error::ConnectionDead
                };
                self.tls = None;
                self.upgrade_in_progress = false;
                if let Some(timer) = self.upgrade_timer.take() {
                    re.cancel_timer(timer);
                }
                if let Some(callback) = self.upgrade_callback.take() {
                    re.execute(Box::new(move || callback(Err(error))));
                }
            }

            for callback in cancelled {
                re.execute(Box::new(move || callback(Err(Error::Cancelled))));
            }
            if discarded {
                self.announce_write_queue(re, QueueEventKind::Discarded, true);
            }
            self.announce_shutdown(re, ShutdownEventKind::Send, origin);
        }

        if context.receive {
            debug!("socket: receive half shut down");
            if let Some(timer) = self.receive_rate_timer.take() {
                re.cancel_timer(timer);
            }
            for mut entry in self.receive_queue.drain_callbacks() {
                if let Some(timer) = entry.timer.take() {
                    re.cancel_timer(timer);
                }
                re.execute(Box::new(move || (entry.callback)(Err(Error::Eof))));
            }
            // Forced low-watermark so a polling user wakes up to observe EOF.
            self.announce_read_queue(re, QueueEventKind::LowWatermark, true);
            self.announce_shutdown(re, ShutdownEventKind::Receive, origin);
        }

        if context.completed {
            self.announce_shutdown(re, ShutdownEventKind::Complete, origin);
            if self.reserved {
                re.release_handle_reservation();
                self.reserved = false;
            }
            self.io = None;
            self.open_state = OpenState::Closed;
            trace!(token = ?self.token, "socket: closed");
            if let Some(manager) = &self.manager {
                let manager = Arc::clone(manager);
                let token = self.token;
                re.execute(Box::new(move || manager.stream_socket_closed(token)));
            }
            if let Some(callback) = self.close_callback.take() {
                re.execute(Box::new(callback));
            }
            self.session = None;
            self.manager = None;
        }

        self.drain_deferred_ops(re);
    }

    fn drain_deferred_ops(&mut self, re: &mut SocketReactor) {
        let ops = std::mem::take(&mut self.deferred_ops);
        for op in ops {
            match op {
                DeferredOp::Shutdown(direction, mode) => {
                    let _ = self.shutdown(re, direction, mode);
                }
                DeferredOp::Close(callback) => self.close(re, callback),
                DeferredOp::ConnectDeadline => self.process_connect_deadline_timer(re),
            }
        }
    }

    // ----------------------------------------------------------- failure

    /// Failure during normal operation. Peer hard-closes become a symmetric
    /// shutdown; everything else is announced as a transport error and tears
    /// the socket down.
    fn fail(&mut self, re: &mut SocketReactor, error: Error) {
        if self.connect_in_progress {
            self.fail_connect(re, error, false);
            return;
        }
        if self.upgrade_in_progress {
            self.fail_upgrade(re, error, "transport failure");
            return;
        }
        self.apply_flow_control(re, ShutdownDirection::Both, false, true);
        self.flow_control.close();
        if error.is_connection_lost() {
            // Masks the race between a peer TLS close-notify and the TCP
            // reset that can follow it.
            self.private_shutdown_receive(re, ShutdownOrigin::Remote, false);
            self.private_shutdown_send(re, false);
        } else {
            warn!(?error, "socket: transport error");
            self.announce_error(re, error);
            self.private_shutdown(re, ShutdownDirection::Both, ShutdownMode::Immediate);
        }
    }

    // ----------------------------------------------------- flow control

    fn relax_flow_control(
        &mut self,
        re: &mut SocketReactor,
        direction: ShutdownDirection,
        defer: bool,
        unlock: bool,
    ) {
        let Some(context) = self.flow_control.relax(direction, unlock) else { return };
        if direction.includes_send() && context.enable_send && self.shutdown_state.can_send() {
            if self.attached
                && let Some(io) = self.io.as_mut()
            {
                let _ = re.show_writable(io, self.token);
            }
            self.announce_write_queue(re, QueueEventKind::FlowControlRelaxed, defer);
        }
        if direction.includes_receive()
            && context.enable_receive
            && self.shutdown_state.can_receive()
        {
            if self.attached
                && let Some(io) = self.io.as_mut()
            {
                let _ = re.show_readable(io, self.token);
            }
            self.announce_read_queue(re, QueueEventKind::FlowControlRelaxed, defer);
        }
    }

    fn apply_flow_control(
        &mut self,
        re: &mut SocketReactor,
        direction: ShutdownDirection,
        defer: bool,
        lock: bool,
    ) {
        let Some(context) = self.flow_control.apply(direction, lock) else { return };
        if direction.includes_send() && !context.enable_send {
            if self.attached
                && let Some(io) = self.io.as_mut()
            {
                let _ = re.hide_writable(io, self.token);
            }
            self.announce_write_queue(re, QueueEventKind::FlowControlApplied, defer);
        }
        if direction.includes_receive() && !context.enable_receive {
            if self.attached
                && let Some(io) = self.io.as_mut()
            {
                let _ = re.hide_readable(io, self.token);
            }
            self.announce_read_queue(re, QueueEventKind::FlowControlApplied, defer);
        }
    }

    // ------------------------------------------------------- post-connect

    fn apply_post_connect_options(&mut self) {
        if let Some(threshold) = self.options.zero_copy_threshold {
            if let Err(error) = self.engage_zero_copy(threshold) {
                debug!(?error, "socket: zero copy unavailable");
            }
        }
        if self.options.timestamp_outgoing_data == Some(true) {
            if let Err(error) = self.timestamp_outgoing_data(true) {
                debug!(?error, "socket: tx timestamping unavailable");
            }
        }
        if self.options.timestamp_incoming_data == Some(true) {
            if let Err(error) = self.timestamp_incoming_data(true) {
                debug!(?error, "socket: rx timestamping unavailable");
            }
        }
    }

    fn engage_zero_copy(&mut self, threshold: usize) -> Result<(), Error> {
        self.options.zero_copy_threshold = Some(threshold);
        let Some(io) = self.io.as_ref() else { return Ok(()) };
        sys::enable_zero_copy(io.as_raw_fd())?;
        self.zero_copy_threshold = Some(threshold);
        trace!(threshold, "socket: zero copy engaged");
        Ok(())
    }

    // ------------------------------------------------------ announcements

    fn announce_write_queue(&self, re: &mut SocketReactor, kind: QueueEventKind, defer: bool) {
        let Some(session) = &self.session else { return };
        let event = self.send_queue.context(kind);
        if defer {
            let session = Arc::clone(session);
            re.execute(Box::new(move || session.on_write_queue_event(event)));
        } else {
            session.on_write_queue_event(event);
        }
    }

    fn announce_read_queue(&self, re: &mut SocketReactor, kind: QueueEventKind, defer: bool) {
        let Some(session) = &self.session else { return };
        let event = self.receive_queue.context(kind);
        if defer {
            let session = Arc::clone(session);
            re.execute(Box::new(move || session.on_read_queue_event(event)));
        } else {
            session.on_read_queue_event(event);
        }
    }

    fn announce_shutdown(
        &self,
        re: &mut SocketReactor,
        kind: ShutdownEventKind,
        origin: ShutdownOrigin,
    ) {
        let Some(session) = &self.session else { return };
        let event = ShutdownEvent { kind, origin };
        let session = Arc::clone(session);
        re.execute(Box::new(move || session.on_shutdown_event(event)));
    }

    fn announce_downgrade(
        &self,
        re: &mut SocketReactor,
        kind: crate::event::DowngradeEventKind,
        defer: bool,
    ) {
        let Some(session) = &self.session else { return };
        if defer {
            let session = Arc::clone(session);
            re.execute(Box::new(move || session.on_downgrade_event(kind)));
        } else {
            session.on_downgrade_event(kind);
        }
    }

    fn announce_error(&self, re: &mut SocketReactor, error: Error) {
        let Some(session) = &self.session else { return };
        let session = Arc::clone(session);
        re.execute(Box::new(move || session.on_transport_error(error)));
    }
}

fn dispatch_send(
    re: &mut SocketReactor,
    callback: SendCallback,
    result: Result<(), Error>,
    defer: bool,
) {
    if defer {
        re.execute(Box::new(move || callback(result)));
    } else {
        callback(result);
    }
}

fn dispatch_receive(
    re: &mut SocketReactor,
    callback: ReceiveCallback,
    result: Result<(ReceiveContext, Bytes), Error>,
    defer: bool,
) {
    if defer {
        re.execute(Box::new(move || callback(result)));
    } else {
        callback(result);
    }
}

fn send_error(e: std::io::Error) -> Error {
    let error = Error::from(e);
    if !error.is_would_block() {
        debug!(?error, "socket: send failed");
    }
    error
}
