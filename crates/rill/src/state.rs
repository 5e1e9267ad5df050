//! Small state machines the socket coordinator composes: open/detach
//! lifecycle, per-half shutdown, and reactor flow control.

use crate::options::{ShutdownDirection, ShutdownOrigin};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenState {
    /// Never opened, or fully torn down and reusable.
    Default,
    /// A connect was requested; waiting for the next attempt.
    Waiting,
    /// A kernel connect is in flight.
    Connecting,
    Connected,
    Closed,
}

impl OpenState {
    pub fn can_connect(self) -> bool {
        matches!(self, Self::Default | Self::Closed)
    }

    pub fn can_send(self) -> bool {
        self == Self::Connected
    }

    pub fn can_receive(self) -> bool {
        self == Self::Connected
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetachState {
    Idle,
    /// Asynchronous reactor detachment in flight; reactor events are ignored
    /// and new top-level operations are deferred until completion.
    Initiated,
}

/// Result of a shutdown attempt: what this call actually changed.
#[derive(Clone, Copy, Debug, Default)]
pub struct ShutdownContext {
    /// This call began the socket's shutdown.
    pub initiated: bool,
    pub send: bool,
    pub receive: bool,
    /// Both halves are now down; the socket must detach and close.
    pub completed: bool,
    pub origin: Option<ShutdownOrigin>,
}

/// Which halves are still live. Transitions are monotonic: a half that shut
/// down never reopens (short of a full connect-retry reset).
#[derive(Clone, Copy, Debug)]
pub struct ShutdownState {
    can_send: bool,
    can_receive: bool,
    initiated: bool,
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownState {
    pub fn new() -> Self {
        Self { can_send: true, can_receive: true, initiated: false }
    }

    pub fn can_send(&self) -> bool {
        self.can_send
    }

    pub fn can_receive(&self) -> bool {
        self.can_receive
    }

    pub fn completed(&self) -> bool {
        !self.can_send && !self.can_receive
    }

    /// Shut down the send half. With `keep_half_open` false the receive half
    /// goes down with it. Returns `None` when the half was already down.
    pub fn try_shutdown_send(&mut self, keep_half_open: bool) -> Option<ShutdownContext> {
        if !self.can_send {
            return None;
        }
        let mut context = ShutdownContext {
            initiated: !self.initiated,
            send: true,
            origin: Some(ShutdownOrigin::Source),
            ..ShutdownContext::default()
        };
        self.initiated = true;
        self.can_send = false;
        if !keep_half_open && self.can_receive {
            self.can_receive = false;
            context.receive = true;
        }
        context.completed = self.completed();
        Some(context)
    }

    /// Shut down the receive half, carrying who initiated it.
    pub fn try_shutdown_receive(
        &mut self,
        keep_half_open: bool,
        origin: ShutdownOrigin,
    ) -> Option<ShutdownContext> {
        if !self.can_receive {
            return None;
        }
        let mut context = ShutdownContext {
            initiated: !self.initiated,
            receive: true,
            origin: Some(origin),
            ..ShutdownContext::default()
        };
        self.initiated = true;
        self.can_receive = false;
        if !keep_half_open && self.can_send {
            self.can_send = false;
            context.send = true;
        }
        context.completed = self.completed();
        Some(context)
    }

    /// Fresh state for the next connect attempt.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Terminal: both halves down without announcing anything.
    pub fn close(&mut self) {
        self.can_send = false;
        self.can_receive = false;
        self.initiated = true;
    }
}

/// Which reactor directions to flip after a flow-control transition.
#[derive(Clone, Copy, Debug, Default)]
pub struct FlowControlContext {
    pub enable_send: bool,
    pub enable_receive: bool,
}

/// Tracks whether the reactor is currently asked to signal readability and
/// writability, with a per-direction lock that pins flow control applied
/// until an unlocking relax.
#[derive(Clone, Copy, Debug)]
pub struct FlowControlState {
    send_wanted: bool,
    receive_wanted: bool,
    send_locked: bool,
    receive_locked: bool,
    closed: bool,
}

impl Default for FlowControlState {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowControlState {
    pub fn new() -> Self {
        Self {
            send_wanted: false,
            receive_wanted: false,
            send_locked: false,
            receive_locked: false,
            closed: false,
        }
    }

    /// Ask for events in `direction`. Returns the resulting want-state when
    /// anything changed, `None` when the call was a no-op (still locked,
    /// already wanted, or closed).
    pub fn relax(&mut self, direction: ShutdownDirection, unlock: bool) -> Option<FlowControlContext> {
        if self.closed {
            return None;
        }
        let mut changed = false;
        if direction.includes_send() {
            if unlock {
                self.send_locked = false;
            }
            if !self.send_locked && !self.send_wanted {
                self.send_wanted = true;
                changed = true;
            }
        }
        if direction.includes_receive() {
            if unlock {
                self.receive_locked = false;
            }
            if !self.receive_locked && !self.receive_wanted {
                self.receive_wanted = true;
                changed = true;
            }
        }
        changed.then_some(self.context())
    }

    /// Stop asking for events in `direction`, optionally locking so that
    /// only an unlocking relax can re-enable them.
    pub fn apply(&mut self, direction: ShutdownDirection, lock: bool) -> Option<FlowControlContext> {
        if self.closed {
            return None;
        }
        let mut changed = false;
        if direction.includes_send() {
            if lock {
                self.send_locked = true;
            }
            if self.send_wanted {
                self.send_wanted = false;
                changed = true;
            }
        }
        if direction.includes_receive() {
            if lock {
                self.receive_locked = true;
            }
            if self.receive_wanted {
                self.receive_wanted = false;
                changed = true;
            }
        }
        changed.then_some(self.context())
    }

    fn context(&self) -> FlowControlContext {
        FlowControlContext { enable_send: self.send_wanted, enable_receive: self.receive_wanted }
    }

    pub fn wants_send(&self) -> bool {
        self.send_wanted
    }

    pub fn wants_receive(&self) -> bool {
        self.receive_wanted
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Terminal: every further relax or apply is a no-op.
    pub fn close(&mut self) {
        self.closed = true;
        self.send_wanted = false;
        self.receive_wanted = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_send_without_half_open_completes_the_socket() {
        let mut state = ShutdownState::new();
        let context = state.try_shutdown_send(false).unwrap();
        assert!(context.initiated);
        assert!(context.send);
        assert!(context.receive);
        assert!(context.completed);
        assert!(state.completed());

        // Monotonic: a second attempt is a no-op.
        assert!(state.try_shutdown_send(false).is_none());
        assert!(state.try_shutdown_receive(false, ShutdownOrigin::Remote).is_none());
    }

    #[test]
    fn half_open_keeps_the_other_half_alive() {
        let mut state = ShutdownState::new();
        let context = state.try_shutdown_send(true).unwrap();
        assert!(context.send);
        assert!(!context.receive);
        assert!(!context.completed);
        assert!(state.can_receive());

        let context = state.try_shutdown_receive(true, ShutdownOrigin::Remote).unwrap();
        assert!(!context.initiated);
        assert!(context.receive);
        assert!(context.completed);
        assert_eq!(context.origin, Some(ShutdownOrigin::Remote));
    }

    #[test]
    fn locked_flow_control_ignores_plain_relax() {
        let mut state = FlowControlState::new();
        assert!(state.relax(ShutdownDirection::Send, false).is_some());

        let context = state.apply(ShutdownDirection::Send, true).unwrap();
        assert!(!context.enable_send);

        // Locked: relax without unlock does nothing.
        assert!(state.relax(ShutdownDirection::Send, false).is_none());
        assert!(!state.wants_send());

        // Unlocking relax re-enables.
        let context = state.relax(ShutdownDirection::Send, true).unwrap();
        assert!(context.enable_send);
    }

    #[test]
    fn redundant_transitions_report_nothing() {
        let mut state = FlowControlState::new();
        assert!(state.relax(ShutdownDirection::Receive, false).is_some());
        assert!(state.relax(ShutdownDirection::Receive, false).is_none());
        assert!(state.apply(ShutdownDirection::Receive, false).is_some());
        assert!(state.apply(ShutdownDirection::Receive, false).is_none());
    }

    #[test]
    fn closed_flow_control_is_inert() {
        let mut state = FlowControlState::new();
        state.relax(ShutdownDirection::Both, false);
        state.close();
        assert!(state.relax(ShutdownDirection::Both, true).is_none());
        assert!(state.apply(ShutdownDirection::Both, true).is_none());
        assert!(!state.wants_send());
    }
}
