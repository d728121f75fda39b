//! Scripted device conversations
//!
//! A small state machine for multi-step exchanges: named states, each
//! mapping a response code (or a wildcard) to a handler. Handlers may write
//! back through the frame's sink and return where to go next. The runtime
//! loop is nothing more than dispatching every arriving frame to the
//! current state's handler.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::connection::{ConnectionEvent, Subscription};
use super::response::ResponseFrame;
use super::ProtocolError;

/// What a handler wants to happen after it ran
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Keep the current state
    Stay,
    /// Move to the named state; an unknown name is a configuration error
    Goto(String),
    /// Finish the session
    End,
}

impl Transition {
    /// Convenience constructor for [`Transition::Goto`]
    pub fn goto(name: impl Into<String>) -> Self {
        Transition::Goto(name.into())
    }
}

type Handler = Box<dyn FnMut(&ResponseFrame) -> Transition>;

/// One named state: response-code-keyed handlers plus an optional wildcard
pub struct SessionState {
    name: String,
    handlers: HashMap<u8, Handler>,
    fallback: Option<Handler>,
}

impl SessionState {
    /// Empty state with the given name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: HashMap::new(),
            fallback: None,
        }
    }

    /// Handle frames with exactly this response code
    pub fn on(mut self, code: u8, handler: impl FnMut(&ResponseFrame) -> Transition + 'static) -> Self {
        self.handlers.insert(code, Box::new(handler));
        self
    }

    /// Handle any frame without a more specific handler
    pub fn on_any(mut self, handler: impl FnMut(&ResponseFrame) -> Transition + 'static) -> Self {
        self.fallback = Some(Box::new(handler));
        self
    }
}

/// A scripted conversation over a connection subscription.
///
/// The machine starts in the state marked first and ends when a handler
/// returns [`Transition::End`], when the subscription completes on its own,
/// or at the overall deadline.
pub struct Session {
    states: HashMap<String, SessionState>,
    first: Option<String>,
    active: bool,
}

impl Session {
    /// Empty session with no states
    pub fn new() -> Self {
        Self {
            states: HashMap::new(),
            first: None,
            active: false,
        }
    }

    /// Register a state; the first one registered becomes the start state
    /// unless [`Session::mark_first`] says otherwise
    pub fn add_state(&mut self, state: SessionState) -> &mut Self {
        if self.first.is_none() {
            self.first = Some(state.name.clone());
        }
        self.states.insert(state.name.clone(), state);
        self
    }

    /// Designate the start state
    pub fn mark_first(&mut self, name: impl Into<String>) -> &mut Self {
        self.first = Some(name.into());
        self
    }

    /// Dispatch frames from `subscription` until the script ends.
    ///
    /// Running an already-running session, or one with no states, is a
    /// usage error. Returns [`ProtocolError::Timeout`] if the script has not
    /// ended when `timeout` elapses.
    pub fn run(
        &mut self,
        subscription: &Subscription,
        timeout: Duration,
    ) -> Result<(), ProtocolError> {
        if self.active {
            return Err(ProtocolError::Usage(
                "session is already running".to_string(),
            ));
        }
        if self.states.is_empty() {
            return Err(ProtocolError::Usage(
                "session has no states defined".to_string(),
            ));
        }
        let first = self
            .first
            .clone()
            .ok_or_else(|| ProtocolError::Usage("session has no first state".to_string()))?;
        if !self.states.contains_key(&first) {
            return Err(ProtocolError::UnknownState(first));
        }

        self.active = true;
        let result = self.dispatch_loop(subscription, first, timeout);
        self.active = false;
        result
    }

    fn dispatch_loop(
        &mut self,
        subscription: &Subscription,
        first: String,
        timeout: Duration,
    ) -> Result<(), ProtocolError> {
        let deadline = Instant::now() + timeout;
        let mut current = first;
        debug!(state = %current, "session started");

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(ProtocolError::Timeout);
            }
            let event = match subscription.recv_timeout(deadline - now) {
                Ok(event) => event,
                Err(ProtocolError::NotConnected) => {
                    // Subscription completed on its own; that ends the script
                    debug!("session ended with subscription");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            let frame = match event {
                ConnectionEvent::Frame(frame) => frame,
                ConnectionEvent::Closed => {
                    debug!("session ended by connection teardown");
                    return Ok(());
                }
            };

            let state = self
                .states
                .get_mut(&current)
                .ok_or_else(|| ProtocolError::UnknownState(current.clone()))?;
            let handler = match state.handlers.get_mut(&frame.code()) {
                Some(handler) => handler,
                None => match state.fallback.as_mut() {
                    Some(handler) => handler,
                    None => {
                        trace!(state = %current, code = %frame.code_hex(), "unhandled frame");
                        continue;
                    }
                },
            };

            match handler(&frame) {
                Transition::Stay => {}
                Transition::Goto(next) => {
                    if !self.states.contains_key(&next) {
                        return Err(ProtocolError::UnknownState(next));
                    }
                    trace!(from = %current, to = %next, "session transition");
                    current = next;
                }
                Transition::End => {
                    debug!(state = %current, "session ended");
                    return Ok(());
                }
            }
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
