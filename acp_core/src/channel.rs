//! Per-publisher channel state machine.
//!
//! A [`PublisherSession`] owns one [`Publisher`] backend and gates every
//! operation on the channel state. Inbound bytes are pulled from the backend
//! with non-blocking polls into a bounded buffer, and `WantBytes` /
//! `ReadBytes` expose that buffer to an engine that can only poll.

use crate::codec::CallArgument;
use crate::error::AgentError;
use crate::publisher::{IterationContext, Publisher};
use std::collections::VecDeque;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Created,
    Started,
    Opened,
    Closed,
}

/// Availability of inbound data relative to the last `WantBytes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputState {
    Idle,
    /// The engine asked for this many bytes and they have not all arrived.
    Waiting(usize),
    Ready,
    /// Part of a ready block has been read; the rest is still buffered.
    Draining,
}

pub struct PublisherSession {
    id: String,
    publisher: Box<dyn Publisher>,
    state: ChannelState,
    input_state: InputState,
    context: IterationContext,
    inbound: VecDeque<u8>,
    max_inbound: usize,
}

impl PublisherSession {
    pub fn new(
        id: impl Into<String>,
        publisher: Box<dyn Publisher>,
        context: IterationContext,
        max_inbound: usize,
    ) -> Self {
        Self {
            id: id.into(),
            publisher,
            state: ChannelState::Created,
            input_state: InputState::Idle,
            context,
            inbound: VecDeque::new(),
            max_inbound,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn class(&self) -> &'static str {
        self.publisher.class()
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn input_state(&self) -> InputState {
        self.input_state
    }

    pub fn buffered(&self) -> usize {
        self.inbound.len()
    }

    pub fn set_iteration(&mut self, iteration: u32) {
        self.context.iteration = iteration;
    }

    pub fn set_control_iteration(&mut self, value: bool) {
        self.context.control_iteration = value;
    }

    pub fn set_control_recording_iteration(&mut self, value: bool) {
        self.context.control_recording_iteration = value;
    }

    pub fn set_iteration_after_fault(&mut self, value: bool) {
        self.context.iteration_after_fault = value;
    }

    fn require_opened(&self, action: &str) -> Result<(), AgentError> {
        if self.state == ChannelState::Opened {
            Ok(())
        } else {
            Err(AgentError::invalid_state(format!(
                "publisher '{}' cannot {action} while {:?}",
                self.id, self.state
            )))
        }
    }

    fn release_buffers(&mut self) {
        self.inbound.clear();
        self.input_state = InputState::Idle;
    }

    /// Pulls whatever the backend has ready, up to the buffer cap.
    fn fill(&mut self) -> Result<(), AgentError> {
        let room = self.max_inbound.saturating_sub(self.inbound.len());
        if room == 0 {
            return Ok(());
        }
        let mut chunk = Vec::new();
        let n = self.publisher.poll_input(&mut chunk, room)?;
        if n > 0 {
            debug!(publisher = %self.id, bytes = n, "Received inbound bytes");
        }
        self.inbound.extend(chunk.into_iter().take(room));
        Ok(())
    }

    fn take(&mut self, count: usize) -> Vec<u8> {
        let count = count.min(self.inbound.len());
        self.inbound.drain(..count).collect()
    }

    pub fn start(&mut self) -> Result<(), AgentError> {
        if self.state != ChannelState::Created {
            return Err(AgentError::invalid_state(format!(
                "publisher '{}' is already started",
                self.id
            )));
        }
        self.publisher.start()?;
        self.state = ChannelState::Started;
        Ok(())
    }

    /// Closes the channel if needed, stops the backend and returns to
    /// `Created`.
    pub fn stop(&mut self) -> Result<(), AgentError> {
        self.close()?;
        if self.state != ChannelState::Created {
            self.publisher.stop()?;
        }
        self.state = ChannelState::Created;
        Ok(())
    }

    pub fn open(&mut self) -> Result<(), AgentError> {
        match self.state {
            ChannelState::Opened => Ok(()),
            ChannelState::Started | ChannelState::Closed => {
                self.publisher.open(&self.context)?;
                self.release_buffers();
                self.state = ChannelState::Opened;
                Ok(())
            }
            ChannelState::Created => Err(AgentError::invalid_state(format!(
                "publisher '{}' must be started before it is opened",
                self.id
            ))),
        }
    }

    pub fn close(&mut self) -> Result<(), AgentError> {
        if self.state == ChannelState::Opened {
            if let Err(e) = self.publisher.close() {
                warn!(publisher = %self.id, error = %e, "Backend failed to close cleanly");
            }
            self.state = ChannelState::Closed;
        }
        self.release_buffers();
        Ok(())
    }

    pub fn accept(&mut self) -> Result<(), AgentError> {
        self.require_opened("accept")?;
        Ok(self.publisher.accept()?)
    }

    pub fn call(
        &mut self,
        method: &str,
        args: &[CallArgument],
    ) -> Result<Option<Vec<u8>>, AgentError> {
        self.require_opened("call")?;
        Ok(self.publisher.call(method, args)?)
    }

    pub fn set_property(&mut self, name: &str, value: &[u8]) -> Result<(), AgentError> {
        self.require_opened("setProperty")?;
        Ok(self.publisher.set_property(name, value)?)
    }

    pub fn get_property(&mut self, name: &str) -> Result<Option<Vec<u8>>, AgentError> {
        self.require_opened("getProperty")?;
        Ok(self.publisher.get_property(name)?)
    }

    pub fn get_result(&mut self) -> Result<Option<Vec<u8>>, AgentError> {
        self.require_opened("get a result")?;
        Ok(self.publisher.get_result()?)
    }

    pub fn set_result(&mut self, value: Option<Vec<u8>>) -> Result<(), AgentError> {
        self.require_opened("set a result")?;
        Ok(self.publisher.set_result(value)?)
    }

    pub fn output(&mut self, data: &[u8]) -> Result<(), AgentError> {
        self.require_opened("output")?;
        Ok(self.publisher.output(data)?)
    }

    /// Returns a copy of everything currently buffered without consuming it.
    pub fn input(&mut self) -> Result<Vec<u8>, AgentError> {
        self.require_opened("input")?;
        self.publisher.input()?;
        self.fill()?;
        Ok(self.inbound.iter().copied().collect())
    }

    pub fn want_bytes(&mut self, count: usize) -> Result<(), AgentError> {
        self.require_opened("want bytes")?;
        self.fill()?;
        self.input_state = if self.inbound.len() >= count {
            InputState::Ready
        } else {
            InputState::Waiting(count)
        };
        Ok(())
    }

    /// `Ok(None)` means the requested bytes have not arrived yet.
    pub fn read_bytes(&mut self, count: usize) -> Result<Option<Vec<u8>>, AgentError> {
        self.require_opened("read bytes")?;
        self.fill()?;

        if let InputState::Waiting(wanted) = self.input_state {
            if self.inbound.len() >= wanted {
                self.input_state = InputState::Ready;
            }
        }

        match self.input_state {
            InputState::Waiting(_) => Ok(None),
            InputState::Ready | InputState::Draining => {
                let data = self.take(count);
                self.input_state = if self.inbound.is_empty() {
                    InputState::Idle
                } else {
                    InputState::Draining
                };
                Ok(Some(data))
            }
            InputState::Idle if self.inbound.is_empty() => Ok(None),
            InputState::Idle => Ok(Some(self.take(count))),
        }
    }

    pub fn read_all_bytes(&mut self) -> Result<Vec<u8>, AgentError> {
        self.require_opened("read bytes")?;
        self.fill()?;
        self.input_state = InputState::Idle;
        Ok(self.inbound.drain(..).collect())
    }

    /// Best-effort close and stop used when the owning agent session goes
    /// away. Never fails.
    pub fn shutdown(&mut self) {
        if let Err(e) = self.stop() {
            warn!(publisher = %self.id, error = %e, "Publisher did not stop cleanly");
        }
    }
}
