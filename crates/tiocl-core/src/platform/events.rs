//! Event objects: user events, callbacks, waiting and queries.

use std::sync::Arc;

use tracing::debug;

use super::Platform;
use crate::event::{CallbackTrigger, CommandType, Event, EventInfo, EventStatus, ProfilingInfo};
use crate::handle::{ContextHandle, EventHandle};
use crate::{ClError, ClResult};

impl Platform {
    /// An event the application completes with [`Platform::set_user_event_status`].
    pub fn create_user_event(&self, context: ContextHandle) -> ClResult<EventHandle> {
        self.check_open()?;
        self.contexts.get(context)?;
        Ok(self.register_event(Arc::new(Event::user(context))))
    }

    /// `0` completes the event, a negative value fails it. Only the first call takes effect.
    pub fn set_user_event_status(&self, event: EventHandle, status: i32) -> ClResult<()> {
        let ev = self.events.get(event)?;
        if ev.command_type() != CommandType::User {
            return Err(ClError::InvalidEvent);
        }
        let next = match status {
            0 => EventStatus::Complete,
            code if code < 0 => EventStatus::Error(code),
            _ => return Err(ClError::InvalidValue),
        };
        if !ev.set_status(next) {
            return Err(ClError::InvalidOperation);
        }
        debug!(event = ev.id(), %next, "user event set");
        Ok(())
    }

    /// Runs `callback` once when the event reaches `trigger` (or fails), immediately if it
    /// already has. Callbacks run on whichever thread moves the event and must not block.
    pub fn set_event_callback<F>(
        &self,
        event: EventHandle,
        trigger: CallbackTrigger,
        callback: F,
    ) -> ClResult<()>
    where
        F: FnOnce(EventStatus) + Send + 'static,
    {
        let ev = self.events.get(event)?;
        ev.add_callback(trigger, Box::new(callback));
        Ok(())
    }

    /// Blocks until every event is terminal.
    pub fn wait_for_events(&self, events: &[EventHandle]) -> ClResult<()> {
        let first = events.first().ok_or(ClError::InvalidValue)?;
        let context = self.events.get(*first)?.context();
        let evs = events
            .iter()
            .map(|h| {
                let ev = self.events.get(*h)?;
                if ev.context() != context {
                    return Err(ClError::InvalidContext);
                }
                Ok(ev)
            })
            .collect::<ClResult<Vec<_>>>()?;
        let mut failed = false;
        for ev in evs {
            failed |= ev.wait().is_error();
        }
        if failed {
            return Err(ClError::ExecStatusErrorForEventsInWaitList);
        }
        Ok(())
    }

    pub fn event_status(&self, event: EventHandle) -> ClResult<EventStatus> {
        Ok(self.events.get(event)?.status())
    }

    pub fn event_info(&self, event: EventHandle) -> ClResult<EventInfo> {
        let ev = self.events.get(event)?;
        Ok(EventInfo {
            command_type: ev.command_type(),
            status: ev.status(),
            queue: ev.queue(),
            context: ev.context(),
            reference_count: self.events.refcount(event)?,
        })
    }

    /// Timestamps of a completed command on a queue created with `PROFILING_ENABLE`.
    pub fn event_profiling_info(&self, event: EventHandle) -> ClResult<ProfilingInfo> {
        self.events.get(event)?.profiling()
    }

    pub fn retain_event(&self, event: EventHandle) -> ClResult<()> {
        self.events.retain(event)
    }

    /// The command itself still runs to completion.
    pub fn release_event(&self, event: EventHandle) -> ClResult<()> {
        self.events.release(event).map(drop)
    }
}
