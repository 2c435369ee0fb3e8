//! Event state machine.
//!
//! Status only moves forward through Queued → Submitted → Running → Complete, or jumps to a
//! negative code from any non-terminal state. The owning queue's worker is the only writer for
//! command events; the application writes user events.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::handle::{ContextHandle, QueueHandle};
use crate::queue::QueueWaker;
use crate::{ClError, ClResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventStatus {
    Queued,
    Submitted,
    Running,
    Complete,
    /// Negative status code.
    Error(i32),
}

impl EventStatus {
    /// The integer applications see: 3, 2, 1, 0, or the negative error.
    pub fn code(self) -> i32 {
        match self {
            EventStatus::Queued => 3,
            EventStatus::Submitted => 2,
            EventStatus::Running => 1,
            EventStatus::Complete => 0,
            EventStatus::Error(code) => code,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            3 => Some(EventStatus::Queued),
            2 => Some(EventStatus::Submitted),
            1 => Some(EventStatus::Running),
            0 => Some(EventStatus::Complete),
            c if c < 0 => Some(EventStatus::Error(c)),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, EventStatus::Complete | EventStatus::Error(_))
    }

    pub fn is_error(self) -> bool {
        matches!(self, EventStatus::Error(_))
    }

    fn rank(self) -> usize {
        match self {
            EventStatus::Queued => 0,
            EventStatus::Submitted => 1,
            EventStatus::Running => 2,
            EventStatus::Complete => 3,
            EventStatus::Error(_) => 4,
        }
    }

    /// Whether `self → next` is a legal transition. Skipping forward is allowed.
    pub fn can_advance_to(self, next: EventStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            EventStatus::Error(code) => code < 0,
            _ => next.rank() > self.rank(),
        }
    }

    /// Whether a callback registered for `trigger` should have fired by now.
    pub fn reached(self, trigger: CallbackTrigger) -> bool {
        self.rank() >= trigger.status().rank()
    }
}

impl From<ClError> for EventStatus {
    fn from(err: ClError) -> Self {
        EventStatus::Error(err.code())
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::error::describe_status(self.code()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackTrigger {
    Submitted,
    Running,
    Complete,
}

impl CallbackTrigger {
    fn status(self) -> EventStatus {
        match self {
            CallbackTrigger::Submitted => EventStatus::Submitted,
            CallbackTrigger::Running => EventStatus::Running,
            CallbackTrigger::Complete => EventStatus::Complete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    NdRangeKernel,
    Task,
    NativeKernel,
    ReadBuffer,
    WriteBuffer,
    CopyBuffer,
    MapBuffer,
    UnmapMemObject,
    Marker,
    Barrier,
    WaitForEvents,
    User,
}

impl CommandType {
    /// Commands that only order other commands and never reach a device.
    pub fn is_synchronization(self) -> bool {
        matches!(
            self,
            CommandType::Marker | CommandType::Barrier | CommandType::WaitForEvents
        )
    }
}

/// Monotonic nanosecond clock shared by every event of a platform.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now_ns(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfilingInfo {
    pub queued: u64,
    pub submit: u64,
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventInfo {
    pub command_type: CommandType,
    pub status: EventStatus,
    pub queue: Option<QueueHandle>,
    pub context: ContextHandle,
    pub reference_count: u32,
}

pub(crate) type Callback = Box<dyn FnOnce(EventStatus) + Send>;

/// Outcome of checking an event's wait list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dependencies {
    Ready,
    Blocked,
    Failed,
}

struct EventState {
    status: EventStatus,
    wait_list: Vec<Arc<Event>>,
    callbacks: Vec<(CallbackTrigger, Callback)>,
    watchers: Vec<QueueWaker>,
    /// queued, submit, start, end
    timestamps: [Option<u64>; 4],
    /// Terminal and every callback has run; waiters return only then.
    settled: bool,
}

pub struct Event {
    id: u64,
    command_type: CommandType,
    context: ContextHandle,
    queue: Option<QueueHandle>,
    clock: Option<Clock>,
    state: Mutex<EventState>,
    changed: Condvar,
}

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

impl Event {
    pub(crate) fn new(
        command_type: CommandType,
        context: ContextHandle,
        queue: Option<QueueHandle>,
        clock: Option<Clock>,
        wait_list: Vec<Arc<Event>>,
    ) -> Self {
        let mut timestamps = [None; 4];
        timestamps[0] = clock.map(|c| c.now_ns());
        Self {
            id: NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed),
            command_type,
            context,
            queue,
            clock,
            state: Mutex::new(EventState {
                status: EventStatus::Queued,
                wait_list,
                callbacks: Vec::new(),
                watchers: Vec::new(),
                timestamps,
                settled: false,
            }),
            changed: Condvar::new(),
        }
    }

    pub(crate) fn user(context: ContextHandle) -> Self {
        let event = Self::new(CommandType::User, context, None, None, Vec::new());
        event.lock().status = EventStatus::Submitted;
        event
    }

    fn lock(&self) -> MutexGuard<'_, EventState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn command_type(&self) -> CommandType {
        self.command_type
    }

    pub fn context(&self) -> ContextHandle {
        self.context
    }

    pub fn queue(&self) -> Option<QueueHandle> {
        self.queue
    }

    pub fn status(&self) -> EventStatus {
        self.lock().status
    }

    /// Moves the event to `next`. Returns `false` and changes nothing for an illegal transition.
    pub(crate) fn set_status(&self, next: EventStatus) -> bool {
        let (fired, watchers) = {
            let mut state = self.lock();
            if !state.status.can_advance_to(next) {
                return false;
            }
            state.status = next;
            if let Some(clock) = self.clock {
                if !next.is_error() {
                    let now = clock.now_ns();
                    for slot in state.timestamps.iter_mut().take(next.rank() + 1) {
                        slot.get_or_insert(now);
                    }
                }
            }
            let (fired, kept) = std::mem::take(&mut state.callbacks)
                .into_iter()
                .partition::<Vec<_>, _>(|(trigger, _)| next.reached(*trigger));
            state.callbacks = kept;
            let watchers = if next.is_terminal() {
                state.wait_list.clear();
                std::mem::take(&mut state.watchers)
            } else {
                Vec::new()
            };
            (fired, watchers)
        };

        for (_, callback) in fired {
            callback(next);
        }
        if next.is_terminal() {
            self.lock().settled = true;
        }
        self.changed.notify_all();
        for watcher in watchers {
            watcher.wake();
        }
        true
    }

    /// Registers `callback` for `trigger`, running it right away if the event already got there.
    pub(crate) fn add_callback(&self, trigger: CallbackTrigger, callback: Callback) {
        let status = {
            let mut state = self.lock();
            if !state.status.reached(trigger) {
                state.callbacks.push((trigger, callback));
                return;
            }
            state.status
        };
        callback(status);
    }

    /// Asks for `waker` to be woken when the event becomes terminal. Returns `false` if it
    /// already is.
    pub(crate) fn watch(&self, waker: QueueWaker) -> bool {
        let mut state = self.lock();
        if state.status.is_terminal() {
            return false;
        }
        state.watchers.push(waker);
        true
    }

    pub(crate) fn dependencies(&self) -> Dependencies {
        let wait_list = self.lock().wait_list.clone();
        let mut blocked = false;
        for dep in &wait_list {
            match dep.status() {
                EventStatus::Error(_) => return Dependencies::Failed,
                EventStatus::Complete => {}
                _ => blocked = true,
            }
        }
        if blocked {
            Dependencies::Blocked
        } else {
            Dependencies::Ready
        }
    }

    /// Blocks until the event is terminal.
    pub fn wait(&self) -> EventStatus {
        let mut state = self.lock();
        while !state.settled {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.status
    }

    /// Like [`Event::wait`]; returns `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<EventStatus> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while !state.settled {
            let left = deadline.checked_duration_since(Instant::now())?;
            state = self
                .changed
                .wait_timeout(state, left)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        Some(state.status)
    }

    pub fn profiling(&self) -> ClResult<ProfilingInfo> {
        if self.clock.is_none() {
            return Err(ClError::ProfilingInfoNotAvailable);
        }
        let state = self.lock();
        if state.status != EventStatus::Complete {
            return Err(ClError::ProfilingInfoNotAvailable);
        }
        match state.timestamps {
            [Some(queued), Some(submit), Some(start), Some(end)] => Ok(ProfilingInfo {
                queued,
                submit,
                start,
                end,
            }),
            _ => Err(ClError::ProfilingInfoNotAvailable),
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("command_type", &self.command_type)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::HandleTable;
    use crate::context::Context;
    use std::sync::atomic::AtomicUsize;

    fn ctx() -> ContextHandle {
        let table: HandleTable<Context> = HandleTable::new(ClError::InvalidContext);
        table.insert(Arc::new(Context::new(Vec::new())))
    }

    fn event(clock: Option<Clock>) -> Event {
        Event::new(CommandType::Marker, ctx(), None, clock, Vec::new())
    }

    #[test]
    fn status_only_moves_forward() {
        let ev = event(None);
        assert!(ev.set_status(EventStatus::Submitted));
        assert!(!ev.set_status(EventStatus::Queued));
        assert!(!ev.set_status(EventStatus::Submitted));
        assert!(ev.set_status(EventStatus::Complete));
        assert!(!ev.set_status(EventStatus::Error(-5)));
        assert_eq!(ev.status(), EventStatus::Complete);
    }

    #[test]
    fn errors_are_terminal_from_any_live_state() {
        let ev = event(None);
        assert!(ev.set_status(EventStatus::Running));
        assert!(!ev.set_status(EventStatus::Error(1)));
        assert!(ev.set_status(EventStatus::Error(-14)));
        assert!(!ev.set_status(EventStatus::Complete));
        assert_eq!(ev.wait(), EventStatus::Error(-14));
    }

    #[test]
    fn callbacks_fire_once_including_late_registrations() {
        let ev = event(None);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        ev.add_callback(
            CallbackTrigger::Running,
            Box::new(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        ev.set_status(EventStatus::Submitted);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        ev.set_status(EventStatus::Running);
        ev.set_status(EventStatus::Complete);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let h = Arc::clone(&hits);
        ev.add_callback(
            CallbackTrigger::Submitted,
            Box::new(move |status| {
                assert_eq!(status, EventStatus::Complete);
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn waiters_return_after_callbacks_have_run() {
        let ev = Arc::new(event(None));
        let done = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&done);
        ev.add_callback(
            CallbackTrigger::Complete,
            Box::new(move |_| {
                std::thread::sleep(Duration::from_millis(30));
                d.store(1, Ordering::SeqCst);
            }),
        );
        let setter = {
            let ev = Arc::clone(&ev);
            std::thread::spawn(move || ev.set_status(EventStatus::Complete))
        };
        while ev.status() != EventStatus::Complete {
            std::thread::yield_now();
        }
        assert_eq!(ev.wait(), EventStatus::Complete);
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(setter.join().unwrap());
    }

    #[test]
    fn failure_passes_every_trigger() {
        let ev = event(None);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for trigger in [
            CallbackTrigger::Submitted,
            CallbackTrigger::Running,
            CallbackTrigger::Complete,
        ] {
            let seen = Arc::clone(&seen);
            ev.add_callback(trigger, Box::new(move |s| seen.lock().unwrap().push(s)));
        }
        ev.set_status(EventStatus::Error(-2));
        assert_eq!(*seen.lock().unwrap(), vec![EventStatus::Error(-2); 3]);
    }

    #[test]
    fn dependencies_report_failures_first() {
        let done = Arc::new(event(None));
        let live = Arc::new(event(None));
        let failed = Arc::new(event(None));
        done.set_status(EventStatus::Complete);
        failed.set_status(EventStatus::Error(-5));

        let ev = Event::new(
            CommandType::Barrier,
            ctx(),
            None,
            None,
            vec![Arc::clone(&done), Arc::clone(&live)],
        );
        assert_eq!(ev.dependencies(), Dependencies::Blocked);
        live.set_status(EventStatus::Complete);
        assert_eq!(ev.dependencies(), Dependencies::Ready);

        let ev = Event::new(
            CommandType::Barrier,
            ctx(),
            None,
            None,
            vec![Arc::new(event(None)), failed],
        );
        assert_eq!(ev.dependencies(), Dependencies::Failed);
    }

    #[test]
    fn profiling_needs_a_clock_and_completion() {
        assert_eq!(
            event(None).profiling(),
            Err(ClError::ProfilingInfoNotAvailable)
        );
        let ev = event(Some(Clock::new()));
        ev.set_status(EventStatus::Submitted);
        assert_eq!(ev.profiling(), Err(ClError::ProfilingInfoNotAvailable));
        ev.set_status(EventStatus::Complete);
        let p = ev.profiling().unwrap();
        assert!(p.queued <= p.submit && p.submit <= p.start && p.start <= p.end);
    }

    #[test]
    fn user_events_start_submitted() {
        let ev = Event::user(ctx());
        assert_eq!(ev.status(), EventStatus::Submitted);
        assert_eq!(ev.command_type(), CommandType::User);
        assert_eq!(ev.wait_timeout(Duration::from_millis(1)), None);
    }

    #[test]
    fn status_codes_round_trip() {
        for status in [
            EventStatus::Queued,
            EventStatus::Submitted,
            EventStatus::Running,
            EventStatus::Complete,
            EventStatus::Error(-14),
        ] {
            assert_eq!(EventStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(EventStatus::from_code(7), None);
    }
}
