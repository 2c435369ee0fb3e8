//! Command queues and their scheduler workers.
//!
//! Each queue owns one worker thread. Enqueue appends to the pending list and wakes the worker;
//! the worker submits every command whose wait list is complete, in FIFO order, and is the only
//! thread that moves the queue's events forward. Devices report back over the worker's channel.

use std::collections::VecDeque;
use std::fmt;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::command::Command;
use crate::device::{Device, DeviceWork};
use crate::event::{Clock, CommandType, Dependencies, Event, EventStatus};
use crate::flags::QueueProperties;
use crate::handle::{ContextHandle, DeviceHandle, QueueHandle};
use crate::{ClError, ClResult};

pub(crate) enum QueueMsg {
    /// Something the pending list waits on may have changed.
    Wake,
    Running(Arc<Event>),
    Completed(Arc<Event>, Result<(), i32>),
    Flush(SyncSender<()>),
    /// The application released the queue; exit once everything pending is terminal.
    Retire,
    /// Platform teardown; fail whatever is still pending.
    Shutdown,
}

/// Handle to a queue worker's channel.
#[derive(Clone)]
pub(crate) struct QueueWaker(Sender<QueueMsg>);

impl QueueWaker {
    pub(crate) fn wake(&self) {
        let _ = self.0.send(QueueMsg::Wake);
    }

    pub(crate) fn running(&self, event: Arc<Event>) {
        let _ = self.0.send(QueueMsg::Running(event));
    }

    pub(crate) fn completed(&self, event: Arc<Event>, result: Result<(), i32>) {
        let _ = self.0.send(QueueMsg::Completed(event, result));
    }
}

impl fmt::Debug for QueueWaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("QueueWaker")
    }
}

struct Pending {
    event: Arc<Event>,
    /// Taken when the command is handed to the device.
    command: Option<Command>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Pending>,
    /// Most recent command, for the implicit in-order dependency.
    last: Option<Arc<Event>>,
    /// Most recent barrier; later commands of an out-of-order queue wait for it.
    barrier: Option<Arc<Event>>,
}

struct QueueShared {
    state: Mutex<QueueState>,
    drained: Condvar,
}

impl QueueShared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The platform's grip on a worker thread, kept for teardown.
pub(crate) struct QueueWorker {
    tx: Sender<QueueMsg>,
    join: JoinHandle<()>,
}

impl QueueWorker {
    pub(crate) fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub(crate) fn shutdown(self) {
        let _ = self.tx.send(QueueMsg::Shutdown);
        if self.join.join().is_err() {
            warn!("queue worker panicked");
        }
    }
}

pub struct CommandQueue {
    handle: QueueHandle,
    context: ContextHandle,
    device_handle: DeviceHandle,
    device: Arc<dyn Device>,
    properties: QueueProperties,
    clock: Clock,
    shared: Arc<QueueShared>,
    tx: Sender<QueueMsg>,
}

impl CommandQueue {
    /// Creates the queue and starts its worker.
    pub(crate) fn spawn(
        handle: QueueHandle,
        context: ContextHandle,
        device_handle: DeviceHandle,
        device: Arc<dyn Device>,
        properties: QueueProperties,
        clock: Clock,
        idle_poll: Duration,
    ) -> ClResult<(Self, QueueWorker)> {
        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(QueueShared {
            state: Mutex::new(QueueState::default()),
            drained: Condvar::new(),
        });
        let worker = Worker {
            handle,
            device: Arc::clone(&device),
            out_of_order: properties.contains(QueueProperties::OUT_OF_ORDER_EXEC_MODE_ENABLE),
            shared: Arc::clone(&shared),
            waker: QueueWaker(tx.clone()),
            rx,
            idle_poll,
        };
        let join = thread::Builder::new()
            .name(format!("tiocl-queue{}", handle.index()))
            .spawn(move || worker.run())
            .map_err(|err| {
                warn!(%err, "could not start queue worker");
                ClError::OutOfHostMemory
            })?;
        let queue = Self {
            handle,
            context,
            device_handle,
            device,
            properties,
            clock,
            shared,
            tx: tx.clone(),
        };
        Ok((queue, QueueWorker { tx, join }))
    }

    pub fn handle(&self) -> QueueHandle {
        self.handle
    }

    pub fn context(&self) -> ContextHandle {
        self.context
    }

    pub fn device_handle(&self) -> DeviceHandle {
        self.device_handle
    }

    pub(crate) fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn properties(&self) -> QueueProperties {
        self.properties
    }

    pub fn is_out_of_order(&self) -> bool {
        self.properties
            .contains(QueueProperties::OUT_OF_ORDER_EXEC_MODE_ENABLE)
    }

    pub fn pending_len(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Appends a command. `wait_list` must already be validated.
    pub(crate) fn enqueue(
        &self,
        command_type: CommandType,
        command: Command,
        wait_list: Vec<Arc<Event>>,
    ) -> Arc<Event> {
        let clock = self
            .properties
            .contains(QueueProperties::PROFILING_ENABLE)
            .then_some(self.clock);
        let event = {
            let mut state = self.shared.lock();
            let mut deps = wait_list;
            if command_type.is_synchronization() && command_type != CommandType::WaitForEvents {
                deps.extend(state.pending.iter().map(|p| Arc::clone(&p.event)));
            }
            if self.is_out_of_order() {
                deps.extend(state.barrier.clone());
            } else {
                deps.extend(state.last.clone());
            }
            dedup_events(&mut deps);

            let event = Arc::new(Event::new(
                command_type,
                self.context,
                Some(self.handle),
                clock,
                deps.clone(),
            ));
            let waker = QueueWaker(self.tx.clone());
            for dep in &deps {
                dep.watch(waker.clone());
            }
            state.pending.push_back(Pending {
                event: Arc::clone(&event),
                command: Some(command),
            });
            state.last = Some(Arc::clone(&event));
            if command_type == CommandType::Barrier {
                state.barrier = Some(Arc::clone(&event));
            }
            event
        };
        trace!(queue = ?self.handle, event = event.id(), ?command_type, "enqueued");
        let _ = self.tx.send(QueueMsg::Wake);
        event
    }

    /// Returns once the worker has looked at every command enqueued before the call.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        if self.tx.send(QueueMsg::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    /// Blocks until the pending list is empty.
    pub fn finish(&self) {
        self.flush();
        let mut state = self.shared.lock();
        while !state.pending.is_empty() {
            state = self
                .shared
                .drained
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        let _ = self.tx.send(QueueMsg::Retire);
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("handle", &self.handle)
            .field("device", &self.device.id())
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}

fn dedup_events(events: &mut Vec<Arc<Event>>) {
    let mut seen = std::collections::HashSet::new();
    events.retain(|e| seen.insert(e.id()));
}

enum Action {
    Poison(Arc<Event>, EventStatus),
    Complete(Arc<Event>),
    Submit(Arc<Event>, Command),
}

struct Worker {
    handle: QueueHandle,
    device: Arc<dyn Device>,
    out_of_order: bool,
    shared: Arc<QueueShared>,
    waker: QueueWaker,
    rx: Receiver<QueueMsg>,
    idle_poll: Duration,
}

impl Worker {
    fn run(self) {
        let _span = tracing::debug_span!("queue", index = self.handle.index()).entered();
        let mut retiring = false;
        let mut deferred = false;
        loop {
            let first = if deferred {
                match self.rx.recv_timeout(self.idle_poll) {
                    Ok(msg) => Some(msg),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => Some(QueueMsg::Shutdown),
                }
            } else {
                Some(self.rx.recv().unwrap_or(QueueMsg::Shutdown))
            };

            let mut acks = Vec::new();
            for msg in first.into_iter().chain(std::iter::from_fn(|| self.rx.try_recv().ok())) {
                match msg {
                    QueueMsg::Wake => {}
                    QueueMsg::Running(event) => {
                        event.set_status(EventStatus::Running);
                    }
                    QueueMsg::Completed(event, result) => {
                        let status = match result {
                            Ok(()) => EventStatus::Complete,
                            Err(code) => EventStatus::Error(code),
                        };
                        debug!(event = event.id(), %status, "command finished");
                        event.set_status(status);
                    }
                    QueueMsg::Flush(ack) => acks.push(ack),
                    QueueMsg::Retire => retiring = true,
                    QueueMsg::Shutdown => {
                        self.fail_all(ClError::DeviceNotAvailable);
                        for ack in acks {
                            let _ = ack.send(());
                        }
                        debug!("queue worker stopped");
                        return;
                    }
                }
            }

            deferred = self.schedule();
            for ack in acks {
                let _ = ack.send(());
            }
            if retiring && self.shared.lock().pending.is_empty() {
                debug!("queue retired");
                return;
            }
        }
    }

    /// Scans the pending list until nothing more can move. Returns whether commands were held
    /// back because the device was busy.
    fn schedule(&self) -> bool {
        loop {
            let (actions, deferred) = self.collect();
            if actions.is_empty() {
                return deferred;
            }
            for action in actions {
                self.apply(action);
            }
        }
    }

    fn collect(&self) -> (Vec<Action>, bool) {
        let mut state = self.shared.lock();
        state.pending.retain(|p| !p.event.status().is_terminal());
        if state.pending.is_empty() {
            self.shared.drained.notify_all();
        }

        let mut actions = Vec::new();
        let mut deferred = false;
        let mut device_busy = self.out_of_order && self.device.got_enough_to_work_on();
        for pending in state.pending.iter_mut() {
            if pending.command.is_none() {
                continue;
            }
            let event = &pending.event;
            match event.dependencies() {
                Dependencies::Blocked => continue,
                Dependencies::Failed => {
                    pending.command = None;
                    actions.push(Action::Poison(
                        Arc::clone(event),
                        ClError::ExecStatusErrorForEventsInWaitList.into(),
                    ));
                }
                Dependencies::Ready if event.command_type().is_synchronization() => {
                    pending.command = None;
                    actions.push(Action::Complete(Arc::clone(event)));
                }
                Dependencies::Ready if !self.device.is_available() => {
                    pending.command = None;
                    actions.push(Action::Poison(
                        Arc::clone(event),
                        ClError::DeviceNotAvailable.into(),
                    ));
                }
                Dependencies::Ready if device_busy => deferred = true,
                Dependencies::Ready => {
                    if let Some(command) = pending.command.take() {
                        actions.push(Action::Submit(Arc::clone(event), command));
                        device_busy = self.out_of_order && self.device.got_enough_to_work_on();
                    }
                }
            }
        }
        (actions, deferred)
    }

    fn apply(&self, action: Action) {
        match action {
            Action::Poison(event, status) => {
                debug!(event = event.id(), %status, "command poisoned");
                event.set_status(status);
            }
            Action::Complete(event) => {
                event.set_status(EventStatus::Complete);
            }
            Action::Submit(event, command) => {
                trace!(event = event.id(), ?command, "submitting");
                event.set_status(EventStatus::Submitted);
                let work = DeviceWork::new(
                    Arc::clone(&event),
                    command,
                    self.device.compute_units(),
                    self.out_of_order,
                    self.waker.clone(),
                );
                if let Err(err) = self.device.push_event(work) {
                    debug!(event = event.id(), %err, "device refused command");
                    event.set_status(err.into());
                }
            }
        }
    }

    fn fail_all(&self, err: ClError) {
        let events: Vec<_> = {
            let mut state = self.shared.lock();
            let events = state.pending.drain(..).map(|p| p.event).collect();
            self.shared.drained.notify_all();
            events
        };
        for event in events {
            event.set_status(err.into());
        }
    }
}
