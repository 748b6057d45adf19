//! Handler worker pool and the dispatcher front-end.

use crate::error::Result;
use crate::session::{Session, SessionInner};
use crate::types::{Event, EventKind, Message};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use super::queue::EventQueue;
use super::set_dispatching;

/// Callback invoked once per delivered event.
pub type EventHandler = Arc<dyn Fn(&Event, &Session) + Send + Sync>;

/// Dispatcher thread configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventDispatcherConfig {
    /// Number of dispatcher threads invoking the handler.
    /// Default: 1
    pub num_threads: usize,
}

impl Default for EventDispatcherConfig {
    fn default() -> Self {
        Self { num_threads: 1 }
    }
}

enum Command {
    Deliver(Event),
    /// Deliver a message whose ids span several workers, once every other
    /// worker involved has reached its `Hold` for the same joint.
    Joint(Event, Arc<Joint>),
    /// Park until the owner of the joint has delivered it.
    Hold(Arc<Joint>),
    /// Stop after draining everything queued before this command.
    Exit,
    /// Wait for every other worker to exit, deliver the final event, stop.
    Finish(Event),
}

/// Rendezvous between the workers owning the ids of one message.
struct Joint {
    state: Mutex<JointState>,
    changed: Condvar,
}

struct JointState {
    /// Holders that have not reached the joint yet.
    waiting: usize,
    delivered: bool,
}

impl Joint {
    fn new(holders: usize) -> Self {
        Self {
            state: Mutex::new(JointState {
                waiting: holders,
                delivered: false,
            }),
            changed: Condvar::new(),
        }
    }

    fn hold(&self) {
        let mut state = self.state.lock();
        state.waiting -= 1;
        self.changed.notify_all();
        while !state.delivered {
            self.changed.wait(&mut state);
        }
    }

    fn wait_for_holders(&self) {
        let mut state = self.state.lock();
        while state.waiting > 0 {
            self.changed.wait(&mut state);
        }
    }

    fn release(&self) {
        self.state.lock().delivered = true;
        self.changed.notify_all();
    }
}

/// Distinct workers owning the ids of `message`, lowest first.
fn partitions(message: &Message, workers: usize) -> Vec<usize> {
    let mut indices: Vec<usize> = message
        .correlation_ids
        .iter()
        .map(|id| id.partition(workers))
        .collect();
    indices.sort_unstable();
    indices.dedup();
    indices
}

/// Routes events to the consumer: either the handler pool or a poll queue.
pub(crate) enum EventDispatcher {
    Polling(EventQueue),
    Workers(WorkerPool),
}

impl EventDispatcher {
    pub(crate) fn polling() -> Self {
        EventDispatcher::Polling(EventQueue::new())
    }

    pub(crate) fn workers(
        session_id: u64,
        handler: EventHandler,
        config: &EventDispatcherConfig,
        session: Weak<SessionInner>,
    ) -> Self {
        EventDispatcher::Workers(WorkerPool::new(session_id, handler, config, session))
    }

    pub(crate) fn has_handler(&self) -> bool {
        matches!(self, EventDispatcher::Workers(_))
    }

    /// Spawn dispatcher threads, if any.
    pub(crate) fn start(&self) -> Result<()> {
        match self {
            EventDispatcher::Polling(_) => Ok(()),
            EventDispatcher::Workers(pool) => pool.start(),
        }
    }

    /// Hand `event` to the consumer. A finishing worker pool refuses it and
    /// gives it back.
    pub(crate) fn dispatch(&self, event: Event) -> std::result::Result<(), Event> {
        match self {
            EventDispatcher::Polling(queue) => {
                queue.push(event);
                Ok(())
            }
            EventDispatcher::Workers(pool) => pool.dispatch(event),
        }
    }

    /// Deliver `event` last and stop accepting work. Returns false if the
    /// dispatcher was already finishing.
    pub(crate) fn finish(&self, event: Event) -> bool {
        match self {
            EventDispatcher::Polling(queue) => {
                queue.push(event);
                true
            }
            EventDispatcher::Workers(pool) => pool.finish(event),
        }
    }

    /// Block until every dispatcher thread has exited.
    pub(crate) fn join(&self) {
        if let EventDispatcher::Workers(pool) = self {
            pool.join();
        }
    }

    pub(crate) fn queue(&self) -> Option<&EventQueue> {
        match self {
            EventDispatcher::Polling(queue) => Some(queue),
            EventDispatcher::Workers(_) => None,
        }
    }
}

/// Fixed pool of dispatcher threads, one FIFO per thread.
pub(crate) struct WorkerPool {
    session_id: u64,
    handler: EventHandler,
    session: Weak<SessionInner>,
    senders: Vec<Sender<Command>>,
    /// Receivers waiting for `start` to hand them to their threads.
    pending: Mutex<Option<Vec<Receiver<Command>>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    /// Held while the commands of one event are enqueued, so every worker
    /// queue sees joints in the same relative order.
    enqueue: Mutex<()>,
    finishing: AtomicBool,
}

impl WorkerPool {
    fn new(
        session_id: u64,
        handler: EventHandler,
        config: &EventDispatcherConfig,
        session: Weak<SessionInner>,
    ) -> Self {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..config.num_threads.max(1)).map(|_| unbounded()).unzip();

        Self {
            session_id,
            handler,
            session,
            senders,
            pending: Mutex::new(Some(receivers)),
            handles: Mutex::new(Vec::new()),
            enqueue: Mutex::new(()),
            finishing: AtomicBool::new(false),
        }
    }

    fn start(&self) -> Result<()> {
        let Some(receivers) = self.pending.lock().take() else {
            return Ok(());
        };

        let workers = receivers.len();
        let (done_tx, done_rx) = unbounded();
        let mut handles = self.handles.lock();

        for (index, receiver) in receivers.into_iter().enumerate() {
            let worker = Worker {
                index,
                workers,
                session_id: self.session_id,
                handler: Arc::clone(&self.handler),
                session: self.session.clone(),
                receiver,
                done_tx: done_tx.clone(),
                done_rx: done_rx.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("marketlink-dispatch-{}-{}", self.session_id, index))
                .spawn(move || worker.run())?;
            handles.push(handle);
        }

        tracing::debug!(session = self.session_id, workers, "Dispatcher started");
        Ok(())
    }

    fn dispatch(&self, event: Event) -> std::result::Result<(), Event> {
        let _enqueue = self.enqueue.lock();
        if self.finishing.load(Ordering::Acquire) {
            tracing::debug!(session = self.session_id, kind = ?event.kind, "Dispatcher finishing, event dropped");
            return Err(event);
        }

        let workers = self.senders.len();
        if workers == 1 || event.messages.is_empty() {
            self.send(0, Command::Deliver(event));
            return Ok(());
        }

        let kind = event.kind;
        let mut buckets: Vec<Vec<Message>> = (0..workers).map(|_| Vec::new()).collect();
        for message in event.messages {
            match partitions(&message, workers).as_slice() {
                [] => buckets[0].push(message),
                [index] => buckets[*index].push(message),
                [owner, holders @ ..] => {
                    // Everything before the joint must reach its workers first.
                    self.flush(kind, &mut buckets);
                    let joint = Arc::new(Joint::new(holders.len()));
                    for &index in holders {
                        self.send(index, Command::Hold(Arc::clone(&joint)));
                    }
                    self.send(*owner, Command::Joint(Event::new(kind, vec![message]), joint));
                }
            }
        }
        self.flush(kind, &mut buckets);
        Ok(())
    }

    fn flush(&self, kind: EventKind, buckets: &mut [Vec<Message>]) {
        for (index, bucket) in buckets.iter_mut().enumerate() {
            if !bucket.is_empty() {
                let messages = std::mem::take(bucket);
                self.send(index, Command::Deliver(Event::new(kind, messages)));
            }
        }
    }

    fn finish(&self, event: Event) -> bool {
        let _enqueue = self.enqueue.lock();
        if self.finishing.swap(true, Ordering::AcqRel) {
            return false;
        }
        for index in 1..self.senders.len() {
            self.send(index, Command::Exit);
        }
        self.send(0, Command::Finish(event));
        true
    }

    fn join(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                tracing::warn!(session = self.session_id, "Dispatcher thread exited abnormally");
            }
        }
    }

    fn send(&self, index: usize, command: Command) {
        if self.senders[index].send(command).is_err() {
            tracing::debug!(session = self.session_id, worker = index, "Dispatcher thread gone, command dropped");
        }
    }
}

struct Worker {
    index: usize,
    workers: usize,
    session_id: u64,
    handler: EventHandler,
    session: Weak<SessionInner>,
    receiver: Receiver<Command>,
    done_tx: Sender<()>,
    done_rx: Receiver<()>,
}

impl Worker {
    fn run(self) {
        set_dispatching(Some(self.session_id));

        while let Ok(command) = self.receiver.recv() {
            match command {
                Command::Deliver(event) => self.deliver(event),
                Command::Joint(event, joint) => {
                    joint.wait_for_holders();
                    self.deliver(event);
                    joint.release();
                }
                Command::Hold(joint) => joint.hold(),
                Command::Exit => {
                    let _ = self.done_tx.send(());
                    break;
                }
                Command::Finish(event) => {
                    for _ in 1..self.workers {
                        if self.done_rx.recv().is_err() {
                            break;
                        }
                    }
                    self.deliver(event);
                    if let Some(session) = self.session.upgrade() {
                        session.mark_stopped();
                    }
                    break;
                }
            }
        }

        tracing::trace!(session = self.session_id, worker = self.index, "Dispatcher thread exiting");
        set_dispatching(None);
    }

    fn deliver(&self, event: Event) {
        let Some(inner) = self.session.upgrade() else {
            tracing::trace!(session = self.session_id, kind = ?event.kind, "Session gone, event dropped");
            return;
        };
        let Some(event) = inner.admit(event) else {
            return;
        };

        let session = Session::from_inner(inner);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (self.handler)(&event, &session)));
        if let Err(payload) = outcome {
            let reason = panic_message(payload.as_ref());
            tracing::error!(
                session = self.session_id,
                worker = self.index,
                kind = ?event.kind,
                ids = ?event.correlation_ids(),
                reason = %reason,
                "Exception in event handler, terminating process"
            );
            std::process::exit(1);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
