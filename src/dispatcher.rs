//! Event dispatcher.
//!
//! One unbounded FIFO queue feeds a fixed pool of worker threads:
//!
//! ```text
//!  agents ─┐                          ┌─ worker 0 ─┐
//!  timers ─┼─ submit ─▶ [ queue ] ─▶──┤            ├─▶ subscribe / unsubscribe
//!  commands┘                          └─ worker n ─┘   command registry
//!                                                      matching subscribers
//! ```
//!
//! `submit` never blocks. Each worker takes one event at a time and runs the
//! matching handlers in turn on its own thread, so handlers for different
//! events may run concurrently but the subscribers of one event run
//! sequentially.
//!
//! Shutdown is a barrier: every scheduled entry is cancelled, a terminal
//! [`Event::shutdown`] is queued and the call blocks until the queue has
//! fully drained, including anything the drained events submitted.

use crate::agent::Agent;
use crate::commands::CommandRegistry;
use crate::error::{Removal, ScheduleError};
use crate::event::{ALL, Event, EventKind};
use crate::scheduler::Scheduler;
use crate::timing::TimeFormats;
use std::collections::{BTreeSet, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::JoinHandle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, trace, warn};

/// Default number of worker threads.
pub const DEFAULT_WORKERS: usize = 2;

/// `agent_filter -> event id -> subscriber -> handler`
type SubscriptionTable = HashMap<String, HashMap<String, HashMap<String, Arc<dyn Agent>>>>;

pub(crate) enum Job {
    Event(Event),
    Stop,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Submitter ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    drained: Condvar,
}

impl Pending {
    fn add(&self) {
        *lock(&self.count) += 1;
    }

    fn done(&self) {
        let mut count = lock(&self.count);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    fn get(&self) -> usize {
        *lock(&self.count)
    }

    fn wait_drained(&self) {
        let mut count = lock(&self.count);
        while *count > 0 {
            count = self
                .drained
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Cloneable handle for putting events on the dispatcher queue.
///
/// Agents, timers and the command registry all hold one.
#[derive(Clone)]
pub struct Submitter {
    tx: UnboundedSender<Job>,
    pending: Arc<Pending>,
    closed: Arc<AtomicBool>,
}

impl Submitter {
    /// Queue `event` for delivery. Never blocks.
    ///
    /// After the dispatcher has shut down the event is dropped with a warning.
    pub fn submit(&self, event: Event) {
        if self.closed.load(Ordering::Acquire) {
            warn!(id = event.id(), emitter = event.emitter(), "Dispatcher is shut down, dropping event");
            return;
        }

        trace!(%event, "Submitting event");
        self.pending.add();
        if let Err(mpsc::error::SendError(job)) = self.tx.send(Job::Event(event)) {
            self.pending.done();
            if let Job::Event(event) = job {
                warn!(id = event.id(), "Event queue is closed, dropping event");
            }
        }
    }

    /// Events submitted but not yet fully processed.
    pub fn pending(&self) -> usize {
        self.pending.get()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn stop_worker(&self) {
        let _ = self.tx.send(Job::Stop);
    }
}

/// Create a queue and the submitter feeding it.
pub(crate) fn queue() -> (Submitter, UnboundedReceiver<Job>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let submitter = Submitter {
        tx,
        pending: Arc::new(Pending::default()),
        closed: Arc::new(AtomicBool::new(false)),
    };
    (submitter, rx)
}

// ── Router ──────────────────────────────────────────────────────────────────

/// The state workers share: subscriptions, registered agents and commands.
struct Router {
    subscriptions: RwLock<SubscriptionTable>,
    agents: RwLock<HashMap<String, Arc<dyn Agent>>>,
    commands: Arc<CommandRegistry>,
}

impl Router {
    fn route(&self, event: Event) {
        debug!(%event, "Dispatching event");
        match event.kind() {
            EventKind::Subscribe => self.subscribe(&event),
            EventKind::Unsubscribe => {
                self.unsubscribe(&event);
            }
            EventKind::Command => {
                let outcome =
                    catch_unwind(AssertUnwindSafe(|| self.commands.on_command_event(&event)));
                if outcome.is_err() {
                    error!(%event, "Command handling panicked");
                }
            }
            _ => self.deliver(&event),
        }
    }

    fn subscribe(&self, event: &Event) {
        let handler = self
            .agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event.emitter())
            .cloned();

        let Some(handler) = handler else {
            warn!(
                subscriber = event.emitter(),
                id = event.id(),
                "Subscription from unknown component, dropping"
            );
            return;
        };

        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event.agent_filter().to_string())
            .or_default()
            .entry(event.id().to_string())
            .or_default()
            .insert(event.emitter().to_string(), handler);

        debug!(
            subscriber = event.emitter(),
            filter = event.agent_filter(),
            id = event.id(),
            "Subscribed"
        );
    }

    fn unsubscribe(&self, event: &Event) -> Removal {
        let mut table = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let removed = table
            .get_mut(event.agent_filter())
            .and_then(|ids| ids.get_mut(event.id()))
            .and_then(|subscribers| subscribers.remove(event.emitter()))
            .is_some();

        if !removed {
            info!(
                subscriber = event.emitter(),
                filter = event.agent_filter(),
                id = event.id(),
                "No such subscription"
            );
            return Removal::NotFound;
        }

        // Drop emptied levels so the table does not grow without bound.
        if let Some(ids) = table.get_mut(event.agent_filter()) {
            if ids.get(event.id()).is_some_and(HashMap::is_empty) {
                ids.remove(event.id());
            }
            if ids.is_empty() {
                table.remove(event.agent_filter());
            }
        }
        Removal::Removed
    }

    /// Subscribers matching `event`, keyed (and de-duplicated) by name.
    fn matching(&self, event: &Event) -> HashMap<String, Arc<dyn Agent>> {
        let table = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut subs = HashMap::new();

        if table.contains_key(ALL) {
            collect(&table, &mut subs, ALL, ALL);
            collect(&table, &mut subs, ALL, event.id());
            subs.remove(event.emitter());
        }
        if table.contains_key(event.emitter()) {
            collect(&table, &mut subs, event.emitter(), ALL);
            collect(&table, &mut subs, event.emitter(), event.id());
        }
        subs
    }

    fn deliver(&self, event: &Event) {
        let subscribers = self.matching(event);
        if subscribers.is_empty() {
            trace!(id = event.id(), "No subscribers");
            return;
        }

        for (name, handler) in subscribers {
            match catch_unwind(AssertUnwindSafe(|| handler.handle_event(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(subscriber = %name, id = event.id(), error = %e, "Event handler failed")
                }
                Err(_) => error!(subscriber = %name, id = event.id(), "Event handler panicked"),
            }
        }
    }
}

fn collect(
    table: &SubscriptionTable,
    into: &mut HashMap<String, Arc<dyn Agent>>,
    filter: &str,
    id: &str,
) {
    if let Some(found) = table.get(filter).and_then(|ids| ids.get(id)) {
        into.extend(found.iter().map(|(name, h)| (name.clone(), Arc::clone(h))));
    }
}

// ── Dispatcher ──────────────────────────────────────────────────────────────

/// Owns the queue, the worker pool, the registry of agents, the command
/// registry and the scheduler.
pub struct Dispatcher {
    submitter: Submitter,
    receiver: Arc<Mutex<UnboundedReceiver<Job>>>,
    router: Arc<Router>,
    scheduler: Scheduler,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Dispatcher {
    pub fn new() -> Result<Self, ScheduleError> {
        Self::with_formats(TimeFormats::default())
    }

    /// Create a dispatcher whose scheduler parses absolute times with `formats`.
    pub fn with_formats(formats: TimeFormats) -> Result<Self, ScheduleError> {
        let (submitter, receiver) = queue();
        let scheduler = Scheduler::with_formats(submitter.clone(), formats)?;
        let router = Router {
            subscriptions: RwLock::new(HashMap::new()),
            agents: RwLock::new(HashMap::new()),
            commands: Arc::new(CommandRegistry::new(submitter.clone())),
        };

        Ok(Self {
            submitter,
            receiver: Arc::new(Mutex::new(receiver)),
            router: Arc::new(router),
            scheduler,
            workers: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn submit(&self, event: Event) {
        self.submitter.submit(event);
    }

    pub fn submitter(&self) -> Submitter {
        self.submitter.clone()
    }

    pub fn commands(&self) -> &Arc<CommandRegistry> {
        &self.router.commands
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn pending(&self) -> usize {
        self.submitter.pending()
    }

    /// Make `agent` available as a subscription target under its name.
    ///
    /// Subscribe events naming an unregistered emitter are dropped, so
    /// register agents before their subscriptions are processed.
    pub fn register(&self, agent: Arc<dyn Agent>) {
        let name = agent.name().to_string();
        let previous = self
            .router
            .agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), agent);
        if previous.is_some() {
            warn!(agent = %name, "Replaced registered agent");
        } else {
            info!(agent = %name, "Registered agent");
        }
    }

    /// Forget agent `name` and every subscription it holds.
    pub fn deregister(&self, name: &str) -> Removal {
        let removed = self
            .router
            .agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some();

        let mut table = self
            .router
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for ids in table.values_mut() {
            for subscribers in ids.values_mut() {
                subscribers.remove(name);
            }
            ids.retain(|_, subscribers| !subscribers.is_empty());
        }
        table.retain(|_, ids| !ids.is_empty());

        if removed { Removal::Removed } else { Removal::NotFound }
    }

    pub fn agent_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .router
            .agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Names of the subscribers `event` would be delivered to, sorted.
    pub fn subscriber_names(&self, event: &Event) -> Vec<String> {
        let names: BTreeSet<String> = self.router.matching(event).into_keys().collect();
        names.into_iter().collect()
    }

    /// Start `workers` worker threads (at least one).
    pub fn start(&self, workers: usize) -> std::io::Result<()> {
        let mut handles = lock(&self.workers);
        if !handles.is_empty() {
            warn!(running = handles.len(), "Dispatcher already started");
            return Ok(());
        }

        let count = workers.max(1);
        for index in 0..count {
            let receiver = Arc::clone(&self.receiver);
            let router = Arc::clone(&self.router);
            let pending = Arc::clone(&self.submitter.pending);
            let handle = std::thread::Builder::new()
                .name(format!("mc-worker-{index}"))
                .spawn(move || worker_loop(index, receiver, router, pending))?;
            handles.push(handle);
        }
        info!(workers = count, "Dispatcher started");
        Ok(())
    }

    /// Cancel all schedules, queue the shutdown event and wait for the queue
    /// to drain, then stop the workers.
    ///
    /// A handler that never returns blocks this call forever.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        let cancelled = self.scheduler.remove_all();
        info!(cancelled, "Shutting down dispatcher");
        self.submitter.submit(Event::shutdown());

        let workers = std::mem::take(&mut *lock(&self.workers));
        if workers.is_empty() {
            self.drain_inline();
        } else {
            self.submitter.pending.wait_drained();
        }
        self.submitter.closed.store(true, Ordering::Release);

        for _ in &workers {
            self.submitter.stop_worker();
        }
        for handle in workers {
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }
        info!("Dispatcher stopped");
    }

    /// Process everything queued on the calling thread; used when no
    /// workers were ever started.
    fn drain_inline(&self) {
        let mut receiver = lock(&self.receiver);
        while let Ok(job) = receiver.try_recv() {
            if let Job::Event(event) = job {
                self.router.route(event);
                self.submitter.pending.done();
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        // Without an explicit shutdown, just release the workers.
        self.submitter.closed.store(true, Ordering::Release);
        for _ in lock(&self.workers).iter() {
            self.submitter.stop_worker();
        }
    }
}

fn worker_loop(
    index: usize,
    receiver: Arc<Mutex<UnboundedReceiver<Job>>>,
    router: Arc<Router>,
    pending: Arc<Pending>,
) {
    debug!(worker = index, "Worker started");
    loop {
        let job = lock(&receiver).blocking_recv();
        match job {
            Some(Job::Event(event)) => {
                router.route(event);
                pending.done();
            }
            Some(Job::Stop) | None => break,
        }
    }
    debug!(worker = index, "Worker stopped");
}
