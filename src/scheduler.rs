//! Timed and recurring event emission.
//!
//! Each entry is a tokio task on the scheduler's own timer runtime that
//! sleeps until its target and then submits the entry's event. Recurring
//! entries re-resolve their pattern after firing, so one pattern yields an
//! unbounded series of firings.

use crate::dispatcher::{Submitter, lock};
use crate::error::{Removal, ScheduleError};
use crate::event::Event;
use crate::timing::{self, TimeFormats, TimePattern};
use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Entry {
    pattern: TimePattern,
    event: Event,
    target: NaiveDateTime,
    generation: u64,
    task: JoinHandle<()>,
}

/// A scheduled entry as reported by [`Scheduler::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSummary {
    pub id: String,
    pub target: NaiveDateTime,
    pub recurring: bool,
    pub event_id: String,
}

struct Inner {
    entries: Mutex<HashMap<String, Entry>>,
    submitter: Submitter,
    handle: Handle,
    formats: TimeFormats,
    generation: AtomicU64,
}

pub struct Scheduler {
    inner: Arc<Inner>,
    runtime: Option<Runtime>,
}

impl Scheduler {
    pub fn new(submitter: Submitter) -> Result<Self, ScheduleError> {
        Self::with_formats(submitter, TimeFormats::default())
    }

    pub fn with_formats(submitter: Submitter, formats: TimeFormats) -> Result<Self, ScheduleError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("mc-timer")
            .enable_time()
            .build()?;

        let inner = Inner {
            entries: Mutex::new(HashMap::new()),
            submitter,
            handle: runtime.handle().clone(),
            formats,
            generation: AtomicU64::new(0),
        };

        Ok(Self {
            inner: Arc::new(inner),
            runtime: Some(runtime),
        })
    }

    /// Schedule `event` for the next time `pattern` resolves to.
    ///
    /// An existing entry with the same id is replaced. Returns the target
    /// time, or [`ScheduleError::Unresolvable`] if the pattern never occurs.
    pub fn add(
        &self,
        id: impl Into<String>,
        pattern: TimePattern,
        event: Event,
    ) -> Result<NaiveDateTime, ScheduleError> {
        self.add_at(id, pattern, event, timing::local_now())
    }

    /// [`Scheduler::add`] resolving the pattern against an explicit `now`.
    pub fn add_at(
        &self,
        id: impl Into<String>,
        pattern: TimePattern,
        event: Event,
        now: NaiveDateTime,
    ) -> Result<NaiveDateTime, ScheduleError> {
        let id = id.into();
        let mut entries = lock(&self.inner.entries);
        self.inner.arm(&mut entries, id, pattern, event, now)
    }

    /// Cancel and forget entry `id`.
    pub fn remove(&self, id: &str) -> Removal {
        match lock(&self.inner.entries).remove(id) {
            Some(entry) => {
                entry.task.abort();
                info!(id, "Removed schedule");
                Removal::Removed
            }
            None => {
                info!(id, "No such schedule");
                Removal::NotFound
            }
        }
    }

    /// Cancel every entry, returning how many there were.
    pub fn remove_all(&self) -> usize {
        let drained: Vec<(String, Entry)> = lock(&self.inner.entries).drain().collect();
        for (id, entry) in &drained {
            entry.task.abort();
            debug!(id = %id, "Cancelled schedule");
        }
        drained.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        lock(&self.inner.entries).contains_key(id)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current entries, sorted by id.
    pub fn list(&self) -> Vec<ScheduleSummary> {
        let mut summaries: Vec<ScheduleSummary> = lock(&self.inner.entries)
            .iter()
            .map(|(id, entry)| ScheduleSummary {
                id: id.clone(),
                target: entry.target,
                recurring: entry.pattern.recurring,
                event_id: entry.event.id().to_string(),
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }
}

impl Inner {
    fn arm(
        self: &Arc<Self>,
        entries: &mut HashMap<String, Entry>,
        id: String,
        pattern: TimePattern,
        event: Event,
        now: NaiveDateTime,
    ) -> Result<NaiveDateTime, ScheduleError> {
        if let Some(previous) = entries.remove(&id) {
            previous.task.abort();
            debug!(id = %id, "Replacing schedule");
        }

        let Some(offset) = timing::resolve_offset_with(&pattern, now, &self.formats) else {
            warn!(id = %id, "Schedule can never occur");
            return Err(ScheduleError::Unresolvable(id));
        };

        // Targets already in the past fire immediately.
        let offset = offset.max(0);
        let Some(target) = timing::target_after(now, offset) else {
            warn!(id = %id, in_seconds = offset, "Schedule is beyond the calendar range");
            return Err(ScheduleError::Unresolvable(id));
        };
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        let inner = Arc::clone(self);
        let task_id = id.clone();
        let task = self.handle.spawn(async move {
            tokio::time::sleep(Duration::from_secs(offset.unsigned_abs())).await;
            inner.fire(&task_id, generation);
        });

        info!(id = %id, %target, in_seconds = offset, "Scheduled event");
        entries.insert(
            id,
            Entry {
                pattern,
                event,
                target,
                generation,
                task,
            },
        );
        Ok(target)
    }

    fn fire(self: &Arc<Self>, id: &str, generation: u64) {
        let mut entries = lock(&self.entries);

        // Replaced or removed while this timer was in flight.
        if entries.get(id).is_none_or(|entry| entry.generation != generation) {
            debug!(id, "Ignoring stale timer");
            return;
        }
        let Some(entry) = entries.remove(id) else {
            return;
        };

        info!(id, event = entry.event.id(), "Schedule fired");
        self.submitter.submit(entry.event.clone());

        if entry.pattern.recurring {
            let now = timing::local_now().max(entry.target);
            if let Err(e) = self.arm(&mut entries, id.to_string(), entry.pattern, entry.event, now) {
                warn!(id, error = %e, "Recurring schedule ended");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl fmt::Display for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for summary in self.list() {
            writeln!(
                f,
                "{:20} {} {}{}",
                summary.id,
                summary.target.format("%Y-%m-%d %H:%M:%S"),
                summary.event_id,
                if summary.recurring { " (recurring)" } else { "" }
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{Job, queue};
    use chrono::NaiveDate;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    fn event(id: &str) -> Event {
        Event::message(id, "", "timer-test").unwrap()
    }

    fn wait_for_event(rx: &mut UnboundedReceiver<Job>, timeout: Duration) -> Option<Event> {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if let Ok(Job::Event(ev)) = rx.try_recv() {
                return Some(ev);
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        None
    }

    #[test]
    fn test_add_reports_target() {
        let (submitter, _rx) = queue();
        let scheduler = Scheduler::new(submitter).unwrap();
        let now = at(2024, 3, 15, 10, 0, 0);

        let target = scheduler
            .add_at("evening", TimePattern::new().with_hours(vec![20]).recurring(), event("lights"), now)
            .unwrap();
        assert_eq!(target, at(2024, 3, 15, 20, 0, 0));
        assert!(scheduler.contains("evening"));

        let listed = scheduler.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].event_id, "lights");
        assert!(listed[0].recurring);
        assert!(scheduler.to_string().contains("evening"));
    }

    #[test]
    fn test_unresolvable_pattern_is_rejected() {
        let (submitter, _rx) = queue();
        let scheduler = Scheduler::new(submitter).unwrap();

        let err = scheduler
            .add("never", TimePattern::new(), event("x"))
            .unwrap_err();
        assert!(matches!(err, ScheduleError::Unresolvable(id) if id == "never"));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_out_of_range_offset_is_rejected() {
        let (submitter, _rx) = queue();
        let scheduler = Scheduler::new(submitter).unwrap();
        let far = TimePattern {
            years: Some(100_000_000_000),
            ..TimePattern::default()
        };

        let err = scheduler.add("far", far, event("x")).unwrap_err();
        assert!(matches!(err, ScheduleError::Unresolvable(id) if id == "far"));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_add_is_idempotent() {
        let (submitter, _rx) = queue();
        let scheduler = Scheduler::new(submitter).unwrap();
        let now = at(2024, 3, 15, 10, 0, 0);

        scheduler
            .add_at("job", TimePattern::new().in_minutes(5), event("a"), now)
            .unwrap();
        let target = scheduler
            .add_at("job", TimePattern::new().in_minutes(10), event("b"), now)
            .unwrap();

        assert_eq!(scheduler.len(), 1);
        assert_eq!(target, at(2024, 3, 15, 10, 10, 0));
        assert_eq!(scheduler.list()[0].event_id, "b");
    }

    #[test]
    fn test_remove() {
        let (submitter, _rx) = queue();
        let scheduler = Scheduler::new(submitter).unwrap();
        scheduler
            .add("a", TimePattern::new().in_minutes(5), event("a"))
            .unwrap();
        scheduler
            .add("b", TimePattern::new().in_minutes(5), event("b"))
            .unwrap();

        assert_eq!(scheduler.remove("missing"), Removal::NotFound);
        assert_eq!(scheduler.len(), 2);
        assert_eq!(scheduler.remove("a"), Removal::Removed);
        assert_eq!(scheduler.remove("a"), Removal::NotFound);
        assert_eq!(scheduler.remove_all(), 1);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_one_shot_fires_once() {
        let (submitter, mut rx) = queue();
        let scheduler = Scheduler::new(submitter).unwrap();
        scheduler
            .add("soon", TimePattern::new().in_seconds(1), event("ding"))
            .unwrap();

        let fired = wait_for_event(&mut rx, Duration::from_secs(5)).expect("timer did not fire");
        assert_eq!(fired.id(), "ding");
        assert!(!scheduler.contains("soon"));
    }

    #[test]
    fn test_removed_entry_never_fires() {
        let (submitter, mut rx) = queue();
        let scheduler = Scheduler::new(submitter).unwrap();
        scheduler
            .add("soon", TimePattern::new().in_seconds(1), event("ding"))
            .unwrap();
        scheduler.remove("soon");

        assert!(wait_for_event(&mut rx, Duration::from_millis(1500)).is_none());
    }

    #[test]
    fn test_recurring_rearms() {
        let (submitter, mut rx) = queue();
        let scheduler = Scheduler::new(submitter).unwrap();
        // Re-armed one second after each firing.
        let pattern = TimePattern {
            seconds: Some(1),
            recurring: true,
            ..TimePattern::default()
        };
        scheduler.add("tick", pattern, event("tick")).unwrap();

        assert!(wait_for_event(&mut rx, Duration::from_secs(5)).is_some());
        assert!(wait_for_event(&mut rx, Duration::from_secs(5)).is_some());
        assert!(scheduler.contains("tick"));
        scheduler.remove_all();
    }

    fn generation_of(scheduler: &Scheduler, id: &str) -> u64 {
        lock(&scheduler.inner.entries)[id].generation
    }

    #[test]
    fn test_recurring_wildcard_rearms_past_its_own_target() {
        let (submitter, mut rx) = queue();
        let scheduler = Scheduler::new(submitter).unwrap();
        // Far enough ahead that the wall clock is still before every target.
        let now = at(2099, 3, 15, 10, 0, 0);

        let evening = TimePattern::new().with_hours(vec![20]).recurring();
        let target = scheduler.add_at("evening", evening, event("lights"), now).unwrap();
        assert_eq!(target, at(2099, 3, 15, 20, 0, 0));

        // 2099-03-17 is a Tuesday.
        let tuesday = TimePattern::new().with_day_names(["tuesday"]).recurring();
        let target = scheduler.add_at("tuesday", tuesday, event("bins"), now).unwrap();
        assert_eq!(target, at(2099, 3, 17, 0, 0, 0));

        // Fire both timers as if woken early, before their targets.
        for id in ["evening", "tuesday"] {
            let generation = generation_of(&scheduler, id);
            scheduler.inner.fire(id, generation);
            assert_ne!(generation_of(&scheduler, id), generation);
        }

        let targets: Vec<(String, NaiveDateTime)> =
            scheduler.list().into_iter().map(|s| (s.id, s.target)).collect();
        assert_eq!(
            targets,
            [
                ("evening".to_string(), at(2099, 3, 16, 20, 0, 0)),
                ("tuesday".to_string(), at(2099, 3, 24, 0, 0, 0)),
            ]
        );
        assert_eq!(wait_for_event(&mut rx, Duration::from_secs(1)).unwrap().id(), "lights");
        assert_eq!(wait_for_event(&mut rx, Duration::from_secs(1)).unwrap().id(), "bins");

        // A stale generation is ignored.
        scheduler.inner.fire("evening", 0);
        assert_eq!(scheduler.list()[0].target, at(2099, 3, 16, 20, 0, 0));
        scheduler.remove_all();
    }
}
