// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

//! A small scheduler running named tasks on one background thread.
//!
//! Tasks run one after another on the watcher's thread, so a slow task delays
//! the rest. A periodic task is rescheduled one period after it *finishes*,
//! which means slow bodies drift rather than pile up. This is meant for a
//! handful of polling tasks, not as a general executor.

use crate::Error;
use slog::debug;
use slog::error;
use slog::o;
use slog::Logger;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

type Body = Box<dyn FnMut() + Send>;

/// A named unit of work.
pub struct Task {
    name: String,
    delay: Duration,
    period: Option<Duration>,
    body: Body,
}

impl Task {
    /// A task first run after `delay`, then every `period` after it
    /// completes.
    pub fn periodic<F>(
        name: impl Into<String>,
        delay: Duration,
        period: Duration,
        body: F,
    ) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        Self {
            name: name.into(),
            delay,
            period: Some(period),
            body: Box::new(body),
        }
    }

    /// A task run once, after `delay`.
    pub fn once<F>(name: impl Into<String>, delay: Duration, body: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        Self {
            name: name.into(),
            delay,
            period: None,
            body: Box::new(body),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period(&self) -> Option<Duration> {
        self.period
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("delay", &self.delay)
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}

struct Scheduled {
    id: u64,
    name: String,
    period: Option<Duration>,
    next_run: Instant,
    // Taken while the body runs.
    body: Option<Body>,
}

#[derive(Default)]
struct State {
    running: bool,
    // Bumped on each start, so a thread outliving a stop cannot resume.
    generation: u64,
    tasks: Vec<Scheduled>,
    next_id: u64,
}

struct Shared {
    log: Logger,
    state: Mutex<State>,
    cvar: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runs [`Task`]s on a single background thread.
pub struct Watcher {
    name: String,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("name", &self.name)
            .field("tasks", &self.task_names())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Watcher {
    /// Create a watcher. Its thread is named `name`.
    pub fn new(log: &Logger, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            shared: Arc::new(Shared {
                log: log.new(o!("watcher" => name.clone())),
                state: Mutex::new(State::default()),
                cvar: Condvar::new(),
            }),
            name,
            thread: Mutex::new(None),
        }
    }

    /// Schedule a task, replacing any task with the same name.
    ///
    /// This may be called whether or not the watcher is running, including
    /// from inside a task.
    pub fn add_task(&self, task: Task) {
        let mut state = self.shared.lock();
        state.tasks.retain(|t| t.name != task.name);
        let id = state.next_id;
        state.next_id += 1;
        state.tasks.push(Scheduled {
            id,
            name: task.name,
            period: task.period,
            next_run: Instant::now() + task.delay,
            body: Some(task.body),
        });
        drop(state);
        self.shared.cvar.notify_all();
    }

    /// Remove the task named `name`, returning true if there was one.
    ///
    /// A task removed while it runs finishes its current run.
    pub fn remove_task(&self, name: &str) -> bool {
        let mut state = self.shared.lock();
        let before = state.tasks.len();
        state.tasks.retain(|t| t.name != name);
        before != state.tasks.len()
    }

    /// Remove all tasks.
    pub fn clear_tasks(&self) {
        self.shared.lock().tasks.clear();
    }

    /// The names of all scheduled tasks.
    pub fn task_names(&self) -> Vec<String> {
        self.shared
            .lock()
            .tasks
            .iter()
            .map(|t| t.name.clone())
            .collect()
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    /// Start the watcher thread. Starting a running watcher does nothing.
    pub fn start(&self) -> Result<(), Error> {
        let mut slot = self.thread.lock().unwrap_or_else(PoisonError::into_inner);
        let generation = {
            let mut state = self.shared.lock();
            if state.running {
                return Ok(());
            }
            state.running = true;
            state.generation += 1;
            state.generation
        };
        let shared = self.shared.clone();
        match thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || run(shared, generation))
        {
            Ok(handle) => {
                *slot = Some(handle);
                Ok(())
            }
            Err(source) => {
                self.shared.lock().running = false;
                Err(Error::Spawn {
                    name: self.name.clone(),
                    source,
                })
            }
        }
    }

    /// Stop the watcher thread, and remove all tasks.
    ///
    /// This waits for a running task to finish. Stopping a stopped watcher
    /// does nothing. When called from one of the watcher's own tasks, the
    /// thread exits once that task returns.
    pub fn stop(&self) {
        let handle = {
            let mut slot = self.thread.lock().unwrap_or_else(PoisonError::into_inner);
            let mut state = self.shared.lock();
            state.running = false;
            state.tasks.clear();
            drop(state);
            self.shared.cvar.notify_all();
            slot.take()
        };
        let Some(handle) = handle else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            debug!(self.shared.log, "watcher stopped from its own task");
            return;
        }
        if handle.join().is_err() {
            error!(self.shared.log, "watcher thread panicked");
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop();
    }
}

// The body of the watcher thread.
fn run(shared: Arc<Shared>, generation: u64) {
    debug!(shared.log, "watcher starting");
    let mut state = shared.lock();
    while state.running && state.generation == generation {
        let now = Instant::now();
        let mut due = Vec::new();
        for task in state.tasks.iter_mut() {
            if task.next_run <= now {
                if let Some(body) = task.body.take() {
                    due.push((task.id, task.name.clone(), body));
                }
            }
        }

        if due.is_empty() {
            let next = state
                .tasks
                .iter()
                .filter(|t| t.body.is_some())
                .map(|t| t.next_run)
                .min();
            state = match next {
                Some(deadline) => {
                    shared
                        .cvar
                        .wait_timeout(state, deadline.saturating_duration_since(now))
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => shared
                    .cvar
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
            continue;
        }

        drop(state);
        let mut finished = Vec::with_capacity(due.len());
        for (id, name, mut body) in due {
            if panic::catch_unwind(AssertUnwindSafe(&mut body)).is_err() {
                error!(shared.log, "task panicked"; "task" => &name);
            }
            finished.push((id, body, Instant::now()));
        }

        state = shared.lock();
        for (id, body, completed) in finished {
            let Some(pos) = state.tasks.iter().position(|t| t.id == id) else {
                // Removed or replaced while it ran.
                continue;
            };
            let period = state.tasks[pos].period;
            match period {
                Some(period) => {
                    let task = &mut state.tasks[pos];
                    task.next_run = completed + period;
                    task.body = Some(body);
                }
                None => {
                    state.tasks.remove(pos);
                }
            }
        }
    }
    debug!(shared.log, "watcher exiting");
}

#[cfg(test)]
mod tests {
    use super::Task;
    use super::Watcher;
    use crate::test_utils::test_logger;
    use crate::test_utils::wait_until;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;
    use std::time::Instant;

    const FAST: Duration = Duration::from_millis(5);
    const SLOW: Duration = Duration::from_secs(60);
    const TIMEOUT: Duration = Duration::from_secs(2);

    fn counter() -> (Arc<AtomicUsize>, impl FnMut() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_periodic_task_runs_on_schedule() {
        let watcher = Watcher::new(&test_logger(), "test-watcher");
        let (count, body) = counter();
        let period = Duration::from_millis(20);
        let delay = Duration::from_millis(10);
        watcher.add_task(Task::periodic("tick", delay, period, body));
        let start = Instant::now();
        watcher.start().unwrap();
        thread::sleep(Duration::from_millis(250));
        let n = count.load(Ordering::SeqCst);
        let elapsed = start.elapsed();
        watcher.stop();

        // Allow for scheduling jitter of one period.
        let expected = ((elapsed - delay).as_millis() / period.as_millis()) as usize;
        assert!(n + 1 >= expected, "ran {n} times, expected about {expected}");
    }

    #[test]
    fn test_add_task_before_and_after_start() {
        let watcher = Watcher::new(&test_logger(), "test-watcher");
        let (early, body) = counter();
        watcher.add_task(Task::periodic("early", Duration::ZERO, FAST, body));
        watcher.start().unwrap();
        let (late, body) = counter();
        watcher.add_task(Task::periodic("late", Duration::ZERO, FAST, body));
        assert!(wait_until(TIMEOUT, || {
            early.load(Ordering::SeqCst) > 0 && late.load(Ordering::SeqCst) > 0
        }));
        watcher.stop();
    }

    #[test]
    fn test_same_name_replaces_task() {
        let watcher = Watcher::new(&test_logger(), "test-watcher");
        let (first, body) = counter();
        watcher.add_task(Task::periodic("update", SLOW, SLOW, body));
        let (second, body) = counter();
        watcher.add_task(Task::periodic("update", Duration::ZERO, FAST, body));
        assert_eq!(watcher.task_names(), vec![String::from("update")]);

        watcher.start().unwrap();
        assert!(wait_until(TIMEOUT, || second.load(Ordering::SeqCst) >= 2));
        watcher.stop();
        assert_eq!(first.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_single_shot_task() {
        let watcher = Watcher::new(&test_logger(), "test-watcher");
        let (count, body) = counter();
        watcher.add_task(Task::once("once", Duration::ZERO, body));
        watcher.start().unwrap();
        assert!(wait_until(TIMEOUT, || watcher.task_names().is_empty()));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        watcher.stop();
    }

    #[test]
    fn test_remove_task() {
        let watcher = Watcher::new(&test_logger(), "test-watcher");
        let (count, body) = counter();
        watcher.add_task(Task::periodic("tick", SLOW, SLOW, body));
        assert!(watcher.remove_task("tick"));
        assert!(!watcher.remove_task("tick"));
        watcher.start().unwrap();
        thread::sleep(Duration::from_millis(20));
        watcher.stop();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_task_keeps_its_schedule() {
        let watcher = Watcher::new(&test_logger(), "test-watcher");
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let flaky = move || {
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first run fails");
            }
        };
        watcher.add_task(Task::periodic("flaky", Duration::ZERO, FAST, flaky));
        let (other, body) = counter();
        watcher.add_task(Task::periodic("other", Duration::ZERO, FAST, body));
        watcher.start().unwrap();
        assert!(wait_until(TIMEOUT, || {
            count.load(Ordering::SeqCst) >= 3 && other.load(Ordering::SeqCst) >= 3
        }));
        watcher.stop();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let watcher = Watcher::new(&test_logger(), "test-watcher");
        watcher.stop();
        watcher.start().unwrap();
        watcher.start().unwrap();
        assert!(watcher.is_running());
        watcher.stop();
        watcher.stop();
        assert!(!watcher.is_running());
        assert!(watcher.task_names().is_empty());
    }

    #[test]
    fn test_stop_from_inside_task() {
        let watcher = Arc::new(Watcher::new(&test_logger(), "test-watcher"));
        let slot = Arc::new(Mutex::new(Some(watcher.clone())));
        let s = slot.clone();
        watcher.add_task(Task::once("stop", Duration::ZERO, move || {
            if let Some(w) = s.lock().unwrap().take() {
                w.stop();
            }
        }));
        watcher.start().unwrap();
        assert!(wait_until(TIMEOUT, || !watcher.is_running()));
        watcher.stop();
    }

    #[test]
    fn test_restart_after_stop() {
        let watcher = Watcher::new(&test_logger(), "test-watcher");
        watcher.start().unwrap();
        watcher.stop();
        let (count, body) = counter();
        watcher.add_task(Task::periodic("tick", Duration::ZERO, FAST, body));
        watcher.start().unwrap();
        assert!(wait_until(TIMEOUT, || count.load(Ordering::SeqCst) > 0));
        watcher.stop();
    }
}
