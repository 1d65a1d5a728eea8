use chrono::{DateTime, Duration, FixedOffset};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::domain::{
    cmp_importance, AdapterError, Clock, PowerRecord, Priority, RecordScale, RegisterError, Task,
    TaskStatus,
};
use crate::pv::PvPredictor;
use crate::sensor::PowerMeter;
use crate::store::Store;
use crate::window::{PowerWindow, TaskProfile, Thresholds};

pub const LAST_PRIORITIES_KEY: &str = "last_priorities";

/// Scheduler knobs distilled from the application configuration
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick_interval: std::time::Duration,
    pub window_size: usize,
    pub max_record_gap: Duration,
    pub call_timeout: std::time::Duration,
    pub stale_limit: u32,
}

impl SchedulerSettings {
    pub fn from_config(cfg: &AppConfig) -> (Self, Thresholds) {
        (
            Self {
                tick_interval: std::time::Duration::from_secs(cfg.scheduler.tick_interval_secs),
                window_size: cfg.scheduler.window_size,
                max_record_gap: Duration::minutes(cfg.scheduler.max_record_gap_minutes),
                call_timeout: std::time::Duration::from_secs(cfg.adapter.timeout_secs),
                stale_limit: cfg.adapter.stale_limit,
            },
            Thresholds::new(
                cfg.scheduler.ignore_power_threshold.clone(),
                cfg.scheduler.default_ignore_power_threshold,
            ),
        )
    }
}

struct Registered {
    task: Arc<dyn Task>,
    stale: u32,
}

/// Everything the tick needs to know about one task, gathered once through
/// bounded adapter calls
struct TaskView {
    task: Arc<dyn Task>,
    priority: Priority,
    auto_adjust: bool,
    profile: TaskProfile,
    running: bool,
    runnable: bool,
}

impl TaskView {
    fn importance(&self) -> (Priority, bool, &str) {
        (self.priority, self.auto_adjust, &self.profile.id)
    }
}

/// Priority-based task scheduler.
///
/// Owns the sliding window and the task registry; borrows the tasks through
/// the uniform contract. Every adapter call is bounded by the per-call
/// timeout, and a task failing three consecutive ticks is dropped. A single
/// misbehaving task never aborts the tick.
pub struct Scheduler {
    clock: Arc<dyn Clock>,
    meter: Arc<dyn PowerMeter>,
    simulator: Arc<dyn PowerMeter>,
    predictor: Arc<PvPredictor>,
    store: Arc<Store>,
    settings: SchedulerSettings,
    tasks: Mutex<HashMap<String, Registered>>,
    window: Mutex<PowerWindow>,
    paused: AtomicBool,
    paused_locally: AtomicBool,
    last_record_at: Mutex<Option<DateTime<FixedOffset>>>,
    status_tx: watch::Sender<Vec<TaskStatus>>,
}

impl Scheduler {
    pub fn new(
        clock: Arc<dyn Clock>,
        meter: Arc<dyn PowerMeter>,
        simulator: Arc<dyn PowerMeter>,
        predictor: Arc<PvPredictor>,
        store: Arc<Store>,
        settings: SchedulerSettings,
        thresholds: Thresholds,
    ) -> Self {
        let (status_tx, _) = watch::channel(Vec::new());
        let window = PowerWindow::new(settings.window_size, thresholds);
        Self {
            clock,
            meter,
            simulator,
            predictor,
            store,
            settings,
            tasks: Mutex::new(HashMap::new()),
            window: Mutex::new(window),
            paused: AtomicBool::new(false),
            paused_locally: AtomicBool::new(false),
            last_record_at: Mutex::new(None),
            status_tx,
        }
    }

    /// Register a task under its stable identifier. Channel keys may not
    /// overlap another registered task's keys; a task whose consumption
    /// cannot be told apart from another's cannot be scheduled against it.
    pub fn register(&self, task: Arc<dyn Task>) -> Result<(), RegisterError> {
        let mut tasks = self.tasks.lock().unwrap();
        let id = task.id().to_string();
        if tasks.contains_key(&id) {
            return Err(RegisterError::Duplicate(id));
        }
        for (other_id, other) in tasks.iter() {
            for key in task.keys() {
                if other.task.keys().contains(key) {
                    return Err(RegisterError::KeyConflict {
                        task: id,
                        key: key.clone(),
                        owner: other_id.clone(),
                    });
                }
            }
        }
        info!(task = %id, "task registered");
        tasks.insert(id, Registered { task, stale: 0 });
        Ok(())
    }

    pub fn unregister(&self, id: &str) {
        if self.tasks.lock().unwrap().remove(id).is_some() {
            info!(task = %id, "task unregistered");
        }
    }

    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("scheduler paused");
        }
    }

    pub fn resume(&self) {
        self.paused_locally.store(false, Ordering::SeqCst);
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("scheduler resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn statuses(&self) -> watch::Receiver<Vec<TaskStatus>> {
        self.status_tx.subscribe()
    }

    pub fn window_snapshot(&self) -> Vec<PowerRecord> {
        self.window.lock().unwrap().snapshot()
    }

    fn snapshot_tasks(&self) -> Vec<Arc<dyn Task>> {
        self.tasks
            .lock()
            .unwrap()
            .values()
            .map(|r| r.task.clone())
            .collect()
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, AdapterError>>,
    ) -> Result<T, AdapterError> {
        match tokio::time::timeout(self.settings.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout),
        }
    }

    fn mark_stale(&self, id: &str, err: &AdapterError) {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(registered) = tasks.get_mut(id) {
            registered.stale += 1;
            warn!(task = %id, error = %err, stale = registered.stale, "adapter call failed");
        }
    }

    fn mark_fresh(&self, id: &str) {
        if let Some(registered) = self.tasks.lock().unwrap().get_mut(id) {
            registered.stale = 0;
        }
    }

    /// Drop tasks that failed every contact for `stale_limit` consecutive
    /// ticks
    fn sanitize(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        let limit = self.settings.stale_limit;
        tasks.retain(|id, registered| {
            if registered.stale >= limit {
                warn!(task = %id, "unreachable, removing");
                false
            } else {
                true
            }
        });
    }

    /// Pull the latest power record, falling back to the PV simulator when
    /// the meter goes stale. With neither source delivering, stop everything
    /// and pause until records return.
    async fn ingest(&self) -> Option<PowerRecord> {
        let now = self.clock.now();
        match self.bounded(self.meter.read(RecordScale::Minute)).await {
            Ok(record) => {
                *self.last_record_at.lock().unwrap() = Some(now);
                if self.paused_locally.load(Ordering::SeqCst) {
                    debug!("power records are back, resuming");
                    self.window.lock().unwrap().clear();
                    self.resume();
                }
                self.window.lock().unwrap().push(record.clone());
                return Some(record);
            }
            Err(err) => debug!(error = %err, "no new power record"),
        }

        let gap = {
            let mut last = self.last_record_at.lock().unwrap();
            now - *last.get_or_insert(now)
        };
        if gap <= self.settings.max_record_gap {
            return None;
        }

        match self.bounded(self.simulator.read(RecordScale::Minute)).await {
            Ok(record) => {
                debug!("using a record from the simulator");
                self.window.lock().unwrap().push(record.clone());
                Some(record)
            }
            Err(_) => {
                warn!(
                    gap_minutes = gap.num_minutes(),
                    "no power record from any source, stopping all tasks"
                );
                if !self.is_paused() {
                    self.stop_all().await;
                    self.pause();
                    self.paused_locally.store(true, Ordering::SeqCst);
                }
                None
            }
        }
    }

    /// Invite every task to refresh its priority, then read back its state.
    /// Tasks failing any call are skipped for this tick and move toward
    /// sanitisation.
    async fn collect_views(&self) -> Vec<TaskView> {
        let mut views = Vec::new();
        for task in self.snapshot_tasks() {
            let id = task.id().to_string();
            if let Err(err) = self.bounded(task.adjust_priority()).await {
                self.mark_stale(&id, &err);
                continue;
            }
            let running = match self.bounded(task.is_running()).await {
                Ok(running) => running,
                Err(err) => {
                    self.mark_stale(&id, &err);
                    continue;
                }
            };
            let runnable = match self.bounded(task.is_runnable()).await {
                Ok(runnable) => runnable,
                Err(err) => {
                    self.mark_stale(&id, &err);
                    continue;
                }
            };
            self.mark_fresh(&id);
            views.push(TaskView {
                priority: task.priority(),
                auto_adjust: task.auto_adjust(),
                profile: TaskProfile {
                    id,
                    keys: task.keys().to_vec(),
                    nominal_power: task.nominal_power(),
                },
                running,
                runnable,
                task,
            });
        }
        views
    }

    fn adjustable_profiles<'a>(views: &'a [TaskView]) -> Vec<&'a TaskProfile> {
        views
            .iter()
            .filter(|v| v.running && v.auto_adjust)
            .map(|v| &v.profile)
            .collect()
    }

    /// Steps 5-7 of the tick: stop, start, adjust
    async fn schedule(&self, views: &mut [TaskView]) {
        // Stop decisions, in ascending order of importance
        let mut order: Vec<usize> = (0..views.len()).collect();
        order.sort_by(|&a, &b| cmp_importance(views[a].importance(), views[b].importance()));

        for index in order.clone() {
            if !views[index].running {
                continue;
            }
            let stoppable = match self.bounded(views[index].task.is_stoppable()).await {
                Ok(stoppable) => stoppable,
                Err(err) => {
                    self.mark_stale(&views[index].profile.id, &err);
                    continue;
                }
            };
            if !stoppable {
                continue;
            }
            let (ratio, power) = {
                let window = self.window.lock().unwrap();
                let minimize = Self::adjustable_profiles(views);
                (
                    window.covered_by_production(&views[index].profile, &minimize, &[]),
                    window.power_used_by(&views[index].profile),
                )
            };
            let meets = match self
                .bounded(views[index].task.meet_running_criteria(ratio, power))
                .await
            {
                Ok(meets) => meets,
                Err(err) => {
                    self.mark_stale(&views[index].profile.id, &err);
                    continue;
                }
            };
            if !meets {
                debug!(
                    task = %views[index].profile.id,
                    ratio, power, "running criteria no longer met, stopping"
                );
                if let Err(err) = self.bounded(views[index].task.stop()).await {
                    self.mark_stale(&views[index].profile.id, &err);
                    continue;
                }
                views[index].running = false;
            }
        }

        // Start decisions, in descending order of importance
        for index in order.into_iter().rev() {
            if views[index].running || !views[index].runnable {
                continue;
            }
            let nominal = views[index].profile.nominal_power;

            let ratio = {
                let window = self.window.lock().unwrap();
                let minimum = Self::adjustable_profiles(views);
                window.available_for(&views[index].profile, &minimum, &[])
            };
            let meets = match self
                .bounded(views[index].task.meet_running_criteria(ratio, nominal))
                .await
            {
                Ok(meets) => meets,
                Err(err) => {
                    self.mark_stale(&views[index].profile.id, &err);
                    continue;
                }
            };
            if meets {
                self.start_task(&mut views[index]).await;
                continue;
            }

            // Preemption: strictly lower-priority running tasks may be
            // displaced if that frees enough power
            let mut challengers = Vec::new();
            for (i, other) in views.iter().enumerate() {
                if other.running && other.priority < views[index].priority {
                    if matches!(self.bounded(other.task.is_stoppable()).await, Ok(true)) {
                        challengers.push(i);
                    }
                }
            }
            if challengers.is_empty() {
                continue;
            }
            let ratio = {
                let window = self.window.lock().unwrap();
                let minimum: Vec<&TaskProfile> = views
                    .iter()
                    .enumerate()
                    .filter(|(i, v)| v.running && v.auto_adjust && !challengers.contains(i))
                    .map(|(_, v)| &v.profile)
                    .collect();
                let ignore: Vec<&TaskProfile> =
                    challengers.iter().map(|&i| &views[i].profile).collect();
                window.available_for(&views[index].profile, &minimum, &ignore)
            };
            let meets = self
                .bounded(views[index].task.meet_running_criteria(ratio, nominal))
                .await
                .unwrap_or(false);
            if !meets {
                continue;
            }
            for i in challengers {
                debug!(
                    stopping = %views[i].profile.id,
                    starting = %views[index].profile.id,
                    "preempting for a higher-priority task"
                );
                if self.bounded(views[i].task.stop()).await.is_ok() {
                    views[i].running = false;
                }
            }
            self.start_task(&mut views[index]).await;
        }

        // Adjust running auto-adjust tasks to the latest record
        let latest = self.window.lock().unwrap().latest().cloned();
        if let Some(record) = latest {
            for view in views.iter().filter(|v| v.running && v.auto_adjust) {
                if let Err(err) = self.bounded(view.task.adjust(&record)).await {
                    self.mark_stale(&view.profile.id, &err);
                }
            }
        }
    }

    async fn start_task(&self, view: &mut TaskView) {
        debug!(task = %view.profile.id, "starting");
        match self.bounded(view.task.start()).await {
            Ok(()) => view.running = true,
            Err(err) => self.mark_stale(&view.profile.id, &err),
        }
    }

    /// Publish per-task status to observers; lossy, observers read the
    /// latest snapshot
    async fn emit(&self, views: &[TaskView]) {
        let mut statuses = Vec::with_capacity(views.len());
        let mut priorities = HashMap::new();
        for view in views {
            let desc =
                match tokio::time::timeout(self.settings.call_timeout, view.task.desc()).await {
                    Ok(desc) => desc,
                    Err(_) => view.profile.id.clone(),
                };
            priorities.insert(view.profile.id.clone(), view.priority);
            statuses.push(TaskStatus {
                id: view.profile.id.clone(),
                priority: view.priority,
                nominal_power_kw: view.profile.nominal_power,
                auto_adjust: view.auto_adjust,
                running: view.running,
                runnable: view.runnable,
                desc,
            });
        }
        // Last-known priorities warm the next process start
        if let Err(err) = self.store.put(LAST_PRIORITIES_KEY, &priorities) {
            warn!(error = %err, "could not persist task priorities");
        }
        let _ = self.status_tx.send(statuses);
    }

    /// One scheduling cycle
    pub async fn tick(&self) {
        self.sanitize();
        self.predictor.refresh().await;

        if self.ingest().await.is_none() {
            return;
        }

        let mut views = self.collect_views().await;
        if self.is_paused() {
            debug!("scheduler is on pause, task scheduling skipped");
        } else {
            self.schedule(&mut views).await;
        }
        self.emit(&views).await;
    }

    /// Stop every task, minimum-run-time lockouts included. Shutdown
    /// overrides protection locks; devices must tolerate a hard stop.
    pub async fn stop_all(&self) {
        for task in self.snapshot_tasks() {
            if let Err(err) = self.bounded(task.stop()).await {
                warn!(task = %task.id(), error = %err, "stop failed during stop-all");
            }
        }
    }

    /// Periodic loop; runs until the process shuts down
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.settings.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            self.tick().await;
            debug!("tick complete");
        }
    }
}
