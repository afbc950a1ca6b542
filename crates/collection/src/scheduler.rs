//! Interval-bucketed scheduling. Every polling interval owns a bounded
//! pool of long-lived workers; hosts are round-robined across the pool and
//! each worker fans its assignments out to a bounded set of collector
//! slices per tick. Inventory refreshes reassign hosts between ticks, never
//! during one: the worker's own mutex is held across a full tick.

use crate::collector::{nomad_tags, Collect, CollectRequest};
use crate::MEASUREMENT_PREFIX;
use catalog::{HostManager, Inventory};
use points::{now_ns, Output, Point};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Interval of the liveness worker that runs when the inventory is empty.
const DEFAULT_INTERVAL_SECS: u64 = 120;

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Upper bound on workers per polling interval.
    pub max_worker_threads: usize,
    /// Fan collection out to collector threads within each tick.
    pub use_threads: bool,
    /// Upper bound on concurrent collector slices per tick.
    pub num_threads_per_worker: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        SchedulerOptions {
            max_worker_threads: 1,
            use_threads: true,
            num_threads_per_worker: 10,
        }
    }
}

/// One long-lived periodic worker, responsible for a single interval.
pub struct Worker {
    name: String,
    interval: Duration,
    host_cmds: Mutex<BTreeMap<String, Vec<String>>>,
    stop: AtomicBool,
    started: AtomicBool,
}

impl Worker {
    pub(crate) fn new(name: String, interval: Duration) -> Arc<Worker> {
        Arc::new(Worker {
            name,
            interval,
            host_cmds: Mutex::new(BTreeMap::new()),
            stop: AtomicBool::new(false),
            started: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_host(&self, host: &str, commands: &[String]) {
        let mut assignments = self.host_cmds.lock().unwrap();
        assignments
            .entry(host.to_string())
            .or_default()
            .extend(commands.iter().cloned());
    }

    /// Empties the assignment map. Waits for an in-flight tick, so a host
    /// is never collected under both the old and new assignment.
    pub fn clear(&self) {
        self.host_cmds.lock().unwrap().clear();
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn assigned_hosts(&self) -> Vec<String> {
        self.host_cmds.lock().unwrap().keys().cloned().collect()
    }

    /// The main loop: tick under the worker lock, release, sleep, repeat.
    /// The stop flag is observed at the top of each iteration.
    fn run(
        &self,
        collector: &Arc<dyn Collect>,
        output: &Output,
        use_threads: bool,
        num_collector_threads: usize,
    ) {
        loop {
            if self.stop.load(Ordering::Relaxed) {
                tracing::info!(worker = %self.name, "stopped");
                return;
            }
            let tick_started = Instant::now();
            {
                let assignments = self.host_cmds.lock().unwrap();
                tracing::info!(
                    worker = %self.name,
                    hosts = assignments.len(),
                    "starting collection"
                );

                if !assignments.is_empty() {
                    if use_threads {
                        self.collect_sliced(collector, &assignments, num_collector_threads);
                    } else {
                        collector.collect(
                            &self.name,
                            CollectRequest::HostCommands(assignments.clone()),
                        );
                    }
                }

                let elapsed = tick_started.elapsed().as_secs_f64();
                let mut stats = Point::new();
                stats.measurement = Some(format!("{}_worker_stats", MEASUREMENT_PREFIX));
                stats.insert_tag("worker_name", &self.name);
                for (key, value) in nomad_tags() {
                    stats.insert_tag(key, &value);
                }
                stats.insert_field("execution_time_sec", format!("{:.4}", elapsed));
                stats.insert_field("nbr_devices", assignments.len() as i64);
                stats.insert_field("nbr_threads", num_collector_threads as i64);
                stats.timestamp_ns = now_ns();
                if let Err(error) = output.emit(vec![stats]) {
                    tracing::warn!(worker = %self.name, %error, "failed to emit worker stats");
                }
                tracing::info!(worker = %self.name, seconds = elapsed, "tick finished");
            }
            // The lock is released before sleeping so refreshes can land.
            std::thread::sleep(self.interval);
        }
    }

    /// Splits the assignment into near-equal slices and collects them on
    /// transient threads, at most `num_collector_threads` of them.
    fn collect_sliced(
        &self,
        collector: &Arc<dyn Collect>,
        assignments: &BTreeMap<String, Vec<String>>,
        num_collector_threads: usize,
    ) {
        let hosts: Vec<&String> = assignments.keys().collect();
        let chunk_size = hosts.len() / num_collector_threads.max(1) + 1;

        std::thread::scope(|scope| {
            for (index, slice) in hosts.chunks(chunk_size).enumerate() {
                let mut slice_map = BTreeMap::new();
                for host in slice {
                    slice_map.insert((*host).clone(), assignments[*host].clone());
                }
                tracing::info!(
                    worker = %self.name,
                    slice = index + 1,
                    hosts = slice_map.len(),
                    "collector slice scheduled"
                );
                let collector = Arc::clone(collector);
                let worker_name = &self.name;
                scope.spawn(move || {
                    collector.collect(worker_name, CollectRequest::HostCommands(slice_map));
                });
            }
        });
    }
}

struct Pool {
    workers: Vec<Arc<Worker>>,
    cursor: usize,
}

pub struct Scheduler {
    hosts: Arc<HostManager>,
    collector: Arc<dyn Collect>,
    output: Arc<Output>,
    options: SchedulerOptions,
    pools: Mutex<BTreeMap<u64, Pool>>,
    working: Mutex<Vec<Arc<Worker>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    default_worker: Arc<Worker>,
}

impl Scheduler {
    pub fn new(
        hosts: Arc<HostManager>,
        collector: Arc<dyn Collect>,
        output: Arc<Output>,
        options: SchedulerOptions,
    ) -> Scheduler {
        let default_worker = Worker::new(
            format!("Default-{}sec", DEFAULT_INTERVAL_SECS),
            Duration::from_secs(DEFAULT_INTERVAL_SECS),
        );
        Scheduler {
            hosts,
            collector,
            output,
            options,
            pools: Mutex::new(BTreeMap::new()),
            working: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
            default_worker,
        }
    }

    /// The worker for an interval: new ones until the pool is full, then a
    /// round-robin over the existing pool.
    fn worker_for(&self, interval_secs: u64) -> Arc<Worker> {
        let mut pools = self.pools.lock().unwrap();
        let pool = pools.entry(interval_secs).or_insert_with(|| Pool {
            workers: Vec::new(),
            cursor: 0,
        });
        if pool.workers.len() < self.options.max_worker_threads {
            let worker = Worker::new(
                format!("Worker-{}sec-{}", interval_secs, pool.workers.len() + 1),
                Duration::from_secs(interval_secs),
            );
            pool.workers.push(Arc::clone(&worker));
            return worker;
        }
        let worker = Arc::clone(&pool.workers[pool.cursor % pool.workers.len()]);
        pool.cursor = (pool.cursor + 1) % pool.workers.len();
        worker
    }

    /// Clears every working worker's assignments; each clear serializes
    /// with that worker's tick, so no reassignment lands mid-collection.
    pub fn init_workers(&self) {
        for worker in self.working.lock().unwrap().iter() {
            worker.clear();
        }
    }

    /// Replaces the host set and rebuilds worker assignments. With
    /// `refresh` set, workers created for newly seen intervals are started
    /// immediately.
    pub fn add_hosts(
        &self,
        inventory: Inventory,
        host_tags: &[String],
        cmd_tags: &[String],
        refresh: bool,
    ) {
        if inventory.is_empty() {
            tracing::error!("no hosts to schedule");
            return;
        }
        self.init_workers();
        self.hosts.update_hosts(inventory);

        let all = vec![".*".to_string()];
        let host_tags = if host_tags.is_empty() { &all[..] } else { host_tags };
        let cmd_tags = if cmd_tags.is_empty() { &all[..] } else { cmd_tags };

        let targets = self.hosts.get_target_hosts(host_tags);
        tracing::debug!(hosts = ?targets, "selected hosts");

        let mut assigned_any = false;
        for host in &targets {
            // All command groups a host matches, bucketed by interval.
            let mut per_interval: BTreeMap<u64, Vec<String>> = BTreeMap::new();
            for group in self.hosts.get_target_commands(host, cmd_tags) {
                per_interval
                    .entry(group.interval_secs)
                    .or_default()
                    .extend(group.commands);
            }
            for (interval_secs, commands) in per_interval {
                let worker = self.worker_for(interval_secs);
                worker.add_host(host, &commands);
                self.note_working(&worker);
                assigned_any = true;
            }
        }
        if !assigned_any {
            tracing::error!("no commands found to collect");
            return;
        }
        if refresh {
            self.spawn_unstarted();
        }
    }

    fn note_working(&self, worker: &Arc<Worker>) {
        let mut working = self.working.lock().unwrap();
        if !working.iter().any(|w| Arc::ptr_eq(w, worker)) {
            working.push(Arc::clone(worker));
        }
    }

    /// Starts every worker and blocks until they finish, which in normal
    /// operation is never. An empty schedule still runs the default worker
    /// so the agent keeps emitting its own liveness statistics.
    pub fn start(&self) {
        {
            let mut working = self.working.lock().unwrap();
            if working.is_empty() {
                working.push(Arc::clone(&self.default_worker));
            }
        }
        self.spawn_unstarted();
        loop {
            let handle = self.handles.lock().unwrap().pop();
            match handle {
                Some(handle) => {
                    let _ = handle.join();
                }
                None => break,
            }
        }
    }

    fn spawn_unstarted(&self) {
        let working: Vec<Arc<Worker>> = self.working.lock().unwrap().clone();
        for worker in working {
            if worker.started.swap(true, Ordering::SeqCst) {
                continue;
            }
            let collector = Arc::clone(&self.collector);
            let output = Arc::clone(&self.output);
            let use_threads = self.options.use_threads;
            let num_collector_threads = self.options.num_threads_per_worker;
            let runner = Arc::clone(&worker);
            let spawned = std::thread::Builder::new()
                .name(worker.name().to_string())
                .spawn(move || {
                    runner.run(&collector, &output, use_threads, num_collector_threads);
                });
            match spawned {
                Ok(handle) => self.handles.lock().unwrap().push(handle),
                Err(error) => {
                    tracing::error!(worker = %worker.name(), %error, "failed to spawn worker")
                }
            }
        }
    }

    /// Flags every worker to stop at its next iteration and forgets the
    /// pools. In-flight collections are not pre-empted.
    pub fn stop(&self) {
        tracing::info!("stopping all running workers");
        for worker in self.working.lock().unwrap().iter() {
            worker.stop();
        }
        self.pools.lock().unwrap().clear();
        self.working.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use catalog::{RawCommandGroup, RawCredential};
    use points::OutputKind;

    struct RecordingCollector {
        calls: Mutex<Vec<(String, BTreeMap<String, Vec<String>>)>>,
    }

    impl RecordingCollector {
        fn new() -> Arc<RecordingCollector> {
            Arc::new(RecordingCollector {
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    impl Collect for RecordingCollector {
        fn collect(&self, worker_name: &str, request: CollectRequest) {
            if let CollectRequest::HostCommands(map) = request {
                self.calls
                    .lock()
                    .unwrap()
                    .push((worker_name.to_string(), map));
            }
        }
    }

    fn manager() -> Arc<HostManager> {
        let credentials: BTreeMap<String, RawCredential> = serde_yaml::from_str(
            r#"
lab:
    username: u
    password: p
    method: password
    tags: site1
"#,
        )
        .unwrap();
        let commands: BTreeMap<String, RawCommandGroup> = serde_yaml::from_str(
            r#"
a:
    netconf: [show version]
    tags: [router]
b:
    netconf: [show env]
    tags: [site1]
    interval: 60
c:
    netconf: [show chassis]
    tags: [switch]
    interval: 30
"#,
        )
        .unwrap();
        Arc::new(HostManager::new(credentials, commands))
    }

    fn inventory() -> Inventory {
        serde_yaml::from_str(
            r#"
r1:
    tags: [router, site1, lab]
    address: 1.1.1.1
s1:
    tags: [switch, site1, lab]
    address: 2.2.2.2
"#,
        )
        .unwrap()
    }

    fn scheduler(options: SchedulerOptions) -> (Scheduler, Arc<RecordingCollector>) {
        let recorder = RecordingCollector::new();
        let collector: Arc<dyn Collect> = recorder.clone();
        let scheduler = Scheduler::new(
            manager(),
            collector,
            Arc::new(Output::new(OutputKind::Stdout, "").unwrap()),
            options,
        );
        (scheduler, recorder)
    }

    fn hosts_per_interval(scheduler: &Scheduler) -> BTreeMap<u64, Vec<String>> {
        let pools = scheduler.pools.lock().unwrap();
        pools
            .iter()
            .map(|(interval, pool)| {
                let mut hosts: Vec<String> = pool
                    .workers
                    .iter()
                    .flat_map(|w| w.assigned_hosts())
                    .collect();
                hosts.sort();
                (*interval, hosts)
            })
            .collect()
    }

    #[test]
    fn hosts_bucket_by_command_group_interval() {
        let (scheduler, _) = scheduler(SchedulerOptions::default());
        scheduler.add_hosts(inventory(), &[], &[], false);

        let buckets = hosts_per_interval(&scheduler);
        assert_eq!(
            buckets.keys().cloned().collect::<Vec<_>>(),
            vec![30, 60, 120]
        );
        assert_eq!(buckets[&120], vec!["r1"]);
        assert_eq!(buckets[&60], vec!["r1", "s1"]);
        assert_eq!(buckets[&30], vec!["s1"]);
    }

    #[test]
    fn interval_pool_respects_max_worker_threads() {
        let (scheduler, _) = scheduler(SchedulerOptions {
            max_worker_threads: 2,
            ..SchedulerOptions::default()
        });
        // Six distinct workers requested, pool capped at two.
        let w1 = scheduler.worker_for(60);
        let w2 = scheduler.worker_for(60);
        let w3 = scheduler.worker_for(60);
        let w4 = scheduler.worker_for(60);
        assert!(!Arc::ptr_eq(&w1, &w2));
        assert!(Arc::ptr_eq(&w3, &w1));
        assert!(Arc::ptr_eq(&w4, &w2));
        assert_eq!(scheduler.pools.lock().unwrap()[&60].workers.len(), 2);
    }

    #[test]
    fn refresh_reassigns_without_duplicating_hosts() {
        let (scheduler, _) = scheduler(SchedulerOptions {
            max_worker_threads: 2,
            ..SchedulerOptions::default()
        });
        scheduler.add_hosts(inventory(), &[], &[], false);
        // A second pass over the same inventory must not double-assign.
        scheduler.init_workers();
        scheduler.add_hosts(inventory(), &[], &[], false);

        let pools = scheduler.pools.lock().unwrap();
        for (interval, pool) in pools.iter() {
            let mut seen = Vec::new();
            for worker in &pool.workers {
                for host in worker.assigned_hosts() {
                    assert!(
                        !seen.contains(&host),
                        "host {} scheduled twice for interval {}",
                        host,
                        interval
                    );
                    seen.push(host);
                }
            }
        }
    }

    #[test]
    fn removed_host_disappears_after_refresh() {
        let (scheduler, _) = scheduler(SchedulerOptions::default());
        scheduler.add_hosts(inventory(), &[], &[], false);
        assert_eq!(hosts_per_interval(&scheduler)[&60], vec!["r1", "s1"]);

        let smaller: Inventory = serde_yaml::from_str(
            r#"
r1:
    tags: [router, site1, lab]
    address: 1.1.1.1
"#,
        )
        .unwrap();
        scheduler.add_hosts(smaller, &[], &[], false);
        assert_eq!(hosts_per_interval(&scheduler)[&60], vec!["r1"]);
        assert!(hosts_per_interval(&scheduler)[&30].is_empty());
    }

    #[test]
    fn empty_inventory_is_refused() {
        let (scheduler, _) = scheduler(SchedulerOptions::default());
        scheduler.add_hosts(Inventory::new(), &[], &[], false);
        assert!(scheduler.pools.lock().unwrap().is_empty());
    }

    #[test]
    fn worker_tick_drives_the_collector_and_stops_on_flag() {
        let recorder = RecordingCollector::new();
        let output = Output::new(OutputKind::Stdout, "").unwrap();
        let worker = Worker::new("Worker-test".to_string(), Duration::from_millis(20));
        worker.add_host("r1", &["show version".to_string()]);

        let runner = Arc::clone(&worker);
        let collector: Arc<dyn Collect> = recorder.clone();
        let handle = std::thread::spawn(move || {
            runner.run(&collector, &output, false, 10);
        });
        std::thread::sleep(Duration::from_millis(80));
        worker.stop();
        handle.join().unwrap();

        let calls = recorder.calls.lock().unwrap();
        assert!(!calls.is_empty());
        let (worker_name, map) = &calls[0];
        assert_eq!(worker_name, "Worker-test");
        assert_eq!(map.get("r1").unwrap(), &vec!["show version".to_string()]);
    }

    #[test]
    fn sliced_fanout_covers_every_host_exactly_once() {
        let recorder = RecordingCollector::new();
        let output = Output::new(OutputKind::Stdout, "").unwrap();
        let worker = Worker::new("Worker-fan".to_string(), Duration::from_millis(20));
        for i in 0..7 {
            worker.add_host(&format!("h{}", i), &["show version".to_string()]);
        }

        let runner = Arc::clone(&worker);
        let collector: Arc<dyn Collect> = recorder.clone();
        let handle = std::thread::spawn(move || {
            runner.run(&collector, &output, true, 3);
        });
        std::thread::sleep(Duration::from_millis(50));
        worker.stop();
        handle.join().unwrap();

        let calls = recorder.calls.lock().unwrap();
        let mut seen: Vec<String> = calls
            .iter()
            .flat_map(|(_, map)| map.keys().cloned())
            .collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 7);
    }

    #[test]
    fn default_worker_fills_an_empty_schedule() {
        let (scheduler, _) = scheduler(SchedulerOptions::default());
        {
            let mut working = scheduler.working.lock().unwrap();
            assert!(working.is_empty());
            working.push(Arc::clone(&scheduler.default_worker));
        }
        let working = scheduler.working.lock().unwrap();
        assert_eq!(working[0].name(), "Default-120sec");
    }
}
