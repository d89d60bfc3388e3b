//! Module lifecycle and the periodic acquisition loop.

use std::{fmt, time::Duration};

use log::{debug, error, info, warn};
use tokio::sync::watch;

use crate::{
    cancellation::{CancellationFlag, Wait},
    module::{CollectionProvider, PostCollection, PostCollectionProvider},
    outcome::Outcome,
    store::ReadingStore,
    task_manager::TaskManager,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Starting,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    /// Cancelled by a signal or by [`CancellationFlag::raise`].
    Clean,
    /// A module reported an unrecoverable fault.
    Fatal(String),
    /// The acquisition module could not be initialized.
    StartupFailed(String),
}

impl ExitStatus {
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Clean)
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clean => f.write_str("clean shutdown"),
            Self::Fatal(reason) => write!(f, "fatal error: {reason}"),
            Self::StartupFailed(reason) => write!(f, "startup failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopReport {
    pub status: ExitStatus,
    /// Acquisition attempts made while running.
    pub cycles: u64,
}

/// Owns one acquisition module and any number of output sinks.
///
/// Sinks without a cadence run inline after every successful acquisition.
/// Sinks with a cadence run as detached tasks that read the store on their own
/// schedule, independent of whether acquisition succeeds.
pub struct EventLoop {
    collection: CollectionProvider,
    post_collection: Vec<PostCollectionProvider>,
    interval: Duration,
    flag: CancellationFlag,
    store: ReadingStore,
    state: watch::Sender<LoopState>,
}

impl EventLoop {
    pub fn new(collection: CollectionProvider, interval: Duration, flag: CancellationFlag) -> Self {
        let (state, _) = watch::channel(LoopState::Starting);
        Self {
            collection,
            post_collection: Vec::new(),
            interval,
            flag,
            store: ReadingStore::new(),
            state,
        }
    }

    pub fn with_post_collection(mut self, provider: PostCollectionProvider) -> Self {
        self.post_collection.push(provider);
        self
    }

    pub fn store(&self) -> ReadingStore {
        self.store.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    fn enter(&self, state: LoopState) {
        debug!("Event loop state: {state:?}");
        self.state.send_replace(state);
    }

    /// Runs until cancelled or until a module fails fatally.
    ///
    /// Every module that was initialized is destroyed exactly once before
    /// this returns.
    pub async fn run(mut self) -> LoopReport {
        self.enter(LoopState::Starting);
        info!(
            "Starting event loop: collection '{}', {} post-collection module(s), interval {:?}",
            self.collection.name(),
            self.post_collection.len(),
            self.interval
        );

        let mut collection = match self.collection.init(&self.store).await {
            Ok(module) => module,
            Err(e) => {
                error!("Collection module '{}' failed to start: {e}", self.collection.name());
                self.enter(LoopState::Stopped);
                return LoopReport {
                    status: ExitStatus::StartupFailed(e.to_string()),
                    cycles: 0,
                };
            }
        };

        let mut tasks = TaskManager::new(&self.flag);
        let mut inline: Vec<Box<dyn PostCollection>> = Vec::new();
        for provider in std::mem::take(&mut self.post_collection) {
            let module = match provider.init(&self.store).await {
                Ok(module) => module,
                Err(e) => {
                    warn!(
                        "Post-collection module '{}' failed to start, continuing without it: {e}",
                        provider.name()
                    );
                    continue;
                }
            };
            match provider.cadence() {
                Some(cadence) => {
                    let store = self.store.clone();
                    tasks.spawn_task(format!("{}-consumer", provider.name()), move |flag| {
                        consume(module, store, cadence, flag)
                    });
                }
                None => inline.push(module),
            }
        }

        self.enter(LoopState::Running);
        let mut cycles = 0u64;
        let status = loop {
            if self.flag.wait(self.interval).await == Wait::Cancelled {
                if self.flag.by_signal() {
                    info!("Termination signal received");
                }
                break ExitStatus::Clean;
            }
            cycles += 1;

            match collection.step().await {
                Outcome::Success => {}
                Outcome::Recoverable(e) => {
                    warn!("Cycle {cycles}: {} skipped: {e}", collection.name());
                    continue;
                }
                Outcome::Fatal(e) => {
                    error!("Cycle {cycles}: {} failed fatally: {e}", collection.name());
                    self.flag.raise();
                    break ExitStatus::Fatal(e.to_string());
                }
            }

            let reading = match self.store.snapshot() {
                Ok(reading) => reading,
                Err(e) => {
                    error!("Cycle {cycles}: {e}");
                    self.flag.raise();
                    break ExitStatus::Fatal(e.to_string());
                }
            };
            for sink in inline.iter_mut() {
                match sink.step(&reading).await {
                    Outcome::Success => {}
                    Outcome::Recoverable(e) => warn!("{}: {e}", sink.name()),
                    Outcome::Fatal(e) => error!("{}: {e}, keeping the loop alive", sink.name()),
                }
            }
        };

        self.enter(LoopState::Draining);
        if let Err(e) = tasks.shutdown_all().await {
            error!("Error while stopping consumers: {e:#}");
        }
        for sink in inline.iter_mut().rev() {
            sink.destroy().await;
        }
        collection.destroy().await;
        self.enter(LoopState::Stopped);

        info!("Event loop stopped after {cycles} cycle(s): {status}");
        LoopReport { status, cycles }
    }
}

/// Detached consumer: publishes a snapshot every `cadence` until cancelled.
async fn consume(
    mut module: Box<dyn PostCollection>,
    store: ReadingStore,
    cadence: Duration,
    flag: CancellationFlag,
) -> anyhow::Result<()> {
    let result = loop {
        if flag.wait(cadence).await == Wait::Cancelled {
            break Ok(());
        }
        let reading = match store.snapshot() {
            Ok(reading) => reading,
            Err(e) => break Err(anyhow::Error::new(e)),
        };
        match module.step(&reading).await {
            Outcome::Success => {}
            Outcome::Recoverable(e) => warn!("{}: {e}", module.name()),
            Outcome::Fatal(e) => error!("{}: {e}", module.name()),
        }
    };
    module.destroy().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ModuleCfg,
        module::{Collection, ModuleProvider},
        outcome::ModuleError,
        post_collection::ConfiguredPostCollection,
        store::Reading,
    };
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::{
        collections::VecDeque,
        sync::{
            Arc, Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };
    use tokio::time::Instant;

    const INTERVAL: Duration = Duration::from_secs(3);

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Publish(f64),
        Recover,
        Fatal,
    }

    #[derive(Default)]
    struct Counters {
        steps: AtomicUsize,
        destroys: AtomicUsize,
    }

    struct Scripted {
        script: VecDeque<Step>,
        store: ReadingStore,
        /// Raised once the script runs out; `None` keeps recovering forever.
        stop: Option<CancellationFlag>,
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl Collection for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn step(&mut self) -> Outcome {
            self.counters.steps.fetch_add(1, Ordering::SeqCst);
            match self.script.pop_front() {
                Some(Step::Publish(v)) => self.store.publish(v, &[v / 2.0]).into(),
                Some(Step::Recover) => ModuleError::validation("checksum mismatch").into(),
                Some(Step::Fatal) => Outcome::Fatal(ModuleError::Concurrency("poisoned".into())),
                None => {
                    if let Some(stop) = &self.stop {
                        stop.raise();
                    }
                    ModuleError::validation("script exhausted").into()
                }
            }
        }

        async fn destroy(&mut self) {
            self.counters.destroys.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ScriptedProvider {
        script: Vec<Step>,
        stop: Option<CancellationFlag>,
        fail_init: bool,
        counters: Arc<Counters>,
    }

    impl ScriptedProvider {
        fn boxed(
            script: &[Step],
            stop: Option<&CancellationFlag>,
            counters: &Arc<Counters>,
        ) -> CollectionProvider {
            Box::new(Self {
                script: script.to_vec(),
                stop: stop.cloned(),
                fail_init: false,
                counters: Arc::clone(counters),
            })
        }
    }

    #[async_trait]
    impl ModuleProvider<dyn Collection> for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn init(&self, store: &ReadingStore) -> Result<Box<dyn Collection>, ModuleError> {
            if self.fail_init {
                return Err(ModuleError::config("no such device"));
            }
            Ok(Box::new(Scripted {
                script: self.script.iter().copied().collect(),
                store: store.clone(),
                stop: self.stop.clone(),
                counters: Arc::clone(&self.counters),
            }))
        }
    }

    #[derive(Default)]
    struct SinkLog {
        seen: Mutex<Vec<f64>>,
        destroys: AtomicUsize,
    }

    impl SinkLog {
        fn seen(&self) -> Vec<f64> {
            self.seen.lock().unwrap().clone()
        }
    }

    struct RecordingSink(Arc<SinkLog>);

    #[async_trait]
    impl PostCollection for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        async fn step(&mut self, reading: &Reading) -> Outcome {
            self.0.seen.lock().unwrap().push(reading.primary);
            Outcome::Success
        }

        async fn destroy(&mut self) {
            self.0.destroys.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct SinkProvider {
        log: Arc<SinkLog>,
        cadence: Option<Duration>,
        fail_init: bool,
    }

    impl SinkProvider {
        fn boxed(log: &Arc<SinkLog>, cadence: Option<Duration>) -> PostCollectionProvider {
            Box::new(Self {
                log: Arc::clone(log),
                cadence,
                fail_init: false,
            })
        }
    }

    #[async_trait]
    impl ModuleProvider<dyn PostCollection> for SinkProvider {
        fn name(&self) -> &str {
            "recording"
        }

        async fn init(
            &self,
            _store: &ReadingStore,
        ) -> Result<Box<dyn PostCollection>, ModuleError> {
            if self.fail_init {
                return Err(ModuleError::sink("broker unreachable"));
            }
            Ok(Box::new(RecordingSink(Arc::clone(&self.log))))
        }

        fn cadence(&self) -> Option<Duration> {
            self.cadence
        }
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_each_success_to_inline_sinks() {
        let flag = CancellationFlag::new();
        let counters = Arc::new(Counters::default());
        let log = Arc::new(SinkLog::default());
        let script = [Step::Publish(21.0), Step::Publish(22.0)];

        let event_loop = EventLoop::new(
            ScriptedProvider::boxed(&script, Some(&flag), &counters),
            INTERVAL,
            flag.clone(),
        )
        .with_post_collection(SinkProvider::boxed(&log, None));
        let store = event_loop.store();
        let start = Instant::now();
        let report = event_loop.run().await;

        assert_eq!(report.status, ExitStatus::Clean);
        assert_eq!(report.cycles, 3);
        assert_eq!(log.seen(), vec![21.0, 22.0]);
        assert_eq!(store.snapshot().unwrap().secondary, vec![11.0]);
        assert_eq!(Instant::now() - start, INTERVAL * 3);
        assert_eq!(counters.destroys.load(Ordering::SeqCst), 1);
        assert_eq!(log.destroys.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn collection_init_failure_is_startup_failure() {
        let counters = Arc::new(Counters::default());
        let provider = Box::new(ScriptedProvider {
            script: vec![],
            stop: None,
            fail_init: true,
            counters: Arc::clone(&counters),
        });
        let event_loop = EventLoop::new(provider, INTERVAL, CancellationFlag::new());
        let state = event_loop.subscribe();
        let report = event_loop.run().await;

        assert!(matches!(
            report.status,
            ExitStatus::StartupFailed(ref r) if r.contains("no such device")
        ));
        assert_eq!(report.cycles, 0);
        assert_eq!(*state.borrow(), LoopState::Stopped);
        assert_eq!(counters.steps.load(Ordering::SeqCst), 0);
        assert_eq!(counters.destroys.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sink_init_failure_does_not_stop_acquisition() {
        let flag = CancellationFlag::new();
        let counters = Arc::new(Counters::default());
        let healthy = Arc::new(SinkLog::default());
        let broken = Arc::new(SinkLog::default());
        let script = [Step::Publish(1.0), Step::Publish(2.0), Step::Publish(3.0)];

        let report = EventLoop::new(
            ScriptedProvider::boxed(&script, Some(&flag), &counters),
            INTERVAL,
            flag.clone(),
        )
        .with_post_collection(Box::new(SinkProvider {
            log: Arc::clone(&broken),
            cadence: None,
            fail_init: true,
        }))
        .with_post_collection(SinkProvider::boxed(&healthy, None))
        .run()
        .await;

        assert_eq!(report.status, ExitStatus::Clean);
        assert_eq!(healthy.seen(), vec![1.0, 2.0, 3.0]);
        assert!(broken.seen().is_empty());
        assert_eq!(broken.destroys.load(Ordering::SeqCst), 0);
        assert_eq!(healthy.destroys.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unreachable_network_sinks_do_not_stall_cycles() {
        let flag = CancellationFlag::new();
        let counters = Arc::new(Counters::default());
        let healthy = Arc::new(SinkLog::default());
        let script = [1.0, 2.0, 3.0, 4.0, 5.0].map(Step::Publish);

        let report = EventLoop::new(
            ScriptedProvider::boxed(&script, Some(&flag), &counters),
            Duration::from_millis(200),
            flag.clone(),
        )
        .with_post_collection(Box::new(ConfiguredPostCollection::new(
            ModuleCfg::new("mqtt")
                .with("host", "127.0.0.1")
                .with("port", 9)
                .with("topic", "home/thmond")
                .with("connect_timeout_secs", 2),
        )))
        .with_post_collection(Box::new(ConfiguredPostCollection::new(
            ModuleCfg::new("http-post")
                .with("url", "http://127.0.0.1:9/ingest")
                .with("timeout_secs", 2),
        )))
        .with_post_collection(SinkProvider::boxed(&healthy, None))
        .run()
        .await;

        assert_eq!(report.status, ExitStatus::Clean);
        assert_eq!(report.cycles, 6);
        assert_eq!(counters.steps.load(Ordering::SeqCst), 6);
        assert_eq!(healthy.seen(), vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn recoverable_failure_leaves_store_and_sinks_untouched() {
        let flag = CancellationFlag::new();
        let counters = Arc::new(Counters::default());
        let log = Arc::new(SinkLog::default());
        let script = [Step::Publish(20.0), Step::Recover, Step::Recover];

        let event_loop = EventLoop::new(
            ScriptedProvider::boxed(&script, Some(&flag), &counters),
            INTERVAL,
            flag.clone(),
        )
        .with_post_collection(SinkProvider::boxed(&log, None));
        let store = event_loop.store();
        let report = event_loop.run().await;

        assert_eq!(report.status, ExitStatus::Clean);
        assert_eq!(report.cycles, 4);
        assert_eq!(log.seen(), vec![20.0]);
        assert_eq!(store.snapshot().unwrap().primary, 20.0);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_outcome_drains_every_module_once() {
        let flag = CancellationFlag::new();
        let counters = Arc::new(Counters::default());
        let inline = Arc::new(SinkLog::default());
        let detached = Arc::new(SinkLog::default());
        let script = [Step::Publish(5.0), Step::Fatal, Step::Publish(6.0)];

        let event_loop = EventLoop::new(
            ScriptedProvider::boxed(&script, None, &counters),
            INTERVAL,
            flag.clone(),
        )
        .with_post_collection(SinkProvider::boxed(&inline, None))
        .with_post_collection(SinkProvider::boxed(&detached, Some(Duration::from_secs(1))));
        let state = event_loop.subscribe();
        let report = event_loop.run().await;

        assert!(matches!(report.status, ExitStatus::Fatal(ref r) if r.contains("poisoned")));
        assert_eq!(report.cycles, 2);
        assert!(flag.is_raised());
        assert_eq!(*state.borrow(), LoopState::Stopped);
        assert_eq!(counters.steps.load(Ordering::SeqCst), 2);
        assert_eq!(counters.destroys.load(Ordering::SeqCst), 1);
        assert_eq!(inline.destroys.load(Ordering::SeqCst), 1);
        assert_eq!(detached.destroys.load(Ordering::SeqCst), 1);
        assert_eq!(inline.seen(), vec![5.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn detached_consumer_runs_while_acquisition_fails() {
        let flag = CancellationFlag::new();
        let counters = Arc::new(Counters::default());
        let inline = Arc::new(SinkLog::default());
        let detached = Arc::new(SinkLog::default());

        let event_loop = EventLoop::new(
            ScriptedProvider::boxed(&[Step::Publish(30.0)], None, &counters),
            INTERVAL,
            flag.clone(),
        )
        .with_post_collection(SinkProvider::boxed(&inline, None))
        .with_post_collection(SinkProvider::boxed(&detached, Some(Duration::from_secs(1))));
        let handle = tokio::spawn(event_loop.run());

        tokio::time::sleep(Duration::from_millis(20_500)).await;
        flag.raise();
        let report = handle.await.unwrap();

        assert_eq!(report.status, ExitStatus::Clean);
        assert_eq!(inline.seen(), vec![30.0]);
        let seen = detached.seen();
        assert_eq!(seen.len(), 20);
        // Before the first acquisition the consumer sees the unset reading.
        assert_eq!(&seen[..2], &[Reading::SENTINEL, Reading::SENTINEL]);
        assert!(seen[3..].iter().all(|&v| v == 30.0));
        assert_eq!(detached.destroys.load(Ordering::SeqCst), 1);
    }

    async fn drain_latency(cancel: impl FnOnce(&CancellationFlag)) -> Duration {
        let flag = CancellationFlag::new();
        let counters = Arc::new(Counters::default());
        let event_loop = EventLoop::new(
            ScriptedProvider::boxed(&[], None, &counters),
            Duration::from_secs(3600),
            flag.clone(),
        );
        let mut state = event_loop.subscribe();
        let handle = tokio::spawn(event_loop.run());

        state.wait_for(|s| *s == LoopState::Running).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_250)).await;
        let cancelled_at = Instant::now();
        cancel(&flag);
        state.wait_for(|s| *s != LoopState::Running).await.unwrap();
        let latency = Instant::now() - cancelled_at;

        assert_eq!(handle.await.unwrap().status, ExitStatus::Clean);
        assert_eq!(counters.destroys.load(Ordering::SeqCst), 1);
        latency
    }

    #[tokio::test(start_paused = true)]
    async fn raise_drains_immediately() {
        assert_eq!(drain_latency(|flag| flag.raise()).await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn signal_drains_within_one_second() {
        let latency = drain_latency(|flag| {
            flag.signal_handle().store(true, std::sync::atomic::Ordering::SeqCst)
        })
        .await;
        assert!(latency <= Duration::from_secs(1), "took {latency:?}");
    }
}
