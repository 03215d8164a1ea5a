use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::definition::{FixtureCatalog, FixtureContext, FixtureDefinition};
use super::scope::{Consumer, FixtureRequirement, ScopeIdentity, ScopeKey};
use crate::error::EngineError;
use crate::invoke::{flatten_join, CancellationToken, CapturedError, FixtureSet, Instance};
use crate::utils::lock;

/// Initialization state of one fixture record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FixtureState {
    Uninitialized = 0,
    Initializing = 1,
    Ready = 2,
    Faulted = 3,
    Disposed = 4,
}

impl FixtureState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => FixtureState::Initializing,
            2 => FixtureState::Ready,
            3 => FixtureState::Faulted,
            4 => FixtureState::Disposed,
            _ => FixtureState::Uninitialized,
        }
    }
}

/// One instantiated fixture, keyed by scope
struct FixtureRecord {
    key: ScopeKey,
    definition: Arc<FixtureDefinition>,
    promise: OnceCell<Result<Instance, EngineError>>,
    state: AtomicU8,
    consumers: Mutex<HashSet<String>>,
    /// Nested records this instance resolved, shared or owned
    children: Mutex<Vec<ScopeKey>>,
    ready_seq: AtomicU64,
    disposed: AtomicBool,
}

impl FixtureRecord {
    fn new(key: ScopeKey, definition: Arc<FixtureDefinition>) -> Self {
        Self {
            key,
            definition,
            promise: OnceCell::new(),
            state: AtomicU8::new(FixtureState::Uninitialized as u8),
            consumers: Mutex::new(HashSet::new()),
            children: Mutex::new(Vec::new()),
            ready_seq: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
        }
    }

    fn state(&self) -> FixtureState {
        FixtureState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: FixtureState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn closing_scope(&self) -> ScopeIdentity {
        self.key.scope.closing_scope()
    }
}

/// Fixtures resolved for one test
#[derive(Debug)]
pub struct AcquiredFixtures {
    pub fixtures: FixtureSet,
    pub keys: Vec<ScopeKey>,
}

/// Why a test could not obtain its fixtures
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcquireFailure {
    pub error: EngineError,
    /// The failing initialization ran on behalf of this consumer
    pub initiated: bool,
}

struct Resolved {
    instance: Instance,
    key: ScopeKey,
}

/// Per-session fixture registry
///
/// Created at session start and dropped at session end. Each scope key owns
/// a single-assignment promise: the first request runs initialization,
/// concurrent requests await the same promise, and a fault poisons the key
/// for the rest of its scope.
pub struct FixtureRegistry {
    catalog: FixtureCatalog,
    records: Mutex<HashMap<ScopeKey, Arc<FixtureRecord>>>,
    held: Mutex<HashMap<String, Vec<ScopeKey>>>,
    closed: Mutex<HashSet<ScopeIdentity>>,
    seq: AtomicU64,
}

impl FixtureRegistry {
    pub fn new(catalog: FixtureCatalog) -> Self {
        Self {
            catalog,
            records: Mutex::new(HashMap::new()),
            held: Mutex::new(HashMap::new()),
            closed: Mutex::new(HashSet::new()),
            seq: AtomicU64::new(0),
        }
    }

    pub fn catalog(&self) -> &FixtureCatalog {
        &self.catalog
    }

    /// Current state of the record for `key`, if one exists
    pub fn state(&self, key: &ScopeKey) -> Option<FixtureState> {
        lock(&self.records).get(key).map(|r| r.state())
    }

    /// Number of live (not yet disposed) records
    pub fn live_count(&self) -> usize {
        lock(&self.records)
            .values()
            .filter(|r| !r.disposed.load(Ordering::Acquire))
            .count()
    }

    /// Resolve every requirement of a test consumer
    ///
    /// Requirements are resolved in declaration order. The first failure
    /// stops resolution; records acquired so far stay held until
    /// [`release`](Self::release).
    pub async fn acquire(
        &self,
        consumer: &Consumer,
        requirements: &[FixtureRequirement],
        cancel: &CancellationToken,
    ) -> Result<AcquiredFixtures, AcquireFailure> {
        let mut acquired = AcquiredFixtures {
            fixtures: FixtureSet::new(),
            keys: Vec::with_capacity(requirements.len()),
        };

        for req in requirements {
            if let Some(chain) = self.catalog.find_cycle(&req.fixture) {
                warn!("Fixture cycle detected: {}", chain.join(" -> "));
                return Err(AcquireFailure {
                    error: EngineError::FixtureCycleDetected {
                        fixture: req.fixture.clone(),
                        chain,
                    },
                    initiated: true,
                });
            }

            let mut initiated = false;
            let outcome = self
                .resolve(req, consumer, consumer, &[], cancel, &mut initiated)
                .await;

            match outcome {
                Ok(resolved) => {
                    lock(&self.held)
                        .entry(consumer.label())
                        .or_default()
                        .push(resolved.key.clone());
                    acquired.keys.push(resolved.key);
                    acquired.fixtures.insert(req.name.clone(), resolved.instance);
                }
                Err(error) => {
                    // An unregistered type never reaches a shared promise
                    let initiated =
                        initiated || matches!(error, EngineError::FixtureNotFound { .. });
                    let error = match error {
                        EngineError::FixtureFault { .. } => EngineError::FixtureInitializationFailed {
                            fixture: req.fixture.clone(),
                            source: Box::new(error),
                        },
                        other => other,
                    };
                    return Err(AcquireFailure { error, initiated });
                }
            }
        }

        Ok(acquired)
    }

    /// Drop every reference `consumer` holds
    pub fn release(&self, consumer: &Consumer) {
        let label = consumer.label();
        let Some(keys) = lock(&self.held).remove(&label) else {
            return;
        };
        let records = lock(&self.records);
        for key in keys {
            if let Some(record) = records.get(&key) {
                lock(&record.consumers).remove(&label);
            }
        }
    }

    fn resolve<'a>(
        &'a self,
        req: &'a FixtureRequirement,
        consumer: &'a Consumer,
        root: &'a Consumer,
        chain: &'a [String],
        cancel: &'a CancellationToken,
        initiated: &'a mut bool,
    ) -> BoxFuture<'a, Result<Resolved, EngineError>> {
        Box::pin(async move {
            if chain.contains(&req.fixture) {
                let mut cycle = chain.to_vec();
                cycle.push(req.fixture.clone());
                return Err(EngineError::FixtureCycleDetected {
                    fixture: req.fixture.clone(),
                    chain: cycle,
                });
            }

            let definition = self.catalog.get(&req.fixture).cloned().ok_or_else(|| {
                EngineError::FixtureNotFound {
                    fixture: req.fixture.clone(),
                }
            })?;

            let key = consumer.scope_key(req, root);
            let record = {
                let mut records = lock(&self.records);
                Arc::clone(
                    records
                        .entry(key.clone())
                        .or_insert_with(|| Arc::new(FixtureRecord::new(key.clone(), definition))),
                )
            };
            lock(&record.consumers).insert(consumer.label());

            let outcome = record
                .promise
                .get_or_init(|| {
                    *initiated = true;
                    self.initialize(Arc::clone(&record), root, chain, cancel)
                })
                .await;

            match outcome {
                Ok(instance) => Ok(Resolved {
                    instance: Arc::clone(instance),
                    key,
                }),
                Err(error) => Err(error.clone()),
            }
        })
    }

    async fn initialize(
        &self,
        record: Arc<FixtureRecord>,
        root: &Consumer,
        chain: &[String],
        cancel: &CancellationToken,
    ) -> Result<Instance, EngineError> {
        record.set_state(FixtureState::Initializing);
        debug!("Initializing fixture {}", record.key);

        let result = self.build_instance(&record, root, chain, cancel).await;
        match &result {
            Ok(_) => {
                let seq = self.seq.fetch_add(1, Ordering::AcqRel) + 1;
                record.ready_seq.store(seq, Ordering::Release);
                record.set_state(FixtureState::Ready);
                debug!("Fixture {} ready", record.key);
            }
            Err(e) => {
                record.set_state(FixtureState::Faulted);
                warn!("Fixture {} faulted: {}", record.key, e);
            }
        }
        result
    }

    async fn build_instance(
        &self,
        record: &FixtureRecord,
        root: &Consumer,
        chain: &[String],
        cancel: &CancellationToken,
    ) -> Result<Instance, EngineError> {
        let definition = &record.definition;
        let fixture = definition.id.clone();
        let wrap = |error: EngineError| match error {
            EngineError::FixtureCycleDetected { .. } => error,
            other => EngineError::FixtureInitializationFailed {
                fixture: fixture.clone(),
                source: Box::new(other),
            },
        };

        let mut nested_chain = chain.to_vec();
        nested_chain.push(definition.id.clone());
        let parent = Consumer::Fixture(record.key.clone());

        let mut fixtures = FixtureSet::new();
        for req in &definition.requires {
            let mut nested_initiated = false;
            let resolved = self
                .resolve(req, &parent, root, &nested_chain, cancel, &mut nested_initiated)
                .await
                .map_err(wrap)?;
            lock(&record.children).push(resolved.key);
            fixtures.insert(req.name.clone(), resolved.instance);
        }

        if cancel.is_cancelled() {
            return Err(EngineError::cancelled(format!(
                "fixture {} initialization",
                record.key
            )));
        }

        let ctx = FixtureContext {
            key: record.key.clone(),
            fixtures,
        };
        let fault = |e: CapturedError| EngineError::FixtureFault {
            fixture: fixture.clone(),
            message: e.to_string(),
        };

        let instance = panic::catch_unwind(AssertUnwindSafe(|| definition.construct(&ctx)))
            .map_err(|_| CapturedError::new("fixture constructor panicked"))
            .and_then(|built| built)
            .map_err(fault)?;

        if let Some(initializer) = definition.initializer() {
            let task = tokio::spawn(initializer(Arc::clone(&instance), cancel.clone()));
            flatten_join(task.await).map_err(fault)?;
        }

        Ok(instance)
    }

    /// Close a scope and dispose its unreferenced fixtures
    ///
    /// Records are finalized in reverse order of becoming ready. Disposing a
    /// record releases its hold on nested records, which are disposed in turn
    /// once unreferenced and their own scope has closed. Closing the session
    /// disposes everything that remains.
    pub async fn close_scope(
        &self,
        scope: &ScopeIdentity,
        cancel: &CancellationToken,
    ) -> Vec<EngineError> {
        lock(&self.closed).insert(scope.clone());
        let session = *scope == ScopeIdentity::Session;

        // Faulted and never-initialized records of a closed scope are dropped outright
        let dropped: Vec<Arc<FixtureRecord>> = {
            let mut records = lock(&self.records);
            let keys: Vec<ScopeKey> = records
                .values()
                .filter(|r| r.state() != FixtureState::Ready)
                .filter(|r| session || r.closing_scope() == *scope)
                .map(|r| r.key.clone())
                .collect();
            keys.iter().filter_map(|k| records.remove(k)).collect()
        };
        let mut orphans = Vec::new();
        for record in &dropped {
            orphans.extend(self.detach_children(record));
        }

        let mut candidates: Vec<Arc<FixtureRecord>> = {
            let records = lock(&self.records);
            records
                .values()
                .filter(|r| session || r.closing_scope() == *scope)
                .filter(|r| r.state() == FixtureState::Ready)
                .filter(|r| session || lock(&r.consumers).is_empty())
                .cloned()
                .collect()
        };
        for orphan in orphans {
            if !candidates.iter().any(|c| Arc::ptr_eq(c, &orphan)) {
                candidates.push(orphan);
            }
        }
        candidates.sort_by_key(|r| std::cmp::Reverse(r.ready_seq.load(Ordering::Acquire)));

        let mut errors = Vec::new();
        for record in candidates {
            errors.extend(self.dispose(record, cancel).await);
        }
        if session {
            lock(&self.records).clear();
        }
        errors
    }

    fn dispose<'a>(
        &'a self,
        record: Arc<FixtureRecord>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Vec<EngineError>> {
        Box::pin(async move {
            let mut errors = Vec::new();
            if record.disposed.swap(true, Ordering::AcqRel) {
                return errors;
            }

            if let (Some(Ok(instance)), Some(finalizer)) =
                (record.promise.get(), record.definition.finalizer())
            {
                debug!("Disposing fixture {}", record.key);
                let task = tokio::spawn(finalizer(Arc::clone(instance), cancel.clone()));
                if let Err(e) = flatten_join(task.await) {
                    warn!("Fixture {} failed to dispose: {}", record.key, e);
                    errors.push(EngineError::FixtureDisposalFailed {
                        fixture: record.key.fixture.clone(),
                        message: e.to_string(),
                    });
                }
            }
            record.set_state(FixtureState::Disposed);
            lock(&self.records).remove(&record.key);

            for child in self.detach_children(&record) {
                errors.extend(self.dispose(child, cancel).await);
            }
            errors
        })
    }

    /// Drop `record`'s hold on its nested records, returning those now due for disposal
    fn detach_children(&self, record: &FixtureRecord) -> Vec<Arc<FixtureRecord>> {
        let parent = Consumer::Fixture(record.key.clone()).label();
        let children: Vec<ScopeKey> = lock(&record.children).drain(..).collect();
        let mut due = Vec::new();
        for key in children.into_iter().rev() {
            let child = lock(&self.records).get(&key).cloned();
            let Some(child) = child else { continue };
            let unreferenced = {
                let mut consumers = lock(&child.consumers);
                consumers.remove(&parent);
                consumers.is_empty()
            };
            if unreferenced && lock(&self.closed).contains(&child.closing_scope()) {
                due.push(child);
            }
        }
        due
    }
}

impl std::fmt::Debug for FixtureRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixtureRegistry")
            .field("definitions", &self.catalog.len())
            .field("records", &lock(&self.records).len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::SharedScope;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting(id: &str, inits: Arc<AtomicUsize>, disposals: Arc<AtomicUsize>) -> FixtureDefinition {
        FixtureDefinition::new(id, |ctx| Ok(Arc::new(ctx.key.to_string()) as Instance))
            .on_initialize(move |_instance, _cancel| {
                let inits = Arc::clone(&inits);
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    inits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .on_dispose(move |_instance, _cancel| {
                let disposals = Arc::clone(&disposals);
                async move {
                    disposals.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
    }

    fn test_consumer(id: &str) -> Consumer {
        Consumer::test(id, "Orders", "app")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_requests_initialize_once() {
        let inits = Arc::new(AtomicUsize::new(0));
        let disposals = Arc::new(AtomicUsize::new(0));
        let catalog =
            FixtureCatalog::new().with(counting("db", Arc::clone(&inits), Arc::clone(&disposals)));
        let registry = Arc::new(FixtureRegistry::new(catalog));
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for i in 0..64 {
            let registry = Arc::clone(&registry);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let consumer = test_consumer(&format!("t{i}"));
                let req = [FixtureRequirement::of("db", SharedScope::PerSession)];
                registry
                    .acquire(&consumer, &req, &cancel)
                    .await
                    .map(|a| a.fixtures.get_raw("db").cloned())
            }));
        }

        let mut instances = Vec::new();
        for handle in handles {
            let instance = handle.await.unwrap().unwrap().unwrap();
            instances.push(instance);
        }

        assert_eq!(inits.load(Ordering::SeqCst), 1);
        assert!(instances.iter().all(|i| Arc::ptr_eq(i, &instances[0])));
    }

    #[tokio::test]
    async fn test_fault_poisons_key() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let catalog = FixtureCatalog::new().with(
            FixtureDefinition::value("db", ()).on_initialize(move |_i, _c| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(CapturedError::new("connection refused")) }
            }),
        );
        let registry = FixtureRegistry::new(catalog);
        let cancel = CancellationToken::new();
        let req = [FixtureRequirement::of("db", SharedScope::PerClass)];

        let first = registry
            .acquire(&test_consumer("t1"), &req, &cancel)
            .await
            .unwrap_err();
        assert!(first.initiated);
        assert!(matches!(
            first.error,
            EngineError::FixtureInitializationFailed { .. }
        ));

        let second = registry
            .acquire(&test_consumer("t2"), &req, &cancel)
            .await
            .unwrap_err();
        assert!(!second.initiated);
        assert_eq!(second.error, first.error);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cycle_detected_without_initializing() {
        let inits = Arc::new(AtomicUsize::new(0));
        let disposals = Arc::new(AtomicUsize::new(0));
        let catalog = FixtureCatalog::new()
            .with(
                counting("a", Arc::clone(&inits), Arc::clone(&disposals))
                    .requires(FixtureRequirement::of("b", SharedScope::None)),
            )
            .with(
                counting("b", Arc::clone(&inits), Arc::clone(&disposals))
                    .requires(FixtureRequirement::of("a", SharedScope::None)),
            );
        let registry = FixtureRegistry::new(catalog);

        let failure = tokio::time::timeout(
            Duration::from_secs(1),
            registry.acquire(
                &test_consumer("t1"),
                &[FixtureRequirement::of("a", SharedScope::None)],
                &CancellationToken::new(),
            ),
        )
        .await
        .expect("cycle detection hung")
        .unwrap_err();

        assert!(matches!(
            failure.error,
            EngineError::FixtureCycleDetected { .. }
        ));
        assert_eq!(inits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_nested_fixtures_and_reverse_disposal() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let recorder = |id: &'static str| {
            let order = Arc::clone(&order);
            FixtureDefinition::value(id, id).on_dispose(move |_i, _c| {
                lock(&order).push(id);
                async { Ok(()) }
            })
        };
        let catalog = FixtureCatalog::new()
            .with(recorder("app").requires(FixtureRequirement::of("conn", SharedScope::None)))
            .with(recorder("conn"));
        let registry = FixtureRegistry::new(catalog);
        let cancel = CancellationToken::new();
        let consumer = test_consumer("t1");

        let acquired = registry
            .acquire(
                &consumer,
                &[FixtureRequirement::of("app", SharedScope::PerClass)],
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(acquired.fixtures.get::<&'static str>("app").as_deref(), Some(&"app"));

        registry.release(&consumer);
        let errors = registry
            .close_scope(&ScopeIdentity::Class("Orders".into()), &cancel)
            .await;
        assert!(errors.is_empty());
        assert_eq!(*lock(&order), vec!["app", "conn"]);
        assert_eq!(registry.live_count(), 0);
    }

    #[tokio::test]
    async fn test_faulted_parent_releases_nested_fixtures() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&order);
        let catalog = FixtureCatalog::new()
            .with(
                FixtureDefinition::value("app", ())
                    .requires(FixtureRequirement::of("conn", SharedScope::None))
                    .on_initialize(|_i, _c| async { Err(CapturedError::new("bad config")) }),
            )
            .with(FixtureDefinition::value("conn", ()).on_dispose(move |_i, _c| {
                lock(&recorded).push("conn");
                async { Ok(()) }
            }));
        let registry = FixtureRegistry::new(catalog);
        let cancel = CancellationToken::new();
        let consumer = test_consumer("t1");

        let failure = registry
            .acquire(
                &consumer,
                &[FixtureRequirement::of("app", SharedScope::PerClass)],
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            failure.error,
            EngineError::FixtureInitializationFailed { .. }
        ));
        assert_eq!(registry.live_count(), 2);

        registry.release(&consumer);
        let errors = registry
            .close_scope(&ScopeIdentity::Class("Orders".into()), &cancel)
            .await;
        assert!(errors.is_empty());
        assert_eq!(*lock(&order), vec!["conn"]);
        assert_eq!(registry.live_count(), 0);
    }

    #[tokio::test]
    async fn test_shared_child_outlives_parent_scope() {
        let inits = Arc::new(AtomicUsize::new(0));
        let disposals = Arc::new(AtomicUsize::new(0));
        let catalog = FixtureCatalog::new()
            .with(
                FixtureDefinition::value("client", ())
                    .requires(FixtureRequirement::of("server", SharedScope::PerSession)),
            )
            .with(counting("server", Arc::clone(&inits), Arc::clone(&disposals)));
        let registry = FixtureRegistry::new(catalog);
        let cancel = CancellationToken::new();
        let consumer = test_consumer("t1");

        registry
            .acquire(&consumer, &[FixtureRequirement::of("client", SharedScope::None)], &cancel)
            .await
            .unwrap();
        registry.release(&consumer);

        registry
            .close_scope(&ScopeIdentity::Test("t1".into()), &cancel)
            .await;
        assert_eq!(disposals.load(Ordering::SeqCst), 0);
        assert_eq!(
            registry.state(&ScopeKey::new("server", ScopeIdentity::Session)),
            Some(FixtureState::Ready)
        );

        registry.close_scope(&ScopeIdentity::Session, &cancel).await;
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_fixture() {
        let registry = FixtureRegistry::new(FixtureCatalog::new());
        let failure = registry
            .acquire(
                &test_consumer("t1"),
                &[FixtureRequirement::of("ghost", SharedScope::None)],
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(
            failure.error,
            EngineError::FixtureNotFound {
                fixture: "ghost".into()
            }
        );
    }

    #[tokio::test]
    async fn test_disposal_failure_is_reported() {
        let catalog = FixtureCatalog::new().with(
            FixtureDefinition::value("tmp", ())
                .on_dispose(|_i, _c| async { Err(CapturedError::new("busy")) }),
        );
        let registry = FixtureRegistry::new(catalog);
        let cancel = CancellationToken::new();
        let consumer = test_consumer("t1");
        registry
            .acquire(&consumer, &[FixtureRequirement::of("tmp", SharedScope::None)], &cancel)
            .await
            .unwrap();
        registry.release(&consumer);

        let errors = registry
            .close_scope(&ScopeIdentity::Test("t1".into()), &cancel)
            .await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].label(), "fixture_disposal_failed");
    }
}
