//! Fixture type definitions supplied by the fixture collaborator

use futures::future::BoxFuture;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use super::scope::{FixtureRequirement, ScopeKey};
use crate::invoke::{CancellationToken, CapturedError, FixtureSet, Instance};

/// What a fixture constructor sees: its scope key and resolved nested fixtures
#[derive(Clone, Debug)]
pub struct FixtureContext {
    pub key: ScopeKey,
    pub fixtures: FixtureSet,
}

impl FixtureContext {
    pub fn fixture<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.fixtures.get(name)
    }
}

type Constructor = Arc<dyn Fn(&FixtureContext) -> Result<Instance, CapturedError> + Send + Sync>;
type Lifecycle = Arc<
    dyn Fn(Instance, CancellationToken) -> BoxFuture<'static, Result<(), CapturedError>>
        + Send
        + Sync,
>;

/// A fixture type: constructor, optional async initializer and finalizer,
/// and the nested fixtures it requires
#[derive(Clone)]
pub struct FixtureDefinition {
    pub id: String,
    pub requires: Vec<FixtureRequirement>,
    constructor: Constructor,
    initializer: Option<Lifecycle>,
    finalizer: Option<Lifecycle>,
}

impl FixtureDefinition {
    pub fn new<F>(id: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&FixtureContext) -> Result<Instance, CapturedError> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            requires: Vec::new(),
            constructor: Arc::new(constructor),
            initializer: None,
            finalizer: None,
        }
    }

    /// Fixture whose instance is a fixed value cloned per scope key
    pub fn value<T>(id: impl Into<String>, value: T) -> Self
    where
        T: Any + Clone + Send + Sync,
    {
        Self::new(id, move |_ctx| Ok(Arc::new(value.clone()) as Instance))
    }

    pub fn requires(mut self, requirement: FixtureRequirement) -> Self {
        self.requires.push(requirement);
        self
    }

    /// Asynchronous initializer, invoked once per scope key
    pub fn on_initialize<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Instance, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CapturedError>> + Send + 'static,
    {
        self.initializer = Some(Arc::new(move |instance, cancel| Box::pin(f(instance, cancel))));
        self
    }

    /// Asynchronous finalizer, invoked once when the instance's scope closes
    pub fn on_dispose<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Instance, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CapturedError>> + Send + 'static,
    {
        self.finalizer = Some(Arc::new(move |instance, cancel| Box::pin(f(instance, cancel))));
        self
    }

    pub(crate) fn construct(&self, ctx: &FixtureContext) -> Result<Instance, CapturedError> {
        (self.constructor)(ctx)
    }

    pub(crate) fn initializer(&self) -> Option<&Lifecycle> {
        self.initializer.as_ref()
    }

    pub(crate) fn finalizer(&self) -> Option<&Lifecycle> {
        self.finalizer.as_ref()
    }
}

impl std::fmt::Debug for FixtureDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixtureDefinition")
            .field("id", &self.id)
            .field("requires", &self.requires)
            .field("initializer", &self.initializer.is_some())
            .field("finalizer", &self.finalizer.is_some())
            .finish()
    }
}

/// Registered fixture types, by id
#[derive(Clone, Debug, Default)]
pub struct FixtureCatalog {
    definitions: HashMap<String, Arc<FixtureDefinition>>,
}

impl FixtureCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: FixtureDefinition) -> &mut Self {
        self.definitions
            .insert(definition.id.clone(), Arc::new(definition));
        self
    }

    pub fn with(mut self, definition: FixtureDefinition) -> Self {
        self.register(definition);
        self
    }

    pub fn get(&self, id: &str) -> Option<&Arc<FixtureDefinition>> {
        self.definitions.get(id)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Registered fixture ids, sorted
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.definitions.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Find a type-level requirement cycle reachable from `id`
    ///
    /// Returns the chain of fixture ids ending with the repeated id. Unknown
    /// fixture ids are ignored here and reported when resolved.
    pub fn find_cycle(&self, id: &str) -> Option<Vec<String>> {
        let mut path = Vec::new();
        let mut done = HashSet::new();
        self.visit(id, &mut path, &mut done)
    }

    fn visit(
        &self,
        id: &str,
        path: &mut Vec<String>,
        done: &mut HashSet<String>,
    ) -> Option<Vec<String>> {
        if let Some(pos) = path.iter().position(|p| p == id) {
            let mut cycle = path[pos..].to_vec();
            cycle.push(id.to_string());
            return Some(cycle);
        }
        if done.contains(id) {
            return None;
        }
        let definition = self.definitions.get(id)?;

        path.push(id.to_string());
        for req in &definition.requires {
            if let Some(cycle) = self.visit(&req.fixture, path, done) {
                return Some(cycle);
            }
        }
        path.pop();
        done.insert(id.to_string());
        None
    }
}
