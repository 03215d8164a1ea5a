//! Invocation context handed to test bodies, hooks and factories

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::hooks::HookScopeKind;

/// A shared, type-erased instance (fixture or test-class instance)
pub type Instance = Arc<dyn Any + Send + Sync>;

/// Named fixture instances resolved for one consumer
#[derive(Clone, Default)]
pub struct FixtureSet {
    entries: HashMap<String, Instance>,
}

impl FixtureSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, instance: Instance) {
        self.entries.insert(name.into(), instance);
    }

    /// Get a fixture by binding name, downcast to its concrete type
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.entries
            .get(name)
            .and_then(|instance| Arc::clone(instance).downcast::<T>().ok())
    }

    /// Get the type-erased fixture by binding name
    pub fn get_raw(&self, name: &str) -> Option<&Instance> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for FixtureSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.entries.keys().collect();
        names.sort();
        f.debug_struct("FixtureSet").field("names", &names).finish()
    }
}

/// Context passed to every invokable unit
#[derive(Clone, Debug)]
pub struct InvokeContext {
    /// Scope the unit runs in (Test for bodies and per-test hooks)
    pub scope: HookScopeKind,
    /// Scope identity: test id, class, assembly, or "session"
    pub identity: String,
    pub test_id: Option<String>,
    pub class: Option<String>,
    pub assembly: Option<String>,
    /// 1-based attempt number; 0 outside of a test attempt
    pub attempt: u32,
    pub fixtures: FixtureSet,
    instance: Option<InstanceSlot>,
}

#[derive(Clone)]
struct InstanceSlot(Instance);

impl std::fmt::Debug for InstanceSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Instance")
    }
}

impl InvokeContext {
    /// Context for a session-level hook
    pub fn session() -> Self {
        Self::for_scope(HookScopeKind::Session, "session")
    }

    /// Context for a scope-level hook
    pub fn for_scope(scope: HookScopeKind, identity: impl Into<String>) -> Self {
        Self {
            scope,
            identity: identity.into(),
            test_id: None,
            class: None,
            assembly: None,
            attempt: 0,
            fixtures: FixtureSet::new(),
            instance: None,
        }
    }

    /// Context for one attempt of a test
    pub fn for_test(
        test_id: impl Into<String>,
        class: impl Into<String>,
        assembly: impl Into<String>,
        attempt: u32,
    ) -> Self {
        let test_id = test_id.into();
        Self {
            scope: HookScopeKind::Test,
            identity: test_id.clone(),
            test_id: Some(test_id),
            class: Some(class.into()),
            assembly: Some(assembly.into()),
            attempt,
            fixtures: FixtureSet::new(),
            instance: None,
        }
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class = Some(class.into());
        self
    }

    pub fn with_assembly(mut self, assembly: impl Into<String>) -> Self {
        self.assembly = Some(assembly.into());
        self
    }

    pub fn with_fixtures(mut self, fixtures: FixtureSet) -> Self {
        self.fixtures = fixtures;
        self
    }

    pub fn with_instance(mut self, instance: Instance) -> Self {
        self.instance = Some(InstanceSlot(instance));
        self
    }

    /// Shorthand for `self.fixtures.get`
    pub fn fixture<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.fixtures.get(name)
    }

    /// The test-class instance created for this attempt, if any
    pub fn instance<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.instance
            .as_ref()
            .and_then(|slot| Arc::clone(&slot.0).downcast::<T>().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_set_downcast() {
        let mut set = FixtureSet::new();
        set.insert("port", Arc::new(8080u16) as Instance);

        assert_eq!(set.get::<u16>("port").as_deref(), Some(&8080));
        assert!(set.get::<String>("port").is_none());
        assert!(set.get::<u16>("missing").is_none());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_context_for_test() {
        let ctx = InvokeContext::for_test("t1", "Class", "asm", 2)
            .with_instance(Arc::new(String::from("instance")) as Instance);

        assert_eq!(ctx.scope, HookScopeKind::Test);
        assert_eq!(ctx.identity, "t1");
        assert_eq!(ctx.attempt, 2);
        assert_eq!(ctx.instance::<String>().as_deref().map(String::as_str), Some("instance"));
    }
}
