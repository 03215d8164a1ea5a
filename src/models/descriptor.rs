//! Test descriptors
//!
//! A [`TestDescriptor`] is produced once by the discovery collaborator and is
//! read-only for the rest of the run.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::fixtures::FixtureRequirement;
use crate::error::EngineError;
use crate::invoke::{
    invokable, retry_policy, CancellationToken, InstanceFactory, InvokeContext, InvokeOutcome,
    Invokable, RetryPolicy,
};

/// Assembly used when a descriptor does not name one
pub const DEFAULT_ASSEMBLY: &str = "default";

/// What a dependency points at
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyTarget {
    /// A single test by identifier
    Test(String),
    /// Every test of a class (other than the declaring test)
    Class(String),
}

impl fmt::Display for DependencyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyTarget::Test(id) => write!(f, "test {id}"),
            DependencyTarget::Class(class) => write!(f, "class {class}"),
        }
    }
}

/// A `DependsOn` declaration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub target: DependencyTarget,
    /// Run even if the predecessor failed or was skipped
    #[serde(default)]
    pub proceed_on_failure: bool,
}

impl Dependency {
    pub fn on_test(id: impl Into<String>) -> Self {
        Self {
            target: DependencyTarget::Test(id.into()),
            proceed_on_failure: false,
        }
    }

    pub fn on_class(class: impl Into<String>) -> Self {
        Self {
            target: DependencyTarget::Class(class.into()),
            proceed_on_failure: false,
        }
    }

    pub fn proceed_on_failure(mut self) -> Self {
        self.proceed_on_failure = true;
        self
    }
}

/// A mutual-exclusion key
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionKey {
    Named(String),
    /// Exclusive with every other test of the same class holding this key
    Class,
}

impl ExclusionKey {
    /// Resolve to the concrete key string for a test of `class`
    pub fn resolve(&self, class: &str) -> String {
        match self {
            ExclusionKey::Named(key) => key.clone(),
            ExclusionKey::Class => format!("class:{class}"),
        }
    }
}

impl From<&str> for ExclusionKey {
    fn from(key: &str) -> Self {
        ExclusionKey::Named(key.to_string())
    }
}

/// Parallel execution constraint of a test
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelConstraint {
    /// Runs alongside anything
    #[default]
    Unconstrained,
    /// Serializes with every test sharing any key; no keys means run alone
    NotInParallel(Vec<ExclusionKey>),
    /// Runs with tests of the same group, never alongside another group
    ParallelGroup(String),
}

impl ParallelConstraint {
    pub fn not_in_parallel<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<ExclusionKey>,
    {
        ParallelConstraint::NotInParallel(keys.into_iter().map(Into::into).collect())
    }

    /// Exclusive with every other test in the session
    pub fn global_exclusive() -> Self {
        ParallelConstraint::NotInParallel(Vec::new())
    }

    pub fn is_global_exclusive(&self) -> bool {
        matches!(self, ParallelConstraint::NotInParallel(keys) if keys.is_empty())
    }
}

/// Caps the number of in-flight tests sharing a limiter key
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelLimit {
    pub key: String,
    pub max: usize,
}

/// Immutable description of one test
#[derive(Clone)]
pub struct TestDescriptor {
    pub id: String,
    pub class: String,
    pub assembly: String,
    pub categories: Vec<String>,
    pub depends_on: Vec<Dependency>,
    pub constraint: ParallelConstraint,
    pub parallel_limit: Option<ParallelLimit>,
    /// `None` means the engine default
    pub retry_limit: Option<u32>,
    /// `None` means the engine default
    pub timeout: Option<Duration>,
    pub fixtures: Vec<FixtureRequirement>,
    pub skip_reason: Option<String>,
    pub body: Arc<dyn Invokable>,
    pub factory: Option<Arc<dyn InstanceFactory>>,
    /// Consulted before each retry the budget allows
    pub retry_policy: Option<Arc<dyn RetryPolicy>>,
}

impl TestDescriptor {
    /// Create a descriptor with an async body
    pub fn new<F, Fut>(id: impl Into<String>, class: impl Into<String>, body: F) -> Self
    where
        F: Fn(InvokeContext, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = InvokeOutcome> + Send + 'static,
    {
        Self::with_invokable(id, class, invokable(body))
    }

    /// Create a descriptor from an existing invokable
    pub fn with_invokable(
        id: impl Into<String>,
        class: impl Into<String>,
        body: Arc<dyn Invokable>,
    ) -> Self {
        Self {
            id: id.into(),
            class: class.into(),
            assembly: DEFAULT_ASSEMBLY.to_string(),
            categories: Vec::new(),
            depends_on: Vec::new(),
            constraint: ParallelConstraint::Unconstrained,
            parallel_limit: None,
            retry_limit: None,
            timeout: None,
            fixtures: Vec::new(),
            skip_reason: None,
            body,
            factory: None,
            retry_policy: None,
        }
    }

    pub fn assembly(mut self, assembly: impl Into<String>) -> Self {
        self.assembly = assembly.into();
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.categories.push(category.into());
        self
    }

    pub fn depends_on(mut self, dependency: Dependency) -> Self {
        self.depends_on.push(dependency);
        self
    }

    pub fn constraint(mut self, constraint: ParallelConstraint) -> Self {
        self.constraint = constraint;
        self
    }

    pub fn not_in_parallel(self, key: impl Into<String>) -> Self {
        self.constraint(ParallelConstraint::NotInParallel(vec![ExclusionKey::Named(
            key.into(),
        )]))
    }

    pub fn parallel_limit(mut self, key: impl Into<String>, max: usize) -> Self {
        self.parallel_limit = Some(ParallelLimit {
            key: key.into(),
            max,
        });
        self
    }

    pub fn retries(mut self, limit: u32) -> Self {
        self.retry_limit = Some(limit);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn fixture(mut self, requirement: FixtureRequirement) -> Self {
        self.fixtures.push(requirement);
        self
    }

    pub fn skip(mut self, reason: impl Into<String>) -> Self {
        self.skip_reason = Some(reason.into());
        self
    }

    pub fn factory(mut self, factory: Arc<dyn InstanceFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Async veto over retries, given the failed attempt's context, error and number
    pub fn on_retry<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(InvokeContext, EngineError, u32) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.retry_policy = Some(retry_policy(f));
        self
    }

    /// Exclusion keys resolved against this test's class
    pub fn exclusion_keys(&self) -> Vec<String> {
        match &self.constraint {
            ParallelConstraint::NotInParallel(keys) => {
                keys.iter().map(|k| k.resolve(&self.class)).collect()
            }
            _ => Vec::new(),
        }
    }
}

impl fmt::Debug for TestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestDescriptor")
            .field("id", &self.id)
            .field("class", &self.class)
            .field("assembly", &self.assembly)
            .field("depends_on", &self.depends_on)
            .field("constraint", &self.constraint)
            .field("retry_limit", &self.retry_limit)
            .field("timeout", &self.timeout)
            .field("fixtures", &self.fixtures)
            .field("retry_policy", &self.retry_policy.is_some())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for TestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.class, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(id: &str, class: &str) -> TestDescriptor {
        TestDescriptor::new(id, class, |_ctx, _cancel| async { Ok(()) })
    }

    #[test]
    fn test_builder_defaults() {
        let test = noop("t1", "Suite");
        assert_eq!(test.assembly, DEFAULT_ASSEMBLY);
        assert!(test.depends_on.is_empty());
        assert_eq!(test.constraint, ParallelConstraint::Unconstrained);
        assert!(test.retry_limit.is_none());
        assert_eq!(test.to_string(), "Suite::t1");
    }

    #[test]
    fn test_exclusion_keys_resolve_class_key() {
        let test = noop("t1", "Db").constraint(ParallelConstraint::NotInParallel(vec![
            ExclusionKey::Class,
            "db".into(),
        ]));
        assert_eq!(test.exclusion_keys(), vec!["class:Db".to_string(), "db".to_string()]);
    }

    #[test]
    fn test_global_exclusive() {
        assert!(ParallelConstraint::global_exclusive().is_global_exclusive());
        assert!(!ParallelConstraint::not_in_parallel(["db"]).is_global_exclusive());
        assert!(!ParallelConstraint::Unconstrained.is_global_exclusive());
    }

    #[test]
    fn test_dependency_builders() {
        let dep = Dependency::on_test("a").proceed_on_failure();
        assert!(dep.proceed_on_failure);
        assert_eq!(dep.target, DependencyTarget::Test("a".into()));
        assert_eq!(Dependency::on_class("C").target.to_string(), "class C");
    }
}
