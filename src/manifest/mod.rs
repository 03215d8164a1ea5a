//! Declarative suite manifests
//!
//! A manifest describes tests, fixtures and hooks in YAML or JSON. Every
//! callable is a [`Script`], so a manifest can exercise the engine end to end
//! without compiled test code.

mod script;

pub use script::{Script, ScriptRunner};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::fixtures::{FixtureCatalog, FixtureDefinition, FixtureRequirement, SharedScope};
use crate::hooks::{Hook, HookPhase, HookRegistry, HookScopeKind, HookTarget};
use crate::invoke::Instance;
use crate::models::{
    Dependency, ExclusionKey, ParallelConstraint, ParallelLimit, TestDescriptor, TestSuite,
    DEFAULT_ASSEMBLY,
};

/// Top-level manifest document
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub fixtures: Vec<FixtureSpec>,
    #[serde(default)]
    pub hooks: Vec<HookSpec>,
    pub tests: Vec<TestSpec>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixtureSpec {
    pub id: String,
    #[serde(default)]
    pub requires: Vec<RequirementSpec>,
    #[serde(default)]
    pub initialize: Option<Script>,
    #[serde(default)]
    pub dispose: Option<Script>,
}

/// Sharing scope names as written in a manifest
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeName {
    #[default]
    None,
    PerClass,
    PerAssembly,
    PerSession,
    Keyed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequirementSpec {
    pub fixture: String,
    /// Binding name; defaults to the fixture id
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub scope: ScopeName,
    /// Sharing key, required for `keyed`
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HookSpec {
    pub name: String,
    pub scope: HookScopeKind,
    pub phase: HookPhase,
    #[serde(default)]
    pub order: i32,
    /// Restrict to one class
    #[serde(default)]
    pub class: Option<String>,
    /// Restrict to one assembly
    #[serde(default)]
    pub assembly: Option<String>,
    #[serde(default)]
    pub run: Script,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DependencySpec {
    #[serde(default)]
    pub test: Option<String>,
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub proceed_on_failure: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestSpec {
    pub id: String,
    pub class: String,
    #[serde(default)]
    pub assembly: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<DependencySpec>,
    /// Exclusion keys; an empty list runs the test alone
    #[serde(default)]
    pub not_in_parallel: Option<Vec<String>>,
    /// Also exclusive with tests of the same class
    #[serde(default)]
    pub class_exclusive: bool,
    #[serde(default)]
    pub parallel_group: Option<String>,
    #[serde(default)]
    pub parallel_limit: Option<ParallelLimit>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub fixtures: Vec<RequirementSpec>,
    #[serde(default)]
    pub skip: Option<String>,
    #[serde(default)]
    pub run: Script,
}

impl Manifest {
    /// Load a manifest; YAML or JSON by file extension
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;

        let is_yaml = path
            .extension()
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false);
        if is_yaml {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML manifest: {}", path.display()))
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON manifest: {}", path.display()))
        }
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse YAML manifest")
    }

    /// Build the executable suite
    pub fn into_suite(self) -> Result<TestSuite> {
        let mut catalog = FixtureCatalog::new();
        let mut fixture_ids = HashSet::new();
        for spec in self.fixtures {
            if !fixture_ids.insert(spec.id.clone()) {
                bail!("Fixture '{}' is declared twice", spec.id);
            }
            catalog.register(build_fixture(spec)?);
        }

        let mut hooks = HookRegistry::new();
        for spec in self.hooks {
            let target = match (spec.class, spec.assembly) {
                (Some(_), Some(_)) => {
                    bail!("Hook '{}' may target a class or an assembly, not both", spec.name)
                }
                (Some(class), None) => HookTarget::Class(class),
                (None, Some(assembly)) => HookTarget::Assembly(assembly),
                (None, None) => HookTarget::Everywhere,
            };
            let hook =
                Hook::with_invokable(spec.name, spec.run.into_invokable()).order(spec.order);
            hooks.register(spec.scope, spec.phase, target, hook);
        }

        let tests = self
            .tests
            .into_iter()
            .map(build_test)
            .collect::<Result<Vec<_>>>()?;

        Ok(TestSuite::new()
            .with_tests(tests)
            .with_hooks(hooks)
            .with_fixtures(catalog))
    }
}

fn build_requirement(spec: RequirementSpec) -> Result<FixtureRequirement> {
    let scope = match (spec.scope, spec.key) {
        (ScopeName::Keyed, Some(key)) => SharedScope::Keyed(key),
        (ScopeName::Keyed, None) => bail!("Keyed requirement of '{}' needs a key", spec.fixture),
        (_, Some(_)) => bail!("Only keyed requirements of '{}' take a key", spec.fixture),
        (ScopeName::None, None) => SharedScope::None,
        (ScopeName::PerClass, None) => SharedScope::PerClass,
        (ScopeName::PerAssembly, None) => SharedScope::PerAssembly,
        (ScopeName::PerSession, None) => SharedScope::PerSession,
    };
    let name = spec.name.unwrap_or_else(|| spec.fixture.clone());
    Ok(FixtureRequirement::new(name, spec.fixture, scope))
}

fn build_fixture(spec: FixtureSpec) -> Result<FixtureDefinition> {
    let id = spec.id.clone();
    let mut definition = FixtureDefinition::new(spec.id, move |ctx| {
        Ok(Arc::new(format!("{id}@{}", ctx.key.scope)) as Instance)
    });

    for req in spec.requires {
        definition = definition.requires(build_requirement(req)?);
    }
    if let Some(script) = spec.initialize {
        let runner = script.runner();
        definition = definition.on_initialize(move |_instance, cancel| runner.call(cancel));
    }
    if let Some(script) = spec.dispose {
        let runner = script.runner();
        definition = definition.on_dispose(move |_instance, cancel| runner.call(cancel));
    }
    Ok(definition)
}

fn build_test(spec: TestSpec) -> Result<TestDescriptor> {
    let mut test = TestDescriptor::with_invokable(&spec.id, &spec.class, spec.run.into_invokable())
        .assembly(spec.assembly.unwrap_or_else(|| DEFAULT_ASSEMBLY.to_string()));

    for category in spec.categories {
        test = test.category(category);
    }

    for dep in spec.depends_on {
        let dependency = match (dep.test, dep.class) {
            (Some(id), None) => Dependency::on_test(id),
            (None, Some(class)) => Dependency::on_class(class),
            _ => bail!("Dependency of '{}' must name exactly one of test or class", spec.id),
        };
        test = test.depends_on(if dep.proceed_on_failure {
            dependency.proceed_on_failure()
        } else {
            dependency
        });
    }

    let mut keys: Vec<ExclusionKey> = spec
        .not_in_parallel
        .clone()
        .unwrap_or_default()
        .into_iter()
        .map(ExclusionKey::Named)
        .collect();
    if spec.class_exclusive {
        keys.push(ExclusionKey::Class);
    }
    let exclusive = spec.not_in_parallel.is_some() || spec.class_exclusive;
    let constraint = match (exclusive, spec.parallel_group) {
        (true, Some(_)) => bail!(
            "Test '{}' cannot combine not_in_parallel with a parallel group",
            spec.id
        ),
        (true, None) => ParallelConstraint::NotInParallel(keys),
        (false, Some(group)) => ParallelConstraint::ParallelGroup(group),
        (false, None) => ParallelConstraint::Unconstrained,
    };
    test = test.constraint(constraint);

    if let Some(limit) = spec.parallel_limit {
        test = test.parallel_limit(limit.key, limit.max);
    }
    if let Some(retries) = spec.retries {
        test = test.retries(retries);
    }
    if let Some(timeout) = spec.timeout_ms {
        test = test.timeout(Duration::from_millis(timeout));
    }
    for req in spec.fixtures {
        test = test.fixture(build_requirement(req)?);
    }
    if let Some(reason) = spec.skip {
        test = test.skip(reason);
    }
    Ok(test)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const MANIFEST: &str = r#"
name: checkout
fixtures:
  - id: db
    initialize: { sleep_ms: 5 }
  - id: app
    requires:
      - { fixture: db, scope: per_session }
hooks:
  - { name: warmup, scope: class, phase: before, class: Cart }
  - { name: cleanup, scope: test, phase: after, order: -1 }
tests:
  - id: add_item
    class: Cart
    fixtures:
      - { fixture: app, scope: per_class }
  - id: checkout
    class: Cart
    depends_on:
      - { test: add_item }
    not_in_parallel: [payments]
    retries: 2
    timeout_ms: 250
    run: { fail_attempts: 1 }
  - id: audit
    class: Audit
    not_in_parallel: []
  - id: flaky_report
    class: Audit
    skip: "quarantined"
"#;

    #[test]
    fn test_manifest_builds_suite() {
        let suite = Manifest::from_yaml(MANIFEST).unwrap().into_suite().unwrap();

        assert_eq!(suite.len(), 4);
        assert_eq!(suite.fixtures.len(), 2);
        assert_eq!(suite.hooks.len(), 2);

        let checkout = &suite.tests[1];
        assert_eq!(checkout.retry_limit, Some(2));
        assert_eq!(checkout.timeout, Some(Duration::from_millis(250)));
        assert_eq!(checkout.exclusion_keys(), vec!["payments".to_string()]);
        assert_eq!(checkout.depends_on, vec![Dependency::on_test("add_item")]);

        assert!(suite.tests[2].constraint.is_global_exclusive());
        assert_eq!(suite.tests[3].skip_reason.as_deref(), Some("quarantined"));
    }

    #[test]
    fn test_keyed_requirement_needs_key() {
        let manifest = Manifest::from_yaml(
            "tests:\n  - id: a\n    class: C\n    fixtures:\n      - { fixture: f, scope: keyed }\n",
        )
        .unwrap();
        assert!(manifest.into_suite().is_err());
    }

    #[test]
    fn test_dependency_needs_one_target() {
        let manifest = Manifest::from_yaml(
            "tests:\n  - id: a\n    class: C\n    depends_on:\n      - { test: b, class: D }\n",
        )
        .unwrap();
        let err = manifest.into_suite().unwrap_err();
        assert!(err.to_string().contains("exactly one"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(Manifest::from_yaml("tests:\n  - id: a\n    class: C\n    retry: 1\n").is_err());
    }

    #[test]
    fn test_load_json_manifest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("suite.json");
        std::fs::write(
            &path,
            r#"{"tests": [{"id": "a", "class": "C", "run": {"sleep_ms": 1}}]}"#,
        )
        .unwrap();

        let manifest = Manifest::load(&path).unwrap();
        assert_eq!(manifest.tests[0].run.sleep_ms, 1);
    }
}
