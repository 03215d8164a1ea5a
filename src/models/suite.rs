//! Test suites and filtering

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use super::descriptor::{DependencyTarget, TestDescriptor};
use crate::fixtures::FixtureCatalog;
use crate::hooks::HookRegistry;

/// Everything the discovery collaborator hands to the engine
#[derive(Debug, Default)]
pub struct TestSuite {
    pub tests: Vec<TestDescriptor>,
    pub hooks: HookRegistry,
    pub fixtures: FixtureCatalog,
}

impl TestSuite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn test(mut self, test: TestDescriptor) -> Self {
        self.tests.push(test);
        self
    }

    pub fn with_tests(mut self, tests: impl IntoIterator<Item = TestDescriptor>) -> Self {
        self.tests.extend(tests);
        self
    }

    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_fixtures(mut self, fixtures: FixtureCatalog) -> Self {
        self.fixtures = fixtures;
        self
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }
}

/// Selects a subset of tests to run
///
/// Empty criteria match everything. Matching is by substring.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestFilter {
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
}

impl TestFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, pattern: impl Into<String>) -> Self {
        self.ids.push(pattern.into());
        self
    }

    pub fn class(mut self, pattern: impl Into<String>) -> Self {
        self.classes.push(pattern.into());
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.categories.push(category.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.classes.is_empty() && self.categories.is_empty()
    }

    pub fn matches(&self, test: &TestDescriptor) -> bool {
        let id_ok = self.ids.is_empty() || self.ids.iter().any(|p| test.id.contains(p.as_str()));
        let class_ok =
            self.classes.is_empty() || self.classes.iter().any(|p| test.class.contains(p.as_str()));
        let category_ok = self.categories.is_empty()
            || self
                .categories
                .iter()
                .any(|c| test.categories.iter().any(|tc| tc == c));
        id_ok && class_ok && category_ok
    }

    /// Keep matching tests plus everything they transitively depend on,
    /// preserving declaration order
    pub fn apply(&self, tests: Vec<TestDescriptor>) -> Vec<TestDescriptor> {
        if self.is_empty() {
            return tests;
        }

        let by_id: HashMap<&str, usize> = tests
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.as_str(), i))
            .collect();
        let mut by_class: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, t) in tests.iter().enumerate() {
            by_class.entry(t.class.as_str()).or_default().push(i);
        }

        let mut keep: HashSet<usize> = HashSet::new();
        let mut queue: VecDeque<usize> = tests
            .iter()
            .enumerate()
            .filter(|(_, t)| self.matches(t))
            .map(|(i, _)| i)
            .collect();

        while let Some(i) = queue.pop_front() {
            if !keep.insert(i) {
                continue;
            }
            for dep in &tests[i].depends_on {
                match &dep.target {
                    DependencyTarget::Test(id) => {
                        if let Some(&j) = by_id.get(id.as_str()) {
                            queue.push_back(j);
                        }
                    }
                    DependencyTarget::Class(class) => {
                        if let Some(members) = by_class.get(class.as_str()) {
                            queue.extend(members.iter().copied().filter(|&j| j != i));
                        }
                    }
                }
            }
        }

        tests
            .into_iter()
            .enumerate()
            .filter(|(i, _)| keep.contains(i))
            .map(|(_, t)| t)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Dependency;

    fn test(id: &str, class: &str) -> TestDescriptor {
        TestDescriptor::new(id, class, |_ctx, _cancel| async { Ok(()) })
    }

    #[test]
    fn test_empty_filter_keeps_everything() {
        let tests = vec![test("a", "A"), test("b", "B")];
        assert_eq!(TestFilter::new().apply(tests).len(), 2);
    }

    #[test]
    fn test_filter_by_category() {
        let tests = vec![test("a", "A").category("smoke"), test("b", "B")];
        let kept = TestFilter::new().category("smoke").apply(tests);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "a");
    }

    #[test]
    fn test_filter_pulls_in_dependencies() {
        let tests = vec![
            test("setup", "Infra"),
            test("unrelated", "Other"),
            test("login", "Auth").depends_on(Dependency::on_test("setup")),
            test("checkout", "Shop").depends_on(Dependency::on_class("Auth")),
        ];
        let kept = TestFilter::new().id("checkout").apply(tests);
        let ids: Vec<_> = kept.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["setup", "login", "checkout"]);
    }
}
