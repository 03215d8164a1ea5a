use std::cmp::Reverse;
use std::future::Future;
use std::sync::Arc;

use super::{HookPhase, HookScopeKind, HookTarget};
use crate::invoke::{invokable, CancellationToken, Invokable, InvokeContext, InvokeOutcome};

/// A named, ordered hook body
#[derive(Clone)]
pub struct Hook {
    pub name: String,
    pub order: i32,
    pub invoker: Arc<dyn Invokable>,
}

impl Hook {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(InvokeContext, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = InvokeOutcome> + Send + 'static,
    {
        Self::with_invokable(name, invokable(f))
    }

    pub fn with_invokable(name: impl Into<String>, invoker: Arc<dyn Invokable>) -> Self {
        Self {
            name: name.into(),
            order: 0,
            invoker,
        }
    }

    /// Lower orders run first within a scope and phase
    pub fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }
}

impl std::fmt::Debug for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hook")
            .field("name", &self.name)
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
struct Registration {
    kind: HookScopeKind,
    phase: HookPhase,
    target: HookTarget,
    hook: Hook,
}

/// Hooks bound by the discovery collaborator
#[derive(Clone, Debug, Default)]
pub struct HookRegistry {
    registrations: Vec<Registration>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        kind: HookScopeKind,
        phase: HookPhase,
        target: HookTarget,
        hook: Hook,
    ) -> &mut Self {
        self.registrations.push(Registration {
            kind,
            phase,
            target,
            hook,
        });
        self
    }

    pub fn before(mut self, kind: HookScopeKind, target: HookTarget, hook: Hook) -> Self {
        self.register(kind, HookPhase::Before, target, hook);
        self
    }

    pub fn after(mut self, kind: HookScopeKind, target: HookTarget, hook: Hook) -> Self {
        self.register(kind, HookPhase::After, target, hook);
        self
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Hooks of one kind and phase covering a test's class and assembly
    ///
    /// Within a target tier hooks are ordered by `order`, then registration.
    /// Before hooks run the broadest target first; after hooks the narrowest.
    pub fn hooks_for(
        &self,
        kind: HookScopeKind,
        phase: HookPhase,
        class: &str,
        assembly: &str,
    ) -> Vec<Hook> {
        let max_tier = match kind {
            HookScopeKind::Session => 0,
            HookScopeKind::Assembly => 1,
            HookScopeKind::Class | HookScopeKind::Test => 2,
        };

        let mut matched: Vec<(u8, i32, usize, &Hook)> = self
            .registrations
            .iter()
            .enumerate()
            .filter(|(_, r)| r.kind == kind && r.phase == phase)
            .filter_map(|(seq, r)| {
                r.target
                    .tier(class, assembly)
                    .filter(|tier| *tier <= max_tier)
                    .map(|tier| (tier, r.hook.order, seq, &r.hook))
            })
            .collect();

        match phase {
            HookPhase::Before => matched.sort_by_key(|(tier, order, seq, _)| (*tier, *order, *seq)),
            HookPhase::After => {
                matched.sort_by_key(|(tier, order, seq, _)| (Reverse(*tier), *order, *seq))
            }
        }

        matched.into_iter().map(|(.., hook)| hook.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(name: &str) -> Hook {
        Hook::new(name, |_ctx, _cancel| async { Ok(()) })
    }

    fn names(hooks: Vec<Hook>) -> Vec<String> {
        hooks.into_iter().map(|h| h.name).collect()
    }

    #[test]
    fn test_order_then_registration() {
        let registry = HookRegistry::new()
            .before(HookScopeKind::Class, HookTarget::Everywhere, noop("late").order(10))
            .before(HookScopeKind::Class, HookTarget::Everywhere, noop("first"))
            .before(HookScopeKind::Class, HookTarget::Everywhere, noop("second"))
            .after(HookScopeKind::Class, HookTarget::Everywhere, noop("teardown"));

        assert_eq!(
            names(registry.hooks_for(HookScopeKind::Class, HookPhase::Before, "C", "A")),
            vec!["first", "second", "late"]
        );
        assert_eq!(
            names(registry.hooks_for(HookScopeKind::Class, HookPhase::After, "C", "A")),
            vec!["teardown"]
        );
    }

    #[test]
    fn test_level_hooks_nest_by_target() {
        let registry = HookRegistry::new()
            .before(HookScopeKind::Test, HookTarget::Class("C".into()), noop("class"))
            .before(HookScopeKind::Test, HookTarget::Everywhere, noop("global"))
            .before(HookScopeKind::Test, HookTarget::Assembly("A".into()), noop("assembly"))
            .before(HookScopeKind::Test, HookTarget::Class("Other".into()), noop("other"))
            .after(HookScopeKind::Test, HookTarget::Everywhere, noop("global"))
            .after(HookScopeKind::Test, HookTarget::Class("C".into()), noop("class"));

        assert_eq!(
            names(registry.hooks_for(HookScopeKind::Test, HookPhase::Before, "C", "A")),
            vec!["global", "assembly", "class"]
        );
        assert_eq!(
            names(registry.hooks_for(HookScopeKind::Test, HookPhase::After, "C", "A")),
            vec!["class", "global"]
        );
    }

    #[test]
    fn test_session_hooks_ignore_narrow_targets() {
        let registry = HookRegistry::new()
            .before(HookScopeKind::Session, HookTarget::Everywhere, noop("boot"))
            .before(HookScopeKind::Session, HookTarget::Class("C".into()), noop("misplaced"));

        assert_eq!(
            names(registry.hooks_for(HookScopeKind::Session, HookPhase::Before, "C", "A")),
            vec!["boot"]
        );
    }
}
