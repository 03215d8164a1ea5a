//! Fixture scopes and scope keys

use serde::{Deserialize, Serialize};
use std::fmt;

/// How widely a fixture instance is shared
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharedScope {
    /// Fresh instance per consuming test, or owned by the requiring fixture
    #[default]
    None,
    PerClass,
    PerAssembly,
    PerSession,
    /// Shared by every consumer naming the same key, for the whole session
    Keyed(String),
}

/// The concrete scope entity an instance belongs to
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeIdentity {
    Test(String),
    Class(String),
    Assembly(String),
    Session,
    Keyed(String),
    /// Exclusively owned by another fixture instance
    Owned(Box<ScopeKey>),
}

impl ScopeIdentity {
    /// The scope whose closure disposes instances of this identity
    ///
    /// Keyed instances live for the session; owned instances follow their owner.
    pub fn closing_scope(&self) -> ScopeIdentity {
        match self {
            ScopeIdentity::Keyed(_) => ScopeIdentity::Session,
            ScopeIdentity::Owned(owner) => owner.scope.closing_scope(),
            other => other.clone(),
        }
    }
}

impl fmt::Display for ScopeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeIdentity::Test(id) => write!(f, "test {id}"),
            ScopeIdentity::Class(class) => write!(f, "class {class}"),
            ScopeIdentity::Assembly(asm) => write!(f, "assembly {asm}"),
            ScopeIdentity::Session => write!(f, "session"),
            ScopeIdentity::Keyed(key) => write!(f, "key {key}"),
            ScopeIdentity::Owned(owner) => write!(f, "owned by {owner}"),
        }
    }
}

/// Identity under which a fixture instance is deduplicated
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeKey {
    pub fixture: String,
    pub scope: ScopeIdentity,
}

impl ScopeKey {
    pub fn new(fixture: impl Into<String>, scope: ScopeIdentity) -> Self {
        Self {
            fixture: fixture.into(),
            scope,
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.fixture, self.scope)
    }
}

/// A declared need for a fixture, bound to a name in the consumer's context
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureRequirement {
    /// Binding name the consumer looks the instance up by
    pub name: String,
    /// Registered fixture type
    pub fixture: String,
    #[serde(default)]
    pub scope: SharedScope,
}

impl FixtureRequirement {
    pub fn new(name: impl Into<String>, fixture: impl Into<String>, scope: SharedScope) -> Self {
        Self {
            name: name.into(),
            fixture: fixture.into(),
            scope,
        }
    }

    /// Bind under the fixture type's own name
    pub fn of(fixture: impl Into<String>, scope: SharedScope) -> Self {
        let fixture = fixture.into();
        Self::new(fixture.clone(), fixture, scope)
    }
}

/// Who is asking for a fixture
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Consumer {
    Test {
        id: String,
        class: String,
        assembly: String,
    },
    Fixture(ScopeKey),
}

impl Consumer {
    pub fn test(id: impl Into<String>, class: impl Into<String>, assembly: impl Into<String>) -> Self {
        Consumer::Test {
            id: id.into(),
            class: class.into(),
            assembly: assembly.into(),
        }
    }

    /// Label used in the consumer reference set
    pub fn label(&self) -> String {
        match self {
            Consumer::Test { id, .. } => format!("test:{id}"),
            Consumer::Fixture(key) => format!("fixture:{key}"),
        }
    }

    /// Class and assembly of a test consumer
    fn test_scope(&self) -> Option<(&str, &str)> {
        match self {
            Consumer::Test {
                class, assembly, ..
            } => Some((class, assembly)),
            Consumer::Fixture(_) => None,
        }
    }

    /// Resolve the scope key for `requirement` requested by this consumer
    ///
    /// `root` is the test whose request started the chain; nested fixtures
    /// resolve class/assembly scopes against it.
    pub fn scope_key(&self, requirement: &FixtureRequirement, root: &Consumer) -> ScopeKey {
        let (class, assembly) = root.test_scope().unwrap_or(("", ""));
        let scope = match &requirement.scope {
            SharedScope::None => match self {
                Consumer::Test { id, .. } => ScopeIdentity::Test(id.clone()),
                Consumer::Fixture(owner) => ScopeIdentity::Owned(Box::new(owner.clone())),
            },
            SharedScope::PerClass => ScopeIdentity::Class(class.to_string()),
            SharedScope::PerAssembly => ScopeIdentity::Assembly(assembly.to_string()),
            SharedScope::PerSession => ScopeIdentity::Session,
            SharedScope::Keyed(key) => ScopeIdentity::Keyed(key.clone()),
        };
        ScopeKey::new(requirement.fixture.clone(), scope)
    }
}
