//! Fixture lifecycle management
//!
//! Fixtures are shared resource instances requested by tests or by other
//! fixtures. The [`FixtureRegistry`] resolves a requirement to a scope key,
//! initializes each key at most once, and disposes instances when their
//! scope closes.

mod definition;
mod registry;
mod scope;

pub use definition::{FixtureCatalog, FixtureContext, FixtureDefinition};
pub use registry::{AcquireFailure, AcquiredFixtures, FixtureRegistry, FixtureState};
pub use scope::{Consumer, FixtureRequirement, ScopeIdentity, ScopeKey, SharedScope};
