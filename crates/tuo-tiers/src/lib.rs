//! TUO Tiers - Tier capability table and resolver
//!
//! Static configuration mapping every subscription tier to its features,
//! limits and prices, plus the resolver that turns a tier change into the
//! list of data transforms a migration must apply.
//!
//! # Example
//!
//! ```rust
//! use tuo_tiers::{Tier, TierResolver};
//!
//! let resolver = TierResolver::builtin();
//! let diff = resolver.diff(Tier::Starter, Tier::Professional).unwrap();
//! assert!(!diff.added_features.is_empty());
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod capability;
pub mod error;
pub mod resolver;
pub mod tier;

pub use capability::{FeatureId, Limits, TierCapabilitySet, TierDefinition};
pub use error::TierConfigError;
pub use resolver::{ChangeDirection, DataTransform, TierDiff, TierResolver};
pub use tier::{BillingInterval, Tier};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
