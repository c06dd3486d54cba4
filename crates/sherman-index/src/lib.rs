//! Index A: a hierarchical-lock (GLT/LLT) B+-tree client with two-level
//! optimistic versioning, a hopscotch leaf overlay, and request delegation.

pub mod delegation;
pub mod hopscotch;
pub mod index;
pub mod locks;

pub use delegation::{CollisionPolicy as DelegationCollisionPolicy, DelegationStats, DelegationTable};
pub use index::{make_delegation_table, Sherman};
