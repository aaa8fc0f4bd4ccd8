//! `graphstore-core`: domain primitives for the key/field/value graph store.
//!
//! This crate contains **pure domain** types (no IO, no async): node mutations,
//! stored nodes, the value wire encoding and the validated table prefix.

pub mod error;
pub mod node;
pub mod table;
pub mod value;

pub use error::{DomainError, DomainResult};
pub use node::{MAX_KEY_LEN, NodeMutation, StoredNode};
pub use table::TablePrefix;
pub use value::{NodeValue, ValueType};
