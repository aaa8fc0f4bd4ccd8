//! Infrastructure layer: job queueing, connectors and the transactional batch writer.

pub mod adapter;
pub mod batch_insert;
pub mod config;
pub mod connector;
pub mod jobs;
pub mod put_transaction;
pub mod sql;


pub use adapter::{AdapterError, GraphAdapter, Lifecycle};
pub use config::{AdapterOptions, ConfigError, StoreConfig};
pub use put_transaction::{BatchError, PutReport, PutTransaction};
