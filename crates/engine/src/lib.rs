//! Datastore facade for Limestone
//!
//! This crate composes the durability layer into the public engine
//! surface: channel creation, recovery (`ready`), epoch switching,
//! rotation, on-demand and scheduled compaction, snapshot access and the
//! two-phase shutdown drain.

#![warn(missing_docs)]

mod background;
pub mod config;
pub mod datastore;

pub use config::DatastoreConfig;
pub use datastore::Datastore;
