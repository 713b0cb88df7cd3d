//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! hexagonal architecture. Ports are interfaces that the reconciliation
//! engine depends on, but whose implementations live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`IObjectLister`] - Paginated crawling of a provider container
//! - [`IGraphSyncStore`] - Persistent record graph, sync points and passes
//! - [`ISyncTransaction`] - Atomic batch writes against the store

pub mod graph_store;
pub mod object_lister;

pub use graph_store::{IGraphSyncStore, ISyncTransaction, RecordWrite};
pub use object_lister::{ChangePage, IObjectLister, ListingPage, ProviderError};
