//! GraphSync Core - Domain logic and reconciliation contracts
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain entities** - `Record`, `RecordGroup`, `Permission`, `SyncPoint`, `SyncPass`
//! - **Pure domain logic** - `FingerprintResolver`, `PermissionResolver`
//! - **Port definitions** - Traits for adapters: `IObjectLister`, `IGraphSyncStore`, `ISyncTransaction`
//! - **Configuration** - YAML-backed daemon and engine settings
//!
//! # Architecture
//!
//! This crate follows the hexagonal (ports & adapters) architecture pattern.
//! The domain module contains pure business logic with no I/O.
//! Ports define trait interfaces that adapter crates implement; the
//! reconciliation engine in `graphsync-sync` drives them.

pub mod config;
pub mod domain;
pub mod ports;
