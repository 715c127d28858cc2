//! Lens module
//!
//! This module provides the business logic of the enrichment runtime on top of
//! the database layer.
//!
//! | Lens | Purpose |
//! |------|---------|
//! | `LookupBatcher` | Bounded-concurrency bundle lookups of many IPs |
//! | `Ip2GeoProcessor` | Per-record enrichment, built by `Ip2GeoProcessorFactory` |
//! | `Ip2GeoLockService` | Datasource locks for the refresh job |
//!
//! # Architecture
//!
//! Each lens module exports:
//! - A **Lens struct** - the main entry point for its operations
//! - **Args structs** - input arguments with `with_*` builders
//!
//! # Usage
//!
//! ```rust,ignore
//! use ip2geo::lens::lookup::{BatchLookupArgs, LookupBatcher};
//! use ip2geo::lens::processor::{CreateMode, Document, Ip2GeoProcessorFactory};
//! use ip2geo::lens::lock::Ip2GeoLockService;
//! ```

pub mod lock;
pub mod lookup;
pub mod processor;
