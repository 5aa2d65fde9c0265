//! Warden certificate controller.
//!
//! Reconciles declarative certificate resources into issued key pairs:
//!
//! - **Issuers**: self-signed, CA, Vault and ACME backends behind one trait
//! - **Certificates**: renewal scheduling, key rotation, secret management
//! - **ACME**: orders, challenges, HTTP-01 and DNS-01 solvers with self-checks
//! - **Runtime**: a work queue per kind, bounded passes, status writes only on change
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use warden_controller::{run_all, Context, ControllerOptions, MemoryStore};
//!
//! let store = Arc::new(MemoryStore::new());
//! let context = Arc::new(Context::new(store, acme, solvers, recorder, &config));
//! run_all(context, ControllerOptions::default(), shutdown).await;
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod acme;
pub mod api;
pub mod controller;
pub mod controllers;
pub mod events;
pub mod issuers;
pub mod pki;
pub mod queue;
pub mod renewal;
pub mod solver;
pub mod status;
pub mod store;

#[cfg(test)]
mod testing;

// ============================================================================
// Public API Re-exports
// ============================================================================

pub use controller::{Action, Controller, ControllerOptions, ReconcileError, Reconciler};
pub use controllers::{run_all, Context, PassError, Timing};
pub use events::{EventRecorder, MemoryRecorder, TracingRecorder};
pub use store::{Api, MemoryStore, ResourceStore, StoreError};
