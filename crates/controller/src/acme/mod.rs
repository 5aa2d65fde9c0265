//! ACME protocol access and challenge solver selection.
//!
//! - [`AcmeClient`] is the single-request protocol seam the controllers use
//! - [`InstantAcmeClient`] implements it over `instant-acme`
//! - [`select_solver`] picks the solver rule for an authorization

mod client;
mod instant;
mod selection;

pub use client::{
    AccountHandle, AcmeClient, AcmeClientError, AuthorizationDetails, AuthorizationState,
    ChallengeDetails, OrderDetails, RATE_LIMITED_PROBLEM,
};
pub use instant::InstantAcmeClient;
pub use selection::{rule_type, select_solver};
