//! ACME Order and Challenge resources.
//!
//! An Order is owned by the CertificateRequest it serves and a Challenge by
//! its Order, so deleting a request tears the whole tree down.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use warden_common::IssuerRef;

use super::{impl_resource, ObjectMeta, SolverRule};

// ============================================================================
// Order
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub metadata: ObjectMeta,
    pub spec: OrderSpec,
    #[serde(default)]
    pub status: OrderStatus,
}

impl_resource!(Order, "Order", OrderStatus);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSpec {
    /// PEM CSR copied from the request
    pub request: String,
    pub dns_names: Vec<String>,
    pub issuer_ref: IssuerRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderState {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
    /// Failed on our side (no usable solver, unparseable CSR)
    Errored,
}

impl OrderState {
    pub fn is_failed(self) -> bool {
        matches!(self, OrderState::Invalid | OrderState::Errored)
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OrderState::Pending => "pending",
            OrderState::Ready => "ready",
            OrderState::Processing => "processing",
            OrderState::Valid => "valid",
            OrderState::Invalid => "invalid",
            OrderState::Errored => "errored",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatus {
    /// Order URL; once set, the order is only ever re-fetched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalize_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<OrderState>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authorizations: Vec<AuthorizationRecord>,
    /// PEM chain downloaded after the order became valid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_time: Option<DateTime<Utc>>,
}

impl OrderStatus {
    /// Valid with a certificate, or failed.
    pub fn is_terminal(&self) -> bool {
        match self.state {
            Some(OrderState::Valid) => self.certificate.is_some(),
            Some(state) => state.is_failed(),
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationRecord {
    pub url: String,
    pub identifier: String,
    #[serde(default)]
    pub wildcard: bool,
    pub initial_state: String,
}

// ============================================================================
// Challenge
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    pub metadata: ObjectMeta,
    pub spec: ChallengeSpec,
    #[serde(default)]
    pub status: ChallengeStatus,
}

impl_resource!(Challenge, "Challenge", ChallengeStatus);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChallengeType {
    #[serde(rename = "http-01")]
    Http01,
    #[serde(rename = "dns-01")]
    Dns01,
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChallengeType::Http01 => f.write_str("http-01"),
            ChallengeType::Dns01 => f.write_str("dns-01"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeSpec {
    /// Challenge URL, used to accept it
    pub url: String,
    pub authorization_url: String,
    pub order_url: String,
    /// Identifier being validated, without any `*.` prefix
    pub dns_name: String,
    #[serde(default)]
    pub wildcard: bool,
    #[serde(rename = "type")]
    pub type_: ChallengeType,
    pub token: String,
    /// Key authorization for the token
    pub key: String,
    /// Solver rule selected for this challenge
    pub solver: SolverRule,
    pub issuer_ref: IssuerRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeState {
    Pending,
    Processing,
    Valid,
    Invalid,
}

impl ChallengeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChallengeState::Valid | ChallengeState::Invalid)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeStatus {
    /// Still being worked on; false once terminal and cleaned up
    #[serde(default)]
    pub processing: bool,
    /// Solver artifacts are currently in place
    #[serde(default)]
    pub presented: bool,
    /// Accepted at the ACME server
    #[serde(default)]
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ChallengeState>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default)]
    pub self_check_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presented_at: Option<DateTime<Utc>>,
}

impl ChallengeStatus {
    pub fn is_terminal(&self) -> bool {
        self.state.is_some_and(ChallengeState::is_terminal)
    }
}
