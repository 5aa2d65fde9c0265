use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use warden_common::Condition;

use super::{impl_resource, ObjectMeta};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issuer {
    pub metadata: ObjectMeta,
    pub spec: IssuerSpec,
    #[serde(default)]
    pub status: IssuerStatus,
}

impl_resource!(Issuer, "Issuer", IssuerStatus);

/// Exactly one backend configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IssuerSpec {
    SelfSigned(SelfSignedIssuer),
    Ca(CaIssuer),
    Vault(VaultIssuer),
    Acme(AcmeIssuer),
}

impl IssuerSpec {
    pub fn issuer_type(&self) -> IssuerType {
        match self {
            IssuerSpec::SelfSigned(_) => IssuerType::SelfSigned,
            IssuerSpec::Ca(_) => IssuerType::Ca,
            IssuerSpec::Vault(_) => IssuerType::Vault,
            IssuerSpec::Acme(_) => IssuerType::Acme,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IssuerType {
    SelfSigned,
    Ca,
    Vault,
    Acme,
}

impl fmt::Display for IssuerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IssuerType::SelfSigned => "selfSigned",
            IssuerType::Ca => "ca",
            IssuerType::Vault => "vault",
            IssuerType::Acme => "acme",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelfSignedIssuer {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaIssuer {
    /// Secret holding `tls.crt` and `tls.key` of the signing CA
    pub secret_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultIssuer {
    /// Base URL, e.g. `https://vault.internal:8200`
    pub server: String,
    /// PKI signing path, e.g. `pki_int/sign/web`
    pub path: String,
    /// Secret holding the token under `token`
    pub token_secret_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcmeIssuer {
    /// Directory URL of the ACME server
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Secret holding the account credentials under `credentials.json`
    pub private_key_secret_name: String,
    #[serde(default)]
    pub solvers: Vec<SolverRule>,
}

/// One entry of an issuer's ordered solver list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolverRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<SolverSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http01: Option<Http01SolverConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns01: Option<Dns01SolverConfig>,
}

/// Narrows a solver rule to some identifiers. All given criteria must hold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolverSelector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_zones: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Http01SolverConfig {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dns01SolverConfig {
    /// Registered DNS provider name, e.g. `webhook`
    pub provider: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IssuerStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acme: Option<AcmeIssuerStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcmeIssuerStatus {
    /// Account URL assigned by the ACME server
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_registered_email: Option<String>,
}
