//! Subject key generation and the per-request input tuple.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Caller classification carrying a default policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalTier {
    Unauthenticated,
    User,
    Agent,
    Premium,
}

impl PrincipalTier {
    pub const ALL: [PrincipalTier; 4] = [
        PrincipalTier::Unauthenticated,
        PrincipalTier::User,
        PrincipalTier::Agent,
        PrincipalTier::Premium,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PrincipalTier::Unauthenticated => "unauthenticated",
            PrincipalTier::User => "user",
            PrincipalTier::Agent => "agent",
            PrincipalTier::Premium => "premium",
        }
    }
}

impl fmt::Display for PrincipalTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrincipalTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PrincipalTier::ALL
            .into_iter()
            .find(|tier| tier.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown tier `{}`", s))
    }
}

/// What the middleware layer hands the limiter for each request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectInput {
    /// Authenticated caller id, or an IP-derived id for anonymous traffic.
    pub principal_id: String,
    pub principal_tier: PrincipalTier,
    #[serde(default)]
    pub service_tag: Option<String>,
    #[serde(default)]
    pub endpoint_tag: Option<String>,
    /// Relative weight of this request; `None` counts as one.
    #[serde(default)]
    pub request_cost_hint: Option<f64>,
}

impl SubjectInput {
    pub fn new(principal_id: impl Into<String>, principal_tier: PrincipalTier) -> Self {
        Self {
            principal_id: principal_id.into(),
            principal_tier,
            service_tag: None,
            endpoint_tag: None,
            request_cost_hint: None,
        }
    }

    /// Identify an unauthenticated caller by client address.
    pub fn anonymous(ip: impl fmt::Display) -> Self {
        Self::new(format!("ip:{}", ip), PrincipalTier::Unauthenticated)
    }

    pub fn with_service(mut self, service_tag: impl Into<String>) -> Self {
        self.service_tag = Some(service_tag.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint_tag: impl Into<String>) -> Self {
        self.endpoint_tag = Some(endpoint_tag.into());
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.request_cost_hint = Some(cost);
        self
    }

    pub fn subject(&self) -> RateLimitSubject {
        RateLimitSubject::new(
            &self.principal_id,
            self.service_tag.as_deref(),
            self.endpoint_tag.as_deref(),
        )
    }

    pub fn cost_hint(&self) -> f64 {
        self.request_cost_hint.unwrap_or(1.0)
    }
}

/// A key that uniquely identifies what is being limited.
///
/// Subjects are never stored on their own; they only name counters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RateLimitSubject {
    pub principal_id: String,
    pub service_tag: String,
    pub endpoint_tag: String,
}

impl RateLimitSubject {
    pub fn new(principal_id: &str, service_tag: Option<&str>, endpoint_tag: Option<&str>) -> Self {
        Self {
            principal_id: principal_id.to_string(),
            service_tag: service_tag.unwrap_or_default().to_string(),
            endpoint_tag: endpoint_tag.unwrap_or_default().to_string(),
        }
    }

    /// Convert the subject to a string representation.
    ///
    /// `|` separates the parts; occurrences inside a part are escaped so two
    /// different subjects never share a key.
    pub fn to_string_key(&self) -> String {
        format!(
            "{}|{}|{}",
            escape(&self.principal_id),
            escape(&self.service_tag),
            escape(&self.endpoint_tag)
        )
    }
}

fn escape(part: &str) -> String {
    part.replace('\\', "\\\\").replace('|', "\\|")
}

impl fmt::Display for RateLimitSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
