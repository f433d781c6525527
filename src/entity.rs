use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side of a support conversation a message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Agent,
    Customer,
    Unknown,
}

/// Author ids issued to support staff in the Jira service desk.
const AGENT_AUTHOR_PREFIX: &str = "712020";
/// Portal customers are exported as `qm:<uuid>` accounts.
const CUSTOMER_AUTHOR_PREFIX: &str = "qm:";

impl Role {
    /// Resolve a role from an explicit hint (`~A`, `C`, `agent`, ...) falling back to the
    /// author identifier prefix. Pure: the same inputs always give the same role.
    pub fn resolve(author: &str, hint: Option<&str>) -> Self {
        if let Some(role) = hint.and_then(Self::from_hint) {
            return role;
        }
        Self::from_author(author)
    }

    pub fn from_hint(hint: &str) -> Option<Self> {
        match hint.trim().to_ascii_uppercase().as_str() {
            "~A" | "A" | "AGENT" => Some(Role::Agent),
            "~C" | "C" | "CUSTOMER" => Some(Role::Customer),
            "~U" | "U" | "UNKNOWN" => Some(Role::Unknown),
            _ => None,
        }
    }

    pub fn from_author(author: &str) -> Self {
        let author = author.trim().to_lowercase();
        if author.starts_with(AGENT_AUTHOR_PREFIX) {
            Role::Agent
        } else if author.starts_with(CUSTOMER_AUTHOR_PREFIX) {
            Role::Customer
        } else {
            Role::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Agent => "agent",
            Role::Customer => "customer",
            Role::Unknown => "unknown",
        }
    }

    /// Single letter used in transcripts to save prompt tokens.
    pub fn short(&self) -> &'static str {
        match self {
            Role::Agent => "A",
            Role::Customer => "C",
            Role::Unknown => "U",
        }
    }

    /// Hint written into prepared exports (`~A`, `~C`, `~U`).
    pub fn hint(&self) -> &'static str {
        match self {
            Role::Agent => "~A",
            Role::Customer => "~C",
            Role::Unknown => "~U",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
