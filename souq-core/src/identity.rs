//! Caller identity for the engine's exposed operations.
//!
//! Role verification happens once, at the API boundary; the engine trusts a
//! pre-authorized `Caller` and only uses it for audit trails.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallerRole {
    Customer,
    Vendor,
    Admin,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Caller {
    pub id: String,
    pub role: CallerRole,
}

impl Caller {
    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: CallerRole::Admin,
        }
    }

    pub fn vendor(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: CallerRole::Vendor,
        }
    }

    pub fn customer(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: CallerRole::Customer,
        }
    }

    /// The identity used by the periodic release sweep.
    pub fn system() -> Self {
        Self {
            id: "sweep".to_string(),
            role: CallerRole::System,
        }
    }

    /// Stable string recorded in status history `actor` fields.
    pub fn audit_tag(&self) -> String {
        let role = match self.role {
            CallerRole::Customer => "CUSTOMER",
            CallerRole::Vendor => "VENDOR",
            CallerRole::Admin => "ADMIN",
            CallerRole::System => "SYSTEM",
        };
        format!("{}:{}", role, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_tag_format() {
        assert_eq!(Caller::admin("ops-1").audit_tag(), "ADMIN:ops-1");
        assert_eq!(Caller::system().audit_tag(), "SYSTEM:sweep");
    }
}
