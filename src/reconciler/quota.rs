//! Per-user quota admission.

use std::collections::HashMap;

use crate::domain::{QuotaDimension, ResourceSpec, ResourceUsage, UserId, UserQuota};

/// A rejected admission, naming the exceeded dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaViolation {
    pub dimension: QuotaDimension,
    pub limit: u64,
}

impl QuotaViolation {
    /// Caller-facing message naming the exceeded dimension.
    #[must_use]
    pub fn message(&self) -> String {
        match self.dimension {
            QuotaDimension::Memory => format!(
                "memory quota exceeded (limit {} bytes)",
                self.limit
            ),
            QuotaDimension::Cpu => {
                format!("cpu quota exceeded (limit {}m)", self.limit)
            }
            QuotaDimension::Sessions => {
                format!("session quota exceeded (limit {})", self.limit)
            }
        }
    }
}

/// Quota source: a global default plus per-user overrides from config.
#[derive(Debug, Clone, Default)]
pub struct QuotaPolicy {
    default_quota: UserQuota,
    overrides: HashMap<String, UserQuota>,
}

impl QuotaPolicy {
    #[must_use]
    pub fn new(default_quota: UserQuota, overrides: HashMap<String, UserQuota>) -> Self {
        Self {
            default_quota,
            overrides,
        }
    }

    #[must_use]
    pub fn quota_for(&self, user: &UserId) -> UserQuota {
        self.overrides
            .get(user.as_str())
            .copied()
            .unwrap_or(self.default_quota)
    }

    /// Admission check for one new session request.
    pub fn check(
        &self,
        user: &UserId,
        used: &ResourceUsage,
        request: &ResourceSpec,
    ) -> Result<(), QuotaViolation> {
        let quota = self.quota_for(user);
        quota.admit(used, request).map_err(|dimension| {
            let limit = match dimension {
                QuotaDimension::Cpu => quota.max_cpu_millis,
                QuotaDimension::Memory => quota.max_memory_bytes,
                QuotaDimension::Sessions => quota.max_sessions,
            };
            QuotaViolation { dimension, limit }
        })
    }
}
