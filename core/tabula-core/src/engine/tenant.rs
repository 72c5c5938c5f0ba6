//! Tenant resolution
//!
//! Maps a tenant id to the backing-store resource that holds its tables.

use crate::error::{TabulaError, TabulaResult};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantInfo {
    /// Backing-store resource (workbook, base, ...) of the tenant
    pub resource_id: String,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

impl TenantInfo {
    pub fn new(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            enabled: true,
        }
    }
}

#[async_trait]
pub trait TenantResolver: Send + Sync + 'static {
    /// Unknown tenants are `TenantNotFound`, disabled ones `TenantDisabled`.
    async fn resolve(&self, tenant: &str) -> TabulaResult<TenantInfo>;
}

/// In-process tenant table.
#[derive(Debug, Default)]
pub struct StaticTenantRegistry {
    tenants: DashMap<String, TenantInfo>,
}

impl StaticTenantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenant(self, tenant: impl Into<String>, info: TenantInfo) -> Self {
        self.register(tenant, info);
        self
    }

    pub fn register(&self, tenant: impl Into<String>, info: TenantInfo) {
        self.tenants.insert(tenant.into(), info);
    }

    /// Returns whether the tenant existed.
    pub fn set_enabled(&self, tenant: &str, enabled: bool) -> bool {
        match self.tenants.get_mut(tenant) {
            Some(mut info) => {
                info.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, tenant: &str) -> Option<TenantInfo> {
        self.tenants.remove(tenant).map(|(_, info)| info)
    }

    /// Loads `{"tenant": {"resource_id": "...", "enabled": true}, ...}`.
    pub fn from_json_str(json: &str) -> TabulaResult<Self> {
        let map: std::collections::BTreeMap<String, TenantInfo> = serde_json::from_str(json)?;
        let registry = Self::new();
        for (tenant, info) in map {
            registry.register(tenant, info);
        }
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }
}

#[async_trait]
impl TenantResolver for StaticTenantRegistry {
    async fn resolve(&self, tenant: &str) -> TabulaResult<TenantInfo> {
        let info = self
            .tenants
            .get(tenant)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TabulaError::TenantNotFound(tenant.to_string()))?;
        if !info.enabled {
            return Err(TabulaError::TenantDisabled(tenant.to_string()));
        }
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve() {
        let registry = StaticTenantRegistry::new()
            .with_tenant("acme", TenantInfo::new("wb-acme"))
            .with_tenant("globex", TenantInfo::new("wb-globex"));
        assert_eq!(registry.resolve("acme").await.unwrap().resource_id, "wb-acme");

        assert!(registry.set_enabled("globex", false));
        assert!(matches!(
            registry.resolve("globex").await,
            Err(TabulaError::TenantDisabled(_))
        ));
        assert!(matches!(
            registry.resolve("initech").await,
            Err(TabulaError::TenantNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_from_json() {
        let registry = StaticTenantRegistry::from_json_str(
            r#"{"acme": {"resource_id": "wb-1"}, "old": {"resource_id": "wb-2", "enabled": false}}"#,
        )
        .unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.resolve("acme").await.is_ok());
        assert!(registry.resolve("old").await.is_err());
    }
}
