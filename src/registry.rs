//! # Tenant Registry
//!
//! Maps mount paths (segment 0 of a route) to mounted databases. A path is
//! bound at most once; mounting onto a taken path is an error rather than a
//! silent replacement, so a client can never end up talking to a different
//! database than the one it was talking to a moment ago.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::api::Qdb;
use crate::types::RouteAlias;
use crate::{Error, Result};

/// A database bound to a routable path.
pub struct MountedDatabase {
    pub mount_path: String,
    pub database: Qdb,
    pub route_aliases: Vec<RouteAlias>,
}

impl MountedDatabase {
    /// The alias registered for `path`, if any.
    pub fn alias(&self, path: &str) -> Option<&RouteAlias> {
        self.route_aliases.iter().find(|a| a.path == path)
    }
}

/// Mount path → database.
#[derive(Default)]
pub struct TenantRegistry {
    mounts: RwLock<HashMap<String, Arc<MountedDatabase>>>,
}

impl TenantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mounts `database` under `alias`, or under its own name.
    ///
    /// # Errors
    ///
    /// [`Error::DatabaseAlreadyMounted`] if the path is taken.
    pub fn mount(
        &self,
        database: Qdb,
        alias: Option<&str>,
        route_aliases: Vec<RouteAlias>,
    ) -> Result<Arc<MountedDatabase>> {
        let mount_path = alias.unwrap_or(database.name()).to_string();

        let mut mounts = self.mounts.write();
        if mounts.contains_key(&mount_path) {
            return Err(Error::DatabaseAlreadyMounted(mount_path));
        }

        let mounted = Arc::new(MountedDatabase {
            mount_path: mount_path.clone(),
            database,
            route_aliases,
        });
        mounts.insert(mount_path.clone(), Arc::clone(&mounted));
        info!(mount_path = %mount_path, database = %mounted.database.name(), "database mounted");
        Ok(mounted)
    }

    /// # Errors
    ///
    /// [`Error::DatabaseNotFound`] if nothing is mounted at `path`.
    pub fn resolve(&self, path: &str) -> Result<Arc<MountedDatabase>> {
        self.mounts
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::DatabaseNotFound(path.to_string()))
    }

    /// Removes a mount and shuts its database down.
    pub async fn unmount(&self, path: &str) -> Result<()> {
        let removed = self
            .mounts
            .write()
            .remove(path)
            .ok_or_else(|| Error::DatabaseNotFound(path.to_string()))?;
        removed.database.shutdown().await;
        info!(mount_path = path, "database unmounted");
        Ok(())
    }

    /// Mounted paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.mounts.read().keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.mounts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.read().is_empty()
    }

    /// Unmounts everything, shutting each database down.
    pub async fn shutdown_all(&self) {
        let drained: Vec<Arc<MountedDatabase>> = self.mounts.write().drain().map(|(_, m)| m).collect();
        for mounted in drained {
            mounted.database.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mount_and_resolve() {
        let registry = TenantRegistry::new();
        let db = Qdb::open_in_memory("shop").await.unwrap();

        registry.mount(db, None, vec![RouteAlias::new("reports")]).unwrap();

        let mounted = registry.resolve("shop").expect("should resolve");
        assert_eq!(mounted.mount_path, "shop");
        assert!(mounted.alias("reports").is_some());
        assert!(mounted.alias("orders").is_none());

        assert!(matches!(registry.resolve("blog"), Err(Error::DatabaseNotFound(p)) if p == "blog"));
    }

    #[tokio::test]
    async fn test_mount_under_alias() {
        let registry = TenantRegistry::new();
        let db = Qdb::open_in_memory("shop").await.unwrap();

        registry.mount(db, Some("store"), vec![]).unwrap();
        assert_eq!(registry.paths(), vec!["store"]);
        assert!(registry.resolve("shop").is_err());
    }

    #[tokio::test]
    async fn test_duplicate_mount_rejected() {
        let registry = TenantRegistry::new();
        registry
            .mount(Qdb::open_in_memory("shop").await.unwrap(), None, vec![])
            .unwrap();

        let second = Qdb::open_in_memory("shop").await.unwrap();
        let err = registry.mount(second, None, vec![]).err().expect("should reject");
        assert!(matches!(err, Error::DatabaseAlreadyMounted(p) if p == "shop"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_unmount_shuts_down() {
        let registry = TenantRegistry::new();
        let db = Qdb::open_in_memory("shop").await.unwrap();
        registry.mount(db.clone(), None, vec![]).unwrap();

        registry.unmount("shop").await.unwrap();
        assert!(registry.is_empty());
        assert!(matches!(db.job("x").await, Err(Error::StorageClosed(_))));
        assert!(registry.unmount("shop").await.is_err());
    }
}
