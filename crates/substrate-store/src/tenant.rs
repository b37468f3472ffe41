use std::path::{Path, PathBuf};
use std::{env, fs};

use crate::error::{Result, StoreError};
use crate::store::Store;

/// Default base directory for tenant databases.
pub fn default_base_dir() -> PathBuf {
    dirs_home().join(".substrate")
}

fn dirs_home() -> PathBuf {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Tenant names become file names, so only a conservative alphabet is
/// accepted.
pub fn validate_tenant(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidData(format!(
            "invalid tenant name '{name}': use 1-64 of [A-Za-z0-9._-], not starting with '.'"
        )))
    }
}

/// Resolves and opens per-tenant databases under one base directory:
/// `<base>/tenants/<tenant>.db`.
#[derive(Clone, Debug)]
pub struct TenantDirectory {
    base: PathBuf,
}

impl TenantDirectory {
    /// `base_dir` overrides the default location (tests, `SUBSTRATE_DATA_DIR`).
    pub fn new(base_dir: Option<&Path>) -> Self {
        Self {
            base: base_dir.map(PathBuf::from).unwrap_or_else(default_base_dir),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn tenants_dir(&self) -> PathBuf {
        self.base.join("tenants")
    }

    pub fn db_path(&self, tenant: &str) -> Result<PathBuf> {
        validate_tenant(tenant)?;
        Ok(self.tenants_dir().join(format!("{tenant}.db")))
    }

    /// Open (creating if needed) the database for `tenant`.
    pub fn open(&self, tenant: &str) -> Result<Store> {
        let dir = self.tenants_dir();
        fs::create_dir_all(&dir).map_err(|e| {
            StoreError::InvalidData(format!("failed to create {}: {e}", dir.display()))
        })?;
        let path = self.db_path(tenant)?;
        let store = Store::open(&path)?;
        if store.get_metadata("tenant")?.is_none() {
            store.set_metadata("tenant", tenant)?;
            tracing::info!(tenant, path = %path.display(), "created tenant database");
        }
        Ok(store)
    }

    /// Tenants with a database on disk, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let dir = self.tenants_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&dir).map_err(|e| {
            StoreError::InvalidData(format!("failed to read {}: {e}", dir.display()))
        })?;
        let mut tenants: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "db") {
                    path.file_stem()
                        .and_then(|s| s.to_str())
                        .map(str::to_string)
                } else {
                    None
                }
            })
            .filter(|name| validate_tenant(name).is_ok())
            .collect();
        tenants.sort();
        Ok(tenants)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_tenant() {
        for good in ["alice", "team-7", "a.b_c"] {
            assert!(validate_tenant(good).is_ok(), "{good}");
        }
        for bad in ["", ".hidden", "../escape", "a/b", "with space"] {
            assert!(validate_tenant(bad).is_err(), "{bad}");
        }
        assert!(validate_tenant(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_open_creates_and_lists() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = TenantDirectory::new(Some(tmp.path()));
        assert!(dir.list().unwrap().is_empty());

        dir.open("bob").unwrap();
        dir.open("alice").unwrap();

        assert_eq!(dir.list().unwrap(), vec!["alice", "bob"]);
        assert!(tmp.path().join("tenants").join("alice.db").exists());
        let store = dir.open("alice").unwrap();
        assert_eq!(store.get_metadata("tenant").unwrap().as_deref(), Some("alice"));
    }

    #[test]
    fn test_db_path_rejects_traversal() {
        let dir = TenantDirectory::new(Some(Path::new("/tmp/unused")));
        assert!(dir.db_path("../etc").is_err());
    }
}
