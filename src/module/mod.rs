//! Deployed-module records.
//!
//! A [`TargetModule`] remembers one successful distribute/redeploy: which
//! backend module id landed on which target of which instance, when, from
//! which content directory, and under which context root. The records are
//! persisted as small JSON files so the next deployment session can triage
//! incremental redeploys across restarts. The store is a cache, never a
//! source of truth: losing it degrades to "not deployed".

use crate::error::{Error, Result};
use crate::plugin::ModuleRef;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Lazily resolved backend handle of a deployed module.
///
/// Forwarding operations fail explicitly while unresolved instead of
/// panicking on a missing handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delegate {
    /// No backend handle bound yet
    Unresolved,
    /// Backend handle bound after a successful deployment or lookup
    Resolved(ModuleRef),
}

/// Record of one module deployed to one target of one instance.
///
/// Identity is the (module id, instance URL, target name) triple.
#[derive(Debug, Clone)]
pub struct TargetModule {
    id: String,
    instance_url: String,
    target_name: String,
    timestamp_millis: u64,
    content_dir: PathBuf,
    context_root: String,
    delegate: Delegate,
}

impl TargetModule {
    /// Create a record with an unresolved delegate
    pub fn new(
        id: impl Into<String>,
        instance_url: impl Into<String>,
        target_name: impl Into<String>,
        timestamp_millis: u64,
        content_dir: impl Into<PathBuf>,
        context_root: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            instance_url: instance_url.into(),
            target_name: target_name.into(),
            timestamp_millis,
            content_dir: content_dir.into(),
            context_root: context_root.into(),
            delegate: Delegate::Unresolved,
        }
    }

    /// Backend module id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// URL of the owning server instance
    pub fn instance_url(&self) -> &str {
        &self.instance_url
    }

    /// Name of the target the module was deployed to
    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// Milliseconds since the epoch of the last successful deployment
    pub fn timestamp_millis(&self) -> u64 {
        self.timestamp_millis
    }

    /// Content directory the deployment was diffed against
    pub fn content_dir(&self) -> &Path {
        &self.content_dir
    }

    /// Context root recorded at deployment time
    pub fn context_root(&self) -> &str {
        &self.context_root
    }

    /// Stamp a fresh deployment time
    pub fn touch(&mut self) {
        self.timestamp_millis = now_millis();
    }

    /// Bind the backend handle
    pub fn resolve(&mut self, module: ModuleRef) {
        self.delegate = Delegate::Resolved(module);
    }

    /// Whether the backend handle is bound
    pub fn is_resolved(&self) -> bool {
        matches!(self.delegate, Delegate::Resolved(_))
    }

    /// The bound backend handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotResolved`] when no handle is bound; a record read
    /// back from disk stays unresolved until the next triage binds it.
    pub fn delegate(&self) -> Result<&ModuleRef> {
        match &self.delegate {
            Delegate::Resolved(module) => Ok(module),
            Delegate::Unresolved => Err(Error::NotResolved(format!(
                "{} on {}",
                self.id, self.target_name
            ))),
        }
    }

    /// Web context URL, forwarded to the backend handle
    pub fn web_url(&self) -> Result<Option<&str>> {
        Ok(self.delegate()?.web_url.as_deref())
    }

    /// Whether this record describes the same deployment source as the
    /// given content directory and context root
    pub fn same_reference(&self, content_dir: &Path, context_root: &str) -> bool {
        self.content_dir == content_dir && self.context_root == context_root
    }
}

/// Milliseconds since the epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// On-disk shape of a [`TargetModule`] record
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetModuleRecord {
    id: String,
    instance_url: String,
    target_name: String,
    timestamp_millis: u64,
    content_dir: PathBuf,
    context_root: String,
}

/// Persistent store of [`TargetModule`] records.
///
/// Layout: `<root>/<hash(url)>/<hash(target)>/<hash(content dir)>.json`.
/// Hashes keep vendor URLs and Windows paths out of file names.
pub struct TargetModuleStore {
    root: PathBuf,
}

impl TargetModuleStore {
    /// Create a store rooted at the given directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Persist a record, replacing any previous record for the same
    /// (instance, target, content directory) key
    pub fn write(&self, module: &TargetModule) -> Result<()> {
        let path = self.record_path(
            &module.instance_url,
            &module.target_name,
            &module.content_dir,
        );
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Serialization(format!(
                    "Failed to create record directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let record = TargetModuleRecord {
            id: module.id.clone(),
            instance_url: module.instance_url.clone(),
            target_name: module.target_name.clone(),
            timestamp_millis: module.timestamp_millis,
            content_dir: module.content_dir.clone(),
            context_root: module.context_root.clone(),
        };
        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| Error::Serialization(format!("Failed to serialize record: {}", e)))?;
        fs::write(&path, json).map_err(|e| {
            Error::Serialization(format!("Failed to write {}: {}", path.display(), e))
        })?;

        tracing::debug!(
            module = %module.id,
            target = %module.target_name,
            path = %path.display(),
            "Persisted target module record"
        );
        Ok(())
    }

    /// Read all records for an (instance, target) pair.
    ///
    /// Unreadable or malformed records are logged and skipped; a corrupt
    /// cache must degrade to "not deployed", never to wrong behavior.
    pub fn read_all(&self, instance_url: &str, target_name: &str) -> Vec<TargetModule> {
        let dir = self
            .root
            .join(hash_segment(instance_url))
            .join(hash_segment(target_name));
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut modules = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|s| {
                    serde_json::from_str::<TargetModuleRecord>(&s).map_err(|e| e.to_string())
                }) {
                Ok(record) => modules.push(TargetModule {
                    id: record.id,
                    instance_url: record.instance_url,
                    target_name: record.target_name,
                    timestamp_millis: record.timestamp_millis,
                    content_dir: record.content_dir,
                    context_root: record.context_root,
                    delegate: Delegate::Unresolved,
                }),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable module record");
                }
            }
        }
        modules
    }

    /// Remove the record for a module, if present
    pub fn remove(&self, module: &TargetModule) {
        let path = self.record_path(
            &module.instance_url,
            &module.target_name,
            &module.content_dir,
        );
        if let Err(e) = fs::remove_file(&path) {
            tracing::debug!(path = %path.display(), error = %e, "No module record removed");
        }
    }

    fn record_path(&self, instance_url: &str, target_name: &str, content_dir: &Path) -> PathBuf {
        self.root
            .join(hash_segment(instance_url))
            .join(hash_segment(target_name))
            .join(format!(
                "{}.json",
                hash_segment(&content_dir.to_string_lossy())
            ))
    }
}

/// Short stable hash of a key, safe for use as a path segment
fn hash_segment(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let mut out = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_segment_is_stable_and_distinct() {
        assert_eq!(hash_segment("a"), hash_segment("a"));
        assert_ne!(hash_segment("a"), hash_segment("b"));
        assert_eq!(hash_segment("deployer:mock:localhost").len(), 16);
    }

    #[test]
    fn test_unresolved_delegate_fails_fast() {
        let module = TargetModule::new(
            "app",
            "deployer:mock:localhost",
            "server",
            0,
            "/tmp/app",
            "/app",
        );
        assert!(!module.is_resolved());
        assert!(matches!(module.delegate(), Err(Error::NotResolved(_))));
        assert!(matches!(module.web_url(), Err(Error::NotResolved(_))));
    }

    #[test]
    fn test_resolved_delegate_forwards() {
        let mut module = TargetModule::new(
            "app",
            "deployer:mock:localhost",
            "server",
            0,
            "/tmp/app",
            "/app",
        );
        module.resolve(ModuleRef {
            id: "app".to_string(),
            target_name: "server".to_string(),
            web_url: Some("http://localhost:8080/app".to_string()),
        });
        assert_eq!(module.web_url().unwrap(), Some("http://localhost:8080/app"));
    }
}
