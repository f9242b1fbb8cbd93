//! Change descriptors for incremental deployment.
//!
//! As the distributor copies files it classifies every changed relative
//! path into semantic buckets; backends use the buckets to decide how much
//! of the application to reload (class reload, descriptor reparse, full
//! module restart).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Manifest path that flips the manifest-changed bucket
const MANIFEST_PATH: &str = "META-INF/MANIFEST.MF";

/// Path prefixes that classify a change as a class or library change
const CLASSES_PREFIXES: [&str; 2] = ["WEB-INF/classes/", "WEB-INF/lib/"];

/// Descriptor locations of one module, supplied by the module provider.
///
/// The sets hold module-relative paths. Which paths count as deployment
/// descriptors depends on the module kind and the backend, so the provider
/// owns this knowledge, not the distributor.
#[derive(Debug, Clone, Default)]
pub struct ModuleDescriptors {
    /// Standard deployment descriptor paths (e.g. `WEB-INF/web.xml`)
    pub descriptor_paths: HashSet<PathBuf>,
    /// Vendor-specific descriptor paths the running server consumes
    pub server_descriptor_paths: HashSet<PathBuf>,
    /// Subset of descriptor paths that describe enterprise beans
    pub ejb_descriptor_paths: HashSet<PathBuf>,
}

/// Accumulated change description of one redeploy cycle.
///
/// Built incrementally as each changed file is classified. The ordered
/// rules are: classes/lib prefix first, then descriptor membership, then
/// server-descriptor membership, then manifest equality; the first matching
/// rule wins for a given path.
#[derive(Debug, Clone, Default)]
pub struct AppChanges {
    descriptor_changed: bool,
    server_descriptor_changed: bool,
    classes_changed: bool,
    manifest_changed: bool,
    ejbs_changed: bool,
    changed_files: Vec<PathBuf>,
    removed_files: Vec<PathBuf>,
}

impl AppChanges {
    /// Create an empty change set
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a changed file and classify it
    pub fn record_changed(&mut self, relative: &Path, descriptors: &ModuleDescriptors) {
        self.classify(relative, descriptors);
        self.changed_files.push(relative.to_path_buf());
    }

    /// Record a file present at the destination but absent from the source.
    ///
    /// Removals are tracked for the caller's decision; they do not flip any
    /// classification bucket on their own.
    pub fn record_removed(&mut self, relative: &Path) {
        self.removed_files.push(relative.to_path_buf());
    }

    fn classify(&mut self, relative: &Path, descriptors: &ModuleDescriptors) {
        let unix = to_unix(relative);

        if CLASSES_PREFIXES.iter().any(|p| unix.starts_with(p)) {
            self.classes_changed = true;
            return;
        }
        if descriptors.descriptor_paths.contains(relative) {
            self.descriptor_changed = true;
            if descriptors.ejb_descriptor_paths.contains(relative) {
                self.ejbs_changed = true;
            }
            return;
        }
        if descriptors.server_descriptor_paths.contains(relative) {
            self.server_descriptor_changed = true;
            return;
        }
        if unix == MANIFEST_PATH {
            self.manifest_changed = true;
        }
    }

    /// Whether a standard deployment descriptor changed
    pub fn descriptor_changed(&self) -> bool {
        self.descriptor_changed
    }

    /// Whether a vendor-specific server descriptor changed
    pub fn server_descriptor_changed(&self) -> bool {
        self.server_descriptor_changed
    }

    /// Whether classes or libraries changed
    pub fn classes_changed(&self) -> bool {
        self.classes_changed
    }

    /// Whether the module manifest changed
    pub fn manifest_changed(&self) -> bool {
        self.manifest_changed
    }

    /// Whether an enterprise bean descriptor changed
    pub fn ejbs_changed(&self) -> bool {
        self.ejbs_changed
    }

    /// Changed files, module-relative
    pub fn changed_files(&self) -> &[PathBuf] {
        &self.changed_files
    }

    /// Destination files with no source counterpart, module-relative
    pub fn removed_files(&self) -> &[PathBuf] {
        &self.removed_files
    }

    /// Whether anything changed at all (removals included)
    pub fn has_changes(&self) -> bool {
        !self.changed_files.is_empty() || !self.removed_files.is_empty()
    }
}

/// Render a module-relative path with forward slashes for prefix matching
fn to_unix(path: &Path) -> String {
    let mut out = String::new();
    for component in path.components() {
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(&component.as_os_str().to_string_lossy());
    }
    out
}
