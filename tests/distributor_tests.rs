use deploy_runner::deploy::{
    DiffMode, InitialServerFileDistributor, ModuleDescriptors, ModuleEntry, ServerFileDistributor,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

fn write(path: &Path, content: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn web_entries(src: &Path) -> Vec<ModuleEntry> {
    vec![
        ModuleEntry::new("index.html", src.join("index.html")),
        ModuleEntry::new("WEB-INF/web.xml", src.join("WEB-INF/web.xml")),
        ModuleEntry::new(
            "WEB-INF/classes/App.class",
            src.join("WEB-INF/classes/App.class"),
        ),
    ]
}

fn web_descriptors() -> ModuleDescriptors {
    let mut descriptors = ModuleDescriptors::default();
    descriptors
        .descriptor_paths
        .insert(PathBuf::from("WEB-INF/web.xml"));
    descriptors
}

fn web_module(src: &Path) {
    write(&src.join("index.html"), "<html/>");
    write(&src.join("WEB-INF/web.xml"), "<web-app/>");
    write(&src.join("WEB-INF/classes/App.class"), "cafebabe");
}

#[test]
fn test_unchanged_tree_produces_no_changes() {
    let src = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    web_module(src.path());
    let entries = web_entries(src.path());

    InitialServerFileDistributor::distribute(&entries, dest.path()).unwrap();

    let changes = ServerFileDistributor::distribute(
        &entries,
        dest.path(),
        &web_descriptors(),
        &DiffMode::Timestamps,
    )
    .unwrap();

    assert!(!changes.has_changes());
    assert!(!changes.classes_changed());
    assert!(!changes.descriptor_changed());
    assert!(!changes.manifest_changed());
}

#[test]
fn test_changed_class_sets_only_the_classes_bucket() {
    let src = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    web_module(src.path());
    let entries = web_entries(src.path());

    InitialServerFileDistributor::distribute(&entries, dest.path()).unwrap();

    std::thread::sleep(std::time::Duration::from_millis(20));
    write(&src.path().join("WEB-INF/classes/App.class"), "cafebabe v2");

    let changes = ServerFileDistributor::distribute(
        &entries,
        dest.path(),
        &web_descriptors(),
        &DiffMode::Timestamps,
    )
    .unwrap();

    assert!(changes.classes_changed());
    assert!(!changes.descriptor_changed());
    assert_eq!(
        changes.changed_files(),
        &[PathBuf::from("WEB-INF/classes/App.class")]
    );
}

#[test]
fn test_artifact_list_pass_ignores_timestamps() {
    let src = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    web_module(src.path());
    let entries = web_entries(src.path());

    InitialServerFileDistributor::distribute(&entries, dest.path()).unwrap();

    // nothing is newer, but the build says this artifact changed
    let mut artifacts = HashSet::new();
    artifacts.insert(PathBuf::from("WEB-INF/web.xml"));

    let changes = ServerFileDistributor::distribute(
        &entries,
        dest.path(),
        &web_descriptors(),
        &DiffMode::ArtifactList(artifacts),
    )
    .unwrap();

    assert!(changes.descriptor_changed());
    assert!(!changes.classes_changed());
    assert_eq!(changes.changed_files(), &[PathBuf::from("WEB-INF/web.xml")]);
}

#[test]
fn test_first_distribution_copies_the_full_tree() {
    let src = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    web_module(src.path());
    let entries = web_entries(src.path());

    let changes = ServerFileDistributor::distribute(
        &entries,
        dest.path(),
        &web_descriptors(),
        &DiffMode::Timestamps,
    )
    .unwrap();

    assert_eq!(changes.changed_files().len(), 3);
    assert!(changes.classes_changed());
    assert!(changes.descriptor_changed());
    assert!(dest.path().join("WEB-INF/classes/App.class").exists());
}

#[test]
fn test_stale_destination_files_are_tracked_as_removals() {
    let src = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    web_module(src.path());
    write(&dest.path().join("WEB-INF/lib/old.jar"), "stale");
    let entries = web_entries(src.path());

    let changes = ServerFileDistributor::distribute(
        &entries,
        dest.path(),
        &web_descriptors(),
        &DiffMode::Timestamps,
    )
    .unwrap();

    assert_eq!(
        changes.removed_files(),
        &[PathBuf::from("WEB-INF/lib/old.jar")]
    );
    // removals are tracked for the caller, not executed
    assert!(dest.path().join("WEB-INF/lib/old.jar").exists());
}

#[test]
fn test_initial_distribution_clears_stale_archives() {
    let src = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    web_module(src.path());
    write(&dest.path().join("WEB-INF/lib/old.jar"), "stale");
    let entries = web_entries(src.path());

    InitialServerFileDistributor::distribute(&entries, dest.path()).unwrap();

    // the leftover archive is gone (or neutralized where locked)
    let leftover = dest.path().join("WEB-INF/lib/old.jar");
    if leftover.exists() {
        assert_eq!(std::fs::metadata(&leftover).unwrap().len(), 0);
    }
}
