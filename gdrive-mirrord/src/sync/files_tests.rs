use super::*;
use crate::sync::paths::DOCUMENT_MIME;
use time::macros::datetime;

const ROOT: &str = "root";

fn store() -> FileStore {
    FileStore::new(Some(ROOT.to_string()))
}

fn doc(id: &str, name: &str) -> RemoteFile {
    RemoteFile::new(id, name, DOCUMENT_MIME)
        .with_parent(ROOT)
        .with_modified_time(datetime!(2024-01-01 00:00 UTC))
}

fn folder(id: &str, name: &str) -> RemoteFile {
    RemoteFile::new(id, name, FOLDER_MIME).with_parent(ROOT)
}

fn local(store: &FileStore, id: &str) -> String {
    store.get(id).unwrap().local_path.clone()
}

fn assert_unique_live_paths(store: &FileStore) {
    let live = store.find_files(|r| !r.is_synthetic());
    let mut seen = HashSet::new();
    for record in live {
        assert!(
            seen.insert(record.local_path.clone()),
            "duplicate local path {}",
            record.local_path
        );
    }
}

#[test]
fn insert_marks_files_dirty_but_never_folders() {
    let mut store = store();
    let outcome = store.merge(vec![folder("f", "Guides"), doc("a", "Intro").with_parent("f")]);

    assert_eq!(outcome.inserted, vec!["f".to_string(), "a".to_string()]);
    assert!(!store.get("f").unwrap().dirty);
    assert!(store.get("a").unwrap().dirty);
    assert_eq!(local(&store, "a"), "guides/intro.md");
    assert_eq!(store.get("a").unwrap().desired_local_path, "guides/intro.md");
}

#[test]
fn merging_the_same_listing_twice_is_idempotent() {
    let listing = vec![
        folder("f", "Docs"),
        doc("a", "Same").with_parent("f"),
        doc("b", "Same").with_parent("f"),
        doc("c", "Other"),
    ];
    let mut store = store();
    store.merge(listing.clone());
    let first = store.snapshot();

    let outcome = store.merge(listing);

    assert_eq!(store.snapshot(), first);
    assert!(outcome.inserted.is_empty());
    assert!(outcome.redirected.is_empty());
    assert!(outcome.orphaned_paths.is_empty());
}

#[test]
fn rename_leaves_redirect_at_old_path() {
    let mut store = store();
    store.merge(vec![doc("a", "Old Name")]);
    store.mark_clean("a", Some(datetime!(2024-01-01 00:00 UTC)));

    let outcome = store.merge(vec![doc("a", "New Name")]);

    assert_eq!(outcome.redirected, vec!["a".to_string()]);
    assert_eq!(local(&store, "a"), "new-name.md");
    assert!(store.get("a").unwrap().dirty);
    let redirect = store
        .find_file(|r| r.is_redirect() && r.local_path == "old-name.md")
        .expect("redirect at old path");
    assert_eq!(redirect.redirect_to.as_deref(), Some("a"));
    assert!(redirect.dirty);
    assert!(outcome.orphaned_paths.is_empty());
}

#[test]
fn renaming_back_reclaims_the_redirected_path() {
    let mut store = store();
    store.merge(vec![doc("a", "One")]);
    store.merge(vec![doc("a", "Two")]);
    store.merge(vec![doc("a", "One")]);

    assert_eq!(local(&store, "a"), "one.md");
    let redirects = store.find_files(|r| r.is_redirect());
    assert_eq!(redirects.len(), 1);
    assert_eq!(redirects[0].local_path, "two.md");
}

#[test]
fn colliding_records_get_conflict_record_and_unique_paths() {
    let mut store = store();
    store.merge(vec![doc("b", "Page")]);
    store.merge(vec![doc("c", "page")]);

    let conflict = store
        .find_file(|r| r.is_conflict())
        .expect("conflict record");
    assert_eq!(conflict.local_path, "page.md");
    assert_eq!(conflict.conflicting, vec!["b".to_string(), "c".to_string()]);
    assert_eq!(local(&store, "b"), "page_1.md");
    assert_eq!(local(&store, "c"), "page_2.md");
    assert_ne!(local(&store, "b"), local(&store, "c"));

    let outcome = store.merge(vec![doc("c", "page").trashed()]);

    assert_eq!(outcome.removed, vec!["c".to_string()]);
    assert!(store.find_file(|r| r.is_conflict()).is_none());
    assert_eq!(local(&store, "b"), "page.md");
    let b = store.get("b").unwrap();
    assert!(b.counter.is_none());
    assert!(b.conflict_id.is_none());
    assert_eq!(
        outcome.orphaned_paths,
        vec!["page_1.md".to_string(), "page_2.md".to_string()]
    );
}

#[test]
fn counter_order_is_first_observation_not_name() {
    let mut store = store();
    store.merge(vec![doc("zeta", "Report"), doc("alpha", "report")]);

    let conflict = store.find_file(|r| r.is_conflict()).unwrap();
    assert_eq!(
        conflict.conflicting,
        vec!["zeta".to_string(), "alpha".to_string()]
    );
    assert_eq!(store.get("zeta").unwrap().counter, Some(1));
    assert_eq!(store.get("alpha").unwrap().counter, Some(2));
}

#[test]
fn counters_are_stable_and_not_recycled_while_conflicted() {
    let mut store = store();
    store.merge(vec![doc("a", "X"), doc("b", "X"), doc("c", "X")]);
    assert_eq!(local(&store, "c"), "x_3.md");

    store.merge(vec![doc("b", "X").trashed()]);
    assert_eq!(local(&store, "a"), "x_1.md");
    assert_eq!(local(&store, "c"), "x_3.md");

    store.merge(vec![doc("d", "X")]);
    assert_eq!(local(&store, "d"), "x_4.md");
    let conflict = store.find_file(|r| r.is_conflict()).unwrap();
    assert_eq!(
        conflict.conflicting,
        vec!["a".to_string(), "c".to_string(), "d".to_string()]
    );
    assert_unique_live_paths(&store);
}

#[test]
fn overlapping_merges_keep_live_paths_unique() {
    let mut store = store();
    store.merge(vec![doc("a", "A"), doc("b", "B")]);
    store.merge(vec![doc("b", "A"), doc("c", "C")]);
    assert_unique_live_paths(&store);
    assert_eq!(store.find_files(|r| r.is_conflict()).len(), 1);

    store.merge(vec![doc("c", "A"), doc("a", "Z")]);
    assert_unique_live_paths(&store);
    let conflict = store.find_file(|r| r.is_conflict()).unwrap();
    assert_eq!(conflict.conflicting, vec!["b".to_string(), "c".to_string()]);

    store.merge(vec![doc("b", "B")]);
    assert_unique_live_paths(&store);
    assert!(store.find_file(|r| r.is_conflict()).is_none());
    assert_eq!(local(&store, "c"), "a.md");
}

#[test]
fn folder_rename_moves_children_with_redirects() {
    let mut store = store();
    store.merge(vec![folder("f", "Guides"), doc("a", "Setup").with_parent("f")]);
    store.mark_clean("a", Some(datetime!(2024-01-01 00:00 UTC)));

    store.merge(vec![folder("f", "Manuals")]);

    assert_eq!(local(&store, "f"), "manuals");
    assert_eq!(local(&store, "a"), "manuals/setup.md");
    assert!(store.get("a").unwrap().dirty);
    assert!(!store.get("f").unwrap().dirty);
    let redirect = store
        .find_file(|r| r.is_redirect() && r.local_path == "guides/setup.md")
        .expect("child redirect");
    assert_eq!(redirect.redirect_to.as_deref(), Some("a"));
}

#[test]
fn colliding_folders_keep_children_apart() {
    let mut store = store();
    store.merge(vec![
        folder("f1", "Docs"),
        folder("f2", "docs"),
        doc("a", "Index").with_parent("f1"),
        doc("b", "Index").with_parent("f2"),
    ]);

    assert_eq!(local(&store, "f1"), "docs_1");
    assert_eq!(local(&store, "f2"), "docs_2");
    assert_eq!(local(&store, "a"), "docs_1/index.md");
    assert_eq!(local(&store, "b"), "docs_2/index.md");
    assert_unique_live_paths(&store);
}

#[test]
fn child_listed_before_parent_lands_under_it_without_redirect() {
    let mut store = store();
    store.merge(vec![doc("a", "Note").with_parent("f"), folder("f", "Space")]);

    assert_eq!(local(&store, "a"), "space/note.md");
    assert!(store.find_file(|r| r.is_redirect()).is_none());
}

#[test]
fn trashed_folder_removes_descendants() {
    let mut store = store();
    store.merge(vec![
        folder("f", "Team"),
        folder("g", "Sub").with_parent("f"),
        doc("a", "Deep").with_parent("g"),
        doc("b", "Keep"),
    ]);

    let outcome = store.merge(vec![folder("f", "Team").trashed()]);

    assert_eq!(outcome.removed.len(), 3);
    assert!(store.get("a").is_none());
    assert!(store.get("b").is_some());
    assert!(outcome.orphaned_paths.contains(&"team/sub/deep.md".to_string()));
}

#[test]
fn modified_time_drives_dirty_and_clean() {
    let mut store = store();
    store.merge(vec![doc("a", "Page")]);
    assert!(store.mark_clean("a", Some(datetime!(2024-01-01 00:00 UTC))));
    assert!(!store.get("a").unwrap().dirty);

    store.merge(vec![doc("a", "Page")]);
    assert!(!store.get("a").unwrap().dirty, "unchanged listing stays clean");

    let newer = doc("a", "Page").with_modified_time(datetime!(2024-02-01 00:00 UTC));
    let outcome = store.merge(vec![newer]);
    assert_eq!(outcome.updated, vec!["a".to_string()]);
    assert!(store.get("a").unwrap().dirty);

    // A download of the old version does not confirm the new one.
    assert!(!store.mark_clean("a", Some(datetime!(2024-01-01 00:00 UTC))));
    assert!(store.get("a").unwrap().dirty);
}

#[test]
fn mark_dirty_skips_folders() {
    let mut store = store();
    store.merge(vec![folder("f", "Dir"), doc("a", "Page")]);
    store.mark_clean("a", Some(datetime!(2024-01-01 00:00 UTC)));

    assert_eq!(store.mark_dirty(&["f", "a", "missing"]), 1);
    assert!(!store.get("f").unwrap().dirty);
    assert!(store.get("a").unwrap().dirty);
}

#[test]
fn max_modified_time_ignores_synthetic_records() {
    let mut store = store();
    assert!(store.max_modified_time().is_none());
    store.merge(vec![
        doc("a", "One"),
        doc("b", "Two").with_modified_time(datetime!(2024-03-05 10:00 UTC)),
    ]);
    store.merge(vec![doc("a", "Renamed")]);

    assert_eq!(
        store.max_modified_time(),
        Some(datetime!(2024-03-05 10:00 UTC))
    );
}

#[test]
fn redirect_collection_reaches_fixed_point() {
    let mut snapshot = FilesSnapshot::new();
    let mut chain = |id: &str, target: &str, seq: u64| {
        let mut record = FileRecord::synthetic(
            id.to_string(),
            REDIRECT_MIME,
            id.to_string(),
            format!("{id}.md"),
            seq,
        );
        record.redirect_to = Some(target.to_string());
        snapshot.insert(id.to_string(), record);
    };
    chain("r1", "r2", 1);
    chain("r2", "r3", 2);
    chain("r3", "gone", 3);

    let mut store = FileStore::from_snapshot(None, snapshot);

    assert_eq!(store.collect_redirects(), 3);
    assert!(store.is_empty());
}

#[test]
fn trashing_a_redirect_target_collects_the_redirect() {
    let mut store = store();
    store.merge(vec![doc("a", "Before")]);
    store.merge(vec![doc("a", "After")]);
    assert!(store.find_file(|r| r.is_redirect()).is_some());

    store.merge(vec![doc("a", "After").trashed()]);

    assert!(store.is_empty());
}

#[test]
fn remove_resolves_conflicts_like_trash() {
    let mut store = store();
    store.merge(vec![doc("a", "Dup"), doc("b", "Dup")]);

    let outcome = store.remove("a");

    assert_eq!(outcome.removed, vec!["a".to_string()]);
    assert_eq!(local(&store, "b"), "dup.md");
    assert!(store.find_file(|r| r.is_conflict()).is_none());
}

#[test]
fn snapshot_round_trip_preserves_dirty_set() {
    let mut store = store();
    store.merge(vec![doc("a", "One"), doc("b", "Two"), doc("c", "One")]);
    store.mark_clean("b", Some(datetime!(2024-01-01 00:00 UTC)));
    let json = serde_json::to_string(&store.snapshot()).unwrap();

    let restored: FilesSnapshot = serde_json::from_str(&json).unwrap();
    let mut restored = FileStore::from_snapshot(Some(ROOT.to_string()), restored);

    let dirty: Vec<String> = restored.dirty_records().into_iter().map(|r| r.id).collect();
    let expected: Vec<String> = store.dirty_records().into_iter().map(|r| r.id).collect();
    assert_eq!(dirty, expected);
    assert!(!dirty.contains(&"b".to_string()));

    restored.merge(vec![doc("d", "One")]);
    assert_eq!(local(&restored, "d"), "one_3.md");
}

#[test]
fn flush_flag_is_taken_once() {
    let mut store = store();
    assert!(!store.take_needs_flush());
    store.merge(vec![doc("a", "Page")]);
    assert!(store.take_needs_flush());
    assert!(!store.take_needs_flush());
}
