use super::*;
use std::sync::Arc;
use tempfile::{tempdir, TempDir};

fn entry(path: &str, digest: &str) -> Entry {
    Entry::new(path, digest).with_size(Some(path.len() as u64))
}

fn sqlite_manifest() -> Result<(TempDir, Manifest)> {
    let temp = tempdir()?;
    let manifest = Manifest::sqlite("dataset", temp.path().join("manifest.db"))?;
    Ok((temp, manifest))
}

fn both_backings() -> Result<Vec<(Option<TempDir>, Manifest)>> {
    let (temp, sqlite) = sqlite_manifest()?;
    Ok(vec![(None, Manifest::in_memory("dataset")), (Some(temp), sqlite)])
}

#[test]
fn digest_ignores_insertion_order_and_backing() -> Result<()> {
    let entries = [
        entry("b/two.txt", "ZGlnZXN0LTI="),
        entry("a.txt", "ZGlnZXN0LTE="),
        entry("b/one.txt", "ZGlnZXN0LTM="),
        entry("c", "ZGlnZXN0LTQ="),
    ];
    let mut digests = Vec::new();
    for (_guard, manifest) in both_backings()? {
        for item in &entries {
            manifest.add_entry(item)?;
        }
        digests.push(manifest.digest()?);
    }
    let shuffled = Manifest::in_memory("dataset");
    for item in entries.iter().rev() {
        shuffled.add_entry(item)?;
    }
    digests.push(shuffled.digest()?);

    let mut expected = ManifestDigester::new();
    for (path, digest) in [
        ("a.txt", "ZGlnZXN0LTE="),
        ("b/one.txt", "ZGlnZXN0LTM="),
        ("b/two.txt", "ZGlnZXN0LTI="),
        ("c", "ZGlnZXN0LTQ="),
    ] {
        expected.push(path, digest);
    }
    let expected = expected.finish();
    assert!(digests.iter().all(|d| d == &expected), "{digests:?}");
    Ok(())
}

#[test]
fn conflicting_digest_keeps_the_first_entry() -> Result<()> {
    for (_guard, manifest) in both_backings()? {
        manifest.add_entry(&entry("p", "ZDE="))?;
        let err = manifest.add_entry(&entry("p", "ZDI=")).unwrap_err();
        match err.downcast_ref::<ArtifactError>() {
            Some(ArtifactError::PathConflict {
                path,
                existing,
                attempted,
            }) => {
                assert_eq!(path, "p");
                assert_eq!(existing, "ZDE=");
                assert_eq!(attempted, "ZDI=");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let kept = manifest.get_entry_by_path("p")?;
        assert_eq!(kept.map(|e| e.digest), Some("ZDE=".to_string()));
        assert_eq!(manifest.len()?, 1);
    }
    Ok(())
}

#[test]
fn same_digest_is_idempotent_and_refreshes_fields() -> Result<()> {
    for (_guard, manifest) in both_backings()? {
        manifest.add_entry(&entry("p", "ZDE="))?;
        let refreshed = Entry::staged("p", "ZDE=", "/cache/obj", 9);
        manifest.add_entry(&refreshed)?;
        let stored = manifest.get_entry_by_path("p")?;
        let stored = stored.ok_or_else(|| anyhow!("entry vanished"))?;
        assert_eq!(stored.size, Some(9));
        assert_eq!(stored.local_path(), Some(Path::new("/cache/obj")));
        assert_eq!(manifest.len()?, 1);
    }
    Ok(())
}

#[test]
fn finalize_is_idempotent_and_freezes_entries() -> Result<()> {
    for (_guard, manifest) in both_backings()? {
        manifest.add_entry(&entry("a", "ZDE="))?;
        let first = manifest.finalize()?;
        let second = manifest.finalize()?;
        assert_eq!(first, second);
        assert_eq!(manifest.digest()?, first.digest);
        assert!(manifest.is_finalized()?);

        let err = manifest.add_entry(&entry("b", "ZDI=")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ArtifactError>(),
            Some(ArtifactError::Finalized { .. })
        ));
        assert_eq!(manifest.len()?, 1);
    }
    Ok(())
}

#[test]
fn sqlite_location_is_reported_on_finalize() -> Result<()> {
    let (temp, manifest) = sqlite_manifest()?;
    manifest.add_entry(&entry("a", "ZDE="))?;
    let done = manifest.finalize()?;
    assert_eq!(done.location, Some(temp.path().join("manifest.db")));
    assert_eq!(Manifest::in_memory("x").finalize()?.location, None);
    Ok(())
}

#[test]
fn entries_under_pages_in_path_order() -> Result<()> {
    for (_guard, manifest) in both_backings()? {
        manifest.transaction(|m| {
            for i in (0..2_500).rev() {
                m.add_entry(&entry(&format!("dir/{i:05}"), "ZDE="))?;
            }
            m.add_entry(&entry("dirt", "ZDI="))?;
            m.add_entry(&entry("other/x", "ZDM="))?;
            Ok(())
        })?;
        let under: Vec<String> = manifest
            .entries_under("dir/")
            .map(|e| e.map(|e| e.path))
            .collect::<Result<_>>()?;
        assert_eq!(under.len(), 2_500);
        assert_eq!(under.first().map(String::as_str), Some("dir/00000"));
        assert_eq!(under.last().map(String::as_str), Some("dir/02499"));
        assert!(under.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(manifest.entries().count(), 2_502);
    }
    Ok(())
}

#[test]
fn transaction_writes_are_visible_after_scope() -> Result<()> {
    let temp = tempdir()?;
    let store = SqliteStore::open(temp.path().join("m.db"), 3)?;
    let manifest = Manifest::from_store("buffered".into(), ManifestBacking::Sqlite, Box::new(store));
    manifest.transaction(|m| {
        for i in 0..7 {
            m.add_entry(&entry(&format!("f{i}"), "ZDE="))?;
        }
        Ok(())
    })?;
    // A fresh thread uses its own connection and only sees committed rows.
    let manifest = Arc::new(manifest);
    let reader = Arc::clone(&manifest);
    let seen = std::thread::spawn(move || reader.len())
        .join()
        .map_err(|_| anyhow!("reader panicked"))??;
    assert_eq!(seen, 7);
    Ok(())
}

#[test]
fn concurrent_adds_lose_nothing() -> Result<()> {
    for (_guard, manifest) in both_backings()? {
        let manifest = Arc::new(manifest);
        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let manifest = Arc::clone(&manifest);
                std::thread::spawn(move || -> Result<()> {
                    for i in 0..50 {
                        manifest.add_entry(&entry(&format!("w{worker}/{i}"), "ZDE="))?;
                    }
                    Ok(())
                })
            })
            .collect();
        for worker in workers {
            worker.join().map_err(|_| anyhow!("worker panicked"))??;
        }
        assert_eq!(manifest.len()?, 400);
        let done = manifest.finalize()?;
        assert_eq!(done.digest.len(), 32);
    }
    Ok(())
}

#[test]
fn size_and_json_document() -> Result<()> {
    let manifest = Manifest::in_memory("dataset");
    manifest.add_entry(&Entry::new("a.txt", "ZDE=").with_size(Some(10)))?;
    manifest.add_entry(&Entry::reference("ref", "s3://b/k", "etag").with_size(None))?;
    assert_eq!(manifest.size()?, 10);
    let document = manifest.to_json(
        "wandb-storage-policy-v1",
        json!({"storageLayout": "V2", "storageRegion": "default"}),
    )?;
    assert_eq!(
        document,
        json!({
            "version": 1,
            "storagePolicy": "wandb-storage-policy-v1",
            "storagePolicyConfig": {"storageLayout": "V2", "storageRegion": "default"},
            "contents": {
                "a.txt": {"digest": "ZDE=", "size": 10},
                "ref": {"digest": "etag", "ref": "s3://b/k"},
            }
        })
    );
    Ok(())
}

#[test]
fn birth_artifact_id_can_be_recorded_after_finalize() -> Result<()> {
    for (_guard, manifest) in both_backings()? {
        manifest.add_entry(&entry("a", "ZDE="))?;
        let done = manifest.finalize()?;
        manifest.set_birth_artifact_id("a", "QXJ0aWZhY3Q6MQ==")?;
        let stored = manifest.get_entry_by_path("a")?;
        assert_eq!(
            stored.and_then(|e| e.birth_artifact_id).as_deref(),
            Some("QXJ0aWZhY3Q6MQ==")
        );
        assert_eq!(manifest.digest()?, done.digest);
        assert!(manifest.set_birth_artifact_id("missing", "x").is_err());
    }
    Ok(())
}

#[test]
fn explicit_memory_backing_skips_sqlite() -> Result<()> {
    let temp = tempdir()?;
    let manifest =
        Manifest::with_backing("m", ManifestBacking::Memory, temp.path().join("unused.db"))?;
    assert_eq!(manifest.backing(), ManifestBacking::Memory);
    assert!(!temp.path().join("unused.db").exists());

    let auto = Manifest::with_backing("m", ManifestBacking::Auto, temp.path().join("auto.db"))?;
    assert_eq!(auto.backing(), ManifestBacking::Sqlite);
    Ok(())
}
