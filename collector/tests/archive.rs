use ddc_collector::archive::{
    self,
    ArchiveError,
};
use flate2::{
    write::GzEncoder,
    Compression,
};
use pretty_assertions::assert_eq;
use rand::{
    rngs::StdRng,
    RngCore as _,
    SeedableRng as _,
};
use std::{
    fs,
    path::Path,
};

fn random_bytes(rng: &mut StdRng, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rng.fill_bytes(&mut buf);
    buf
}

fn read_tree(root: &Path) -> Vec<(String, Vec<u8>)> {
    let mut files = walkdir::WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e.path().strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/");
            (rel, fs::read(e.path()).unwrap())
        })
        .collect::<Vec<_>>();
    files.sort();
    files
}

#[test]
fn split_produces_two_parts_for_four_files() {
    let mut rng = StdRng::seed_from_u64(42);
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    for (i, size) in [1_000usize, 2_000, 3_000, 4_000].into_iter().enumerate() {
        fs::write(src.path().join(format!("file{}.bin", i + 1)), random_bytes(&mut rng, size)).unwrap();
    }

    let parts = archive::compact_split(src.path(), &out.path().join("bundle"), 5_000, |_| true).unwrap();
    assert_eq!(parts.len(), 2);
    assert!(parts[0].to_string_lossy().ends_with("part001.tar.gz"));
    assert!(parts[1].to_string_lossy().ends_with("part002.tar.gz"));

    let restored = tempfile::tempdir().unwrap();
    for part in &parts {
        archive::extract(part, restored.path(), None).unwrap();
    }
    assert_eq!(read_tree(restored.path()), read_tree(src.path()));
}

#[test]
fn split_parts_stay_near_the_limit() {
    let mut rng = StdRng::seed_from_u64(7);
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let mut largest = 0u64;
    for i in 0..40 {
        let size = 2_000 + (rng.next_u32() % 30_000) as usize;
        largest = largest.max(size as u64);
        let dir = src.path().join(format!("node{}", i % 3));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(format!("f{i:02}.bin")), random_bytes(&mut rng, size)).unwrap();
    }
    let max = 100_000i64;
    let parts = archive::compact_split(src.path(), &out.path().join("bundle"), max, |_| true).unwrap();
    assert!(parts.len() > 1);
    for part in &parts {
        let size = fs::metadata(part).unwrap().len();
        assert!(size <= max as u64 + largest + archive::ENTRY_OVERHEAD, "{size}");
    }
}

#[test]
fn small_files_are_spread_over_bounded_parts() {
    let mut rng = StdRng::seed_from_u64(1_000);
    let src = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    for i in 0..20 {
        fs::write(src.path().join(format!("f{i:02}.bin")), random_bytes(&mut rng, 1_000)).unwrap();
    }

    let max = 5_000u64;
    let parts = archive::compact_split(src.path(), &out.path().join("bundle"), max as i64, |_| true).unwrap();
    assert!(parts.len() >= 4, "{} parts", parts.len());
    for part in &parts {
        let size = fs::metadata(part).unwrap().len();
        assert!(size <= max + 1_000 + archive::ENTRY_OVERHEAD, "{} is {size} bytes", part.display());
    }

    let restored = tempfile::tempdir().unwrap();
    for part in &parts {
        archive::extract(part, restored.path(), None).unwrap();
    }
    assert_eq!(read_tree(restored.path()), read_tree(src.path()));
}

#[test]
fn compact_round_trip_preserves_content_and_mode() {
    let src = tempfile::tempdir().unwrap();
    fs::create_dir_all(src.path().join("logs/node1")).unwrap();
    fs::create_dir_all(src.path().join("empty")).unwrap();
    fs::write(src.path().join("logs/node1/server.log"), "line one\nline two\n").unwrap();
    fs::write(src.path().join("summary.json"), "{}").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        fs::set_permissions(src.path().join("summary.json"), fs::Permissions::from_mode(0o600)).unwrap();
    }

    let out = tempfile::tempdir().unwrap();
    let tarball = out.path().join("node1.tar.gz");
    archive::compact(src.path(), &tarball, |_| true).unwrap();

    let restored = tempfile::tempdir().unwrap();
    let bytes = archive::extract(&tarball, restored.path(), None).unwrap();
    assert_eq!(bytes, 20);
    assert_eq!(read_tree(restored.path()), read_tree(src.path()));
    assert!(restored.path().join("empty").is_dir());
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        let mode = fs::metadata(restored.path().join("summary.json")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

#[test]
fn filter_excludes_paths() {
    let src = tempfile::tempdir().unwrap();
    fs::create_dir_all(src.path().join("skip")).unwrap();
    fs::write(src.path().join("skip/a.txt"), "a").unwrap();
    fs::write(src.path().join("keep.txt"), "k").unwrap();
    let out = tempfile::tempdir().unwrap();
    let tarball = out.path().join("x.tar.gz");
    archive::compact(src.path(), &tarball, |p| !p.starts_with("skip")).unwrap();
    let restored = tempfile::tempdir().unwrap();
    archive::extract(&tarball, restored.path(), None).unwrap();
    assert_eq!(read_tree(restored.path()), vec![("keep.txt".to_string(), b"k".to_vec())]);
}

#[test]
fn extract_strips_prefix() {
    let src = tempfile::tempdir().unwrap();
    fs::create_dir_all(src.path().join("tmp/ddc/out/logs")).unwrap();
    fs::write(src.path().join("tmp/ddc/out/logs/server.log"), "x").unwrap();
    let out = tempfile::tempdir().unwrap();
    let tarball = out.path().join("x.tar.gz");
    archive::compact(src.path(), &tarball, |_| true).unwrap();
    let restored = tempfile::tempdir().unwrap();
    archive::extract(&tarball, restored.path(), Some("/tmp/ddc/out")).unwrap();
    assert!(restored.path().join("logs/server.log").is_file());
}

fn raw_entry(builder: &mut tar::Builder<GzEncoder<fs::File>>, name: &[u8], data: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.as_gnu_mut().unwrap().name[..name.len()].copy_from_slice(name);
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    builder.append(&header, data).unwrap();
}

#[test]
fn extract_rejects_path_escape() {
    let out = tempfile::tempdir().unwrap();
    let tarball = out.path().join("evil.tar.gz");
    {
        let file = fs::File::create(&tarball).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        raw_entry(&mut builder, b"nested/../../evil.txt", b"owned");
        builder.into_inner().unwrap().finish().unwrap();
    }

    let parent = tempfile::tempdir().unwrap();
    let dest = parent.path().join("dest");
    let err = archive::extract(&tarball, &dest, None).unwrap_err();
    assert!(matches!(err, ArchiveError::PathEscape { .. }));
    assert!(!parent.path().join("evil.txt").exists());
    assert_eq!(fs::read_dir(&dest).unwrap().count(), 0);
}
