//! Packed image format: building from disk, serving, and corruption handling

use packfs::backend::ArchiveBackend;
use packfs::image::{EntryKind, HEADER_SIZE};
use packfs::{CompressionMethod, ImageFs, ImageReader, ImageWriter, RouterConfig, RouterError};
use std::os::unix::fs::PermissionsExt;
use tempfile::{NamedTempFile, TempDir};

fn config() -> RouterConfig {
    RouterConfig::default().with_mount_marker("/__scope__")
}

fn tree() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("lib/native")).unwrap();
    std::fs::write(dir.path().join("index.js"), b"require('./lib')").unwrap();
    std::fs::write(
        dir.path().join("lib/data.json"),
        br#"{"key": "value"}"#.repeat(500),
    )
    .unwrap();
    std::fs::write(dir.path().join("lib/native/addon.node"), vec![0x7fu8; 8192]).unwrap();
    std::fs::set_permissions(
        dir.path().join("lib/native/addon.node"),
        std::fs::Permissions::from_mode(0o755),
    )
    .unwrap();
    std::os::unix::fs::symlink("lib/data.json", dir.path().join("data.json")).unwrap();
    dir
}

#[test]
fn test_add_tree_roundtrip() {
    let source = tree();
    let image = NamedTempFile::new().unwrap();
    {
        let mut writer = ImageWriter::create(image.path()).unwrap();
        writer.add_tree("app", source.path()).unwrap();
        writer.finalize().unwrap();
    }

    let mut reader = ImageReader::open(image.path()).unwrap();
    assert_eq!(reader.get_entry("app").unwrap().kind, EntryKind::Directory);
    assert_eq!(reader.get_entry("app/lib/native").unwrap().kind, EntryKind::Directory);
    assert_eq!(reader.get_entry("app/data.json").unwrap().kind, EntryKind::Symlink);
    assert_eq!(reader.read_link("app/data.json").unwrap(), "lib/data.json");

    let json = reader.get_entry("app/lib/data.json").unwrap().clone();
    assert_eq!(json.compression, CompressionMethod::Zstd);
    assert!(json.compressed_size < json.uncompressed_size);

    let addon = reader.get_entry("app/lib/native/addon.node").unwrap().clone();
    assert_eq!(addon.compression, CompressionMethod::Lz4);
    assert_eq!(addon.mode, 0o755);
    assert_eq!(reader.read_entry("app/lib/native/addon.node").unwrap(), vec![0x7fu8; 8192]);
}

#[test]
fn test_image_fs_serves_tree() {
    let source = tree();
    let image = NamedTempFile::new().unwrap();
    {
        let mut writer = ImageWriter::create(image.path()).unwrap();
        writer.add_tree("", source.path()).unwrap();
        writer.finalize().unwrap();
    }

    let fs = ImageFs::open(image.path(), &config()).unwrap();
    assert_eq!(fs.entry_count(), 6);

    let linked = fs.stat("/__scope__/data.json").unwrap();
    let direct = fs.stat("/__scope__/lib/data.json").unwrap();
    assert_eq!(linked, direct);
    assert!(fs.lstat("/__scope__/data.json").unwrap().is_symlink());

    let fd = fs.open("/__scope__/index.js").unwrap();
    let mut buf = vec![0u8; 64];
    let n = fs.read(fd, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"require('./lib')");
    fs.close(fd).unwrap();

    let extracted = fs.extract("/__scope__/lib/native/addon.node", None).unwrap();
    let mode = std::fs::metadata(&extracted).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o755);
}

#[test]
fn test_descriptors_are_distinct_and_reserved() {
    let image = NamedTempFile::new().unwrap();
    {
        let mut writer = ImageWriter::create(image.path()).unwrap();
        writer.add_file("f", b"x").unwrap();
        writer.finalize().unwrap();
    }
    let fs = ImageFs::open(image.path(), &config()).unwrap();

    let fds: Vec<_> = (0..4).map(|_| fs.open("/__scope__/f").unwrap()).collect();
    for fd in &fds {
        assert!(fs.is_descriptor(*fd));
    }
    let mut sorted = fds.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted.len(), fds.len());
    assert!(!fs.is_descriptor(3));
}

#[test]
fn test_truncated_image_rejected() {
    let image = NamedTempFile::new().unwrap();
    {
        let mut writer = ImageWriter::create(image.path()).unwrap();
        writer.add_file("a.txt", b"some content").unwrap();
        writer.finalize().unwrap();
    }

    let bytes = std::fs::read(image.path()).unwrap();
    std::fs::write(image.path(), &bytes[..bytes.len() - 10]).unwrap();
    assert!(matches!(
        ImageReader::open(image.path()),
        Err(RouterError::InvalidFormat(_))
    ));

    std::fs::write(image.path(), &bytes[..HEADER_SIZE / 2]).unwrap();
    assert!(matches!(ImageReader::open(image.path()), Err(RouterError::Io(_))));

    std::fs::write(image.path(), b"definitely not an image, but long enough to hold a header")
        .unwrap();
    assert!(matches!(
        ImageReader::open(image.path()),
        Err(RouterError::InvalidMagic)
    ));
}

#[test]
fn test_corrupted_member_detected() {
    let image = NamedTempFile::new().unwrap();
    {
        let mut writer = ImageWriter::create(image.path()).unwrap();
        writer.add_file("a.txt", b"some content").unwrap();
        writer.finalize().unwrap();
    }

    // The first member starts right after the header
    let mut bytes = std::fs::read(image.path()).unwrap();
    bytes[HEADER_SIZE] ^= 0xff;
    std::fs::write(image.path(), &bytes).unwrap();

    let mut reader = ImageReader::open(image.path()).unwrap();
    assert!(matches!(
        reader.read_entry("a.txt"),
        Err(RouterError::CrcMismatch { .. })
    ));

    let fs = ImageFs::open(image.path(), &config()).unwrap();
    let err = fs.open("/__scope__/a.txt").unwrap_err();
    assert_eq!(err.errno(), libc::EIO);
}
