//! Many threads sharing one router

use packfs::{DirHandle, ImageWriter, OpenOptions, Router, RouterConfig, VFD_BASE};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tempfile::{NamedTempFile, TempDir};

const THREADS: usize = 16;

/// Image with `data/file{i}.txt` holding `data{i}` for each thread
fn shared_router() -> (TempDir, NamedTempFile, Arc<Router>) {
    let scratch = TempDir::new().unwrap();
    let image = NamedTempFile::new().unwrap();
    {
        let mut writer = ImageWriter::create(image.path()).unwrap();
        for i in 0..THREADS {
            let data = format!("data{}", i);
            writer
                .add_file(&format!("data/file{}.txt", i), data.as_bytes())
                .unwrap();
        }
        writer.finalize().unwrap();
    }
    let config = RouterConfig::default()
        .with_mount_marker("/__scope__")
        .with_temp_root(scratch.path());
    let router = Router::with_image(config, image.path()).unwrap();
    (scratch, image, Arc::new(router))
}

#[test]
fn test_concurrent_mkdir_creates_one_shadow_root() {
    let (scratch, _image, router) = shared_router();

    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let router = Arc::clone(&router);
            thread::spawn(move || {
                // data is an archive directory, so every thread also mirrors it
                router
                    .mkdir(&format!("/__scope__/data/t{}", i), 0o755)
                    .unwrap();
                router.shadow_root().unwrap().to_string()
            })
        })
        .collect();

    let roots: HashSet<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(roots.len(), 1);

    let root = PathBuf::from(roots.into_iter().next().unwrap());
    for i in 0..THREADS {
        assert!(root.join(format!("data/t{}", i)).is_dir());
    }

    let created: Vec<_> = std::fs::read_dir(scratch.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(created, vec![root]);
}

#[test]
fn test_concurrent_readers_get_distinct_descriptors() {
    let (_scratch, _image, router) = shared_router();

    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let router = Arc::clone(&router);
            thread::spawn(move || {
                let fd = router
                    .open(
                        &format!("/__scope__/data/file{}.txt", i),
                        &OpenOptions::read_only(),
                    )
                    .unwrap();
                let mut buf = [0u8; 16];
                let n = router.read(fd, &mut buf).unwrap();
                assert_eq!(&buf[..n], format!("data{}", i).as_bytes());
                fd
            })
        })
        .collect();

    // Held open until every thread has read
    let fds: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let distinct: HashSet<_> = fds.iter().copied().collect();
    assert_eq!(distinct.len(), THREADS);
    assert!(fds.iter().all(|&fd| fd >= VFD_BASE));

    for fd in fds {
        router.close(fd).unwrap();
    }
}

#[test]
fn test_concurrent_directory_streams() {
    let (_scratch, _image, router) = shared_router();

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let router = Arc::clone(&router);
            thread::spawn(move || {
                let dir = router.opendir("/__scope__/data").unwrap();
                let mut names = Vec::new();
                while let Some(entry) = router.readdir(dir).unwrap() {
                    if entry.name.starts_with("file") {
                        names.push(entry.name);
                    }
                }
                assert_eq!(names.len(), THREADS);
                dir
            })
        })
        .collect();

    let dirs: Vec<DirHandle> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let distinct: HashSet<_> = dirs.iter().copied().collect();
    assert_eq!(distinct.len(), THREADS);

    for dir in dirs {
        router.closedir(dir).unwrap();
    }
}
