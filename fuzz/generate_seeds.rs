//! Generate the seed corpus for `fuzz_image_parse`

use packfs::ImageWriter;
use std::fs;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let corpus_dir = "fuzz/corpus/fuzz_image_parse";
    fs::create_dir_all(corpus_dir)?;

    let seeds: [(&str, fn(&mut ImageWriter) -> packfs::Result<()>); 5] = [
        ("empty", |_| Ok(())),
        ("single", |w| w.add_file("hello.txt", b"Hello, World!")),
        ("nested", |w| {
            w.add_file("a/b/c.txt", b"deep")?;
            w.add_dir("a/empty", 0o755)?;
            w.add_symlink("a/link", "b/c.txt")
        }),
        ("compressible", |w| {
            w.add_file("large.txt", &b"compress me please. ".repeat(1000))
        }),
        ("binary", |w| {
            let bytes: Vec<u8> = (0..=255).collect();
            w.add_file("blob.bin", &bytes)?;
            w.add_file("zero.bin", b"")
        }),
    ];

    for (name, fill) in seeds {
        let path = format!("{}/seed_{}.pkf", corpus_dir, name);
        let mut writer = ImageWriter::create(&path)?;
        fill(&mut writer)?;
        writer.finalize()?;
        println!("✓ Generated: {}", path);
    }

    Ok(())
}
