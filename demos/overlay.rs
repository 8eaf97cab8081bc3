/// Walk through the overlay: pack a tree, change into it, read, write, list
///
/// Run with: RUST_LOG=packfs=debug cargo run --example overlay
use anyhow::Context;
use packfs::{alphasort, ImageWriter, OpenOptions, Router, RouterConfig};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== packfs overlay ===\n");

    let scratch = TempDir::new()?;
    let image_path = scratch.path().join("app.pkf");

    println!("1. Packing image...");
    {
        let mut writer = ImageWriter::create(&image_path)?;
        writer.add_file("lib/index.js", b"module.exports = 42;\n")?;
        writer.add_file("lib/package.json", br#"{"name": "demo"}"#)?;
        writer.add_symlink("main.js", "lib/index.js")?;
        writer.finalize()?;
    }
    println!("   ✓ {}", image_path.display());

    let config = RouterConfig::default().with_temp_root(scratch.path());
    let marker = config.mount_marker.clone();
    let router = Router::with_image(config, &image_path)?;

    println!("\n2. Reading through the virtual working directory...");
    router.chdir(&format!("{}/lib", marker))?;
    println!("   cwd = {}", router.current_dir()?.display());
    let fd = router.open("index.js", &OpenOptions::read_only())?;
    let mut buf = [0u8; 64];
    let n = router.read(fd, &mut buf)?;
    router.close(fd)?;
    println!("   index.js = {:?}", String::from_utf8_lossy(&buf[..n]));

    println!("\n3. Writing into the shadow overlay...");
    router.mkdir("cache", 0o755)?;
    let shadow = router
        .shadow_root()
        .context("mkdir should have created the shadow root")?;
    println!("   shadow root = {}", shadow);
    let fd = router.open(
        "cache/out.txt",
        &OpenOptions::create(libc::O_WRONLY | libc::O_TRUNC, 0o644),
    )?;
    router.close(fd)?;

    println!("\n4. Listing...");
    for entry in router.scandir(".", None, Some(&alphasort))? {
        println!("   {}", entry.name);
    }

    println!("\n5. Extracting a packed file to the host...");
    let extracted = router.extract(&format!("{}/main.js", marker), None)?;
    println!("   {}", extracted.display());

    println!("\n✓ Example complete!");
    Ok(())
}
