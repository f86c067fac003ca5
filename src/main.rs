use anyhow::Context as _;
use norfs::{Config, Fs, SimulatedNorFlashBuilder, TransactionLogLevel};

pub fn main() -> anyhow::Result<()> {
    let flash = SimulatedNorFlashBuilder::new()
        .with_logging(TransactionLogLevel::Minimal)
        .build::<256, 256, 8>();
    let mut fs = Fs::mount(flash, Config::new()).context("mount failed")?;
    println!("{fs}");

    let id = fs.open("hello.txt", "w".parse()?)?;
    fs.write(id, b"written on a simulated NOR flash")?;
    fs.close(id)?;

    let id = fs.open("hello.txt", "r".parse()?)?;
    let mut buf = vec![0u8; fs.file_size("hello.txt")? as usize];
    fs.read(id, &mut buf)?;
    fs.close(id)?;
    println!("hello.txt: {}", String::from_utf8_lossy(&buf));

    let dir = fs.open_dir("/")?;
    while let Some(e) = fs.read_dir(dir)? {
        println!("{:>8}  {}", e.size, e.name);
    }
    fs.close_dir(dir)?;

    let free = fs.free_space()?;
    println!(
        "free: {} data bytes, {} management pages",
        free.data_bytes, free.management_pages
    );

    let flash = fs.unmount()?;
    println!(
        "device: {} bytes written, {} blocks erased, {} accesses",
        flash.bytes_written(),
        flash.blocks_erased(),
        flash.total_accesses()
    );
    Ok(())
}
