//! Power-loss recovery and wear behavior.

use rand::RngCore as _;
use rand::SeedableRng as _;

use norfs::{Config, Fs, Mode, SeekFrom, SimulatedNorFlash, Transaction};

type Flash = SimulatedNorFlash<256, 256, 8>;

const PAGE: usize = 256;

fn pattern(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = rand::rngs::SmallRng::seed_from_u64(seed);
    let mut buf = vec![0u8; len];
    rng.fill_bytes(&mut buf);
    buf
}

fn write_file(fs: &mut Fs<Flash>, name: &str, data: &[u8]) {
    let id = fs.open(name, Mode::WRITE).unwrap();
    fs.write(id, data).unwrap();
    fs.close(id).unwrap();
}

fn read_file(fs: &mut Fs<Flash>, name: &str) -> Vec<u8> {
    let id = fs.open(name, Mode::READ).unwrap();
    let mut buf = vec![0u8; fs.file_size(name).unwrap() as usize];
    let n = fs.read(id, &mut buf).unwrap();
    assert_eq!(n, buf.len());
    fs.close(id).unwrap();
    buf
}

/// A state worth compacting: live files, a delta overwrite and a removal.
fn build_workload() -> Flash {
    let mut fs = Fs::mount(Flash::new(), Config::new()).unwrap();
    write_file(&mut fs, "alpha", &pattern(3 * PAGE + 10, 1));
    write_file(&mut fs, "beta", &pattern(PAGE, 2));
    write_file(&mut fs, "doomed", &pattern(2 * PAGE, 3));

    let id = fs.open("beta", "r+".parse().unwrap()).unwrap();
    fs.seek(id, SeekFrom::Start(0)).unwrap();
    fs.write(id, &pattern(PAGE, 20)).unwrap();
    fs.close(id).unwrap();

    fs.remove("doomed").unwrap();
    fs.unmount().unwrap()
}

fn verify_workload(fs: &mut Fs<Flash>) {
    assert_eq!(read_file(fs, "alpha"), pattern(3 * PAGE + 10, 1));
    assert_eq!(read_file(fs, "beta"), pattern(PAGE, 20));
    assert!(!fs.exists("doomed"));
}

fn mutations(dev: &Flash) -> u32 {
    dev.transactions()
        .iter()
        .filter(|t| matches!(t, Transaction::Program { .. } | Transaction::Erase { .. }))
        .count() as u32
}

#[test]
fn merge_interrupted_at_every_boundary_loses_nothing() {
    // Count the program/erase operations of one full merge
    let mut dev = build_workload();
    dev.set_logging(norfs::TransactionLogLevel::Minimal);
    dev.reset_stats();
    let mut fs = Fs::mount(dev, Config::new()).unwrap();
    fs.merge().unwrap();
    verify_workload(&mut fs);
    let total = mutations(&fs.unmount().unwrap());
    assert!(total > 10, "a merge should take many device operations");

    // Cut the power before each of them in turn
    for cut in 0..total {
        let mut dev = build_workload();
        dev.arm_power_cut(cut);
        let mut fs = Fs::mount(dev, Config::new()).unwrap();
        assert!(fs.merge().is_err(), "cut {cut} should interrupt the merge");

        let mut dev = fs.into_device();
        dev.clear_power_cut();
        let mut fs = Fs::mount(dev, Config::new()).unwrap();
        verify_workload(&mut fs);

        // The file system keeps working: the next merge finishes the job
        fs.merge().unwrap();
        verify_workload(&mut fs);
        fs.check().unwrap();
    }
}

#[test]
fn power_cut_during_a_write_keeps_the_old_content() {
    let mut fs = Fs::mount(Flash::new(), Config::new()).unwrap();
    write_file(&mut fs, "stable", &pattern(2 * PAGE, 5));
    let mut dev = fs.unmount().unwrap();

    // Fail the third mutation of the overwrite
    dev.arm_power_cut(2);
    let mut fs = Fs::mount(dev, Config::new()).unwrap();
    let id = fs.open("stable", "r+".parse().unwrap()).unwrap();
    let _ = fs.write(id, &pattern(2 * PAGE, 6));

    let mut dev = fs.into_device();
    dev.clear_power_cut();
    let mut fs = Fs::mount(dev, Config::new()).unwrap();
    // Each page shows either its old or its new bytes, never a mix
    let old = pattern(2 * PAGE, 5);
    let new = pattern(2 * PAGE, 6);
    let content = read_file(&mut fs, "stable");
    for (i, page) in content.chunks(PAGE).enumerate() {
        let range = i * PAGE..(i + 1) * PAGE;
        assert!(
            page == &old[range.clone()] || page == &new[range],
            "page {i} is torn"
        );
    }
}

#[test]
fn churn_spreads_erase_wear() {
    let mut fs = Fs::mount(Flash::new(), Config::new()).unwrap();
    // A pinned file so the device is not trivially empty
    write_file(&mut fs, "pinned", &pattern(PAGE, 40));

    for round in 0..1000u64 {
        write_file(&mut fs, "churn", &pattern(PAGE, round));
        fs.remove("churn").unwrap();
    }
    assert_eq!(read_file(&mut fs, "pinned"), pattern(PAGE, 40));
    fs.check().unwrap();

    let mut counts = fs.wear_counts().unwrap();
    let max = counts.iter().copied().max().unwrap();
    assert!(max > 0, "churn should erase blocks");
    // The two management areas ping-pong and wear fastest; the allocator
    // bias keeps the data blocks level among themselves
    counts.sort_unstable();
    let data_spread = counts[5] - counts[0];
    assert!(
        data_spread <= 20,
        "data block wear spread {data_spread} exceeds the leveling bound"
    );

    // The static leveler runs clean on a leveled file system
    let moved = fs.level_wear(2).unwrap();
    assert!(moved <= 2);
    fs.check().unwrap();
}

#[test]
fn interrupted_mount_recovery_is_idempotent() {
    // Interrupt the merge right after its commit point: remount now has a
    // stale old area to erase and a next-management pointer to assign.
    let mut dev = build_workload();
    dev.set_logging(norfs::TransactionLogLevel::Minimal);
    dev.reset_stats();
    let mut fs = Fs::mount(dev, Config::new()).unwrap();
    fs.merge().unwrap();
    let dev = fs.unmount().unwrap();
    let after_full = mutations(&dev);

    // Walk backward a few cut points from the end of the merge; these land
    // in the erase-old/assign-next tail after the commit
    for back in 1..6 {
        if back >= after_full {
            break;
        }
        let mut dev = build_workload();
        dev.arm_power_cut(after_full - back);
        let mut fs = Fs::mount(dev, Config::new()).unwrap();
        let _ = fs.merge();

        let mut dev = fs.into_device();
        dev.clear_power_cut();
        // Mount twice: recovery must not depend on running exactly once
        let fs = Fs::mount(dev, Config::new()).unwrap();
        let mut fs = Fs::mount(fs.unmount().unwrap(), Config::new()).unwrap();
        verify_workload(&mut fs);
        fs.check().unwrap();
    }
}
