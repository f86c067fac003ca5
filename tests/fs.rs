//! File system behavior against the simulated NOR flash.

use rand::RngCore as _;
use rand::SeedableRng as _;

use norfs::{Config, Error, Fs, Mode, SeekFrom, SimulatedNorFlash};

type Flash = SimulatedNorFlash<256, 256, 8>;

const PAGE: usize = 256;

fn mount_fresh() -> Fs<Flash> {
    Fs::mount(Flash::new(), Config::new()).unwrap()
}

fn remount(fs: Fs<Flash>) -> Fs<Flash> {
    let dev = fs.unmount().unwrap();
    Fs::mount(dev, Config::new()).unwrap()
}

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

#[test]
fn small_file_roundtrip_survives_remount() {
    let mut fs = mount_fresh();
    let data = b"Hello, NORF!\0";
    assert_eq!(data.len(), 13);
    write_file(&mut fs, "a.dat", data);

    let mut fs = remount(fs);
    assert_eq!(fs.file_size("a.dat").unwrap(), 13);
    assert_eq!(read_file(&mut fs, "a.dat"), data);
    fs.check().unwrap();
}

#[test]
fn overwrite_goes_through_delta_pages() {
    let mut fs = mount_fresh();
    let first: Vec<u8> = (0..512u32).map(|i| (i % 256) as u8).collect();
    let id = fs.open("a.dat", Mode::WRITE).unwrap();
    fs.write(id, &first).unwrap();

    let second: Vec<u8> = (0..512u32).map(|i| 255 - (i % 256) as u8).collect();
    fs.seek(id, SeekFrom::Start(0)).unwrap();
    fs.write(id, &second).unwrap();
    fs.close(id).unwrap();

    assert_eq!(read_file(&mut fs, "a.dat"), second);
    // The superseded pages wait for the next merge
    assert!(fs.to_be_released_space().unwrap().data_pages >= 2);
    fs.check().unwrap();

    let mut fs = remount(fs);
    assert_eq!(read_file(&mut fs, "a.dat"), second);
}

#[test]
fn sixteen_files_survive_removal_of_one() {
    let mut fs = mount_fresh();
    for i in 0..16 {
        write_file(&mut fs, &format!("f{i}"), &pattern(PAGE, i));
    }
    fs.remove("f7").unwrap();
    assert!(!fs.exists("f7"));

    let mut fs = remount(fs);
    assert!(!fs.exists("f7"));
    for i in (0..16).filter(|&i| i != 7) {
        assert_eq!(read_file(&mut fs, &format!("f{i}")), pattern(PAGE, i));
    }
    fs.check().unwrap();

    // The removed pages wait for a merge; reclaim is block granular
    assert!(fs.to_be_released_space().unwrap().data_pages >= 1);
    for i in (0..16).filter(|&i| i != 7) {
        fs.remove(&format!("f{i}")).unwrap();
    }
    fs.merge().unwrap();
    fs.check().unwrap();
}

#[test]
fn removing_everything_reclaims_all_data_pages() {
    let mut fs = mount_fresh();
    let initial = fs.free_space().unwrap().data_pages;

    let chunk = pattern(32 * PAGE, 13);
    let id = fs.open("big", Mode::WRITE).unwrap();
    let err = loop {
        match fs.write(id, &chunk) {
            Ok(_) => {}
            Err(e) => break e,
        }
    };
    assert_eq!(err, Error::NoMoreSpace);
    fs.close(id).unwrap();
    assert_eq!(fs.free_space().unwrap().data_pages, 0);

    fs.remove("big").unwrap();
    fs.merge().unwrap();
    assert_eq!(fs.free_space().unwrap().data_pages, initial);
    fs.check().unwrap();
}

#[test]
fn filling_the_device_fails_cleanly() {
    let mut fs = mount_fresh();
    let chunk = pattern(32 * PAGE, 9);
    let id = fs.open("big", Mode::WRITE).unwrap();
    let mut written = 0usize;
    let err = loop {
        match fs.write(id, &chunk) {
            Ok(n) => written += n,
            Err(e) => break e,
        }
    };
    assert_eq!(err, Error::NoMoreSpace);
    fs.close(id).unwrap();

    // Overwriting now needs a delta page and none is left; at the API this
    // is indistinguishable from any other out-of-space condition
    let id = fs.open("big", "r+".parse().unwrap()).unwrap();
    assert_eq!(fs.write(id, &pattern(PAGE, 10)), Err(Error::NoMoreSpace));
    fs.close(id).unwrap();

    // Still mountable, and the visible size covers only what succeeded
    let mut fs = remount(fs);
    let size = fs.file_size("big").unwrap() as usize;
    assert!(size <= written + 32 * PAGE);
    let id = fs.open("big", Mode::READ).unwrap();
    let mut buf = vec![0u8; PAGE];
    assert_eq!(fs.read(id, &mut buf).unwrap(), PAGE);
    assert_eq!(&buf, &chunk[..PAGE]);
    fs.close(id).unwrap();
}

#[test]
fn seek_from_end_reads_the_tail() {
    let mut fs = mount_fresh();
    let data = pattern(3 * PAGE + 17, 5);
    write_file(&mut fs, "big", &data);

    let id = fs.open("big", Mode::READ).unwrap();
    fs.seek(id, SeekFrom::End(-17)).unwrap();
    assert_eq!(fs.tell(id).unwrap(), 3 * PAGE as u32);
    let mut tail = [0u8; 17];
    assert_eq!(fs.read(id, &mut tail).unwrap(), 17);
    assert_eq!(&tail, &data[3 * PAGE..]);
    assert!(fs.eof(id).unwrap());
    fs.close(id).unwrap();
}

#[test]
fn overwriting_past_delta_capacity_merges_and_keeps_the_latest_value() {
    let mut fs = mount_fresh();
    // Default layout: 2 delta pages of 32 entries each
    write_file(&mut fs, "hot", &pattern(PAGE, 1));
    let id = fs.open("hot", "r+".parse().unwrap()).unwrap();
    for round in 0u8..80 {
        fs.seek(id, SeekFrom::Start(0)).unwrap();
        let data = vec![round; PAGE];
        fs.write(id, &data).unwrap();
    }
    fs.close(id).unwrap();
    assert_eq!(read_file(&mut fs, "hot"), vec![79u8; PAGE]);
    fs.check().unwrap();
}

#[test]
fn seeking_beyond_eof_pads_with_the_fill_byte() {
    let mut fs = mount_fresh();
    let id = fs.open("gap", Mode::WRITE).unwrap();
    fs.write(id, &[0xAAu8; 10]).unwrap();
    fs.seek(id, SeekFrom::Start(300)).unwrap();
    fs.write(id, &[0xBBu8; 5]).unwrap();
    fs.close(id).unwrap();

    let data = read_file(&mut fs, "gap");
    assert_eq!(data.len(), 305);
    assert_eq!(&data[..10], &[0xAAu8; 10]);
    assert!(data[10..300].iter().all(|&b| b == 0x00));
    assert_eq!(&data[300..], &[0xBBu8; 5]);
}

#[test]
fn seeking_beyond_eof_read_only_is_an_error() {
    let mut fs = mount_fresh();
    write_file(&mut fs, "a", &[1, 2, 3]);
    let id = fs.open("a", Mode::READ).unwrap();
    assert_eq!(fs.seek(id, SeekFrom::Start(100)), Err(Error::SeekNotPossible));
    fs.close(id).unwrap();
}

#[test]
fn rename_replaces_and_preserves_content() {
    let mut fs = mount_fresh();
    let data = pattern(700, 3);
    write_file(&mut fs, "old", &data);
    write_file(&mut fs, "victim", &pattern(100, 4));

    fs.rename("old", "new").unwrap();
    assert!(!fs.exists("old"));
    assert_eq!(fs.file_size("new").unwrap(), 700);
    assert_eq!(read_file(&mut fs, "new"), data);

    fs.rename("new", "victim").unwrap();
    assert!(!fs.exists("new"));
    assert_eq!(read_file(&mut fs, "victim"), data);
    fs.check().unwrap();
}

#[test]
fn copy_streams_content_and_rejects_self_copy() {
    let mut fs = mount_fresh();
    let data = pattern(2 * PAGE + 31, 7);
    write_file(&mut fs, "src", &data);
    fs.copy("src", "dst").unwrap();
    assert_eq!(read_file(&mut fs, "dst"), data);
    assert_eq!(read_file(&mut fs, "src"), data);
    assert_eq!(fs.copy("src", "src"), Err(Error::FileAlreadyExist));
    fs.check().unwrap();
}

#[test]
fn append_mode_always_writes_at_the_end() {
    let mut fs = mount_fresh();
    write_file(&mut fs, "log", b"one");
    let id = fs.open("log", Mode::APPEND).unwrap();
    fs.write(id, b"two").unwrap();
    fs.close(id).unwrap();
    assert_eq!(read_file(&mut fs, "log"), b"onetwo");

    // "a" must not truncate, and "a+" can read back
    let id = fs.open("log", "a+".parse().unwrap()).unwrap();
    fs.write(id, b"three").unwrap();
    fs.seek(id, SeekFrom::Start(0)).unwrap();
    let mut buf = vec![0u8; 11];
    fs.read(id, &mut buf).unwrap();
    assert_eq!(&buf, b"onetwothree");
    fs.close(id).unwrap();
}

#[test]
fn open_modes_are_enforced() {
    let mut fs = mount_fresh();
    assert_eq!(
        fs.open("missing", Mode::READ).unwrap_err(),
        Error::FileNotFound
    );
    assert_eq!(
        fs.open("missing", "r+".parse().unwrap()).unwrap_err(),
        Error::FileNotFound
    );
    assert!("x".parse::<Mode>().is_err());
    assert!("rw".parse::<Mode>().is_err());

    write_file(&mut fs, "a", b"data");
    let id = fs.open("a", Mode::READ).unwrap();
    assert_eq!(fs.write(id, b"no"), Err(Error::InvalidOpenMode));
    fs.close(id).unwrap();

    let id = fs.open("a", Mode::APPEND).unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(fs.read(id, &mut buf), Err(Error::InvalidOpenMode));
    assert_eq!(fs.file_error(id).unwrap(), Some(Error::InvalidOpenMode));
    fs.close(id).unwrap();

    // "w" truncates existing content
    let id = fs.open("a", Mode::WRITE).unwrap();
    fs.close(id).unwrap();
    assert_eq!(fs.file_size("a").unwrap(), 0);
}

#[test]
fn file_names_are_validated() {
    let mut fs = mount_fresh();
    assert_eq!(fs.open("", Mode::WRITE).unwrap_err(), Error::InvalidFileName);
    assert_eq!(
        fs.open("bad*name", Mode::WRITE).unwrap_err(),
        Error::InvalidFileName
    );
    assert_eq!(
        fs.open("bad?name", Mode::WRITE).unwrap_err(),
        Error::InvalidFileName
    );
    let long = "x".repeat(33);
    assert_eq!(fs.open(&long, Mode::WRITE).unwrap_err(), Error::InvalidFileName);
    // The temporary-name character is allowed
    let id = fs.open("ok%name", Mode::WRITE).unwrap();
    fs.close(id).unwrap();
}

#[test]
fn user_data_round_trips_through_the_entry() {
    let mut fs = mount_fresh();
    write_file(&mut fs, "stamped", b"payload");
    let id = fs.open("stamped", "r+".parse().unwrap()).unwrap();
    fs.set_user_data(id, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
    assert_eq!(fs.set_user_data(id, &[0; 4]), Err(Error::Configuration));
    fs.close(id).unwrap();

    let mut fs = remount(fs);
    let id = fs.open("stamped", Mode::READ).unwrap();
    assert_eq!(fs.user_data(id).unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    fs.close(id).unwrap();
}

#[test]
fn directories_hold_their_own_entries() {
    let mut fs = mount_fresh();
    fs.mkdir("/logs").unwrap();
    assert_eq!(fs.mkdir("/logs").unwrap_err(), Error::FileAlreadyExist);

    write_file(&mut fs, "/logs/boot.txt", b"inside");
    write_file(&mut fs, "boot.txt", b"outside");
    assert_eq!(read_file(&mut fs, "/logs/boot.txt"), b"inside");
    assert_eq!(read_file(&mut fs, "boot.txt"), b"outside");

    fs.chdir("/logs").unwrap();
    assert_eq!(fs.cwd(), "/logs");
    assert_eq!(read_file(&mut fs, "boot.txt"), b"inside");
    assert_eq!(read_file(&mut fs, "../boot.txt"), b"outside");
    fs.chdir("/").unwrap();

    let dir = fs.open_dir("/logs").unwrap();
    let mut names = Vec::new();
    while let Some(e) = fs.read_dir(dir).unwrap() {
        names.push(e.name);
    }
    fs.close_dir(dir).unwrap();
    assert_eq!(names, vec!["boot.txt".to_string()]);

    assert_eq!(fs.rmdir("/logs").unwrap_err(), Error::DirectoryNotEmpty);
    fs.remove("/logs/boot.txt").unwrap();
    fs.rmdir("/logs").unwrap();
    assert!(!fs.exists("/logs"));
    assert_eq!(fs.open_dir("/logs").unwrap_err(), Error::FileNotFound);
    fs.check().unwrap();
}

#[test]
fn directories_survive_a_merge() {
    let mut fs = mount_fresh();
    fs.mkdir("/cfg").unwrap();
    let data = pattern(3 * PAGE, 11);
    write_file(&mut fs, "/cfg/settings", &data);
    fs.merge().unwrap();
    assert_eq!(read_file(&mut fs, "/cfg/settings"), data);

    let mut fs = remount(fs);
    assert_eq!(read_file(&mut fs, "/cfg/settings"), data);
    fs.check().unwrap();
}

#[test]
fn diagnostic_listing_shows_deleted_entries() {
    let mut fs = mount_fresh();
    write_file(&mut fs, "keep", b"k");
    write_file(&mut fs, "drop", b"d");
    fs.remove("drop").unwrap();

    let dir = fs.open_dir("/").unwrap();
    let mut names = Vec::new();
    while let Some(e) = fs.read_dir(dir).unwrap() {
        names.push(e.name);
    }
    fs.close_dir(dir).unwrap();
    assert_eq!(names, vec!["keep".to_string()]);

    let dir = fs.open_dir_diagnostic("/").unwrap();
    let mut all = Vec::new();
    while let Some(e) = fs.read_dir(dir).unwrap() {
        all.push((e.name, e.attrib & norfs::ATTR_DELETED != 0));
    }
    fs.close_dir(dir).unwrap();
    assert_eq!(
        all,
        vec![("keep".to_string(), false), ("drop".to_string(), true)]
    );
}

#[test]
fn nested_directories_are_rejected() {
    let mut fs = mount_fresh();
    fs.mkdir("/a").unwrap();
    assert_eq!(fs.mkdir("/a/b").unwrap_err(), Error::NotADirectory);
    assert_eq!(
        fs.open("/a/b/c", Mode::WRITE).unwrap_err(),
        Error::NotADirectory
    );
}

#[test]
fn handles_are_a_bounded_resource() {
    let mut fs = mount_fresh();
    let ids: Vec<_> = (0..4)
        .map(|i| fs.open(&format!("h{i}"), Mode::WRITE).unwrap())
        .collect();
    assert_eq!(fs.open("h4", Mode::WRITE).unwrap_err(), Error::NoMoreResource);
    for id in ids {
        fs.close(id).unwrap();
    }
    let id = fs.open("h4", Mode::WRITE).unwrap();
    fs.close(id).unwrap();
}

#[test]
fn open_files_survive_a_merge() {
    let mut fs = mount_fresh();
    let data = pattern(2 * PAGE, 21);
    write_file(&mut fs, "kept", &data);
    let id = fs.open("kept", Mode::READ).unwrap();
    let mut head = [0u8; 100];
    fs.read(id, &mut head).unwrap();

    fs.merge().unwrap();

    // Position and content are intact in the new management area
    assert_eq!(fs.tell(id).unwrap(), 100);
    let mut rest = vec![0u8; data.len() - 100];
    assert_eq!(fs.read(id, &mut rest).unwrap(), rest.len());
    assert_eq!(&rest[..], &data[100..]);
    fs.close(id).unwrap();
    fs.check().unwrap();
}

#[test]
fn rewind_flush_and_telemetry() {
    let mut fs = mount_fresh();
    let id = fs.open("t", Mode::WRITE).unwrap();
    fs.write(id, &pattern(100, 2)).unwrap();
    fs.flush(id).unwrap();
    assert_eq!(fs.file_size("t").unwrap(), 100);
    fs.close(id).unwrap();

    let id = fs.open("t", Mode::READ).unwrap();
    let mut buf = [0u8; 100];
    fs.read(id, &mut buf).unwrap();
    fs.rewind(id).unwrap();
    assert_eq!(fs.tell(id).unwrap(), 0);
    fs.close(id).unwrap();

    let (free_entries, _) = fs.entry_stats().unwrap();
    assert!(free_entries > 0);
    let free = fs.free_space().unwrap();
    assert!(free.data_pages > 0);
    assert_eq!(free.data_bytes, free.data_pages * PAGE);
}
