//! File-list codec round trips across the supported protocol versions.

mod common;

use std::io::Write;

use common::RustCryptoDigests;
use md4::Md4;
use md5::{Digest, Md5};

use rsyn_wire::flist::{FlistItem, FLAG_CONTENT_DIR, FLAG_HLINKED, FLAG_HLINK_FIRST, FLAG_TOP_DIR};
use rsyn_wire::{
    Buffer, DigestKind, FileEntry, FlistDecoder, FlistEncoder, NameLookup, Options,
};

struct Passwd;

impl NameLookup for Passwd {
    fn uid_to_name(&self, uid: i32) -> Option<String> {
        match uid {
            1000 => Some("ferris".to_string()),
            0 => Some("root".to_string()),
            _ => None,
        }
    }

    fn gid_to_name(&self, gid: i32) -> Option<String> {
        match gid {
            1000 => Some("crab".to_string()),
            _ => None,
        }
    }
}

fn entry(dir: &str, name: &str, mode: u32) -> FileEntry {
    FileEntry {
        dir: dir.as_bytes().to_vec(),
        name: name.as_bytes().to_vec(),
        mode,
        uid: 1000,
        gid: 1000,
        mtime: 1588429517,
        size: 0,
        dev: Some(64768),
        ino: None,
        ..FileEntry::default()
    }
}

/// A small tree exercising every field shape: directories, plain files,
/// long names, symlinks, devices, specials, and a hard-linked pair.
fn sample_tree() -> Vec<FileEntry> {
    let mut top = entry("", ".", 0o040755);
    top.flags = FLAG_TOP_DIR | FLAG_CONTENT_DIR;
    top.ino = Some(2);

    let mut readme = entry("", "README", 0o100644);
    readme.size = 1417;
    readme.ino = Some(3);
    readme.mtime_nsec = Some(998877665);

    let mut huge = entry("data", "big.bin", 0o100600);
    huge.size = (1 << 40) + 17;
    huge.uid = 0;
    huge.gid = 0;
    huge.mtime = 1588430000;
    huge.ino = Some(4);

    let long_name = "x".repeat(300);
    let mut deep = entry("data", &long_name, 0o100644);
    deep.size = 9;
    deep.ino = Some(5);

    let mut link = entry("data", "latest", 0o120777);
    link.symlink = Some(b"big.bin".to_vec());
    link.ino = Some(6);

    let mut tty = entry("dev", "tty0", 0o020620);
    tty.rdev = Some((4, 0));
    tty.ino = Some(7);

    let mut disk = entry("dev", "sdb3", 0o060660);
    disk.rdev = Some((8, 300));
    disk.ino = Some(8);

    let mut fifo = entry("run", "pipe", 0o010600);
    fifo.rdev = Some((0, 0));
    fifo.ino = Some(9);

    let mut hard1 = entry("pack", "one", 0o100444);
    hard1.size = 5000;
    hard1.ino = Some(77);
    let mut hard2 = entry("pack", "two", 0o100444);
    hard2.size = 5000;
    hard2.ino = Some(77);

    vec![
        top, readme, huge, deep, link, tty, disk, fifo, hard1, hard2,
    ]
}

fn roundtrip(opts: &Options, protocol: i32, entries: &[FileEntry]) -> Vec<FileEntry> {
    let mut enc = FlistEncoder::new(opts, protocol).unwrap();
    let mut dec = FlistDecoder::new(opts, protocol).unwrap();
    let mut buf = Buffer::new();
    for e in entries {
        enc.write_entry(&mut buf, e, Some(&Passwd), Some(&RustCryptoDigests))
            .unwrap();
    }
    enc.write_end(&mut buf);

    let mut decoded = Vec::new();
    loop {
        match dec.read_entry(&mut buf).unwrap() {
            Some(FlistItem::Entry(e)) => decoded.push(e),
            Some(FlistItem::End) => break,
            None => panic!("decoder starved with {} bytes left", buf.remaining()),
        }
    }
    assert_eq!(buf.remaining(), 0, "trailing bytes after the end marker");
    decoded
}

#[test]
fn semantic_fields_survive_every_version() {
    for &protocol in &[29, 30, 31] {
        let mut opts = Options::new();
        opts.apply_argv(&["-a", "-H"]).unwrap();
        let entries = sample_tree();
        let decoded = roundtrip(&opts, protocol, &entries);
        assert_eq!(decoded.len(), entries.len(), "protocol {}", protocol);
        for (got, want) in decoded.iter().zip(&entries) {
            let name = want.name_lossy_string();
            assert_eq!(got.full_name_bytes(), want.full_name_bytes());
            assert_eq!(got.mode, want.mode, "mode of {} at {}", name, protocol);
            assert_eq!(got.mtime, want.mtime, "mtime of {} at {}", name, protocol);
            assert_eq!(got.uid, want.uid, "uid of {} at {}", name, protocol);
            assert_eq!(got.gid, want.gid, "gid of {} at {}", name, protocol);
            assert_eq!(got.size, want.size, "size of {} at {}", name, protocol);
            assert_eq!(got.symlink, want.symlink, "symlink of {}", name);
            if want.is_device() || (want.is_special() && protocol < 31) {
                assert_eq!(got.rdev, want.rdev, "rdev of {} at {}", name, protocol);
            }
            if protocol >= 31 {
                assert_eq!(got.mtime_nsec, want.mtime_nsec, "nsec of {}", name);
            } else {
                assert_eq!(got.mtime_nsec, None);
            }
        }
    }
}

#[test]
fn uid_and_gid_names_ride_along_from_protocol_30() {
    let mut opts = Options::new();
    opts.apply_argv(&["-og"]).unwrap();
    let mut enc = FlistEncoder::new(&opts, 30).unwrap();
    let mut dec = FlistDecoder::new(&opts, 30).unwrap();
    let mut buf = Buffer::new();
    let mut e = entry("", "owned", 0o100644);
    e.dev = None;
    enc.write_entry(&mut buf, &e, Some(&Passwd), None).unwrap();
    enc.write_end(&mut buf);
    while let Some(item) = dec.read_entry(&mut buf).unwrap() {
        if item == FlistItem::End {
            break;
        }
    }
    assert_eq!(dec.uid_name(1000), Some(&b"ferris"[..]));
    assert_eq!(dec.gid_name(1000), Some(&b"crab"[..]));
}

#[test]
fn hard_link_resights_are_references_on_protocol_30() {
    let mut opts = Options::new();
    opts.apply_argv(&["-a", "-H"]).unwrap();
    let entries = sample_tree();
    let decoded = roundtrip(&opts, 30, &entries);
    let one = decoded.iter().find(|e| e.name == b"one").unwrap();
    let two = decoded.iter().find(|e| e.name == b"two").unwrap();
    assert_ne!(one.flags & FLAG_HLINK_FIRST, 0);
    assert_ne!(two.flags & FLAG_HLINKED, 0);
    assert_eq!(two.flags & FLAG_HLINK_FIRST, 0);
    assert_eq!(two.size, one.size);
    assert_eq!(two.mode, one.mode);
}

#[test]
fn hard_links_into_an_earlier_sublist_omit_the_body() {
    let mut opts = Options::new();
    opts.apply_argv(&["-a", "-H"]).unwrap();
    let mut enc = FlistEncoder::new(&opts, 30).unwrap();
    let mut dec = FlistDecoder::new(&opts, 30).unwrap();
    let mut buf = Buffer::new();

    let mut one = entry("pack", "one", 0o100444);
    one.size = 5000;
    one.ino = Some(77);
    enc.write_entry(&mut buf, &one, None, None).unwrap();
    enc.write_end(&mut buf);
    match dec.read_entry(&mut buf).unwrap() {
        Some(FlistItem::Entry(e)) => assert_eq!(e.name, b"one".to_vec()),
        other => panic!("expected an entry, got {:?}", other),
    }
    assert_eq!(dec.read_entry(&mut buf).unwrap(), Some(FlistItem::End));
    buf.discard();

    enc.begin_list();
    dec.begin_list();

    let mut two = entry("pack", "two", 0o100444);
    two.size = 5000;
    two.ino = Some(77);
    // Give the link a different mtime: it never reaches the wire, so the
    // copy from the first sighting must win.
    two.mtime = one.mtime + 100;
    enc.write_entry(&mut buf, &two, None, None).unwrap();
    // Flags (extended), prefix length, suffix length, "two", and the
    // back-reference; no size, times, mode, or ids follow it.
    assert_eq!(buf.remaining(), 8);
    enc.write_end(&mut buf);
    match dec.read_entry(&mut buf).unwrap() {
        Some(FlistItem::Entry(e)) => {
            assert_eq!(e.name, b"two".to_vec());
            assert_eq!(e.size, one.size);
            assert_eq!(e.mode, one.mode);
            assert_eq!(e.mtime, one.mtime);
            assert_ne!(e.flags & FLAG_HLINKED, 0);
            assert_eq!(e.flags & FLAG_HLINK_FIRST, 0);
        }
        other => panic!("expected an entry, got {:?}", other),
    }
    assert_eq!(dec.read_entry(&mut buf).unwrap(), Some(FlistItem::End));
    assert_eq!(buf.remaining(), 0);
}

#[test]
fn directory_flags_survive_protocol_30() {
    let mut opts = Options::new();
    opts.apply_argv(&["-a"]).unwrap();
    let entries = sample_tree();
    let decoded = roundtrip(&opts, 30, &entries);
    let top = &decoded[0];
    assert_ne!(top.flags & FLAG_TOP_DIR, 0);
    assert_ne!(top.flags & FLAG_CONTENT_DIR, 0);
}

#[test]
fn checksums_ride_along_when_requested() {
    let material = b"the quick brown fox";

    let mut opts = Options::new();
    opts.apply_argv(&["-c"]).unwrap();
    let mut with_data = entry("", "checked", 0o100644);
    with_data.size = material.len() as i64;
    with_data.data = Some(material.to_vec());
    with_data.dev = None;

    // Protocol 30 checksums with MD5.
    let decoded = roundtrip(&opts, 30, std::slice::from_ref(&with_data));
    assert_eq!(
        decoded[0].md5.as_deref(),
        Some(Md5::digest(material).as_slice())
    );

    // Protocol 29 falls back to MD4.
    let decoded = roundtrip(&opts, 29, std::slice::from_ref(&with_data));
    assert_eq!(
        decoded[0].md4.as_deref(),
        Some(Md4::digest(material).as_slice())
    );
}

#[test]
fn checksum_material_can_come_from_disk() {
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(b"spilled to disk").unwrap();
    let mut e = entry("", "ondisk", 0o100644);
    e.path = Some(tmp.path().to_path_buf());
    let sum =
        rsyn_wire::digest::filelist_checksum(Some(&RustCryptoDigests), DigestKind::Md5, &e)
            .unwrap();
    assert_eq!(sum, Md5::digest(b"spilled to disk").to_vec());
}

#[test]
fn entry_without_material_cannot_be_checksummed() {
    let e = entry("", "ghost", 0o100644);
    assert!(
        rsyn_wire::digest::filelist_checksum(Some(&RustCryptoDigests), DigestKind::Md5, &e)
            .is_err()
    );
}

#[test]
fn cached_sums_win_over_material() {
    let mut e = entry("", "cached", 0o100644);
    e.md5 = Some(vec![0xab; 16]);
    e.data = Some(b"ignored".to_vec());
    let sum =
        rsyn_wire::digest::filelist_checksum(Some(&RustCryptoDigests), DigestKind::Md5, &e)
            .unwrap();
    assert_eq!(sum, vec![0xab; 16]);
}

#[test]
fn decoder_survives_arbitrary_chunking() {
    let mut opts = Options::new();
    opts.apply_argv(&["-a", "-H"]).unwrap();
    let entries = sample_tree();

    let mut enc = FlistEncoder::new(&opts, 31).unwrap();
    let mut wire = Buffer::new();
    for e in &entries {
        enc.write_entry(&mut wire, e, Some(&Passwd), None).unwrap();
    }
    enc.write_end(&mut wire);
    let bytes = wire.take();

    let mut dec = FlistDecoder::new(&opts, 31).unwrap();
    let mut buf = Buffer::new();
    let mut decoded = Vec::new();
    let mut ended = false;
    for byte in &bytes {
        buf.append(&[*byte]);
        loop {
            match dec.read_entry(&mut buf).unwrap() {
                Some(FlistItem::Entry(e)) => decoded.push(e),
                Some(FlistItem::End) => {
                    ended = true;
                    break;
                }
                None => break,
            }
        }
        buf.discard();
    }
    assert!(ended);
    assert_eq!(decoded.len(), entries.len());
    for (got, want) in decoded.iter().zip(&entries) {
        assert_eq!(got.full_name_bytes(), want.full_name_bytes());
        assert_eq!(got.size, want.size);
        assert_eq!(got.mtime_nsec, want.mtime_nsec);
    }
}
