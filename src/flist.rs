// Copyright 2020 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! File lists and entries, and their delta-coded wire form.
//!
//! Each entry on the wire starts with a flags value whose `SAME_*` bits say
//! which fields simply repeat the previous entry; the encoder and decoder
//! each keep those cursors between entries, so both sides must walk the list
//! in the same order. Which fields exist at all depends on the protocol
//! version and the transfer options, so the codecs are built from an
//! [`Options`] record plus the negotiated version.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;

use anyhow::{bail, Result};
use chrono::{DateTime, Local, TimeZone};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::buffer::Buffer;
use crate::digest::{self, DigestKind, DigestProvider, NameLookup};
use crate::options::Options;

// Wire flag bits, as sent at the head of each entry. Several bits are
// reused: the pre-30 meaning is suffixed _PRE30, and the directory/device
// meanings of bit 8 never meet because devices aren't directories.
const XMIT_TOP_DIR: u16 = 1 << 0;
const XMIT_SAME_MODE: u16 = 1 << 1;
const XMIT_EXTENDED_FLAGS: u16 = 1 << 2;
const XMIT_SAME_UID: u16 = 1 << 3;
const XMIT_SAME_GID: u16 = 1 << 4;
const XMIT_SAME_NAME: u16 = 1 << 5;
const XMIT_LONG_NAME: u16 = 1 << 6;
const XMIT_SAME_TIME: u16 = 1 << 7;
const XMIT_SAME_RDEV_MAJOR: u16 = 1 << 8;
const XMIT_NO_CONTENT_DIR: u16 = 1 << 8;
const XMIT_HLINKED: u16 = 1 << 9;
const XMIT_SAME_DEV_PRE30: u16 = 1 << 10;
const XMIT_USER_NAME_FOLLOWS: u16 = 1 << 10;
const XMIT_RDEV_MINOR_8_PRE30: u16 = 1 << 11;
const XMIT_GROUP_NAME_FOLLOWS: u16 = 1 << 11;
const XMIT_HLINK_FIRST: u16 = 1 << 12;
const XMIT_MOD_NSEC: u16 = 1 << 13;

/// Entry is a top-level directory of the transfer.
pub const FLAG_TOP_DIR: u32 = 1 << 0;
/// Directory whose contents are included, not just the directory itself.
pub const FLAG_CONTENT_DIR: u32 = 1 << 1;
/// Directory only sent because something under it was.
pub const FLAG_IMPLIED_DIR: u32 = 1 << 2;
/// A sender-side duplicate, kept in place so indices stay stable.
pub const FLAG_DUPLICATE: u32 = 1 << 3;
/// Entry is one of several hard links to the same inode.
pub const FLAG_HLINKED: u32 = 1 << 4;
/// Entry is the first sighting of its inode.
pub const FLAG_HLINK_FIRST: u32 = 1 << 5;

/// The longest name prefix one entry can inherit from the previous one.
const MAX_NAME_PREFIX: usize = 255;

fn is_device(mode: u32) -> bool {
    unix_mode::is_block_device(mode) || unix_mode::is_char_device(mode)
}

fn is_special(mode: u32) -> bool {
    unix_mode::is_fifo(mode) || unix_mode::is_socket(mode)
}

/// Description of a single file (or directory or symlink etc).
///
/// The `Display` trait formats an entry like in `ls -l`, and like in rsync
/// directory listings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileEntry {
    /// Directory part of the name, possibly empty; bytes in the remote OS's
    /// encoding.
    pub dir: Vec<u8>,
    /// Name within `dir`.
    pub name: Vec<u8>,
    /// Unix mode, containing the file type and permissions.
    pub mode: u32,
    pub uid: i32,
    pub gid: i32,
    /// Modification time, in seconds since the Unix epoch.
    pub mtime: i64,
    /// Sub-second part of the modification time, sent from protocol 31.
    pub mtime_nsec: Option<i32>,
    /// Length of the file, in bytes.
    pub size: i64,
    /// Device major/minor numbers, for device and special files.
    pub rdev: Option<(i32, i32)>,
    /// Symlink target bytes.
    pub symlink: Option<Vec<u8>>,
    /// Device holding the file, for hard-link detection.
    pub dev: Option<i64>,
    pub ino: Option<i64>,
    /// Pre-computed checksums, used before any other material.
    pub md4: Option<Vec<u8>>,
    pub md5: Option<Vec<u8>>,
    /// In-memory contents to checksum when no sum is cached.
    pub data: Option<Vec<u8>>,
    /// On-disk file to checksum when neither a sum nor data is present.
    pub path: Option<PathBuf>,
    /// `FLAG_*` bits.
    pub flags: u32,
}

impl FileEntry {
    /// The full name as sent on the wire: `dir/name`, or just `name` when
    /// there's no directory part.
    pub fn full_name_bytes(&self) -> Vec<u8> {
        if self.dir.is_empty() {
            self.name.clone()
        } else {
            let mut v = self.dir.clone();
            v.push(b'/');
            v.extend_from_slice(&self.name);
            v
        }
    }

    /// Returns the file name, as a byte string, in the (remote) OS's encoding.
    ///
    /// rsync doesn't constrain the encoding, so this will typically, but not
    /// necessarily be UTF-8.
    pub fn name_bytes(&self) -> &[u8] {
        &self.name
    }

    /// Returns the full name, with un-decodable bytes converted to Unicode
    /// replacement characters.
    ///
    /// This is suitable for printing, but might not be suitable for use as a
    /// destination file name.
    pub fn name_lossy_string(&self) -> String {
        String::from_utf8_lossy(&self.full_name_bytes()).into_owned()
    }

    /// Returns true if this entry describes a plain file.
    pub fn is_file(&self) -> bool {
        unix_mode::is_file(self.mode)
    }

    /// Returns true if this entry describes a directory.
    pub fn is_dir(&self) -> bool {
        unix_mode::is_dir(self.mode)
    }

    /// Returns true if this entry describes a symlink.
    pub fn is_symlink(&self) -> bool {
        unix_mode::is_symlink(self.mode)
    }

    /// Returns true for block and character devices.
    pub fn is_device(&self) -> bool {
        is_device(self.mode)
    }

    /// Returns true for fifos and sockets.
    pub fn is_special(&self) -> bool {
        is_special(self.mode)
    }

    /// Returns the modification time, in seconds since the Unix epoch.
    pub fn unix_mtime(&self) -> i64 {
        self.mtime
    }

    /// Returns the modification time in the local timezone, if it's in
    /// chrono's representable range.
    pub fn mtime_local(&self) -> Option<DateTime<Local>> {
        Local.timestamp_opt(self.mtime, 0).single()
    }

    /// The canonical key used for ordering and duplicate detection.
    ///
    /// From protocol 29, a non-directory keeps a NUL where the last
    /// separator would be, so files sort before subdirectories of the same
    /// parent; a directory entry named `.` stands for its `dir` itself.
    pub fn sort_key(&self, protocol_version: i32) -> Vec<u8> {
        if protocol_version < 29 || self.dir.is_empty() {
            if protocol_version >= 29 && self.is_dir() && self.name == b"." {
                return self.dir.clone();
            }
            return self.full_name_bytes();
        }
        if self.is_dir() {
            if self.name == b"." {
                self.dir.clone()
            } else {
                self.full_name_bytes()
            }
        } else {
            let mut v = self.dir.clone();
            v.push(0);
            v.extend_from_slice(&self.name);
            v
        }
    }
}

/// Display this entry in a format like that of `ls`, and like `rsync` uses
/// in listing directories:
///
/// ```text
/// drwxr-x---         420 2020-05-02 07:25:17 rsyn
/// ```
impl fmt::Display for FileEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let when = match self.mtime_local() {
            Some(t) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
            None => format!("@{}", self.mtime),
        };
        write!(
            f,
            "{:08} {:11} {:19} {}",
            unix_mode::to_string(self.mode),
            self.size,
            when,
            self.name_lossy_string(),
        )
    }
}

/// A list of entries in original insertion order.
///
/// Wire-level back-references use the insertion index, so the unsorted list
/// is authoritative; sorting is a derived projection computed on demand.
#[derive(Debug, Default)]
pub struct FileList {
    entries: Vec<FileEntry>,
}

impl FileList {
    pub fn new() -> FileList {
        FileList::default()
    }

    /// Append an entry, returning its index.
    pub fn push(&mut self, entry: FileEntry) -> usize {
        self.entries.push(entry);
        self.entries.len() - 1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, ndx: usize) -> Option<&FileEntry> {
        self.entries.get(ndx)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FileEntry> {
        self.entries.iter()
    }

    /// Indices of the entries in canonical sort order.
    ///
    /// Ties (duplicate keys) keep insertion order.
    pub fn sorted_indices(&self, protocol_version: i32) -> Vec<usize> {
        let keys: Vec<Vec<u8>> = self
            .entries
            .iter()
            .map(|e| e.sort_key(protocol_version))
            .collect();
        let mut order: Vec<usize> = (0..self.entries.len()).collect();
        order.sort_by(|&a, &b| keys[a].cmp(&keys[b]).then(a.cmp(&b)));
        order
    }

    /// Receiver-side duplicate handling: entries sharing a sort key are
    /// merged or dropped.
    ///
    /// When both are directories the first survives, taking the duplicate's
    /// top-dir and content-dir bits, and stays implied only if the duplicate
    /// was too. A directory always beats a plain file; between two
    /// non-directories the later one loses.
    pub fn collapse_duplicates(&mut self, protocol_version: i32) {
        self.resolve_duplicates(protocol_version, false)
    }

    /// Sender-side duplicate handling: nothing is dropped, because peers
    /// refer to entries by index, but losers are tagged `FLAG_DUPLICATE`.
    pub fn mark_duplicates(&mut self, protocol_version: i32) {
        self.resolve_duplicates(protocol_version, true)
    }

    fn resolve_duplicates(&mut self, protocol_version: i32, sender: bool) {
        let order = self.sorted_indices(protocol_version);
        let keys: Vec<Vec<u8>> = self
            .entries
            .iter()
            .map(|e| e.sort_key(protocol_version))
            .collect();
        let mut dropped = vec![false; self.entries.len()];
        let mut survivor: Option<usize> = None;
        for pair in order.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if keys[a] != keys[b] {
                survivor = None;
                continue;
            }
            let first = match survivor {
                Some(s) => s,
                None => a,
            };
            if sender {
                self.entries[b].flags |= FLAG_DUPLICATE;
                survivor = Some(first);
                continue;
            }
            let first_is_dir = self.entries[first].is_dir();
            let dup_is_dir = self.entries[b].is_dir();
            if first_is_dir && dup_is_dir {
                let dup_flags = self.entries[b].flags;
                self.entries[first].flags |= dup_flags & (FLAG_TOP_DIR | FLAG_CONTENT_DIR);
                if dup_flags & FLAG_IMPLIED_DIR == 0 {
                    self.entries[first].flags &= !FLAG_IMPLIED_DIR;
                }
                dropped[b] = true;
                survivor = Some(first);
            } else if first_is_dir {
                dropped[b] = true;
                survivor = Some(first);
            } else if dup_is_dir {
                dropped[first] = true;
                survivor = Some(b);
            } else {
                dropped[b] = true;
                survivor = Some(first);
            }
        }
        if !sender {
            let mut flags = dropped.iter();
            self.entries.retain(|_| !*flags.next().unwrap());
        }
    }
}

impl std::iter::FromIterator<FileEntry> for FileList {
    fn from_iter<I: IntoIterator<Item = FileEntry>>(iter: I) -> FileList {
        FileList {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Which transfer options shape the entry encoding.
///
/// Both codec directions derive this from the same `Options`, which is what
/// keeps them symmetric.
#[derive(Debug, Clone, Copy)]
struct CodecConfig {
    protocol: i32,
    preserve_uid: bool,
    preserve_gid: bool,
    preserve_links: bool,
    preserve_hard_links: bool,
    preserve_devices: bool,
    preserve_specials: bool,
    numeric_ids: bool,
    checksum: Option<DigestKind>,
}

impl CodecConfig {
    fn from_options(opts: &Options, protocol_version: i32) -> Result<CodecConfig> {
        let checksum = if opts.checksum != 0 {
            Some(digest::select_kind(
                opts.checksum_choice.as_deref(),
                protocol_version,
            )?)
        } else {
            None
        };
        Ok(CodecConfig {
            protocol: protocol_version,
            preserve_uid: opts.owner != 0,
            preserve_gid: opts.group != 0,
            preserve_links: opts.links != 0,
            preserve_hard_links: opts.hard_links != 0,
            preserve_devices: opts.devices != 0,
            preserve_specials: opts.specials != 0,
            numeric_ids: opts.numeric_ids != 0,
            checksum,
        })
    }

    // Specials carry device numbers only through protocol 30.
    fn sends_rdev(&self, entry_mode: u32) -> bool {
        (self.preserve_devices && is_device(entry_mode))
            || (self.preserve_specials && is_special(entry_mode) && self.protocol < 31)
    }
}

/// Sender-side encoder for one file list.
///
/// Holds the delta cursors and the inode map between entries; one encoder
/// must write the whole list, in order.
pub struct FlistEncoder {
    config: CodecConfig,
    prev_name: Vec<u8>,
    prev_mode: u32,
    prev_uid: i32,
    prev_gid: i32,
    prev_mtime: i64,
    prev_rdev_major: i32,
    prev_dev: i64,
    hlink_map: HashMap<(i64, i64), usize>,
    uids_sent: HashSet<i32>,
    gids_sent: HashSet<i32>,
    ndx: usize,
    start_ndx: usize,
}

impl FlistEncoder {
    pub fn new(opts: &Options, protocol_version: i32) -> Result<FlistEncoder> {
        Ok(FlistEncoder {
            config: CodecConfig::from_options(opts, protocol_version)?,
            prev_name: Vec::new(),
            prev_mode: 0,
            prev_uid: 0,
            prev_gid: 0,
            prev_mtime: 0,
            prev_rdev_major: 0,
            prev_dev: 0,
            hlink_map: HashMap::new(),
            uids_sent: HashSet::new(),
            gids_sent: HashSet::new(),
            ndx: 0,
            start_ndx: 0,
        })
    }

    /// The global index the next entry will get.
    pub fn next_ndx(&self) -> usize {
        self.ndx
    }

    /// Start a new sub-list at the current index.
    ///
    /// Hard-link back-references into earlier sub-lists then resend the
    /// entry body, since the peer may no longer hold those entries.
    pub fn begin_list(&mut self) {
        self.start_ndx = self.ndx;
    }

    /// Encode one entry into `buf`.
    pub fn write_entry(
        &mut self,
        buf: &mut Buffer,
        entry: &FileEntry,
        names: Option<&dyn NameLookup>,
        digests: Option<&dyn DigestProvider>,
    ) -> Result<()> {
        let config = self.config;
        let is_dir = entry.is_dir();
        let wire_name = entry.full_name_bytes();
        if wire_name.is_empty() {
            bail!("file-list entry has no name");
        }
        if config.sends_rdev(entry.mode) && entry.rdev.is_none() {
            bail!(
                "device entry {:?} has no rdev numbers",
                entry.name_lossy_string()
            );
        }

        let mut xflags: u16 = 0;
        if is_dir && entry.flags & FLAG_TOP_DIR != 0 {
            xflags |= XMIT_TOP_DIR;
        }
        if is_dir && config.protocol >= 30 && entry.flags & FLAG_CONTENT_DIR == 0 {
            xflags |= XMIT_NO_CONTENT_DIR;
        }

        // Hard links: from protocol 30 a re-sighted inode becomes an index
        // back-reference; before that, dev/ino ride along on every entry.
        let mut hlink_ref = None;
        if config.preserve_hard_links && !is_dir {
            if config.protocol >= 30 {
                if let (Some(dev), Some(ino)) = (entry.dev, entry.ino) {
                    match self.hlink_map.get(&(dev, ino)) {
                        Some(&first) => {
                            xflags |= XMIT_HLINKED;
                            hlink_ref = Some(first);
                        }
                        None => {
                            self.hlink_map.insert((dev, ino), self.ndx);
                            xflags |= XMIT_HLINKED | XMIT_HLINK_FIRST;
                        }
                    }
                }
            } else {
                let dev = match entry.dev {
                    Some(dev) => dev,
                    None => bail!(
                        "hard-link preservation before protocol 30 needs dev/ino on {:?}",
                        entry.name_lossy_string()
                    ),
                };
                if entry.ino.is_none() {
                    bail!(
                        "hard-link preservation before protocol 30 needs dev/ino on {:?}",
                        entry.name_lossy_string()
                    );
                }
                if dev == self.prev_dev {
                    xflags |= XMIT_SAME_DEV_PRE30;
                } else {
                    self.prev_dev = dev;
                }
            }
        }

        // A hard link whose first sighting is below this sub-list's start
        // index has no body of its own, so only the cursors the peer copies
        // from that sighting may move for it.
        let skip_body = matches!(hlink_ref, Some(first) if first < self.start_ndx);

        if entry.mode == self.prev_mode {
            xflags |= XMIT_SAME_MODE;
        } else {
            self.prev_mode = entry.mode;
        }

        let xmit_rdev = !skip_body && entry.rdev.is_some() && config.sends_rdev(entry.mode);
        let (rdev_major, rdev_minor) = entry.rdev.unwrap_or((0, 0));
        if xmit_rdev {
            if rdev_major == self.prev_rdev_major {
                xflags |= XMIT_SAME_RDEV_MAJOR;
            } else {
                self.prev_rdev_major = rdev_major;
            }
            if config.protocol < 30 && (0..=0xff).contains(&rdev_minor) {
                xflags |= XMIT_RDEV_MINOR_8_PRE30;
            }
        }

        let mut uid_name = None;
        if config.preserve_uid {
            if entry.uid == self.prev_uid {
                xflags |= XMIT_SAME_UID;
            } else {
                self.prev_uid = entry.uid;
                if !skip_body
                    && config.protocol >= 30
                    && !config.numeric_ids
                    && self.uids_sent.insert(entry.uid)
                {
                    if let Some(name) = names.and_then(|n| n.uid_to_name(entry.uid)) {
                        if !name.is_empty() && name.len() <= 255 {
                            xflags |= XMIT_USER_NAME_FOLLOWS;
                            uid_name = Some(name.into_bytes());
                        }
                    }
                }
            }
        }
        let mut gid_name = None;
        if config.preserve_gid {
            if entry.gid == self.prev_gid {
                xflags |= XMIT_SAME_GID;
            } else {
                self.prev_gid = entry.gid;
                if !skip_body
                    && config.protocol >= 30
                    && !config.numeric_ids
                    && self.gids_sent.insert(entry.gid)
                {
                    if let Some(name) = names.and_then(|n| n.gid_to_name(entry.gid)) {
                        if !name.is_empty() && name.len() <= 255 {
                            xflags |= XMIT_GROUP_NAME_FOLLOWS;
                            gid_name = Some(name.into_bytes());
                        }
                    }
                }
            }
        }

        if entry.mtime == self.prev_mtime {
            xflags |= XMIT_SAME_TIME;
        } else {
            self.prev_mtime = entry.mtime;
        }
        let nsec = if config.protocol >= 31 {
            entry.mtime_nsec
        } else {
            None
        };
        if nsec.is_some() {
            xflags |= XMIT_MOD_NSEC;
        }

        let prefix = common_prefix(&self.prev_name, &wire_name);
        if prefix > 0 {
            xflags |= XMIT_SAME_NAME;
        }
        let suffix = &wire_name[prefix..];
        if suffix.len() > 255 {
            xflags |= XMIT_LONG_NAME;
        }

        let checksum = match config.checksum {
            Some(kind) if !skip_body && entry.is_file() => {
                Some(digest::filelist_checksum(digests, kind, entry)?)
            }
            _ => None,
        };
        let symlink = if !skip_body && config.preserve_links && entry.is_symlink() {
            match &entry.symlink {
                Some(target) => Some(target.clone()),
                None => bail!("symlink entry {:?} has no target", entry.name_lossy_string()),
            }
        } else {
            None
        };

        if xflags & 0xff00 != 0 || xflags == 0 {
            xflags |= XMIT_EXTENDED_FLAGS;
            buf.pack_u16(xflags);
        } else {
            buf.pack_u8(xflags as u8);
        }
        if xflags & XMIT_SAME_NAME != 0 {
            buf.pack_u8(prefix as u8);
        }
        if xflags & XMIT_LONG_NAME != 0 {
            buf.pack_v32(suffix.len() as i32);
        } else {
            buf.pack_u8(suffix.len() as u8);
        }
        buf.pack_bytes(suffix);
        self.prev_name = wire_name;

        if let Some(first) = hlink_ref {
            buf.pack_v32(first as i32);
            if skip_body {
                // The peer copies everything else from the linked entry.
                self.ndx += 1;
                return Ok(());
            }
        }

        buf.pack_v64(entry.size, 3)?;
        if xflags & XMIT_SAME_TIME == 0 {
            if config.protocol >= 30 {
                buf.pack_v64(entry.mtime, 4)?;
            } else {
                buf.pack_s32(entry.mtime as i32);
            }
        }
        if let Some(n) = nsec {
            buf.pack_v32(n);
        }
        if xflags & XMIT_SAME_MODE == 0 {
            buf.pack_s32(entry.mode as i32);
        }
        if config.preserve_uid && xflags & XMIT_SAME_UID == 0 {
            if config.protocol < 30 {
                buf.pack_s32(entry.uid);
            } else {
                buf.pack_v32(entry.uid);
                if let Some(name) = &uid_name {
                    buf.pack_u8(name.len() as u8);
                    buf.pack_bytes(name);
                }
            }
        }
        if config.preserve_gid && xflags & XMIT_SAME_GID == 0 {
            if config.protocol < 30 {
                buf.pack_s32(entry.gid);
            } else {
                buf.pack_v32(entry.gid);
                if let Some(name) = &gid_name {
                    buf.pack_u8(name.len() as u8);
                    buf.pack_bytes(name);
                }
            }
        }
        if xmit_rdev {
            if xflags & XMIT_SAME_RDEV_MAJOR == 0 {
                buf.pack_v32(rdev_major);
            }
            if config.protocol >= 30 {
                buf.pack_v32(rdev_minor);
            } else if xflags & XMIT_RDEV_MINOR_8_PRE30 != 0 {
                buf.pack_u8(rdev_minor as u8);
            } else {
                buf.pack_s32(rdev_minor);
            }
        }
        if let Some(target) = &symlink {
            buf.pack_v32(target.len() as i32);
            buf.pack_bytes(target);
        }
        if config.protocol < 30 && config.preserve_hard_links && !is_dir {
            if xflags & XMIT_SAME_DEV_PRE30 == 0 {
                buf.pack_s64(entry.dev.unwrap_or(0) + 1);
            }
            buf.pack_s64(entry.ino.unwrap_or(0));
        }
        if let Some(sum) = &checksum {
            buf.pack_bytes(sum);
        }
        self.ndx += 1;
        Ok(())
    }

    /// Write the end-of-list marker.
    pub fn write_end(&mut self, buf: &mut Buffer) {
        buf.pack_u8(0);
    }
}

/// One decoded item: an entry, or the end-of-list marker.
#[derive(Debug, PartialEq, Eq)]
pub enum FlistItem {
    Entry(FileEntry),
    End,
}

/// Receiver-side decoder, the mirror of [`FlistEncoder`].
///
/// Keeps every decoded entry so hard-link back-references can be resolved;
/// `entries()` exposes them in wire order.
pub struct FlistDecoder {
    config: CodecConfig,
    prev_name: Vec<u8>,
    prev_mode: u32,
    prev_uid: i32,
    prev_gid: i32,
    prev_mtime: i64,
    prev_rdev_major: i32,
    prev_dev: i64,
    uid_names: HashMap<i32, Vec<u8>>,
    gid_names: HashMap<i32, Vec<u8>>,
    entries: Vec<FileEntry>,
    start_ndx: usize,
}

impl FlistDecoder {
    pub fn new(opts: &Options, protocol_version: i32) -> Result<FlistDecoder> {
        Ok(FlistDecoder {
            config: CodecConfig::from_options(opts, protocol_version)?,
            prev_name: Vec::new(),
            prev_mode: 0,
            prev_uid: 0,
            prev_gid: 0,
            prev_mtime: 0,
            prev_rdev_major: 0,
            prev_dev: 0,
            uid_names: HashMap::new(),
            gid_names: HashMap::new(),
            entries: Vec::new(),
            start_ndx: 0,
        })
    }

    /// Entries decoded so far, in wire order.
    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    /// Start a new sub-list at the current index, mirroring the sender's
    /// own sub-list boundary.
    pub fn begin_list(&mut self) {
        self.start_ndx = self.entries.len();
    }

    /// User names learned from the wire, keyed by uid.
    pub fn uid_name(&self, uid: i32) -> Option<&[u8]> {
        self.uid_names.get(&uid).map(|v| v.as_slice())
    }

    pub fn gid_name(&self, gid: i32) -> Option<&[u8]> {
        self.gid_names.get(&gid).map(|v| v.as_slice())
    }

    /// Decode one entry from `buf`.
    ///
    /// Returns `Ok(None)` when the buffer doesn't yet hold a whole entry;
    /// the cursor is left where it was, so the caller appends more bytes and
    /// retries.
    pub fn read_entry(&mut self, buf: &mut Buffer) -> Result<Option<FlistItem>> {
        let start = buf.pos();
        match self.read_entry_inner(buf) {
            Ok(Some(item)) => Ok(Some(item)),
            Ok(None) => {
                buf.set_pos(start);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn read_entry_inner(&mut self, buf: &mut Buffer) -> Result<Option<FlistItem>> {
        let config = self.config;
        let b0 = match buf.unpack_u8() {
            Some(b) => b,
            None => return Ok(None),
        };
        if b0 == 0 {
            return Ok(Some(FlistItem::End));
        }
        let mut xflags = u16::from(b0);
        if xflags & XMIT_EXTENDED_FLAGS != 0 {
            match buf.unpack_u8() {
                Some(b1) => xflags |= u16::from(b1) << 8,
                None => return Ok(None),
            }
        }

        let prefix = if xflags & XMIT_SAME_NAME != 0 {
            match buf.unpack_u8() {
                Some(n) => usize::from(n),
                None => return Ok(None),
            }
        } else {
            0
        };
        let suffix_len = if xflags & XMIT_LONG_NAME != 0 {
            match buf.unpack_v32()? {
                Some(n) if n >= 0 => n as usize,
                Some(n) => bail!("negative name length {}", n),
                None => return Ok(None),
            }
        } else {
            match buf.unpack_u8() {
                Some(n) => usize::from(n),
                None => return Ok(None),
            }
        };
        let suffix = match buf.unpack_bytes(suffix_len) {
            Some(s) => s,
            None => return Ok(None),
        };
        if prefix > self.prev_name.len() {
            bail!(
                "name prefix {} overruns previous name of {} bytes",
                prefix,
                self.prev_name.len()
            );
        }
        let mut wire_name = self.prev_name[..prefix].to_vec();
        wire_name.extend_from_slice(&suffix);
        let (dir, name) = split_wire_name(&wire_name);

        // A hard link back into an earlier sub-list carries no body of its
        // own; everything is copied from the first sighting.
        if config.protocol >= 30
            && config.preserve_hard_links
            && xflags & XMIT_HLINKED != 0
            && xflags & XMIT_HLINK_FIRST == 0
        {
            let first = match buf.unpack_v32()? {
                Some(n) if n >= 0 => n as usize,
                Some(n) => bail!("negative hard-link reference {}", n),
                None => return Ok(None),
            };
            if first < self.start_ndx {
                let source = match self.entries.get(first) {
                    Some(e) => e.clone(),
                    None => bail!("hard-link reference {} out of range", first),
                };
                let entry = FileEntry {
                    dir,
                    name,
                    flags: FLAG_HLINKED,
                    ..source
                };
                self.prev_mode = entry.mode;
                self.prev_uid = entry.uid;
                self.prev_gid = entry.gid;
                self.prev_mtime = entry.mtime;
                self.prev_name = wire_name;
                self.entries.push(entry.clone());
                return Ok(Some(FlistItem::Entry(entry)));
            }
            // A reference within the current sub-list: the body follows in
            // full.
        }

        let size = match buf.unpack_v64(3)? {
            Some(n) => n,
            None => return Ok(None),
        };
        let mtime = if xflags & XMIT_SAME_TIME != 0 {
            self.prev_mtime
        } else if config.protocol >= 30 {
            match buf.unpack_v64(4)? {
                Some(n) => n,
                None => return Ok(None),
            }
        } else {
            match buf.unpack_s32() {
                Some(n) => i64::from(n),
                None => return Ok(None),
            }
        };
        let mtime_nsec = if xflags & XMIT_MOD_NSEC != 0 && config.protocol >= 31 {
            match buf.unpack_v32()? {
                Some(n) => Some(n),
                None => return Ok(None),
            }
        } else {
            None
        };
        let mode = if xflags & XMIT_SAME_MODE != 0 {
            self.prev_mode
        } else {
            match buf.unpack_s32() {
                Some(m) => m as u32,
                None => return Ok(None),
            }
        };

        let mut uid = self.prev_uid;
        if config.preserve_uid && xflags & XMIT_SAME_UID == 0 {
            if config.protocol < 30 {
                uid = match buf.unpack_s32() {
                    Some(u) => u,
                    None => return Ok(None),
                };
            } else {
                uid = match buf.unpack_v32()? {
                    Some(u) => u,
                    None => return Ok(None),
                };
                if xflags & XMIT_USER_NAME_FOLLOWS != 0 {
                    let len = match buf.unpack_u8() {
                        Some(n) => usize::from(n),
                        None => return Ok(None),
                    };
                    match buf.unpack_bytes(len) {
                        Some(name) => self.uid_names.insert(uid, name),
                        None => return Ok(None),
                    };
                }
            }
        }
        let mut gid = self.prev_gid;
        if config.preserve_gid && xflags & XMIT_SAME_GID == 0 {
            if config.protocol < 30 {
                gid = match buf.unpack_s32() {
                    Some(g) => g,
                    None => return Ok(None),
                };
            } else {
                gid = match buf.unpack_v32()? {
                    Some(g) => g,
                    None => return Ok(None),
                };
                if xflags & XMIT_GROUP_NAME_FOLLOWS != 0 {
                    let len = match buf.unpack_u8() {
                        Some(n) => usize::from(n),
                        None => return Ok(None),
                    };
                    match buf.unpack_bytes(len) {
                        Some(name) => self.gid_names.insert(gid, name),
                        None => return Ok(None),
                    };
                }
            }
        }

        let mut rdev = None;
        if config.sends_rdev(mode) {
            let major = if xflags & XMIT_SAME_RDEV_MAJOR != 0 {
                self.prev_rdev_major
            } else {
                match buf.unpack_v32()? {
                    Some(m) => m,
                    None => return Ok(None),
                }
            };
            let minor = if config.protocol >= 30 {
                match buf.unpack_v32()? {
                    Some(m) => m,
                    None => return Ok(None),
                }
            } else if xflags & XMIT_RDEV_MINOR_8_PRE30 != 0 {
                match buf.unpack_u8() {
                    Some(m) => i32::from(m),
                    None => return Ok(None),
                }
            } else {
                match buf.unpack_s32() {
                    Some(m) => m,
                    None => return Ok(None),
                }
            };
            rdev = Some((major, minor));
        }

        let mut symlink = None;
        if config.preserve_links && unix_mode::is_symlink(mode) {
            let len = match buf.unpack_v32()? {
                Some(n) if n >= 0 => n as usize,
                Some(n) => bail!("negative symlink length {}", n),
                None => return Ok(None),
            };
            symlink = match buf.unpack_bytes(len) {
                Some(t) => Some(t),
                None => return Ok(None),
            };
        }

        let mut dev = None;
        let mut ino = None;
        if config.protocol < 30 && config.preserve_hard_links && !unix_mode::is_dir(mode) {
            let d = if xflags & XMIT_SAME_DEV_PRE30 != 0 {
                self.prev_dev
            } else {
                match buf.unpack_s64() {
                    Some(d) => d - 1,
                    None => return Ok(None),
                }
            };
            let i = match buf.unpack_s64() {
                Some(i) => i,
                None => return Ok(None),
            };
            dev = Some(d);
            ino = Some(i);
        }

        let mut md4 = None;
        let mut md5 = None;
        if let Some(kind) = config.checksum {
            if unix_mode::is_file(mode) {
                let sum = match buf.unpack_bytes(kind.digest_len()) {
                    Some(s) => s,
                    None => return Ok(None),
                };
                match kind {
                    DigestKind::Md4 => md4 = Some(sum),
                    DigestKind::Md5 => md5 = Some(sum),
                    DigestKind::None => (),
                }
            }
        }

        let mut flags = 0;
        if unix_mode::is_dir(mode) {
            if xflags & XMIT_TOP_DIR != 0 {
                flags |= FLAG_TOP_DIR;
            }
            if config.protocol >= 30 && xflags & XMIT_NO_CONTENT_DIR == 0 {
                flags |= FLAG_CONTENT_DIR;
            }
        } else if config.protocol >= 30
            && config.preserve_hard_links
            && xflags & XMIT_HLINKED != 0
        {
            flags |= FLAG_HLINKED;
            if xflags & XMIT_HLINK_FIRST != 0 {
                flags |= FLAG_HLINK_FIRST;
            }
        }

        // Commit the cursors only now that the whole entry is in hand.
        self.prev_mode = mode;
        self.prev_uid = uid;
        self.prev_gid = gid;
        self.prev_mtime = mtime;
        if let Some((major, _)) = rdev {
            self.prev_rdev_major = major;
        }
        if let Some(d) = dev {
            self.prev_dev = d;
        }
        self.prev_name = wire_name;

        let entry = FileEntry {
            dir,
            name,
            mode,
            uid,
            gid,
            mtime,
            mtime_nsec,
            size,
            rdev,
            symlink,
            dev,
            ino,
            md4,
            md5,
            data: None,
            path: None,
            flags,
        };
        trace!("decoded {}", entry);
        self.entries.push(entry.clone());
        Ok(Some(FlistItem::Entry(entry)))
    }
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter()
        .zip(b.iter())
        .take(MAX_NAME_PREFIX)
        .take_while(|(x, y)| x == y)
        .count()
}

fn split_wire_name(wire_name: &[u8]) -> (Vec<u8>, Vec<u8>) {
    match wire_name.iter().rposition(|&b| b == b'/') {
        Some(slash) => (
            wire_name[..slash].to_vec(),
            wire_name[slash + 1..].to_vec(),
        ),
        None => (Vec::new(), wire_name.to_vec()),
    }
}
