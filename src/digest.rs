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

//! Checksum plug-ins.
//!
//! The engine never hashes anything itself: callers supply a
//! [`DigestProvider`] and the engine asks it for MD4 or MD5 streams as the
//! negotiated protocol version requires. The `none` checksum is served
//! internally.

use std::fs::File;
use std::io::{self, Read};

use anyhow::{bail, Context, Result};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::flist::FileEntry;

/// Which checksum family a stream implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestKind {
    Md4,
    Md5,
    None,
}

impl DigestKind {
    /// The natural length of this digest, in bytes.
    pub fn digest_len(self) -> usize {
        match self {
            DigestKind::Md4 | DigestKind::Md5 => 16,
            DigestKind::None => 1,
        }
    }
}

/// One in-progress checksum.
pub trait DigestStream {
    fn add(&mut self, bytes: &[u8]);

    /// Feed a whole readable stream through [`add`](#tymethod.add).
    fn addfile(&mut self, r: &mut dyn Read) -> io::Result<()> {
        let mut chunk = [0u8; 65536];
        loop {
            let n = r.read(&mut chunk)?;
            if n == 0 {
                return Ok(());
            }
            self.add(&chunk[..n]);
        }
    }

    fn digest(self: Box<Self>) -> Vec<u8>;
}

/// Factory for checksum streams, supplied by the caller.
///
/// Returning `None` means the provider has no backend for that family, which
/// is fatal to the operation that needed it.
pub trait DigestProvider {
    fn start(&self, kind: DigestKind) -> Option<Box<dyn DigestStream>>;
}

/// The `none` checksum: one NUL byte, regardless of input.
struct NullDigest;

impl DigestStream for NullDigest {
    fn add(&mut self, _bytes: &[u8]) {}

    fn digest(self: Box<Self>) -> Vec<u8> {
        vec![0]
    }
}

/// Pick the checksum family for a configured name and protocol version.
///
/// An unset or `auto` name follows the protocol: MD5 from version 30, MD4
/// back to 27. Asking for MD4 below 27, or for any unknown name, is an
/// error.
pub fn select_kind(name: Option<&str>, protocol_version: i32) -> Result<DigestKind> {
    match name {
        None | Some("auto") => {
            if protocol_version >= 30 {
                Ok(DigestKind::Md5)
            } else if protocol_version >= 27 {
                Ok(DigestKind::Md4)
            } else {
                bail!("no checksum digest for protocol {}", protocol_version)
            }
        }
        Some("md4") => {
            if protocol_version >= 27 {
                Ok(DigestKind::Md4)
            } else {
                bail!("md4 needs protocol 27, not {}", protocol_version)
            }
        }
        Some("md5") => Ok(DigestKind::Md5),
        Some("none") => Ok(DigestKind::None),
        Some(other) => bail!("unknown checksum name: {:?}", other),
    }
}

/// Start a stream for `kind`, serving `none` internally.
pub fn start_digest(
    provider: Option<&dyn DigestProvider>,
    kind: DigestKind,
) -> Result<Box<dyn DigestStream>> {
    if kind == DigestKind::None {
        return Ok(Box::new(NullDigest));
    }
    provider
        .and_then(|p| p.start(kind))
        .ok_or_else(|| anyhow::anyhow!("no digest backend for {:?}", kind))
}

/// Checksum one file-list entry.
///
/// A pre-computed sum of the right family wins; otherwise in-memory data,
/// then the filesystem path, are digested. An entry with none of those has
/// nothing to checksum, which is an error.
pub fn filelist_checksum(
    provider: Option<&dyn DigestProvider>,
    kind: DigestKind,
    entry: &FileEntry,
) -> Result<Vec<u8>> {
    match kind {
        DigestKind::Md4 => {
            if let Some(sum) = &entry.md4 {
                return Ok(sum.clone());
            }
        }
        DigestKind::Md5 => {
            if let Some(sum) = &entry.md5 {
                return Ok(sum.clone());
            }
        }
        DigestKind::None => {}
    }
    let mut stream = start_digest(provider, kind)?;
    if let Some(data) = &entry.data {
        stream.add(data);
    } else if let Some(path) = &entry.path {
        let mut f = File::open(path)
            .with_context(|| format!("Failed to open {:?} for checksumming", path))?;
        stream.addfile(&mut f)?;
    } else {
        bail!(
            "nothing to checksum for {:?}",
            entry.name_lossy_string()
        );
    }
    Ok(stream.digest())
}

/// Maps numeric ids to names for transmission in the file list.
///
/// Never called when `numeric_ids` is set.
pub trait NameLookup {
    fn uid_to_name(&self, uid: i32) -> Option<String>;
    fn gid_to_name(&self, gid: i32) -> Option<String>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kind_selection_follows_protocol() {
        assert_eq!(select_kind(None, 31).unwrap(), DigestKind::Md5);
        assert_eq!(select_kind(None, 30).unwrap(), DigestKind::Md5);
        assert_eq!(select_kind(None, 29).unwrap(), DigestKind::Md4);
        assert_eq!(select_kind(Some("auto"), 29).unwrap(), DigestKind::Md4);
        assert_eq!(select_kind(Some("md5"), 29).unwrap(), DigestKind::Md5);
        assert_eq!(select_kind(Some("md4"), 29).unwrap(), DigestKind::Md4);
        assert_eq!(select_kind(Some("none"), 31).unwrap(), DigestKind::None);
        assert!(select_kind(Some("md4"), 26).is_err());
        assert!(select_kind(None, 26).is_err());
        assert!(select_kind(Some("sha1"), 31).is_err());
    }

    #[test]
    fn none_digest_is_one_nul_byte() {
        let mut stream = start_digest(None, DigestKind::None).unwrap();
        stream.add(b"anything at all");
        assert_eq!(stream.digest(), vec![0]);
    }

    #[test]
    fn md5_without_provider_is_an_error() {
        assert!(start_digest(None, DigestKind::Md5).is_err());
    }
}
