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

//! A sans-I/O engine for the rsync wire protocol.
//!
//! The engine speaks protocol versions 29 through 31, from either end of a
//! daemon connection, but owns no sockets, no files, and no threads: the
//! caller appends inbound bytes with [`Session::feed`], calls
//! [`Session::parse`] until it stops making progress, reacts to the emitted
//! [`Event`]s, and copies [`Session::take_output`] to its own transport.
//! The same core therefore drives blocking sockets, event loops, and
//! in-memory test harnesses alike.
//!
//! ```
//! use rsyn_wire::{Event, Options, Session};
//!
//! let mut opts = Options::new();
//! opts.apply_argv(&["--list-only"]).unwrap();
//! let mut session = Session::new(opts);
//! session.start_daemon_client("pub", None, None).unwrap();
//!
//! // Pretend to be the server's transport.
//! session.feed(b"@RSYNCD: 30.0\n@RSYNCD: OK\n");
//! assert_eq!(session.parse().unwrap(), Some(Event::Protocol(30)));
//! assert_eq!(session.parse().unwrap(), Some(Event::Ok));
//! assert_eq!(session.take_output(), b"@RSYNCD: 30.0\npub\n".to_vec());
//! ```
//!
//! Checksums (MD4, MD5) and uid/gid name lookups are plug-ins supplied by
//! the caller; see [`DigestProvider`] and [`NameLookup`].

pub mod buffer;
pub mod digest;
pub mod flist;
pub mod logging;
pub mod options;
pub mod session;
pub mod statistics;

pub use buffer::Buffer;
pub use digest::{DigestKind, DigestProvider, DigestStream, NameLookup};
pub use flist::{FileEntry, FileList, FlistDecoder, FlistEncoder, FlistItem};
pub use options::{parse_size, Options, OptionsBuilder};
pub use session::{Event, Session, State, LATEST_PROTOCOL, OLDEST_PROTOCOL};
pub use statistics::ServerStatistics;

/// General Result type from rsyn APIs.
pub type Result<T> = anyhow::Result<T>;
