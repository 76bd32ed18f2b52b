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

//! Command-line options controlling the local and remote processes.
//!
//! The protocol transmits the client's argv verbatim, so this module parses
//! the same long/short option grammar as the stock tool: a declarative table
//! maps each option name (and its aliases) to a value kind and an apply
//! function, and [`Options::apply_argv`] walks argv against that table.
//! Options with non-trivial side effects get hand-written `opt_*` apply
//! functions; everything else goes through one generic setter per kind.

use std::collections::{BTreeSet, HashMap};

use anyhow::{anyhow, bail, Result};
use derive_builder::Builder;
use lazy_static::lazy_static;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use regex::Regex;

/// What kind of value an option takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    /// On/off, stored as 0 or 1; `--name=N` assigns N directly.
    Flag,
    /// Each occurrence adds one; `--no-` resets to 0.
    Counter,
    Str,
    Int,
    Size,
}

impl Kind {
    fn needs_value(self) -> bool {
        matches!(self, Kind::Str | Kind::Int | Kind::Size)
    }
}

/// How one occurrence of an option arrived on the command line.
#[derive(Debug, Clone, Copy)]
enum OptArg<'a> {
    Toggle,
    Negated,
    Value(&'a str),
}

type Apply = for<'a> fn(&mut Options, OptArg<'a>) -> Result<()>;

struct Opt {
    /// Canonical long name, hyphenated.
    name: &'static str,
    /// Alternate long names and single-character short names.
    aliases: &'static [&'static str],
    /// Whether a `--no-name` form exists.
    negatable: bool,
    kind: Kind,
    apply: Apply,
}

const fn o(
    name: &'static str,
    aliases: &'static [&'static str],
    negatable: bool,
    kind: Kind,
    apply: Apply,
) -> Opt {
    Opt {
        name,
        aliases,
        negatable,
        kind,
        apply,
    }
}

/// Protocol and transfer options, one field per option.
///
/// Boolean and counting options are plain integers, as the wire-format argv
/// they round-trip through has no richer type; string and numeric options
/// are `Option` so "never given" is distinguishable.
#[derive(Builder, Clone, Debug, Default, PartialEq, Eq)]
#[builder(default)]
pub struct Options {
    /// Be verbose; repeatable.
    pub verbose: i32,
    pub quiet: i32,
    /// Show the daemon's message of the day. On by default.
    pub motd: i32,
    /// Skip files that match in size and checksum.
    pub checksum: i32,
    /// Recurse into directories.
    pub recursive: i32,
    pub relative: i32,
    pub implied_dirs: i32,
    pub backup: i32,
    pub update: i32,
    pub inplace: i32,
    /// On a server this counts occurrences; on a client it's just set.
    pub append: i32,
    pub append_verify: i32,
    pub dirs: i32,
    pub old_dirs: i32,
    /// Copy symlinks as symlinks.
    pub links: i32,
    pub copy_links: i32,
    pub copy_unsafe_links: i32,
    pub safe_links: i32,
    pub munge_links: i32,
    /// Preserve hard links, at the cost of tracking every dev/inode pair.
    pub hard_links: i32,
    pub perms: i32,
    pub executability: i32,
    pub acls: i32,
    pub xattrs: i32,
    pub owner: i32,
    pub group: i32,
    pub devices: i32,
    pub specials: i32,
    pub times: i32,
    pub omit_dir_times: i32,
    pub omit_link_times: i32,
    pub superuser: i32,
    pub fake_super: i32,
    pub sparse: i32,
    pub preallocate: i32,
    pub dry_run: i32,
    pub whole_file: i32,
    /// Don't cross filesystem boundaries; twice to also omit mount points.
    pub one_file_system: i32,
    pub existing: i32,
    pub ignore_existing: i32,
    pub remove_source_files: i32,
    pub delete: i32,
    pub delete_before: i32,
    pub delete_during: i32,
    pub delete_delay: i32,
    pub delete_after: i32,
    pub delete_excluded: i32,
    pub ignore_missing_args: i32,
    pub delete_missing_args: i32,
    pub ignore_errors: i32,
    pub force: i32,
    pub partial: i32,
    pub delay_updates: i32,
    pub prune_empty_dirs: i32,
    pub numeric_ids: i32,
    pub ignore_times: i32,
    pub size_only: i32,
    pub cvs_exclude: i32,
    pub from0: i32,
    pub protect_args: i32,
    pub blocking_io: i32,
    pub stats: i32,
    pub eight_bit_output: i32,
    /// Output numbers in a human-readable format. On by default.
    pub human_readable: i32,
    pub progress: i32,
    pub itemize_changes: i32,
    pub list_only: i32,
    pub ipv4: i32,
    pub ipv6: i32,
    pub fuzzy: i32,
    pub compress: i32,
    /// Incremental recursion. On by default; either side may negate it.
    pub inc_recursive: i32,
    pub msgs2stderr: i32,
    /// We are the server side of the connection.
    pub server: i32,
    /// We are the sending side of the transfer.
    pub sender: i32,
    pub daemon: i32,
    pub no_detach: i32,
    /// 1 when reading a batch file.
    pub read_batch: i32,
    /// 1 for `--write-batch`, -1 for `--only-write-batch`.
    pub write_batch: i32,
    pub compare_dest: i32,
    pub copy_dest: i32,
    pub link_dest: i32,
    pub version: i32,
    pub help: i32,

    pub block_size: Option<i64>,
    pub timeout: Option<i64>,
    pub contimeout: Option<i64>,
    pub max_delete: Option<i64>,
    pub modify_window: Option<i64>,
    pub compress_level: Option<i64>,
    pub checksum_seed: Option<i64>,
    pub port: Option<i64>,
    pub protocol: Option<i64>,
    /// Parsed byte counts; see [`parse_size`].
    pub max_size: Option<i64>,
    pub min_size: Option<i64>,
    pub bwlimit: Option<i64>,

    pub info: Option<String>,
    pub debug: Option<String>,
    pub backup_dir: Option<String>,
    pub suffix: Option<String>,
    pub chmod: Option<String>,
    /// The remote shell command, `-e`.
    pub rsh: Option<String>,
    pub rsync_path: Option<String>,
    pub partial_dir: Option<String>,
    pub temp_dir: Option<String>,
    pub usermap: Option<String>,
    pub groupmap: Option<String>,
    pub skip_compress: Option<String>,
    pub files_from: Option<String>,
    pub address: Option<String>,
    pub sockopts: Option<String>,
    pub out_format: Option<String>,
    pub log_file: Option<String>,
    pub log_file_format: Option<String>,
    pub password_file: Option<String>,
    pub outbuf: Option<String>,
    pub iconv: Option<String>,
    pub checksum_choice: Option<String>,
    pub config: Option<String>,
    pub dparam: Option<String>,
    pub batch_name: Option<String>,

    /// Filter rules in the order given, already normalized to rule syntax.
    pub filters: Vec<String>,
    /// `--compare-dest`/`--copy-dest`/`--link-dest` directories in order.
    pub basis_dirs: Vec<String>,
    /// Extra options for the remote side. Slot 0 is reserved for the
    /// command name and stays `None` until the command line is built.
    pub remote_options: Vec<Option<String>>,

    pub source: Option<String>,
    pub dest: Option<String>,

    /// Names of options that argv assigned explicitly, so implications like
    /// `--archive` can leave explicit choices alone.
    #[builder(setter(skip))]
    explicit: BTreeSet<&'static str>,
}

static OPTION_TABLE: &[Opt] = &[
    o("help", &[], false, Kind::Flag, |o, a| set_flag(&mut o.help, a)),
    o("version", &["V"], false, Kind::Flag, |o, a| {
        set_flag(&mut o.version, a)
    }),
    o("verbose", &["v"], true, Kind::Counter, |o, a| {
        bump_counter(&mut o.verbose, a)
    }),
    o("info", &[], false, Kind::Str, |o, a| set_string(&mut o.info, a)),
    o("debug", &[], false, Kind::Str, |o, a| {
        set_string(&mut o.debug, a)
    }),
    o("msgs2stderr", &[], true, Kind::Flag, |o, a| {
        set_flag(&mut o.msgs2stderr, a)
    }),
    o("quiet", &["q"], true, Kind::Counter, |o, a| {
        bump_counter(&mut o.quiet, a)
    }),
    o("motd", &[], true, Kind::Flag, |o, a| set_flag(&mut o.motd, a)),
    o("checksum", &["c"], true, Kind::Flag, |o, a| {
        set_flag(&mut o.checksum, a)
    }),
    o("archive", &["a"], false, Kind::Flag, opt_archive),
    o("recursive", &["r"], true, Kind::Flag, |o, a| {
        set_flag(&mut o.recursive, a)
    }),
    o("relative", &["R"], true, Kind::Flag, |o, a| {
        set_flag(&mut o.relative, a)
    }),
    o("implied-dirs", &[], true, Kind::Flag, |o, a| {
        set_flag(&mut o.implied_dirs, a)
    }),
    o("backup", &["b"], true, Kind::Flag, |o, a| {
        set_flag(&mut o.backup, a)
    }),
    o("backup-dir", &[], false, Kind::Str, |o, a| {
        set_string(&mut o.backup_dir, a)
    }),
    o("suffix", &[], false, Kind::Str, |o, a| {
        set_string(&mut o.suffix, a)
    }),
    o("update", &["u"], true, Kind::Flag, |o, a| {
        set_flag(&mut o.update, a)
    }),
    o("inplace", &[], true, Kind::Flag, |o, a| {
        set_flag(&mut o.inplace, a)
    }),
    o("append", &[], true, Kind::Flag, opt_append),
    o("append-verify", &[], false, Kind::Flag, |o, a| {
        set_flag(&mut o.append_verify, a)
    }),
    o("dirs", &["d"], true, Kind::Flag, |o, a| set_flag(&mut o.dirs, a)),
    o("old-dirs", &["old-d"], false, Kind::Flag, |o, a| {
        set_flag(&mut o.old_dirs, a)
    }),
    o("links", &["l"], true, Kind::Flag, |o, a| {
        set_flag(&mut o.links, a)
    }),
    o("copy-links", &["L"], true, Kind::Flag, |o, a| {
        set_flag(&mut o.copy_links, a)
    }),
    o("copy-unsafe-links", &[], false, Kind::Flag, |o, a| {
        set_flag(&mut o.copy_unsafe_links, a)
    }),
    o("safe-links", &[], false, Kind::Flag, |o, a| {
        set_flag(&mut o.safe_links, a)
    }),
    o("munge-links", &[], false, Kind::Flag, |o, a| {
        set_flag(&mut o.munge_links, a)
    }),
    o("hard-links", &["H"], true, Kind::Flag, |o, a| {
        set_flag(&mut o.hard_links, a)
    }),
    o("perms", &["p"], true, Kind::Flag, |o, a| {
        set_flag(&mut o.perms, a)
    }),
    o("executability", &["E"], false, Kind::Flag, |o, a| {
        set_flag(&mut o.executability, a)
    }),
    o("chmod", &[], false, Kind::Str, |o, a| {
        set_string(&mut o.chmod, a)
    }),
    o("acls", &["A"], false, Kind::Flag, opt_acls),
    o("xattrs", &["X"], true, Kind::Flag, |o, a| {
        set_flag(&mut o.xattrs, a)
    }),
    o("owner", &["o"], true, Kind::Flag, |o, a| {
        set_flag(&mut o.owner, a)
    }),
    o("group", &["g"], true, Kind::Flag, |o, a| {
        set_flag(&mut o.group, a)
    }),
    o("devices", &[], true, Kind::Flag, |o, a| {
        set_flag(&mut o.devices, a)
    }),
    o("specials", &[], true, Kind::Flag, |o, a| {
        set_flag(&mut o.specials, a)
    }),
    o("D", &[], true, Kind::Flag, opt_devices_specials),
    o("times", &["t"], true, Kind::Flag, |o, a| {
        set_flag(&mut o.times, a)
    }),
    o("omit-dir-times", &["O"], true, Kind::Flag, |o, a| {
        set_flag(&mut o.omit_dir_times, a)
    }),
    o("omit-link-times", &["J"], true, Kind::Flag, |o, a| {
        set_flag(&mut o.omit_link_times, a)
    }),
    o("super", &[], true, Kind::Flag, |o, a| {
        set_flag(&mut o.superuser, a)
    }),
    o("fake-super", &[], false, Kind::Flag, |o, a| {
        set_flag(&mut o.fake_super, a)
    }),
    o("sparse", &["S"], true, Kind::Flag, |o, a| {
        set_flag(&mut o.sparse, a)
    }),
    o("preallocate", &[], false, Kind::Flag, |o, a| {
        set_flag(&mut o.preallocate, a)
    }),
    o("dry-run", &["n"], true, Kind::Flag, |o, a| {
        set_flag(&mut o.dry_run, a)
    }),
    o("whole-file", &["W"], true, Kind::Flag, |o, a| {
        set_flag(&mut o.whole_file, a)
    }),
    o("one-file-system", &["x"], true, Kind::Counter, |o, a| {
        bump_counter(&mut o.one_file_system, a)
    }),
    o("block-size", &["B"], false, Kind::Int, |o, a| {
        set_int(&mut o.block_size, a)
    }),
    o("rsh", &["e"], false, Kind::Str, |o, a| set_string(&mut o.rsh, a)),
    o("rsync-path", &[], false, Kind::Str, |o, a| {
        set_string(&mut o.rsync_path, a)
    }),
    o("existing", &["ignore-non-existing"], false, Kind::Flag, |o, a| {
        set_flag(&mut o.existing, a)
    }),
    o("ignore-existing", &[], false, Kind::Flag, |o, a| {
        set_flag(&mut o.ignore_existing, a)
    }),
    o("remove-source-files", &[], false, Kind::Flag, |o, a| {
        set_flag(&mut o.remove_source_files, a)
    }),
    o("delete", &[], false, Kind::Flag, |o, a| {
        set_flag(&mut o.delete, a)
    }),
    o("delete-before", &[], false, Kind::Flag, |o, a| {
        set_flag(&mut o.delete_before, a)
    }),
    o("delete-during", &["del"], false, Kind::Flag, |o, a| {
        set_flag(&mut o.delete_during, a)
    }),
    o("delete-delay", &[], false, Kind::Flag, |o, a| {
        set_flag(&mut o.delete_delay, a)
    }),
    o("delete-after", &[], false, Kind::Flag, |o, a| {
        set_flag(&mut o.delete_after, a)
    }),
    o("delete-excluded", &[], false, Kind::Flag, |o, a| {
        set_flag(&mut o.delete_excluded, a)
    }),
    o("ignore-missing-args", &[], false, Kind::Flag, |o, a| {
        set_flag(&mut o.ignore_missing_args, a)
    }),
    o("delete-missing-args", &[], false, Kind::Flag, |o, a| {
        set_flag(&mut o.delete_missing_args, a)
    }),
    o("ignore-errors", &[], true, Kind::Flag, |o, a| {
        set_flag(&mut o.ignore_errors, a)
    }),
    o("force", &[], true, Kind::Flag, |o, a| set_flag(&mut o.force, a)),
    o("max-delete", &[], false, Kind::Int, |o, a| {
        set_int(&mut o.max_delete, a)
    }),
    o("max-size", &[], false, Kind::Size, opt_max_size),
    o("min-size", &[], false, Kind::Size, opt_min_size),
    o("partial", &[], true, Kind::Flag, opt_partial),
    o("partial-dir", &[], false, Kind::Str, |o, a| {
        set_string(&mut o.partial_dir, a)
    }),
    o("delay-updates", &[], true, Kind::Flag, |o, a| {
        set_flag(&mut o.delay_updates, a)
    }),
    o("prune-empty-dirs", &["m"], true, Kind::Flag, |o, a| {
        set_flag(&mut o.prune_empty_dirs, a)
    }),
    o("numeric-ids", &[], true, Kind::Flag, |o, a| {
        set_flag(&mut o.numeric_ids, a)
    }),
    o("usermap", &[], false, Kind::Str, opt_usermap),
    o("groupmap", &[], false, Kind::Str, opt_groupmap),
    o("chown", &[], false, Kind::Str, opt_chown),
    o("timeout", &[], false, Kind::Int, |o, a| {
        set_int(&mut o.timeout, a)
    }),
    o("contimeout", &[], false, Kind::Int, |o, a| {
        set_int(&mut o.contimeout, a)
    }),
    o("ignore-times", &["I"], false, Kind::Flag, |o, a| {
        set_flag(&mut o.ignore_times, a)
    }),
    o("size-only", &[], false, Kind::Flag, |o, a| {
        set_flag(&mut o.size_only, a)
    }),
    o("modify-window", &["@"], false, Kind::Int, |o, a| {
        set_int(&mut o.modify_window, a)
    }),
    o("temp-dir", &["T"], false, Kind::Str, |o, a| {
        set_string(&mut o.temp_dir, a)
    }),
    o("fuzzy", &["y"], true, Kind::Counter, |o, a| {
        bump_counter(&mut o.fuzzy, a)
    }),
    o("compare-dest", &[], false, Kind::Str, opt_compare_dest),
    o("copy-dest", &[], false, Kind::Str, opt_copy_dest),
    o("link-dest", &[], false, Kind::Str, opt_link_dest),
    o("compress", &["z"], true, Kind::Counter, |o, a| {
        bump_counter(&mut o.compress, a)
    }),
    o("compress-level", &[], false, Kind::Int, |o, a| {
        set_int(&mut o.compress_level, a)
    }),
    o("skip-compress", &[], false, Kind::Str, |o, a| {
        set_string(&mut o.skip_compress, a)
    }),
    o("cvs-exclude", &["C"], false, Kind::Flag, |o, a| {
        set_flag(&mut o.cvs_exclude, a)
    }),
    o("filter", &["f"], false, Kind::Str, opt_filter),
    o("F", &[], false, Kind::Flag, opt_filter_shorthand),
    o("exclude", &[], false, Kind::Str, opt_exclude),
    o("exclude-from", &[], false, Kind::Str, opt_exclude_from),
    o("include", &[], false, Kind::Str, opt_include),
    o("include-from", &[], false, Kind::Str, opt_include_from),
    o("files-from", &[], false, Kind::Str, |o, a| {
        set_string(&mut o.files_from, a)
    }),
    o("from0", &["0"], true, Kind::Flag, |o, a| {
        set_flag(&mut o.from0, a)
    }),
    o("protect-args", &["s"], true, Kind::Flag, |o, a| {
        set_flag(&mut o.protect_args, a)
    }),
    o("address", &[], false, Kind::Str, |o, a| {
        set_string(&mut o.address, a)
    }),
    o("port", &[], false, Kind::Int, |o, a| set_int(&mut o.port, a)),
    o("sockopts", &[], false, Kind::Str, |o, a| {
        set_string(&mut o.sockopts, a)
    }),
    o("blocking-io", &[], true, Kind::Flag, |o, a| {
        set_flag(&mut o.blocking_io, a)
    }),
    o("stats", &[], false, Kind::Flag, |o, a| set_flag(&mut o.stats, a)),
    o("8-bit-output", &["8"], false, Kind::Flag, |o, a| {
        set_flag(&mut o.eight_bit_output, a)
    }),
    o("human-readable", &["h"], true, Kind::Counter, |o, a| {
        bump_counter(&mut o.human_readable, a)
    }),
    o("progress", &[], true, Kind::Flag, |o, a| {
        set_flag(&mut o.progress, a)
    }),
    o("P", &[], false, Kind::Flag, opt_partial_progress),
    o("itemize-changes", &["i"], false, Kind::Counter, |o, a| {
        bump_counter(&mut o.itemize_changes, a)
    }),
    o("out-format", &["log-format"], false, Kind::Str, |o, a| {
        set_string(&mut o.out_format, a)
    }),
    o("log-file", &[], false, Kind::Str, |o, a| {
        set_string(&mut o.log_file, a)
    }),
    o("log-file-format", &[], false, Kind::Str, |o, a| {
        set_string(&mut o.log_file_format, a)
    }),
    o("password-file", &[], false, Kind::Str, |o, a| {
        set_string(&mut o.password_file, a)
    }),
    o("list-only", &[], false, Kind::Flag, |o, a| {
        set_flag(&mut o.list_only, a)
    }),
    o("bwlimit", &[], false, Kind::Size, opt_bwlimit),
    o("outbuf", &[], false, Kind::Str, |o, a| {
        set_string(&mut o.outbuf, a)
    }),
    o("write-batch", &[], false, Kind::Str, opt_write_batch),
    o("only-write-batch", &[], false, Kind::Str, opt_only_write_batch),
    o("read-batch", &[], false, Kind::Str, opt_read_batch),
    o("protocol", &[], false, Kind::Int, |o, a| {
        set_int(&mut o.protocol, a)
    }),
    o("iconv", &[], true, Kind::Str, |o, a| set_string(&mut o.iconv, a)),
    o("checksum-seed", &[], false, Kind::Int, |o, a| {
        set_int(&mut o.checksum_seed, a)
    }),
    o("ipv4", &["4"], false, Kind::Flag, |o, a| set_flag(&mut o.ipv4, a)),
    o("ipv6", &["6"], false, Kind::Flag, |o, a| set_flag(&mut o.ipv6, a)),
    o("remote-option", &["M"], false, Kind::Str, opt_remote_option),
    o("checksum-choice", &["cc"], false, Kind::Str, |o, a| {
        set_string(&mut o.checksum_choice, a)
    }),
    o("server", &[], false, Kind::Flag, |o, a| {
        set_flag(&mut o.server, a)
    }),
    o("sender", &[], false, Kind::Flag, |o, a| {
        set_flag(&mut o.sender, a)
    }),
    o("daemon", &[], false, Kind::Flag, |o, a| {
        set_flag(&mut o.daemon, a)
    }),
    o("config", &[], false, Kind::Str, |o, a| {
        set_string(&mut o.config, a)
    }),
    o("dparam", &[], false, Kind::Str, |o, a| {
        set_string(&mut o.dparam, a)
    }),
    o("no-detach", &[], false, Kind::Flag, |o, a| {
        set_flag(&mut o.no_detach, a)
    }),
    o("inc-recursive", &["i-r"], true, Kind::Flag, |o, a| {
        set_flag(&mut o.inc_recursive, a)
    }),
];

lazy_static! {
    static ref BY_NAME: HashMap<&'static str, &'static Opt> = {
        let mut m = HashMap::new();
        for opt in OPTION_TABLE {
            assert!(m.insert(opt.name, opt).is_none(), "duplicate {}", opt.name);
            for alias in opt.aliases {
                assert!(m.insert(*alias, opt).is_none(), "duplicate {}", alias);
            }
        }
        m
    };
    static ref BY_SHORT: HashMap<char, &'static Opt> = {
        let mut m = HashMap::new();
        for opt in OPTION_TABLE {
            for name in std::iter::once(&opt.name).chain(opt.aliases) {
                let mut chars = name.chars();
                if let (Some(ch), None) = (chars.next(), chars.next()) {
                    assert!(m.insert(ch, opt).is_none(), "duplicate -{}", ch);
                }
            }
        }
        m
    };
}

fn lookup_long(name: &str) -> Option<(&'static Opt, bool)> {
    if let Some(opt) = BY_NAME.get(name) {
        return Some((*opt, false));
    }
    if let Some(positive) = name.strip_prefix("no-") {
        if let Some(opt) = BY_NAME.get(positive) {
            if opt.negatable {
                return Some((*opt, true));
            }
        }
    }
    None
}

fn set_flag(slot: &mut i32, arg: OptArg) -> Result<()> {
    *slot = match arg {
        OptArg::Toggle => 1,
        OptArg::Negated => 0,
        OptArg::Value(v) => parse_int_value(v)? as i32,
    };
    Ok(())
}

fn bump_counter(slot: &mut i32, arg: OptArg) -> Result<()> {
    match arg {
        OptArg::Toggle => *slot += 1,
        OptArg::Negated => *slot = 0,
        OptArg::Value(v) => *slot = parse_int_value(v)? as i32,
    }
    Ok(())
}

fn set_string(slot: &mut Option<String>, arg: OptArg) -> Result<()> {
    match arg {
        OptArg::Value(v) => *slot = Some(v.to_string()),
        OptArg::Negated => *slot = None,
        OptArg::Toggle => bail!("missing value"),
    }
    Ok(())
}

fn set_int(slot: &mut Option<i64>, arg: OptArg) -> Result<()> {
    match arg {
        OptArg::Value(v) => *slot = Some(parse_int_value(v)?),
        OptArg::Negated => *slot = None,
        OptArg::Toggle => bail!("missing value"),
    }
    Ok(())
}

fn parse_int_value(v: &str) -> Result<i64> {
    v.parse()
        .map_err(|_| anyhow!("Invalid numeric value {:?}", v))
}

fn value_of<'a>(arg: OptArg<'a>, name: &str) -> Result<&'a str> {
    match arg {
        OptArg::Value(v) => Ok(v),
        _ => bail!("Option {} requires a value", name),
    }
}

fn opt_archive(o: &mut Options, _arg: OptArg) -> Result<()> {
    if !o.explicit.contains("recursive") {
        o.recursive = 1;
    }
    o.links = 1;
    o.perms = 1;
    o.times = 1;
    o.group = 1;
    o.owner = 1;
    o.devices = 1;
    o.specials = 1;
    Ok(())
}

fn opt_devices_specials(o: &mut Options, arg: OptArg) -> Result<()> {
    set_flag(&mut o.devices, arg)?;
    set_flag(&mut o.specials, arg)
}

fn opt_acls(o: &mut Options, arg: OptArg) -> Result<()> {
    set_flag(&mut o.acls, arg)?;
    if o.acls != 0 {
        o.perms = 1;
    }
    Ok(())
}

fn opt_append(o: &mut Options, arg: OptArg) -> Result<()> {
    match arg {
        OptArg::Negated => o.append = 0,
        _ if o.server != 0 => o.append += 1,
        _ => o.append = 1,
    }
    Ok(())
}

fn opt_partial(o: &mut Options, arg: OptArg) -> Result<()> {
    set_flag(&mut o.partial, arg)?;
    if o.partial != 0 {
        o.progress = 1;
    }
    Ok(())
}

fn opt_partial_progress(o: &mut Options, _arg: OptArg) -> Result<()> {
    o.partial = 1;
    o.progress = 1;
    Ok(())
}

fn opt_filter(o: &mut Options, arg: OptArg) -> Result<()> {
    let v = value_of(arg, "--filter")?;
    o.filters.push(v.to_string());
    Ok(())
}

fn opt_filter_shorthand(o: &mut Options, _arg: OptArg) -> Result<()> {
    if !o.filters.iter().any(|f| f == ": /.rsync-filter") {
        o.filters.push(": /.rsync-filter".to_string());
    } else if !o.filters.iter().any(|f| f == "- .rsync-filter") {
        o.filters.push("- .rsync-filter".to_string());
    }
    Ok(())
}

fn opt_include(o: &mut Options, arg: OptArg) -> Result<()> {
    let v = value_of(arg, "--include")?;
    o.filters.push(format!("+ {}", v));
    Ok(())
}

fn opt_exclude(o: &mut Options, arg: OptArg) -> Result<()> {
    let v = value_of(arg, "--exclude")?;
    o.filters.push(format!("- {}", v));
    Ok(())
}

fn opt_include_from(o: &mut Options, arg: OptArg) -> Result<()> {
    let v = value_of(arg, "--include-from")?;
    o.filters.push(format!("merge,+ {}", v));
    Ok(())
}

fn opt_exclude_from(o: &mut Options, arg: OptArg) -> Result<()> {
    let v = value_of(arg, "--exclude-from")?;
    o.filters.push(format!("merge,- {}", v));
    Ok(())
}

fn opt_compare_dest(o: &mut Options, arg: OptArg) -> Result<()> {
    let v = value_of(arg, "--compare-dest")?;
    o.basis_dirs.push(v.to_string());
    o.compare_dest = 1;
    Ok(())
}

fn opt_copy_dest(o: &mut Options, arg: OptArg) -> Result<()> {
    let v = value_of(arg, "--copy-dest")?;
    o.basis_dirs.push(v.to_string());
    o.copy_dest = 1;
    Ok(())
}

fn opt_link_dest(o: &mut Options, arg: OptArg) -> Result<()> {
    let v = value_of(arg, "--link-dest")?;
    o.basis_dirs.push(v.to_string());
    o.link_dest = 1;
    Ok(())
}

fn opt_usermap(o: &mut Options, arg: OptArg) -> Result<()> {
    let v = value_of(arg, "--usermap")?;
    if o.usermap.is_some() {
        bail!("You can only specify --usermap once ({:?} was the second)", v);
    }
    o.usermap = Some(v.to_string());
    Ok(())
}

fn opt_groupmap(o: &mut Options, arg: OptArg) -> Result<()> {
    let v = value_of(arg, "--groupmap")?;
    if o.groupmap.is_some() {
        bail!(
            "You can only specify --groupmap once ({:?} was the second)",
            v
        );
    }
    o.groupmap = Some(v.to_string());
    Ok(())
}

fn opt_chown(o: &mut Options, arg: OptArg) -> Result<()> {
    let v = value_of(arg, "--chown")?;
    let (user, group) = match v.find(':') {
        Some(colon) => (&v[..colon], Some(&v[colon + 1..])),
        None => (v, None),
    };
    if !user.is_empty() {
        opt_usermap(o, OptArg::Value(&format!("*:{}", user)))?;
    }
    if let Some(g) = group {
        if !g.is_empty() {
            opt_groupmap(o, OptArg::Value(&format!("*:{}", g)))?;
        }
    }
    Ok(())
}

fn opt_remote_option(o: &mut Options, arg: OptArg) -> Result<()> {
    let v = value_of(arg, "--remote-option")?;
    if !v.starts_with('-') {
        bail!("Remote option {:?} must start with a dash", v);
    }
    if o.remote_options.is_empty() {
        o.remote_options.push(None);
    }
    o.remote_options.push(Some(v.to_string()));
    Ok(())
}

fn opt_read_batch(o: &mut Options, arg: OptArg) -> Result<()> {
    let v = value_of(arg, "--read-batch")?;
    o.batch_name = Some(v.to_string());
    o.read_batch = 1;
    Ok(())
}

fn opt_write_batch(o: &mut Options, arg: OptArg) -> Result<()> {
    let v = value_of(arg, "--write-batch")?;
    o.batch_name = Some(v.to_string());
    o.write_batch = 1;
    Ok(())
}

fn opt_only_write_batch(o: &mut Options, arg: OptArg) -> Result<()> {
    let v = value_of(arg, "--only-write-batch")?;
    o.batch_name = Some(v.to_string());
    o.write_batch = -1;
    Ok(())
}

fn opt_max_size(o: &mut Options, arg: OptArg) -> Result<()> {
    o.max_size = Some(parse_size(value_of(arg, "--max-size")?, "b")?);
    Ok(())
}

fn opt_min_size(o: &mut Options, arg: OptArg) -> Result<()> {
    o.min_size = Some(parse_size(value_of(arg, "--min-size")?, "b")?);
    Ok(())
}

fn opt_bwlimit(o: &mut Options, arg: OptArg) -> Result<()> {
    o.bwlimit = Some(parse_size(value_of(arg, "--bwlimit")?, "k")?);
    Ok(())
}

/// Parse a size with an optional binary or decimal suffix.
///
/// Bare `k`/`m`/`g` (and `kib`/`mib`/`gib`) are powers of 1024; `kb`/`mb`/`gb`
/// are powers of 1000; `b` is bytes. A bare number takes `default_suffix`,
/// and a trailing `+1` or `-1` adjusts the final value.
pub fn parse_size(s: &str, default_suffix: &str) -> Result<i64> {
    lazy_static! {
        static ref SIZE_RE: Regex =
            Regex::new(r"(?i)^(\d*\.?\d*)([kmgb](?:i?b)?)?([+-]1)?$").unwrap();
    }
    let caps = SIZE_RE
        .captures(s)
        .ok_or_else(|| anyhow!("Invalid size {:?}", s))?;
    let num: f64 = caps[1]
        .parse()
        .map_err(|_| anyhow!("Invalid size {:?}", s))?;
    let suffix = caps.get(2).map(|m| m.as_str().to_ascii_lowercase());
    let mult: i64 = match suffix.as_deref().unwrap_or(default_suffix) {
        "b" | "bb" | "bib" => 1,
        "kb" => 1_000,
        "mb" => 1_000_000,
        "gb" => 1_000_000_000,
        "k" | "kib" => 1 << 10,
        "m" | "mib" => 1 << 20,
        "g" | "gib" => 1 << 30,
        other => bail!("Invalid size suffix {:?}", other),
    };
    let adjust = match caps.get(3).map(|m| m.as_str()) {
        Some("+1") => 1,
        Some("-1") => -1,
        _ => 0,
    };
    Ok((num * mult as f64).round() as i64 + adjust)
}

impl Options {
    /// Options as the tool initializes them before any argv parsing.
    ///
    /// Unlike `Options::default()`, which zeroes every field, this carries
    /// the handful of options that are on unless negated.
    pub fn new() -> Options {
        Options {
            motd: 1,
            implied_dirs: 1,
            human_readable: 1,
            inc_recursive: 1,
            ..Options::default()
        }
    }

    /// Parse a whole argv vector, then run the coherence pass.
    ///
    /// This accepts the same grammar as the stock tool: `--name`,
    /// `--name=value`, `--no-name` where the option allows it, bundled short
    /// options where a value-taking option consumes the rest of the bundle,
    /// and `--` to end option parsing. Up to two positional arguments become
    /// `source` and `dest`.
    pub fn apply_argv<S: AsRef<str>>(&mut self, argv: &[S]) -> Result<()> {
        let args: Vec<&str> = argv.iter().map(|s| s.as_ref()).collect();
        let mut positional: Vec<String> = Vec::new();
        let mut i = 0;
        while i < args.len() {
            let tok = args[i];
            i += 1;
            if tok == "--" {
                positional.extend(args[i..].iter().map(|s| s.to_string()));
                break;
            }
            if let Some(body) = tok.strip_prefix("--") {
                let (raw_name, inline) = match body.find('=') {
                    Some(eq) => (&body[..eq], Some(&body[eq + 1..])),
                    None => (body, None),
                };
                let name = raw_name.replace('_', "-");
                let (entry, negated) =
                    lookup_long(&name).ok_or_else(|| anyhow!("Unknown option {:?}", tok))?;
                let arg = if negated {
                    if inline.is_some() {
                        bail!("Option {:?} does not take a value", tok);
                    }
                    OptArg::Negated
                } else if let Some(v) = inline {
                    OptArg::Value(v)
                } else if entry.kind.needs_value() {
                    match args.get(i) {
                        Some(&next) if !next.starts_with('-') => {
                            i += 1;
                            OptArg::Value(next)
                        }
                        _ => bail!("Option {:?} requires a value", tok),
                    }
                } else {
                    OptArg::Toggle
                };
                self.apply_opt(entry, arg)?;
            } else if tok.len() > 1 && tok.starts_with('-') {
                let body = &tok[1..];
                let mut chars = body.char_indices();
                while let Some((off, ch)) = chars.next() {
                    let entry = *BY_SHORT
                        .get(&ch)
                        .ok_or_else(|| anyhow!("Unknown option -{} in {:?}", ch, tok))?;
                    if entry.kind.needs_value() {
                        let rest = &body[off + ch.len_utf8()..];
                        if !rest.is_empty() {
                            self.apply_opt(entry, OptArg::Value(rest))?;
                        } else {
                            match args.get(i) {
                                Some(&next) => {
                                    i += 1;
                                    self.apply_opt(entry, OptArg::Value(next))?;
                                }
                                None => bail!("Option -{} requires a value", ch),
                            }
                        }
                        break;
                    }
                    self.apply_opt(entry, OptArg::Toggle)?;
                }
            } else {
                // Positional arguments end option parsing; a later token
                // that still looks like an option is out of order.
                if let Some(bad) = args[i..].iter().find(|a| a.len() > 1 && a.starts_with('-')) {
                    bail!("Unexpected argument {:?} before option {:?}", tok, bad);
                }
                positional.push(tok.to_string());
                positional.extend(args[i..].iter().map(|s| s.to_string()));
                break;
            }
        }
        if positional.len() > 2 {
            bail!("Too many arguments: {:?}", positional);
        }
        let mut positional = positional.into_iter();
        if let Some(s) = positional.next() {
            self.source = Some(s);
        }
        if let Some(d) = positional.next() {
            self.dest = Some(d);
        }
        self.make_coherent()
    }

    fn apply_opt(&mut self, entry: &'static Opt, arg: OptArg) -> Result<()> {
        self.explicit.insert(entry.name);
        (entry.apply)(self, arg)
    }

    /// Cross-option validation, run after argv is exhausted.
    pub fn make_coherent(&mut self) -> Result<()> {
        if let Some(choice) = self.checksum_choice.clone() {
            match choice.as_str() {
                "auto" | "md4" | "md5" | "none" => (),
                other => bail!("unknown checksum name: {:?}", other),
            }
            if choice == "none" {
                self.whole_file = 1;
            }
        }
        Ok(())
    }
}
