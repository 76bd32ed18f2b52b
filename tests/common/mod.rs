//! Helpers shared by the integration tests.

#![allow(dead_code)]

use md4::Md4;
use md5::{Digest, Md5};

use rsyn_wire::{DigestKind, DigestProvider, DigestStream};

/// The checksum plug-in backed by the RustCrypto hashes.
pub struct RustCryptoDigests;

struct Md4Stream(Md4);

impl DigestStream for Md4Stream {
    fn add(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    fn digest(self: Box<Self>) -> Vec<u8> {
        self.0.finalize().to_vec()
    }
}

struct Md5Stream(Md5);

impl DigestStream for Md5Stream {
    fn add(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    fn digest(self: Box<Self>) -> Vec<u8> {
        self.0.finalize().to_vec()
    }
}

impl DigestProvider for RustCryptoDigests {
    fn start(&self, kind: DigestKind) -> Option<Box<dyn DigestStream>> {
        match kind {
            DigestKind::Md4 => Some(Box::new(Md4Stream(Md4::new()))),
            DigestKind::Md5 => Some(Box::new(Md5Stream(Md5::new()))),
            DigestKind::None => None,
        }
    }
}

pub fn install_test_logger() {
    // The global logger can only be installed once per process, but this'll
    // be called from many tests in the same process; they all try to install
    // the same thing, so don't worry if it fails.
    let _ = fern::Dispatch::new()
        .format(rsyn_wire::logging::format_log)
        .level(log::LevelFilter::Debug)
        .chain(fern::Output::call(|record| println!("{}", record.args())))
        .apply();
}
