// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use core::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length in bytes of a [`ContentHash`] digest.
pub const DIGEST_LENGTH: usize = 32;

/// A fixed-length content digest.
///
/// The engine treats digests as opaque identifiers; equality and ordering are
/// byte-wise. The hex form is used wherever an identifier has to appear in
/// JSON or in messages.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; DIGEST_LENGTH]);

impl ContentHash {
    pub fn of(data: impl AsRef<[u8]>) -> ContentHash {
        ContentHash(Sha256::digest(data.as_ref()).into())
    }

    pub fn from_bytes(bytes: [u8; DIGEST_LENGTH]) -> ContentHash {
        ContentHash(bytes)
    }

    pub fn bytes(&self) -> &[u8; DIGEST_LENGTH] {
        &self.0
    }

    pub fn hex(&self) -> String {
        let mut s = String::with_capacity(2 * DIGEST_LENGTH);
        for b in &self.0 {
            s.push_str(&format!("{b:02x}"));
        }
        s
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.hex())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

/// Incremental variant of [`ContentHash::of`].
#[derive(Clone, Default)]
pub struct Hasher {
    inner: Sha256,
}

impl Hasher {
    pub fn new() -> Hasher {
        Hasher {
            inner: Sha256::new(),
        }
    }

    pub fn update(&mut self, data: impl AsRef<[u8]>) {
        self.inner.update(data.as_ref());
    }

    pub fn finalize(self) -> ContentHash {
        ContentHash(self.inner.finalize().into())
    }
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Hasher")
    }
}
