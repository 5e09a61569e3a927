use std::fmt;
use std::fmt::Display;
use std::fmt::Formatter;

use data_encoding::HEXLOWER;
use ring::digest::Digest;

/// Content identity of an executable. Prefers the identifiers embedded by the
/// toolchain and falls back to a Sha256 of the `.text` section, so two files
/// with the same `BuildId` can be treated as the same binary for caching.
#[derive(Hash, Eq, PartialEq, Clone, Debug)]
pub enum BuildId {
    Gnu(String),
    Go(String),
    Sha256(String),
}

impl BuildId {
    pub fn gnu_from_bytes(bytes: &[u8]) -> Self {
        BuildId::Gnu(HEXLOWER.encode(bytes))
    }

    pub fn go_from_bytes(bytes: &[u8]) -> Self {
        BuildId::Go(HEXLOWER.encode(bytes))
    }

    pub fn sha256_from_digest(digest: &Digest) -> Self {
        BuildId::Sha256(HEXLOWER.encode(digest.as_ref()))
    }
}

impl Display for BuildId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            BuildId::Gnu(build_id) => write!(f, "gnu-{}", build_id),
            BuildId::Go(build_id) => write!(f, "go-{}", build_id),
            BuildId::Sha256(build_id) => write!(f, "sha256-{}", build_id),
        }
    }
}
