//! Trust verification for binaries entering a supervised process.
//!
//! Two pieces live here: the verifier facade, which turns an on-disk file
//! into an accept/reject verdict, and the process-lifetime verdict cache,
//! which pins verified files open and memoizes their verdicts so hot loader
//! paths never re-verify the same binary.

mod cache;
mod errors;
mod facade;
mod identity;
mod imports;
mod verdict;

pub use cache::{CacheEntry, CacheLookup, VerificationCache, CACHE_BUCKET_COUNT};
pub use errors::{VerifyError, VerifyResult};
pub use facade::{
    FileTrustVerifier, LocationOnlySignaturePolicy, SignaturePolicy, TrustedLocationPolicy,
    Verification, VerifyFlags, TrustVerifier,
};
pub use identity::{identity_of_file, FileIdentity, PinnedFile};
pub use imports::enumerate_needed_libraries;
pub use verdict::{RejectReason, TrustVerdict};

/// Case-insensitive, slash-normalized FNV-1a hash over a path string.
///
/// Both the cache buckets and the duplicate check key on this, so the
/// normalization rules here define what "the same path" means everywhere.
pub fn hash_path(path: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    for byte in path.bytes() {
        let normalized = match byte {
            b'\\' => b'/',
            b'A'..=b'Z' => byte + 32,
            other => other,
        };
        hash ^= u64::from(normalized);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
