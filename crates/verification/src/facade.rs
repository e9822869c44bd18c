use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::verdict::{RejectReason, TrustVerdict};

/// How a binary is being brought into the process, as declared by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyFlags {
    /// The file is being loaded as an executable image (not plain data).
    pub is_image: bool,
    /// The path was resolved without following symlinks.
    pub resolved_without_symlinks: bool,
}

/// Result of one facade verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub verdict: TrustVerdict,
    /// False when the verdict is provisional because the deep verifier could
    /// not run yet; such verdicts must be re-confirmed through the cache's
    /// deferred queue once the supporting subsystem is up.
    pub confirmed_by_deep_check: bool,
}

impl Verification {
    pub fn confirmed(verdict: TrustVerdict) -> Self {
        Self {
            verdict,
            confirmed_by_deep_check: true,
        }
    }

    pub fn provisional_accept() -> Self {
        Self {
            verdict: TrustVerdict::Accept,
            confirmed_by_deep_check: false,
        }
    }
}

/// The facade every interception point funnels through.
pub trait TrustVerifier: Send + Sync {
    /// Verify one binary given its resolved path and raw content.
    fn verify_image(&self, path: &Path, image: &[u8], flags: VerifyFlags) -> Verification;

    /// Whether the deep verifier can run right now. Early in process startup
    /// it cannot, and verifications come back provisional.
    fn deep_check_ready(&self) -> bool;
}

/// Location policy: a binary is only trusted from a fixed set of roots.
#[derive(Debug, Clone, Default)]
pub struct TrustedLocationPolicy {
    roots: Vec<PathBuf>,
}

impl TrustedLocationPolicy {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    pub fn is_trusted(&self, path: &Path) -> bool {
        self.roots.iter().any(|root| path.starts_with(root))
    }
}

/// Black-box signature/ownership checker (external collaborator).
///
/// The cryptography behind this is out of scope for the supervisor; it only
/// consumes the pass/fail verdict and diagnostic text.
pub trait SignaturePolicy: Send + Sync {
    fn check(&self, path: &Path, sha256_hex: &str) -> TrustVerdict;
}

/// Signature policy for builds that carry no signature database: every file
/// that passed the location policy is accepted.
pub struct LocationOnlySignaturePolicy;

impl SignaturePolicy for LocationOnlySignaturePolicy {
    fn check(&self, _path: &Path, _sha256_hex: &str) -> TrustVerdict {
        TrustVerdict::Accept
    }
}

/// The production verifier: location policy, image sanity, content digest,
/// then the signature collaborator.
pub struct FileTrustVerifier {
    location: TrustedLocationPolicy,
    signature: Box<dyn SignaturePolicy>,
    deep_ready: AtomicBool,
}

impl FileTrustVerifier {
    pub fn new(location: TrustedLocationPolicy, signature: Box<dyn SignaturePolicy>) -> Self {
        Self {
            location,
            signature,
            deep_ready: AtomicBool::new(false),
        }
    }

    /// Flip once the subsystem backing the deep check has initialized.
    /// Never flipped back.
    pub fn mark_deep_check_ready(&self) {
        self.deep_ready.store(true, Ordering::Release);
    }

    fn check_image_architecture(&self, path: &Path, image: &[u8]) -> Option<TrustVerdict> {
        let elf = match goblin::elf::Elf::parse(image) {
            Ok(elf) => elf,
            Err(err) => {
                return Some(TrustVerdict::reject(
                    RejectReason::ContentMismatch,
                    format!("{} is not a loadable image: {}", path.display(), err),
                ));
            }
        };

        if elf.header.e_machine != host_machine() {
            return Some(TrustVerdict::reject(
                RejectReason::ArchitectureMismatch,
                format!(
                    "{}: image machine {:#x} does not match host {:#x}",
                    path.display(),
                    elf.header.e_machine,
                    host_machine()
                ),
            ));
        }
        None
    }
}

impl TrustVerifier for FileTrustVerifier {
    fn verify_image(&self, path: &Path, image: &[u8], flags: VerifyFlags) -> Verification {
        if !self.location.is_trusted(path) {
            return Verification::confirmed(TrustVerdict::reject(
                RejectReason::UntrustedLocation,
                format!("{} is outside the trusted install locations", path.display()),
            ));
        }

        if flags.is_image {
            if let Some(reject) = self.check_image_architecture(path, image) {
                return Verification::confirmed(reject);
            }
        }

        if !self.deep_check_ready() {
            debug!(path = %path.display(), "deep verifier not ready; provisional accept");
            return Verification::provisional_accept();
        }

        let digest = Sha256::digest(image);
        let sha256_hex = encode_hex(&digest);
        Verification::confirmed(self.signature.check(path, &sha256_hex))
    }

    fn deep_check_ready(&self) -> bool {
        self.deep_ready.load(Ordering::Acquire)
    }
}

fn host_machine() -> u16 {
    #[cfg(target_arch = "x86_64")]
    {
        goblin::elf::header::EM_X86_64
    }
    #[cfg(target_arch = "aarch64")]
    {
        goblin::elf::header::EM_AARCH64
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        goblin::elf::header::EM_NONE
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}
