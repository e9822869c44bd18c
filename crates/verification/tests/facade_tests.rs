use std::path::{Path, PathBuf};

use verification::{
    FileTrustVerifier, RejectReason, SignaturePolicy, TrustVerdict, TrustedLocationPolicy,
    TrustVerifier, VerifyFlags,
};

struct AcceptAll;

impl SignaturePolicy for AcceptAll {
    fn check(&self, _path: &Path, _sha256_hex: &str) -> TrustVerdict {
        TrustVerdict::Accept
    }
}

fn verifier_with_root(root: &str) -> FileTrustVerifier {
    FileTrustVerifier::new(
        TrustedLocationPolicy::new(vec![PathBuf::from(root)]),
        Box::new(AcceptAll),
    )
}

/// Minimal ELF64 header with the given machine field; header-only images
/// parse cleanly with zero program/section headers.
fn minimal_elf(machine: u16) -> Vec<u8> {
    let mut image = vec![0u8; 64];
    image[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    image[4] = 2; // ELFCLASS64
    image[5] = 1; // little endian
    image[6] = 1; // EV_CURRENT
    image[16..18].copy_from_slice(&3u16.to_le_bytes()); // ET_DYN
    image[18..20].copy_from_slice(&machine.to_le_bytes());
    image[20..24].copy_from_slice(&1u32.to_le_bytes());
    image[52..54].copy_from_slice(&64u16.to_le_bytes()); // e_ehsize
    image[54..56].copy_from_slice(&56u16.to_le_bytes()); // e_phentsize
    image[58..60].copy_from_slice(&64u16.to_le_bytes()); // e_shentsize
    image
}

#[test]
fn rejects_binaries_outside_trusted_locations() {
    let verifier = verifier_with_root("/opt/vmguard");
    verifier.mark_deep_check_ready();

    let result = verifier.verify_image(
        Path::new("/tmp/evil.so"),
        b"irrelevant",
        VerifyFlags::default(),
    );
    assert!(result.confirmed_by_deep_check);
    match result.verdict {
        TrustVerdict::Reject { reason, message } => {
            assert_eq!(reason, RejectReason::UntrustedLocation);
            assert!(message.contains("/tmp/evil.so"));
        }
        TrustVerdict::Accept => panic!("untrusted location must not be accepted"),
    }
}

#[test]
fn provisional_accept_until_deep_verifier_is_ready() {
    let verifier = verifier_with_root("/opt/vmguard");

    let early = verifier.verify_image(
        Path::new("/opt/vmguard/lib/librt-shim.so"),
        b"payload",
        VerifyFlags::default(),
    );
    assert!(early.verdict.is_accepted());
    assert!(!early.confirmed_by_deep_check, "must be provisional");

    verifier.mark_deep_check_ready();
    let late = verifier.verify_image(
        Path::new("/opt/vmguard/lib/librt-shim.so"),
        b"payload",
        VerifyFlags::default(),
    );
    assert!(late.verdict.is_accepted());
    assert!(late.confirmed_by_deep_check);
}

#[test]
fn image_flag_rejects_non_elf_content() {
    let verifier = verifier_with_root("/opt/vmguard");
    verifier.mark_deep_check_ready();

    let result = verifier.verify_image(
        Path::new("/opt/vmguard/lib/fake.so"),
        b"#!/bin/sh\necho not a library\n",
        VerifyFlags {
            is_image: true,
            resolved_without_symlinks: true,
        },
    );
    match result.verdict {
        TrustVerdict::Reject { reason, .. } => {
            assert_eq!(reason, RejectReason::ContentMismatch);
        }
        TrustVerdict::Accept => panic!("non-ELF image content must be rejected"),
    }
}

#[test]
fn image_flag_rejects_foreign_architecture() {
    let verifier = verifier_with_root("/opt/vmguard");
    verifier.mark_deep_check_ready();

    // EM_ARM: wrong on every host this supervisor targets.
    let image = minimal_elf(40);
    let result = verifier.verify_image(
        Path::new("/opt/vmguard/lib/wrongarch.so"),
        &image,
        VerifyFlags {
            is_image: true,
            resolved_without_symlinks: true,
        },
    );
    match result.verdict {
        TrustVerdict::Reject { reason, .. } => {
            assert_eq!(reason, RejectReason::ArchitectureMismatch);
        }
        TrustVerdict::Accept => panic!("foreign architecture must be rejected"),
    }
}

#[cfg(target_arch = "x86_64")]
#[test]
fn image_flag_accepts_host_architecture() {
    let verifier = verifier_with_root("/opt/vmguard");
    verifier.mark_deep_check_ready();

    let image = minimal_elf(62); // EM_X86_64
    let result = verifier.verify_image(
        Path::new("/opt/vmguard/lib/hostarch.so"),
        &image,
        VerifyFlags {
            is_image: true,
            resolved_without_symlinks: true,
        },
    );
    assert!(result.verdict.is_accepted());
}
