use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use interception::{
    InterceptError, LibraryLoadGuard, MapExecGuard, ResolvedLibrary, MAX_LIBRARY_NAME,
};
use verification::{
    RejectReason, TrustVerdict, TrustVerifier, Verification, VerificationCache, VerifyFlags,
};

struct CountingVerifier {
    calls: AtomicUsize,
    verdict: TrustVerdict,
}

impl CountingVerifier {
    fn accepting() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            verdict: TrustVerdict::Accept,
        })
    }

    fn rejecting() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            verdict: TrustVerdict::reject(RejectReason::SignatureInvalid, "bad signature"),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TrustVerifier for CountingVerifier {
    fn verify_image(&self, _path: &Path, _image: &[u8], _flags: VerifyFlags) -> Verification {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Verification {
            verdict: self.verdict.clone(),
            confirmed_by_deep_check: true,
        }
    }

    fn deep_check_ready(&self) -> bool {
        true
    }
}

struct Setup {
    guard: LibraryLoadGuard,
    map_exec: MapExecGuard,
    verifier: Arc<CountingVerifier>,
    _system: tempfile::TempDir,
    _app: tempfile::TempDir,
}

fn setup(verifier: Arc<CountingVerifier>) -> Setup {
    let system = tempfile::tempdir().expect("system dir");
    let app = tempfile::tempdir().expect("app dir");
    let cache = Arc::new(VerificationCache::new());
    let map_exec = MapExecGuard::new(
        cache,
        Arc::clone(&verifier) as Arc<dyn TrustVerifier>,
    );
    let guard = LibraryLoadGuard::new(system.path().to_path_buf(), app.path().to_path_buf());
    Setup {
        guard,
        map_exec,
        verifier,
        _system: system,
        _app: app,
    }
}

#[test]
fn unc_path_is_rejected_before_any_file_access() {
    let setup = setup(CountingVerifier::accepting());

    let result = setup.guard.resolve_and_verify(
        "\\\\server\\share\\evil.dll",
        None,
        &setup.map_exec,
    );
    assert!(matches!(result, Err(InterceptError::RemotePath(_))));
    assert_eq!(
        setup.verifier.call_count(),
        0,
        "remote rejection must not open or verify anything"
    );
}

#[test]
fn overlong_name_is_rejected_outright() {
    let setup = setup(CountingVerifier::accepting());
    let name = "a".repeat(MAX_LIBRARY_NAME + 1);

    let result = setup.guard.resolve_and_verify(&name, None, &setup.map_exec);
    assert!(matches!(result, Err(InterceptError::NameTooLong { .. })));
    assert_eq!(setup.verifier.call_count(), 0);
}

#[test]
fn deny_listed_names_are_rejected_case_insensitively() {
    let setup = setup(CountingVerifier::accepting());

    for name in ["libprocesshider.so", "/lib/LIBPROCESSHIDER.SO", "beurk.so"] {
        let result = setup.guard.resolve_and_verify(name, None, &setup.map_exec);
        assert!(
            matches!(result, Err(InterceptError::DeniedName(_))),
            "{} must be denied",
            name
        );
    }
    assert_eq!(setup.verifier.call_count(), 0);
}

#[test]
fn virtual_runtime_libraries_pass_without_verification() {
    let setup = setup(CountingVerifier::accepting());

    let result = setup
        .guard
        .resolve_and_verify("linux-vdso.so.1", None, &setup.map_exec)
        .expect("virtual library");
    assert_eq!(
        result,
        ResolvedLibrary::Virtual("linux-vdso.so.1".to_string())
    );
    assert_eq!(setup.verifier.call_count(), 0);
}

#[test]
fn search_order_prefers_system_directory() {
    let setup = setup(CountingVerifier::accepting());
    std::fs::write(setup._system.path().join("libshared.so"), b"system copy")
        .expect("system lib");
    std::fs::write(setup._app.path().join("libshared.so"), b"app copy").expect("app lib");

    let resolved = setup
        .guard
        .resolve_and_verify("libshared.so", None, &setup.map_exec)
        .expect("resolution");
    match resolved {
        ResolvedLibrary::Disk(path) => {
            assert!(path.starts_with(setup._system.path()));
        }
        ResolvedLibrary::Virtual(_) => panic!("expected on-disk resolution"),
    }
    assert_eq!(setup.verifier.call_count(), 1);
}

#[test]
fn alternate_directory_is_searched_last() {
    let setup = setup(CountingVerifier::accepting());
    let alternate = tempfile::tempdir().expect("alternate dir");
    std::fs::write(alternate.path().join("libplugin.so"), b"plugin").expect("plugin lib");

    let resolved = setup
        .guard
        .resolve_and_verify("libplugin.so", Some(alternate.path()), &setup.map_exec)
        .expect("resolution");
    match resolved {
        ResolvedLibrary::Disk(path) => assert!(path.starts_with(alternate.path())),
        ResolvedLibrary::Virtual(_) => panic!("expected on-disk resolution"),
    }
}

#[test]
fn unresolvable_name_reports_not_found() {
    let setup = setup(CountingVerifier::accepting());
    let result = setup
        .guard
        .resolve_and_verify("libnowhere.so", None, &setup.map_exec);
    assert!(matches!(result, Err(InterceptError::NotFound(_))));
}

#[test]
fn failed_verification_surfaces_as_policy_violation() {
    let setup = setup(CountingVerifier::rejecting());
    std::fs::write(setup._system.path().join("libbad.so"), b"tampered").expect("bad lib");

    let result = setup
        .guard
        .resolve_and_verify("libbad.so", None, &setup.map_exec);
    match result {
        Err(InterceptError::PolicyViolation { path, detail }) => {
            assert!(path.ends_with("libbad.so"));
            assert!(detail.contains("signature_invalid"));
        }
        other => panic!("expected policy violation, got {:?}", other),
    }
}

#[test]
fn post_map_backing_mismatch_is_rejected() {
    let setup = setup(CountingVerifier::accepting());
    let verified = setup._system.path().join("libreal.so");
    let swapped = setup._system.path().join("libswapped.so");
    std::fs::write(&verified, b"verified bytes").expect("verified lib");
    std::fs::write(&swapped, b"other bytes").expect("swapped lib");

    assert!(setup.map_exec.confirm(&verified, &verified).is_ok());
    let result = setup.map_exec.confirm(&verified, &swapped);
    assert!(matches!(result, Err(InterceptError::BackingMismatch { .. })));
}
