use crate::errors::{VerifyError, VerifyResult};

/// Enumerate the dynamic libraries an ELF image declares as needed.
///
/// Used to pre-verify a verified module's dependency chain before the
/// loader chases it, so dependent loads hit the cache instead of paying
/// verification latency inline.
pub fn enumerate_needed_libraries(image: &[u8]) -> VerifyResult<Vec<String>> {
    let elf = goblin::elf::Elf::parse(image).map_err(|err| VerifyError::Parse {
        path: std::path::PathBuf::from("<memory>"),
        detail: err.to_string(),
    })?;
    Ok(elf.libraries.iter().map(|name| (*name).to_string()).collect())
}
