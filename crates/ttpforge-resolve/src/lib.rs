//! Inventory-search path resolver.
//!
//! Resolves a step's `file`/`ttp` reference to an absolute path: the
//! reference's base directory is tried first, then an ordered inventory of
//! collection roots, mirroring how a TTP author expects to reference a
//! script that lives alongside the document or in a shared procedure
//! library. Purely syntactic on the reference string — it never reads file
//! contents, only stats candidates.

use std::path::{Path, PathBuf};

use ttpforge_types::{expand_home, Filesystem, Result, TtpForgeError};

/// Resolve `reference` to an absolute path that exists on `fs`.
///
/// Rules, in order:
/// 1. A `~/`-prefixed reference substitutes the user's home directory.
/// 2. An absolute reference (after substitution) is stat'd directly; hit or
///    miss is final.
/// 3. A reference that is explicitly relative (`./`, `../`, `~/...`, `..\`)
///    resolves only against `base_dir`.
/// 4. Otherwise: try `base_dir` first, then each directory in `inventory`
///    in order. The first candidate that stats successfully as a
///    non-directory with non-zero size wins.
pub fn resolve(
    reference: &str,
    base_dir: &Path,
    inventory: &[PathBuf],
    fs: &dyn Filesystem,
) -> Result<PathBuf> {
    let substituted = substitute_tilde(reference);

    if substituted.is_absolute() {
        return exists(&substituted, fs).ok_or_else(|| not_found(reference));
    }

    if is_explicitly_relative(reference) {
        let candidate = base_dir.join(&substituted);
        return exists(&candidate, fs).ok_or_else(|| not_found(reference));
    }

    let mut candidate_dirs = Vec::with_capacity(1 + inventory.len());
    candidate_dirs.push(base_dir);
    candidate_dirs.extend(inventory.iter().map(PathBuf::as_path));

    for dir in candidate_dirs {
        let candidate = dir.join(&substituted);
        if let Some(meta) = fs.stat(&candidate) {
            if !meta.is_dir && meta.len > 0 {
                return Ok(candidate);
            }
        }
        // A miss (or a zero-size/directory hit) does not abort the search —
        // the next inventory directory is tried. See SPEC_FULL.md §9 on the
        // two historical resolution code paths.
    }

    Err(not_found(reference))
}

fn substitute_tilde(reference: &str) -> PathBuf {
    if reference == "~" || reference.starts_with("~/") {
        expand_home(reference)
    } else {
        PathBuf::from(reference)
    }
}

fn is_explicitly_relative(reference: &str) -> bool {
    reference.starts_with("./")
        || reference.starts_with("../")
        || reference.starts_with("~/")
        || reference.starts_with("..\\")
}

fn exists(path: &Path, fs: &dyn Filesystem) -> Option<PathBuf> {
    fs.stat(path).map(|_| path.to_path_buf())
}

fn not_found(reference: &str) -> TtpForgeError {
    TtpForgeError::validate(format!("could not resolve reference '{reference}'"))
}
