//! Directory-scope guard.
//!
//! Sessions may only anchor to directories inside the configured allow-list.
//! Both the candidate and the allow-list entries are canonicalized, and the
//! candidate is accepted iff it equals an entry or extends one past a path
//! separator — so `/home/u/projects-evil` is NOT inside `/home/u/projects`.
//! This is the only place path policy lives; session create and any
//! working-directory change go through it.

use std::path::PathBuf;

use tracing::warn;

use crate::util::expand_tilde;

/// Compiled allow-list of canonical directory roots.
#[derive(Debug, Clone)]
pub struct DirScope {
    allowed: Vec<PathBuf>,
}

impl DirScope {
    /// Build a scope from configured paths. Entries that don't exist (and so
    /// can't be canonicalized) are skipped with a warning rather than
    /// silently widening or narrowing the policy at check time.
    pub fn new(dirs: &[String]) -> Self {
        let mut allowed = Vec::with_capacity(dirs.len());
        for dir in dirs {
            let expanded = expand_tilde(dir);
            match std::fs::canonicalize(expanded.as_ref()) {
                Ok(canon) => allowed.push(canon),
                Err(e) => warn!("Ignoring allow-list entry {dir}: {e}"),
            }
        }
        Self { allowed }
    }

    /// Validate a candidate working directory. Returns its canonical form, or
    /// an error suitable for sending back to the operator.
    pub fn check(&self, candidate: &str) -> Result<PathBuf, String> {
        let expanded = expand_tilde(candidate);
        let canon = std::fs::canonicalize(expanded.as_ref())
            .map_err(|_| format!("Directory does not exist: {candidate}"))?;
        if !canon.is_dir() {
            return Err(format!("Not a directory: {candidate}"));
        }

        let inside = self.allowed.iter().any(|root| {
            canon == *root || canon.starts_with(root)
        });
        if inside {
            Ok(canon)
        } else {
            Err(format!("Directory not allowed: {candidate}"))
        }
    }

    /// First allow-list root, used as the default working directory.
    pub fn default_dir(&self) -> Option<&PathBuf> {
        self.allowed.first()
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }
}
