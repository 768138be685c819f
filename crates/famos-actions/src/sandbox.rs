//! Cooperative sandbox profiles for tool dispatch.

use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::ActionError;

/// Named sandbox profiles from the tool spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxProfile {
    /// Filesystem allowlist, no network, per-call CPU/time budget enforced
    /// cooperatively, soft memory cap.
    Default,
    /// Separate worker, restricted environment, explicit IPC only. The
    /// in-process rendition still enforces the same data-level limits; the
    /// process boundary belongs to the OS adapter layer.
    HighIsolation,
}

/// The concrete limits a dispatch runs under. Adapters must consult
/// [`SandboxContext::check_path`] before touching the filesystem and
/// [`SandboxContext::check_deadline`] at loop boundaries.
#[derive(Debug, Clone)]
pub struct SandboxContext {
    profile: SandboxProfile,
    allowed_paths: Vec<PathBuf>,
    allow_network: bool,
    deadline: Instant,
    /// Soft cap adapters should respect when buffering output.
    pub memory_cap_bytes: usize,
}

impl SandboxContext {
    /// Build the context for a profile with a time budget.
    pub fn enter(
        profile: SandboxProfile,
        allowed_paths: Vec<PathBuf>,
        budget: std::time::Duration,
    ) -> Self {
        let (allow_network, memory_cap_bytes) = match profile {
            SandboxProfile::Default => (false, 64 * 1024 * 1024),
            SandboxProfile::HighIsolation => (false, 16 * 1024 * 1024),
        };
        Self {
            profile,
            allowed_paths,
            allow_network,
            deadline: Instant::now() + budget,
            memory_cap_bytes,
        }
    }

    /// The active profile.
    pub fn profile(&self) -> SandboxProfile {
        self.profile
    }

    /// Whether outbound network is permitted (never, currently).
    pub fn network_allowed(&self) -> bool {
        self.allow_network
    }

    /// Verify a filesystem path is inside the allowlist.
    pub fn check_path(&self, path: &Path) -> Result<(), ActionError> {
        let ok = self
            .allowed_paths
            .iter()
            .any(|allowed| path.starts_with(allowed));
        if ok {
            Ok(())
        } else {
            Err(ActionError::SafetyBlocked(format!(
                "path outside sandbox allowlist: {}",
                path.display()
            )))
        }
    }

    /// Verify the time budget has not run out.
    pub fn check_deadline(&self) -> Result<(), ActionError> {
        if Instant::now() >= self.deadline {
            Err(ActionError::Timeout(0))
        } else {
            Ok(())
        }
    }

    /// Remaining budget.
    pub fn remaining(&self) -> std::time::Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn allowlist_is_enforced() {
        let ctx = SandboxContext::enter(
            SandboxProfile::Default,
            vec![PathBuf::from("/workspace/notes")],
            Duration::from_secs(1),
        );
        assert!(ctx.check_path(Path::new("/workspace/notes/today.md")).is_ok());
        assert!(ctx.check_path(Path::new("/etc/passwd")).is_err());
        assert!(!ctx.network_allowed());
    }

    #[test]
    fn deadline_expires() {
        let ctx = SandboxContext::enter(SandboxProfile::Default, vec![], Duration::ZERO);
        assert!(ctx.check_deadline().is_err());
    }
}
