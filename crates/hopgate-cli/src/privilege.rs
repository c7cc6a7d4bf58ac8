//! Privilege drop after the listener is bound.
//!
//! Group first, then user: once the uid changes the process can no longer
//! change its gid. Any failure is fatal to startup.

use hopgate_proxy::{ProxyError, Result};
use nix::unistd::{getegid, geteuid, setgid, setuid, Gid, Uid};
use tracing::info;

/// Switch to `gid` and then `uid`, each only when given.
pub fn drop_privileges(uid: Option<u32>, gid: Option<u32>) -> Result<()> {
    if let Some(gid) = gid {
        let gid = Gid::from_raw(gid);

        // Supplementary groups would otherwise keep root's group memberships.
        #[cfg(target_os = "linux")]
        nix::unistd::setgroups(&[]).map_err(|e| {
            ProxyError::Privilege(format!("failed to clear supplementary groups: {}", e))
        })?;

        setgid(gid)
            .map_err(|e| ProxyError::Privilege(format!("failed to set gid {}: {}", gid, e)))?;
        info!("Dropped group privileges to gid={}", gid);
    }

    if let Some(uid) = uid {
        let uid = Uid::from_raw(uid);
        setuid(uid)
            .map_err(|e| ProxyError::Privilege(format!("failed to set uid {}: {}", uid, e)))?;
        info!("Dropped user privileges to uid={}", uid);
    }

    if uid.is_some() || gid.is_some() {
        info!("Running as uid={}, gid={}", geteuid(), getegid());
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_nothing_requested_is_noop() {
        assert!(drop_privileges(None, None).is_ok());
    }

    #[test]
    fn test_switching_to_current_uid_succeeds() {
        // setuid to the current uid is always permitted.
        let uid = geteuid().as_raw();
        if uid == 0 {
            return;
        }
        assert!(drop_privileges(Some(uid), None).is_ok());
    }

    #[test]
    fn test_failure_is_privilege_error() {
        // An unprivileged process cannot become root.
        if geteuid().is_root() {
            return;
        }
        let err = drop_privileges(Some(0), None).unwrap_err();
        assert!(matches!(err, ProxyError::Privilege(_)));
        assert!(err.is_startup_fatal());
    }
}
