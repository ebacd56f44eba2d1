//! Capability set composition for the container process.
//!
//! A fixed default baseline applies unless the caller asked for none
//! (`--no-privs`) or for their own effective set (`--keep-privs`);
//! `--add-caps`/`--drop-caps` adjust the result. How the composed list is
//! spread across the five OCI capability sets depends on whether the
//! target user is root inside the container.

use ibex_common::{IbexError, IbexResult};
use ibex_oci::Capabilities;

/// Default capability baseline for containers.
pub const DEFAULT_CAPABILITIES: &[&str] = &[
    "CAP_AUDIT_WRITE",
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_KILL",
    "CAP_MKNOD",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_RAW",
    "CAP_SETFCAP",
    "CAP_SETGID",
    "CAP_SETPCAP",
    "CAP_SETUID",
    "CAP_SYS_CHROOT",
];

/// Resolve the capability baseline for a launch.
///
/// `--no-privs` empties it, `--keep-privs` copies the caller's effective
/// set, otherwise the fixed default applies.
pub fn baseline(no_privs: bool, keep_privs: bool) -> IbexResult<Vec<String>> {
    if no_privs {
        return Ok(Vec::new());
    }
    if keep_privs {
        let effective = caps::read(None, caps::CapSet::Effective).map_err(|e| {
            IbexError::Internal {
                message: format!("cannot read effective capabilities: {e}"),
            }
        })?;
        let mut caps: Vec<String> = effective.iter().map(ToString::to_string).collect();
        caps.sort();
        return Ok(caps);
    }
    Ok(DEFAULT_CAPABILITIES.iter().map(ToString::to_string).collect())
}

/// Compose the OCI capability sets for a target user.
///
/// Root targets get the full composed list in Permitted/Effective/Bounding
/// with empty Inheritable/Ambient. Non-root targets only carry the
/// explicitly added capabilities in the first four sets, while Bounding
/// keeps the full baseline+added−dropped list.
pub fn compose(
    baseline: &[String],
    add: &[String],
    drop: &[String],
    target_uid: u32,
) -> IbexResult<Capabilities> {
    let add: Vec<String> = add.iter().map(|c| normalize(c)).collect::<IbexResult<_>>()?;
    let drop: Vec<String> = drop.iter().map(|c| normalize(c)).collect::<IbexResult<_>>()?;

    let mut full: Vec<String> = baseline.to_vec();
    for cap in &add {
        if !full.contains(cap) {
            full.push(cap.clone());
        }
    }
    full.retain(|c| !drop.contains(c));

    let added: Vec<String> = add.into_iter().filter(|c| !drop.contains(c)).collect();

    Ok(if target_uid == 0 {
        Capabilities {
            bounding: full.clone(),
            effective: full.clone(),
            inheritable: Vec::new(),
            permitted: full,
            ambient: Vec::new(),
        }
    } else {
        Capabilities {
            bounding: full,
            effective: added.clone(),
            inheritable: added.clone(),
            permitted: added.clone(),
            ambient: added,
        }
    })
}

/// Accept `net_raw`, `NET_RAW` or `CAP_NET_RAW` spellings.
fn normalize(cap: &str) -> IbexResult<String> {
    let upper = cap.to_ascii_uppercase();
    let name = if upper.starts_with("CAP_") {
        upper
    } else {
        format!("CAP_{upper}")
    };
    if !name[4..]
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
        || name.len() == 4
    {
        return Err(IbexError::config(format!("invalid capability name: {cap:?}")));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(caps: &[&str]) -> Vec<String> {
        caps.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn root_target_gets_full_sets_and_empty_ambient() {
        let base = strings(&["CAP_CHOWN", "CAP_KILL"]);
        let caps = compose(&base, &strings(&["sys_admin"]), &strings(&["CAP_KILL"]), 0).unwrap();
        assert_eq!(caps.permitted, strings(&["CAP_CHOWN", "CAP_SYS_ADMIN"]));
        assert_eq!(caps.effective, caps.permitted);
        assert_eq!(caps.bounding, caps.permitted);
        assert!(caps.inheritable.is_empty());
        assert!(caps.ambient.is_empty());
    }

    #[test]
    fn non_root_target_only_carries_added_caps() {
        let base = strings(DEFAULT_CAPABILITIES);
        let caps = compose(&base, &strings(&["net_admin"]), &[], 1000).unwrap();
        assert_eq!(caps.permitted, strings(&["CAP_NET_ADMIN"]));
        assert_eq!(caps.effective, strings(&["CAP_NET_ADMIN"]));
        assert_eq!(caps.inheritable, strings(&["CAP_NET_ADMIN"]));
        assert_eq!(caps.ambient, strings(&["CAP_NET_ADMIN"]));
        // Bounding keeps the remaining baseline plus the addition.
        assert!(caps.bounding.contains(&"CAP_CHOWN".to_string()));
        assert!(caps.bounding.contains(&"CAP_NET_ADMIN".to_string()));
    }

    #[test]
    fn dropped_caps_leave_bounding() {
        let base = strings(DEFAULT_CAPABILITIES);
        let caps = compose(&base, &[], &strings(&["CAP_NET_RAW"]), 1000).unwrap();
        assert!(!caps.bounding.contains(&"CAP_NET_RAW".to_string()));
    }

    #[test]
    fn no_privs_baseline_is_empty() {
        assert!(baseline(true, false).unwrap().is_empty());
    }

    #[test]
    fn invalid_capability_name_is_rejected() {
        assert!(compose(&[], &["not a cap!".to_string()], &[], 0).is_err());
        assert!(compose(&[], &["cap_".to_string()], &[], 0).is_err());
    }
}
