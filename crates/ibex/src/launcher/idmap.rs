//! Rootless UID/GID mapping computation.
//!
//! The launcher runs inside an initial user namespace in which the caller is
//! mapped to root. To make the container process appear as an arbitrary
//! target user, a *nested* namespace is added whose mappings run in the
//! reverse direction: container ID 0 resolves to an unprivileged host-side
//! ID, and the target ID resolves to ID 0 of the outer namespace (the
//! caller's own privilege boundary). The same computation serves both
//! "run as the image USER" and `--fakeroot` (target 0).

use std::fs;
use std::path::Path;

use ibex_common::{IbexError, IbexResult};
use ibex_oci::IdMapping;

/// Minimum subordinate range size required for a container.
///
/// Smaller ranges cannot represent the standard low-numbered accounts
/// (e.g. "nobody" at 65534).
pub const MIN_SUBID_RANGE: u32 = 65536;

/// A subordinate ID range from /etc/subuid or /etc/subgid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubIdRange {
    /// First host ID of the range.
    pub start: u32,
    /// Number of IDs in the range.
    pub size: u32,
}

/// Compute reverse UID and GID mappings for a launch.
///
/// Identity pass-through when both caller and target are root; otherwise
/// the caller's subordinate ranges are read and validated, and the reverse
/// maps are built per [`reverse_id_map`].
pub fn reverse_user_maps(
    host_uid: u32,
    host_gid: u32,
    target_uid: u32,
    target_gid: u32,
) -> IbexResult<(Vec<IdMapping>, Vec<IdMapping>)> {
    if host_uid == 0 && target_uid == 0 {
        let identity = vec![IdMapping {
            container_id: 0,
            host_id: 0,
            size: MIN_SUBID_RANGE,
        }];
        return Ok((identity.clone(), identity));
    }

    let subuid = subid_range(Path::new("/etc/subuid"), host_uid, "uid")?;
    let subgid = subid_range(Path::new("/etc/subgid"), host_gid, "gid")?;

    Ok((
        reverse_id_map(target_uid, subuid.size),
        reverse_id_map(target_gid, subgid.size),
    ))
}

/// Build the reverse mapping table for one target ID.
///
/// Container ID 0 maps to host ID 1, the target maps to host ID 0, and the
/// remainder of `[0, range_size)` fills in contiguously. Yields two entries
/// when the target lies at or above the range size, three otherwise
/// (zero-size segments are dropped, so a target of 0 also yields two).
#[must_use]
pub fn reverse_id_map(target: u32, range_size: u32) -> Vec<IdMapping> {
    let mut map = Vec::with_capacity(3);

    if target < range_size {
        map.push(IdMapping {
            container_id: 0,
            host_id: 1,
            size: target,
        });
        map.push(IdMapping {
            container_id: target,
            host_id: 0,
            size: 1,
        });
        map.push(IdMapping {
            container_id: target + 1,
            host_id: target + 1,
            size: range_size - (target + 1),
        });
    } else {
        map.push(IdMapping {
            container_id: 0,
            host_id: 1,
            size: range_size,
        });
        map.push(IdMapping {
            container_id: target,
            host_id: 0,
            size: 1,
        });
    }

    map.retain(|m| m.size > 0);
    map
}

/// Read the caller's subordinate range, requiring at least
/// [`MIN_SUBID_RANGE`] IDs.
pub fn subid_range(path: &Path, host_id: u32, kind: &str) -> IbexResult<SubIdRange> {
    let user = username_for(host_id);
    let range = parse_subid_file(path, host_id, &user)?;

    match range {
        Some(range) if range.size >= MIN_SUBID_RANGE => Ok(range),
        Some(range) => Err(IbexError::SubIdRange {
            kind: kind.to_string(),
            user,
            size: range.size,
        }),
        None => Err(IbexError::SubIdRange {
            kind: kind.to_string(),
            user,
            size: 0,
        }),
    }
}

/// Find the first `name:start:count` entry matching the numeric ID or the
/// username.
fn parse_subid_file(path: &Path, id: u32, username: &str) -> IbexResult<Option<SubIdRange>> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let id_str = id.to_string();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() >= 3 && (parts[0] == id_str || parts[0] == username) {
            if let (Ok(start), Ok(size)) = (parts[1].parse(), parts[2].parse()) {
                return Ok(Some(SubIdRange { start, size }));
            }
        }
    }

    Ok(None)
}

/// Username for a UID from /etc/passwd, falling back to the numeric form.
pub(crate) fn username_for(uid: u32) -> String {
    let content = fs::read_to_string("/etc/passwd").unwrap_or_default();
    for line in content.lines() {
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() >= 3 {
            if let Ok(line_uid) = parts[2].parse::<u32>() {
                if line_uid == uid {
                    return parts[0].to_string();
                }
            }
        }
    }
    uid.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;

    /// Container-ID coverage of a map: every ID in `[0, size)` must appear
    /// exactly once, plus optionally the out-of-range target.
    fn covered_once(map: &[IdMapping], id: u32) -> bool {
        map.iter()
            .filter(|m| id >= m.container_id && id - m.container_id < m.size)
            .count()
            == 1
    }

    fn host_of(map: &[IdMapping], id: u32) -> Option<u32> {
        map.iter()
            .find(|m| id >= m.container_id && id - m.container_id < m.size)
            .map(|m| m.host_id + (id - m.container_id))
    }

    #[test]
    fn target_inside_range_yields_three_entries() {
        let map = reverse_id_map(1000, 65536);
        assert_eq!(map.len(), 3);
        assert_eq!(host_of(&map, 0), Some(1));
        assert_eq!(host_of(&map, 1000), Some(0));
        assert_eq!(host_of(&map, 1001), Some(1001));
        for id in 0..65536 {
            assert!(covered_once(&map, id), "id {id} not covered exactly once");
        }
    }

    #[test]
    fn target_above_range_yields_two_entries() {
        let map = reverse_id_map(70000, 65536);
        assert_eq!(
            map,
            vec![
                IdMapping {
                    container_id: 0,
                    host_id: 1,
                    size: 65536
                },
                IdMapping {
                    container_id: 70000,
                    host_id: 0,
                    size: 1
                },
            ]
        );
    }

    #[test]
    fn target_zero_drops_empty_head() {
        let map = reverse_id_map(0, 65536);
        assert_eq!(map.len(), 2);
        assert_eq!(host_of(&map, 0), Some(0));
        assert_eq!(host_of(&map, 1), Some(1));
    }

    #[test]
    fn root_to_root_is_identity() {
        let (uid_map, gid_map) = reverse_user_maps(0, 0, 0, 0).unwrap();
        assert_eq!(uid_map.len(), 1);
        assert_eq!(uid_map[0].container_id, 0);
        assert_eq!(uid_map[0].host_id, 0);
        assert_eq!(uid_map[0].size, 65536);
        assert_eq!(uid_map, gid_map);
    }

    #[test]
    fn subid_file_matches_by_uid_or_name() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# comment").unwrap();
        writeln!(file, "alice:100000:65536").unwrap();
        writeln!(file, "1234:200000:131072").unwrap();
        let range = parse_subid_file(file.path(), 1234, "nobody-matches")
            .unwrap()
            .unwrap();
        assert_eq!(
            range,
            SubIdRange {
                start: 200_000,
                size: 131_072
            }
        );
        let range = parse_subid_file(file.path(), 9999, "alice").unwrap().unwrap();
        assert_eq!(range.start, 100_000);
    }

    #[test]
    fn small_range_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "1234:100000:1000").unwrap();
        let err = subid_range(file.path(), 1234, "uid").unwrap_err();
        assert!(matches!(err, IbexError::SubIdRange { size: 1000, .. }));
    }

    proptest! {
        #[test]
        fn reverse_map_covers_range_once(target in 0u32..200_000, size in 65536u32..200_000) {
            let map = reverse_id_map(target, size);
            prop_assert!(map.len() >= 2 && map.len() <= 3);
            prop_assert_eq!(host_of(&map, target), Some(0));
            if target > 0 {
                prop_assert_eq!(host_of(&map, 0), Some(1));
            }
            for id in [0, 1, size / 2, size - 1] {
                prop_assert!(covered_once(&map, id));
            }
        }
    }
}
