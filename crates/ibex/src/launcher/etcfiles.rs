//! Synthesized `/etc` files and the environment injection script.
//!
//! The pristine rootfs copies of passwd and group are rewritten so the
//! target account resolves inside the container; resolv.conf comes from the
//! host or the `--dns` list. All writes land on the overlay-mounted rootfs,
//! so the underlying image stays untouched.

use std::path::Path;

use ibex_common::IbexResult;

/// A passwd entry relevant to user resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    /// Account name.
    pub name: String,
    /// User ID.
    pub uid: u32,
    /// Primary group ID.
    pub gid: u32,
    /// Home directory.
    pub home: String,
}

/// Find an account in the rootfs passwd file by name or numeric UID.
pub fn lookup_passwd(rootfs: &Path, user: &str) -> IbexResult<Option<PasswdEntry>> {
    let path = rootfs.join("etc/passwd");
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    for line in content.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 6 {
            continue;
        }
        let (Ok(uid), Ok(gid)) = (fields[2].parse(), fields[3].parse()) else {
            continue;
        };
        if fields[0] == user || fields[2] == user {
            return Ok(Some(PasswdEntry {
                name: fields[0].to_string(),
                uid,
                gid,
                home: fields[5].to_string(),
            }));
        }
    }
    Ok(None)
}

/// Find a group in the rootfs group file by name or numeric GID.
pub fn lookup_group(rootfs: &Path, group: &str) -> IbexResult<Option<(String, u32)>> {
    let path = rootfs.join("etc/group");
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    for line in content.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 3 {
            continue;
        }
        let Ok(gid) = fields[2].parse() else { continue };
        if fields[0] == group || fields[2] == group {
            return Ok(Some((fields[0].to_string(), gid)));
        }
    }
    Ok(None)
}

/// Rewrite the rootfs passwd file so the target account exists.
///
/// An existing entry with the target UID is replaced; otherwise a new line
/// is appended.
pub fn synthesize_passwd(
    rootfs: &Path,
    name: &str,
    uid: u32,
    gid: u32,
    home: &str,
) -> IbexResult<()> {
    let path = rootfs.join("etc/passwd");
    let pristine = std::fs::read_to_string(&path).unwrap_or_default();

    let mut lines: Vec<String> = pristine
        .lines()
        .filter(|l| {
            l.split(':')
                .nth(2)
                .and_then(|f| f.parse::<u32>().ok())
                .is_none_or(|line_uid| line_uid != uid)
        })
        .map(ToString::to_string)
        .collect();
    lines.push(format!("{name}:x:{uid}:{gid}:{name}:{home}:/bin/sh"));

    std::fs::create_dir_all(rootfs.join("etc"))?;
    std::fs::write(&path, lines.join("\n") + "\n")?;
    tracing::debug!(user = name, uid, "passwd synthesized");
    Ok(())
}

/// Rewrite the rootfs group file so the target group exists.
pub fn synthesize_group(rootfs: &Path, name: &str, gid: u32, member: &str) -> IbexResult<()> {
    let path = rootfs.join("etc/group");
    let pristine = std::fs::read_to_string(&path).unwrap_or_default();

    let mut lines: Vec<String> = pristine
        .lines()
        .filter(|l| {
            l.split(':')
                .nth(2)
                .and_then(|f| f.parse::<u32>().ok())
                .is_none_or(|line_gid| line_gid != gid)
        })
        .map(ToString::to_string)
        .collect();
    lines.push(format!("{name}:x:{gid}:{member}"));

    std::fs::create_dir_all(rootfs.join("etc"))?;
    std::fs::write(&path, lines.join("\n") + "\n")?;
    tracing::debug!(group = name, gid, "group synthesized");
    Ok(())
}

/// Write resolv.conf from the `--dns` list or the host copy.
pub fn synthesize_resolv_conf(rootfs: &Path, dns: Option<&str>) -> IbexResult<()> {
    std::fs::create_dir_all(rootfs.join("etc"))?;
    let path = rootfs.join("etc/resolv.conf");

    if let Some(dns) = dns {
        let mut content = String::new();
        for server in dns.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            content.push_str(&format!("nameserver {server}\n"));
        }
        std::fs::write(&path, content)?;
    } else if let Ok(host_copy) = std::fs::read("/etc/resolv.conf") {
        std::fs::write(&path, host_copy)?;
    }
    Ok(())
}

/// Record user-supplied environment in the image's env.d directory so
/// shell-style entrypoints pick it up.
pub fn write_env_script(rootfs: &Path, env: &[String]) -> IbexResult<()> {
    let dir = rootfs.join(".singularity.d/env");
    std::fs::create_dir_all(&dir)?;

    let mut script = String::from("#!/bin/sh\n");
    for entry in env {
        if let Some((key, value)) = entry.split_once('=') {
            script.push_str(&format!("export {key}=\"{value}\"\n"));
        }
    }
    std::fs::write(dir.join("98-singularityenv.sh"), script)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rootfs_with_passwd(content: &str) -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("etc")).unwrap();
        std::fs::write(tmp.path().join("etc/passwd"), content).unwrap();
        tmp
    }

    #[test]
    fn lookup_by_name_and_uid() {
        let tmp = rootfs_with_passwd("root:x:0:0:root:/root:/bin/bash\nwww:x:33:33:www:/var/www:/sbin/nologin\n");
        let entry = lookup_passwd(tmp.path(), "www").unwrap().unwrap();
        assert_eq!(entry.uid, 33);
        assert_eq!(entry.home, "/var/www");

        let entry = lookup_passwd(tmp.path(), "0").unwrap().unwrap();
        assert_eq!(entry.name, "root");
    }

    #[test]
    fn lookup_missing_user() {
        let tmp = rootfs_with_passwd("root:x:0:0:root:/root:/bin/bash\n");
        assert!(lookup_passwd(tmp.path(), "ghost").unwrap().is_none());
    }

    #[test]
    fn passwd_rewrite_replaces_same_uid() {
        let tmp = rootfs_with_passwd("root:x:0:0:root:/root:/bin/bash\nold:x:1000:1000:old:/home/old:/bin/sh\n");
        synthesize_passwd(tmp.path(), "alice", 1000, 1000, "/home/alice").unwrap();

        let content = std::fs::read_to_string(tmp.path().join("etc/passwd")).unwrap();
        assert!(content.contains("alice:x:1000:1000"));
        assert!(!content.contains("old:x:1000"));
        assert!(content.contains("root:x:0:0"));
    }

    #[test]
    fn resolv_conf_from_dns_list() {
        let tmp = tempfile::tempdir().unwrap();
        synthesize_resolv_conf(tmp.path(), Some("10.0.0.1, 10.0.0.2")).unwrap();
        let content = std::fs::read_to_string(tmp.path().join("etc/resolv.conf")).unwrap();
        assert_eq!(content, "nameserver 10.0.0.1\nnameserver 10.0.0.2\n");
    }

    #[test]
    fn env_script_exports_pairs() {
        let tmp = tempfile::tempdir().unwrap();
        write_env_script(tmp.path(), &["FOO=bar".to_string()]).unwrap();
        let content = std::fs::read_to_string(
            tmp.path().join(".singularity.d/env/98-singularityenv.sh"),
        )
        .unwrap();
        assert!(content.contains("export FOO=\"bar\""));
    }
}
