//! Integration tests for spec assembly across launcher modules.
use std::error::Error;
use std::path::Path;

use ibex::bundle::BundleHandle;
use ibex::filesystem::ImageMounter;
use ibex::launcher::{LaunchOptions, ProcessComposer, SpecBuilder};
use ibex_common::IbexError;
use ibex_oci::{NamespaceType, Spec};
use tempfile::TempDir;

fn make_bundle() -> Result<TempDir, Box<dyn Error>> {
    let temp_dir = TempDir::new()?;
    let rootfs = temp_dir.path().join("rootfs");
    std::fs::create_dir_all(rootfs.join("etc"))?;
    std::fs::write(
        rootfs.join("etc/passwd"),
        "root:x:0:0:root:/root:/bin/bash\n",
    )?;
    std::fs::write(rootfs.join("etc/group"), "root:x:0:\n")?;
    std::fs::write(
        temp_dir.path().join("image-config.json"),
        r#"{
            "architecture": "amd64",
            "os": "linux",
            "config": {
                "Env": ["PATH=/usr/bin", "IMAGE_VAR=from-image"],
                "Entrypoint": ["/bin/app"],
                "Cmd": ["--default"]
            }
        }"#,
    )?;
    Ok(temp_dir)
}

#[test]
fn skeleton_and_process_compose_into_a_complete_spec() -> Result<(), Box<dyn Error>> {
    let bundle_dir = make_bundle()?;
    let options = LaunchOptions {
        binds: vec!["/tmp:/mnt:ro".to_string()],
        env: vec!["USER_VAR=from-flag".to_string()],
        ..Default::default()
    };

    // 1. Skeleton spec (root caller so no subordinate-ID lookups run).
    let builder = SpecBuilder::with_ids(&options, 0, 0);
    let mut images = ImageMounter::new(bundle_dir.path().join("image-mounts"));
    let mut spec = builder.create_spec("it-1", &mut images)?;

    assert!(spec.has_namespace(NamespaceType::Ipc));
    assert!(spec.has_namespace(NamespaceType::Mount));
    assert!(spec.root.as_ref().unwrap().readonly);

    // The documented concrete scenario: a read-only bind derives exactly
    // rbind,nosuid,nodev,ro.
    let bind = spec
        .mounts
        .iter()
        .find(|m| m.destination == Path::new("/mnt"))
        .unwrap();
    assert_eq!(bind.options, vec!["rbind", "nosuid", "nodev", "ro"]);

    // 2. Bundle open + process finalization.
    let bundle = BundleHandle::create(bundle_dir.path())?;
    let composer = ProcessComposer::with_ids(&options, 0, 0);
    composer.finalize(&bundle.rootfs(), &bundle.image().execution(), &mut spec)?;

    let process = spec.process.as_ref().unwrap();
    assert_eq!(process.args, vec!["/bin/app", "--default"]);
    let env = &process.env;
    assert!(env.contains(&"IMAGE_VAR=from-image".to_string()));
    assert!(env.contains(&"USER_VAR=from-flag".to_string()));

    // 3. config.json lands in the bundle and round-trips.
    spec.save(bundle.path())?;
    let loaded = Spec::load(bundle.path())?;
    assert_eq!(loaded.process.unwrap().args, vec!["/bin/app", "--default"]);

    bundle.release();
    Ok(())
}

#[test]
fn concurrent_bundle_creates_fail_without_blocking() -> Result<(), Box<dyn Error>> {
    let bundle_dir = make_bundle()?;

    let first = BundleHandle::create(bundle_dir.path())?;
    let second = BundleHandle::create(bundle_dir.path());
    assert!(matches!(second.unwrap_err(), IbexError::BundleLocked { .. }));

    // Releasing the first allows a new create.
    first.release();
    assert!(BundleHandle::create(bundle_dir.path()).is_ok());
    Ok(())
}

#[test]
fn synthesized_etc_files_land_in_the_rootfs() -> Result<(), Box<dyn Error>> {
    let bundle_dir = make_bundle()?;
    let options = LaunchOptions {
        dns: Some("10.1.1.1".to_string()),
        env: vec!["INJECTED=yes".to_string()],
        ..Default::default()
    };

    let bundle = BundleHandle::create(bundle_dir.path())?;
    let builder = SpecBuilder::with_ids(&options, 0, 0);
    let mut images = ImageMounter::new(bundle_dir.path().join("image-mounts"));
    let mut spec = builder.create_spec("it-2", &mut images)?;

    let composer = ProcessComposer::with_ids(&options, 0, 0);
    composer.finalize(&bundle.rootfs(), &bundle.image().execution(), &mut spec)?;

    let rootfs = bundle.rootfs();
    let resolv = std::fs::read_to_string(rootfs.join("etc/resolv.conf"))?;
    assert_eq!(resolv, "nameserver 10.1.1.1\n");

    let script =
        std::fs::read_to_string(rootfs.join(".singularity.d/env/98-singularityenv.sh"))?;
    assert!(script.contains("export INJECTED=\"yes\""));

    let passwd = std::fs::read_to_string(rootfs.join("etc/passwd"))?;
    assert!(passwd.contains(":x:0:0:"));

    bundle.release();
    Ok(())
}

#[test]
fn overlapping_writable_overlays_fail_before_any_mount() -> Result<(), Box<dyn Error>> {
    let bundle_dir = make_bundle()?;
    let layer_a = bundle_dir.path().join("layer-a");
    let layer_b = bundle_dir.path().join("layer-b");
    std::fs::create_dir_all(&layer_a)?;
    std::fs::create_dir_all(&layer_b)?;

    let options = LaunchOptions {
        overlays: vec![
            layer_a.display().to_string(),
            layer_b.display().to_string(),
        ],
        ..Default::default()
    };

    let builder = SpecBuilder::with_ids(&options, 0, 0);
    let mut images = ImageMounter::new(bundle_dir.path().join("image-mounts"));
    let err = builder.create_spec("it-3", &mut images).unwrap_err();
    assert!(err.to_string().contains("at most one overlay"));
    Ok(())
}
