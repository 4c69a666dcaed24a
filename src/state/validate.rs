//! Restore-time validation of the container spec against the checkpoint
//!
//! The restoring spec must agree with the checkpointed one on the fields
//! that shaped kernel state: terminal, argv, capabilities, devices,
//! namespace types, seccomp, mounts, and annotations. Resource limits may
//! diverge. Namespaces compare by type only, since paths are host-specific.

use crate::{
    errors::StateError,
    spec::{LinuxNamespace, Mount, RuntimeSpec},
};
use std::collections::BTreeMap;

/// Annotation prefixes that are host- or manager-private and exempt from
/// comparison.
const EXEMPT_ANNOTATION_PREFIXES: [&str; 3] = [
    "dev.gvisor.internal.",
    "dev.gvisor.spec.mount.",
    "dev.gvisor.container-name-remap.",
];

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum ValidationPolicy {
    #[default]
    Enforce,
    Ignore,
}

impl std::str::FromStr for ValidationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<ValidationPolicy, String> {
        match s {
            "enforce" | "" => Ok(ValidationPolicy::Enforce),
            "ignore" => Ok(ValidationPolicy::Ignore),
            other => Err(format!("unknown restore validation policy {:?}", other)),
        }
    }
}

fn mismatch(field: &str) -> StateError {
    StateError::SpecMismatch {
        field: field.to_string(),
    }
}

/// Validates `restoring` against the checkpointed `saved` spec.
pub fn validate_restore_spec(
    saved: &RuntimeSpec,
    restoring: &RuntimeSpec,
    policy: ValidationPolicy,
) -> Result<(), StateError> {
    if policy == ValidationPolicy::Ignore {
        log::info!("restore spec validation disabled by policy");
        return Ok(());
    }
    if saved.process.terminal != restoring.process.terminal {
        return Err(mismatch("Terminal"));
    }
    if !argv_matches(saved, restoring) {
        return Err(mismatch("Args"));
    }
    if saved.process.capabilities != restoring.process.capabilities {
        return Err(mismatch("Capabilities"));
    }
    validate_mounts(&saved.mounts, &restoring.mounts)?;
    validate_linux(saved, restoring)?;
    validate_annotations(&saved.annotations, &restoring.annotations)?;
    Ok(())
}

/// Argv comparison. `basename(argv[0])` and `./basename` are treated as
/// equivalent spellings of an executable that resolution finds via the
/// working directory; everything else must be equal verbatim.
fn argv_matches(saved: &RuntimeSpec, restoring: &RuntimeSpec) -> bool {
    let a = &saved.process.args;
    let b = &restoring.process.args;
    if a.len() != b.len() {
        return false;
    }
    if a.is_empty() {
        return true;
    }
    if a[1..] != b[1..] {
        return false;
    }
    a[0] == b[0] || argv0_equivalent(&a[0], &b[0])
}

fn argv0_equivalent(a: &str, b: &str) -> bool {
    fn bare(arg: &str) -> Option<&str> {
        let trimmed = arg.strip_prefix("./").unwrap_or(arg);
        if trimmed.contains('/') {
            None
        } else {
            Some(trimmed)
        }
    }
    fn basename(arg: &str) -> &str {
        arg.rsplit('/').next().unwrap_or(arg)
    }
    match (bare(a), bare(b)) {
        // at least one side must be the bare-or-dot-relative spelling
        (Some(a), Some(b)) => a == b,
        (Some(bare), None) => bare == basename(b),
        (None, Some(bare)) => basename(a) == bare,
        (None, None) => false,
    }
}

/// Mounts must agree pairwise on (destination, type). The restoring spec
/// may carry duplicate entries, but duplicates naming the same destination
/// must be identical.
fn validate_mounts(saved: &[Mount], restoring: &[Mount]) -> Result<(), StateError> {
    let mut restored: BTreeMap<&str, &Mount> = BTreeMap::new();
    for mount in restoring {
        match restored.get(mount.destination.as_str()) {
            None => {
                restored.insert(&mount.destination, mount);
            }
            Some(existing)
                if existing.source == mount.source
                    && existing.mount_type == mount.mount_type => {}
            Some(_) => {
                return Err(StateError::InvalidMount {
                    destination: mount.destination.clone(),
                });
            }
        }
    }
    let mut expected: BTreeMap<&str, &Mount> = BTreeMap::new();
    for mount in saved {
        expected.entry(&mount.destination).or_insert(mount);
    }
    if expected.len() != restored.len() {
        return Err(mismatch("Mounts"));
    }
    for (destination, mount) in &expected {
        match restored.get(destination) {
            Some(other) if other.mount_type == mount.mount_type => {}
            _ => return Err(mismatch("Mounts")),
        }
    }
    Ok(())
}

fn validate_linux(saved: &RuntimeSpec, restoring: &RuntimeSpec) -> Result<(), StateError> {
    let empty = Default::default();
    let a = saved.linux.as_ref().unwrap_or(&empty);
    let b = restoring.linux.as_ref().unwrap_or(&empty);

    let mut devices_a = a.devices.clone();
    let mut devices_b = b.devices.clone();
    devices_a.sort_by(|x, y| x.path.cmp(&y.path));
    devices_b.sort_by(|x, y| x.path.cmp(&y.path));
    if devices_a != devices_b {
        return Err(mismatch("Devices"));
    }

    // namespaces compare by type only; paths point at host objects
    if namespace_types(&a.namespaces) != namespace_types(&b.namespaces) {
        return Err(mismatch("Namespace"));
    }

    if a.seccomp != b.seccomp {
        return Err(mismatch("Seccomp"));
    }

    // Linux.Resources may legitimately differ between hosts
    Ok(())
}

fn namespace_types(namespaces: &[LinuxNamespace]) -> Vec<&str> {
    let mut types: Vec<&str> = namespaces.iter().map(|ns| ns.ns_type.as_str()).collect();
    types.sort_unstable();
    types
}

fn validate_annotations(
    saved: &BTreeMap<String, String>,
    restoring: &BTreeMap<String, String>,
) -> Result<(), StateError> {
    let filter = |annotations: &BTreeMap<String, String>| -> BTreeMap<String, String> {
        annotations
            .iter()
            .filter(|(key, _)| {
                !EXEMPT_ANNOTATION_PREFIXES
                    .iter()
                    .any(|prefix| key.starts_with(prefix))
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    };
    if filter(saved) != filter(restoring) {
        return Err(mismatch("Annotations"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{Capabilities, Linux, LinuxDevice, LinuxSeccomp};

    fn sleep_spec() -> RuntimeSpec {
        RuntimeSpec::with_args(vec!["sleep", "1000"])
    }

    fn expect_mismatch(result: Result<(), StateError>, field: &str) {
        match result {
            Err(StateError::SpecMismatch { field: got }) => assert_eq!(got, field),
            other => panic!("expected {} mismatch, got {:?}", field, other),
        }
    }

    #[test]
    fn identical_specs_pass() {
        validate_restore_spec(&sleep_spec(), &sleep_spec(), ValidationPolicy::Enforce).unwrap();
    }

    #[test]
    fn terminal_divergence_is_reported() {
        let saved = sleep_spec();
        let mut restoring = sleep_spec();
        restoring.process.terminal = true;
        let err =
            validate_restore_spec(&saved, &restoring, ValidationPolicy::Enforce).unwrap_err();
        assert!(err
            .to_string()
            .contains("Terminal does not match across checkpoint restore"));
    }

    #[test]
    fn extra_arg_is_reported() {
        let saved = sleep_spec();
        let mut restoring = sleep_spec();
        restoring.process.args.push("new arg".to_string());
        expect_mismatch(
            validate_restore_spec(&saved, &restoring, ValidationPolicy::Enforce),
            "Args",
        );
    }

    #[test]
    fn argv0_spellings_are_equivalent() {
        let mut saved = sleep_spec();
        saved.process.args[0] = "/usr/bin/sleep".to_string();
        let mut restoring = sleep_spec();
        restoring.process.args[0] = "./sleep".to_string();
        validate_restore_spec(&saved, &restoring, ValidationPolicy::Enforce).unwrap();

        restoring.process.args[0] = "./nap".to_string();
        expect_mismatch(
            validate_restore_spec(&saved, &restoring, ValidationPolicy::Enforce),
            "Args",
        );
    }

    #[test]
    fn added_bounding_capability_is_reported() {
        let mut saved = sleep_spec();
        saved.process.capabilities = Some(Capabilities::default());
        let mut restoring = sleep_spec();
        let mut caps = Capabilities::default();
        caps.bounding.push("CAP_NET_RAW".to_string());
        restoring.process.capabilities = Some(caps);
        expect_mismatch(
            validate_restore_spec(&saved, &restoring, ValidationPolicy::Enforce),
            "Capabilities",
        );
    }

    #[test]
    fn added_device_is_reported() {
        let saved = sleep_spec();
        let mut restoring = sleep_spec();
        restoring.linux = Some(Linux {
            devices: vec![LinuxDevice {
                path: "/dev/nvidiactl".to_string(),
                dev_type: "c".to_string(),
                major: 195,
                minor: 255,
                file_mode: Some(0o666),
            }],
            ..Default::default()
        });
        expect_mismatch(
            validate_restore_spec(&saved, &restoring, ValidationPolicy::Enforce),
            "Devices",
        );
    }

    #[test]
    fn namespaces_compare_by_type_only() {
        let mut saved = sleep_spec();
        saved.linux = Some(Linux {
            namespaces: vec![LinuxNamespace {
                ns_type: "network".to_string(),
                path: "/proc/1/ns/net1".to_string(),
            }],
            ..Default::default()
        });
        let mut restoring = sleep_spec();
        restoring.linux = Some(Linux {
            namespaces: vec![LinuxNamespace {
                ns_type: "network".to_string(),
                path: "/proc/2/ns/net2".to_string(),
            }],
            ..Default::default()
        });
        validate_restore_spec(&saved, &restoring, ValidationPolicy::Enforce).unwrap();

        restoring.linux.as_mut().unwrap().namespaces[0].ns_type = "pid".to_string();
        expect_mismatch(
            validate_restore_spec(&saved, &restoring, ValidationPolicy::Enforce),
            "Namespace",
        );
    }

    #[test]
    fn seccomp_divergence_is_reported() {
        let saved = sleep_spec();
        let mut restoring = sleep_spec();
        restoring.linux = Some(Linux {
            seccomp: Some(LinuxSeccomp {
                default_action: "SCMP_ACT_ALLOW".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        });
        expect_mismatch(
            validate_restore_spec(&saved, &restoring, ValidationPolicy::Enforce),
            "Seccomp",
        );
    }

    #[test]
    fn identical_duplicate_mounts_are_tolerated() {
        let mut saved = sleep_spec();
        saved.mounts.push(Mount {
            destination: "/data".to_string(),
            mount_type: "tmpfs".to_string(),
            source: "src-a".to_string(),
            options: Vec::new(),
        });
        let mut restoring = sleep_spec();
        let mount = Mount {
            destination: "/data".to_string(),
            mount_type: "tmpfs".to_string(),
            source: "src-b".to_string(),
            options: Vec::new(),
        };
        restoring.mounts.push(mount.clone());
        restoring.mounts.push(mount);
        // sources may differ across hosts; destination and type pair up
        validate_restore_spec(&saved, &restoring, ValidationPolicy::Enforce).unwrap();
    }

    #[test]
    fn divergent_duplicate_mounts_are_invalid() {
        let mut saved = sleep_spec();
        saved.mounts.push(Mount {
            destination: "/data".to_string(),
            mount_type: "tmpfs".to_string(),
            source: "src".to_string(),
            options: Vec::new(),
        });
        let mut restoring = saved.clone();
        let mut dup = restoring.mounts[0].clone();
        dup.source = "other".to_string();
        restoring.mounts.push(dup);
        match validate_restore_spec(&saved, &restoring, ValidationPolicy::Enforce) {
            Err(StateError::InvalidMount { destination }) => assert_eq!(destination, "/data"),
            other => panic!("expected invalid mount, got {:?}", other),
        }
    }

    #[test]
    fn moved_mount_is_reported() {
        let mut saved = sleep_spec();
        saved.mounts.push(Mount {
            destination: "/data".to_string(),
            mount_type: "tmpfs".to_string(),
            source: "src".to_string(),
            options: Vec::new(),
        });
        let mut restoring = sleep_spec();
        restoring.mounts.push(Mount {
            destination: "/elsewhere".to_string(),
            mount_type: "tmpfs".to_string(),
            source: "src".to_string(),
            options: Vec::new(),
        });
        expect_mismatch(
            validate_restore_spec(&saved, &restoring, ValidationPolicy::Enforce),
            "Mounts",
        );
    }

    #[test]
    fn annotation_prefixes_are_exempt() {
        let mut saved = sleep_spec();
        saved
            .annotations
            .insert("dev.gvisor.internal.foo".to_string(), "foo".to_string());
        saved.annotations.insert(
            "dev.gvisor.spec.mount.mnt1.source".to_string(),
            "path1".to_string(),
        );
        let mut restoring = sleep_spec();
        restoring
            .annotations
            .insert("dev.gvisor.internal.foo".to_string(), "bar".to_string());
        restoring.annotations.insert(
            "dev.gvisor.container-name-remap.1".to_string(),
            "name2".to_string(),
        );
        validate_restore_spec(&saved, &restoring, ValidationPolicy::Enforce).unwrap();

        saved
            .annotations
            .insert("dev.gvisor.net-disconnect-ok".to_string(), "true".to_string());
        expect_mismatch(
            validate_restore_spec(&saved, &restoring, ValidationPolicy::Enforce),
            "Annotations",
        );
    }

    #[test]
    fn resources_may_differ() {
        use crate::spec::{LinuxMemory, LinuxResources};

        let mut saved = sleep_spec();
        saved.linux = Some(Linux {
            resources: Some(LinuxResources {
                memory: Some(LinuxMemory {
                    limit: Some(1),
                    swap: Some(2),
                    reservation: Some(3),
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
        let mut restoring = sleep_spec();
        restoring.linux = Some(Linux {
            resources: Some(LinuxResources {
                memory: Some(LinuxMemory {
                    limit: Some(1),
                    swap: Some(2),
                    reservation: Some(5),
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
        validate_restore_spec(&saved, &restoring, ValidationPolicy::Enforce).unwrap();
    }

    #[test]
    fn ignore_policy_bypasses_validation() {
        let saved = sleep_spec();
        let mut restoring = sleep_spec();
        restoring.process.terminal = true;
        restoring.process.args.push("extra".to_string());
        validate_restore_spec(&saved, &restoring, ValidationPolicy::Ignore).unwrap();
    }
}
