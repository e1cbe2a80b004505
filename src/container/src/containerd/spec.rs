//! OCI image config and runtime spec helpers
//!
//! Pure functions over JSON documents: selecting the host platform from a manifest list,
//! reading the image config, computing the layer chain id and building the runtime spec
//! for an action container.

use crate::common::VolumeMount;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use workflow::Action;

pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_DOCKER_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

const DEFAULT_PATH: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Capabilities granted to privileged action containers
const ALL_CAPABILITIES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_DAC_READ_SEARCH",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_KILL",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETPCAP",
    "CAP_LINUX_IMMUTABLE",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_BROADCAST",
    "CAP_NET_ADMIN",
    "CAP_NET_RAW",
    "CAP_IPC_LOCK",
    "CAP_IPC_OWNER",
    "CAP_SYS_MODULE",
    "CAP_SYS_RAWIO",
    "CAP_SYS_CHROOT",
    "CAP_SYS_PTRACE",
    "CAP_SYS_PACCT",
    "CAP_SYS_ADMIN",
    "CAP_SYS_BOOT",
    "CAP_SYS_NICE",
    "CAP_SYS_RESOURCE",
    "CAP_SYS_TIME",
    "CAP_SYS_TTY_CONFIG",
    "CAP_MKNOD",
    "CAP_LEASE",
    "CAP_AUDIT_WRITE",
    "CAP_AUDIT_CONTROL",
    "CAP_SETFCAP",
    "CAP_MAC_OVERRIDE",
    "CAP_MAC_ADMIN",
    "CAP_SYSLOG",
    "CAP_WAKE_ALARM",
    "CAP_BLOCK_SUSPEND",
    "CAP_AUDIT_READ",
    "CAP_PERFMON",
    "CAP_BPF",
    "CAP_CHECKPOINT_RESTORE",
];

/// Runtime-relevant parts of an image config
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageConfig {
    pub env: Vec<String>,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub working_dir: String,
    pub user: String,
    /// Chain id of the unpacked layers, the parent of the action snapshot
    pub chain_id: String,
}

#[derive(Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    config: Option<ContainerConfig>,
    #[serde(default)]
    rootfs: Option<RootFs>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct ContainerConfig {
    #[serde(default)]
    env: Option<Vec<String>>,
    #[serde(default)]
    entrypoint: Option<Vec<String>>,
    #[serde(default)]
    cmd: Option<Vec<String>>,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    user: Option<String>,
}

#[derive(Deserialize, Default)]
struct RootFs {
    #[serde(default)]
    diff_ids: Vec<String>,
}

/// Parse an OCI/Docker image config blob.
pub fn parse_image_config(data: &[u8]) -> Result<ImageConfig, serde_json::Error> {
    let file: ConfigFile = serde_json::from_slice(data)?;
    let config = file.config.unwrap_or_default();
    let diff_ids = file.rootfs.map(|r| r.diff_ids).unwrap_or_default();

    Ok(ImageConfig {
        env: config.env.unwrap_or_default(),
        entrypoint: config.entrypoint.unwrap_or_default(),
        cmd: config.cmd.unwrap_or_default(),
        working_dir: config.working_dir.unwrap_or_default(),
        user: config.user.unwrap_or_default(),
        chain_id: chain_id(&diff_ids),
    })
}

/// Layer chain id: `chain(L0) = diff(L0)`, `chain(L0..Ln) = sha256(chain(L0..Ln-1) + " " + diff(Ln))`.
pub fn chain_id(diff_ids: &[String]) -> String {
    let mut iter = diff_ids.iter();
    let Some(first) = iter.next() else {
        return String::new();
    };
    iter.fold(first.clone(), |parent, diff| {
        let digest = Sha256::digest(format!("{} {}", parent, diff).as_bytes());
        format!("sha256:{:x}", digest)
    })
}

pub fn is_index(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_INDEX || media_type == MEDIA_TYPE_DOCKER_LIST
}

/// Host platform in OCI terms (`linux`, `amd64`/`arm64`/...).
pub fn host_platform() -> (&'static str, &'static str) {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "arm",
        other => other,
    };
    (std::env::consts::OS, arch)
}

/// Pick the manifest digest for `os`/`arch` from an index, falling back to the first entry.
pub fn select_platform_manifest(index: &Value, os: &str, arch: &str) -> Option<String> {
    let manifests = index.get("manifests")?.as_array()?;
    let matching = manifests.iter().find(|m| {
        let platform = m.get("platform");
        let m_os = platform.and_then(|p| p.get("os")).and_then(Value::as_str);
        let m_arch = platform
            .and_then(|p| p.get("architecture"))
            .and_then(Value::as_str);
        m_os == Some(os) && m_arch == Some(arch)
    });
    matching
        .or_else(|| manifests.first())
        .and_then(|m| m.get("digest"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Config descriptor digest of an image manifest.
pub fn manifest_config_digest(manifest: &Value) -> Option<String> {
    manifest
        .get("config")?
        .get("digest")?
        .as_str()
        .map(str::to_string)
}

/// Process args: `[cmd] + args` when the action names a command, otherwise the image
/// entrypoint followed by the action args or the image cmd.
pub fn process_args(action: &Action, image: &ImageConfig) -> Vec<String> {
    if !action.cmd.is_empty() {
        let mut args = vec![action.cmd.clone()];
        args.extend(action.args.iter().cloned());
        return args;
    }
    let mut args = image.entrypoint.clone();
    if action.args.is_empty() {
        args.extend(image.cmd.iter().cloned());
    } else {
        args.extend(action.args.iter().cloned());
    }
    args
}

/// Image env overlaid with `overrides`; a later `KEY=` replaces an earlier one in place.
pub fn merge_env(image_env: &[String], overrides: &[String]) -> Vec<String> {
    let mut env: Vec<String> = image_env.to_vec();
    if !env.iter().any(|e| e.starts_with("PATH=")) {
        env.insert(0, DEFAULT_PATH.to_string());
    }
    for entry in overrides {
        let key = env_key(entry);
        match env.iter_mut().find(|e| env_key(e) == key) {
            Some(existing) => *existing = entry.clone(),
            None => env.push(entry.clone()),
        }
    }
    env
}

fn env_key(entry: &str) -> &str {
    entry.split_once('=').map(|(k, _)| k).unwrap_or(entry)
}

fn parse_user(user: &str) -> (u32, u32) {
    let mut parts = user.splitn(2, ':');
    let uid = parts.next().and_then(|u| u.parse().ok()).unwrap_or(0);
    let gid = parts.next().and_then(|g| g.parse().ok()).unwrap_or(0);
    (uid, gid)
}

/// Build the privileged OCI runtime spec for an action container.
pub fn runtime_spec(action: &Action, image: &ImageConfig, env: &[String]) -> Value {
    let (uid, gid) = parse_user(&image.user);
    let cwd = if image.working_dir.is_empty() {
        "/".to_string()
    } else {
        image.working_dir.clone()
    };

    let mut mounts = vec![
        json!({"destination": "/proc", "type": "proc", "source": "proc", "options": ["nosuid", "noexec", "nodev"]}),
        json!({"destination": "/dev", "type": "tmpfs", "source": "tmpfs", "options": ["nosuid", "strictatime", "mode=755", "size=65536k"]}),
        json!({"destination": "/dev/pts", "type": "devpts", "source": "devpts", "options": ["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620", "gid=5"]}),
        json!({"destination": "/dev/shm", "type": "tmpfs", "source": "shm", "options": ["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"]}),
        json!({"destination": "/dev/mqueue", "type": "mqueue", "source": "mqueue", "options": ["nosuid", "noexec", "nodev"]}),
        json!({"destination": "/sys", "type": "sysfs", "source": "sysfs", "options": ["nosuid", "noexec", "nodev", "rw"]}),
        json!({"destination": "/sys/fs/cgroup", "type": "cgroup", "source": "cgroup", "options": ["nosuid", "noexec", "nodev", "relatime", "rw"]}),
    ];
    if action.namespaces.host_network() {
        mounts.push(json!({"destination": "/etc/resolv.conf", "type": "bind", "source": "/etc/resolv.conf", "options": ["rbind", "ro"]}));
        mounts.push(json!({"destination": "/etc/hosts", "type": "bind", "source": "/etc/hosts", "options": ["rbind", "ro"]}));
    }
    for volume in &action.volumes {
        match VolumeMount::parse(volume) {
            Some(mount) => mounts.push(json!({
                "destination": mount.destination,
                "type": "bind",
                "source": mount.source,
                "options": mount.options,
            })),
            None => tracing::warn!("[ContainerdSpec] Ignoring malformed volume {}", volume),
        }
    }

    let mut namespaces = vec![
        json!({"type": "ipc"}),
        json!({"type": "uts"}),
        json!({"type": "mount"}),
    ];
    if !action.namespaces.host_pid() {
        namespaces.push(json!({"type": "pid"}));
    }
    if !action.namespaces.host_network() {
        namespaces.push(json!({"type": "network"}));
    }

    json!({
        "ociVersion": "1.1.0",
        "process": {
            "terminal": false,
            "user": {"uid": uid, "gid": gid},
            "args": process_args(action, image),
            "env": env,
            "cwd": cwd,
            "capabilities": {
                "bounding": ALL_CAPABILITIES,
                "effective": ALL_CAPABILITIES,
                "permitted": ALL_CAPABILITIES,
            },
            "rlimits": [{"type": "RLIMIT_NOFILE", "hard": 1024, "soft": 1024}],
            "noNewPrivileges": false
        },
        "root": {"path": "rootfs", "readonly": false},
        "mounts": mounts,
        "linux": {
            "resources": {"devices": [{"allow": true, "access": "rwm"}]},
            "namespaces": namespaces
        }
    })
}
