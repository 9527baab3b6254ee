//! Hotplug volume plumbing on the node.
//!
//! The cluster reconciler schedules a volume pod that holds the PVCs open;
//! this module resolves those volumes through the volume pod's mountinfo and
//! surfaces them inside the VM pod, as a block node or a bind-mounted image
//! file under its `/hotplug-volumes` empty-dir. Every mount is recorded in a
//! per-VM record file before it is performed, so cleanup can run without the
//! VM object.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use nix::mount::{mount, umount, MsFlags};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Record directory; one JSON file per VM UID.
pub const MOUNT_RECORD_DIR: &str = "/var/run/virtink/hotplug-volume-mount-record";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MountRecordEntry {
    pub volume: String,
    pub target: String,
}

pub fn record_path(record_dir: &Path, vm_uid: &str) -> PathBuf {
    record_dir.join(vm_uid)
}

pub fn read_record(record_dir: &Path, vm_uid: &str) -> Result<Vec<MountRecordEntry>> {
    let path = record_path(record_dir, vm_uid);
    match fs::read(&path) {
        Ok(data) => Ok(serde_json::from_slice(&data).context("decode mount record")?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e).with_context(|| format!("read mount record {}", path.display())),
    }
}

/// Rewrite the record atomically (write temp, rename).
pub fn write_record(record_dir: &Path, vm_uid: &str, entries: &[MountRecordEntry]) -> Result<()> {
    fs::create_dir_all(record_dir).context("create mount record dir")?;
    let path = record_path(record_dir, vm_uid);
    let tmp = record_dir.join(format!(".{}.tmp", vm_uid));
    fs::write(&tmp, serde_json::to_vec(entries)?).context("write mount record")?;
    fs::rename(&tmp, &path).context("commit mount record")?;
    Ok(())
}

/// Remove the record file; a missing file marks the VM as fully cleaned.
pub fn remove_record(record_dir: &Path, vm_uid: &str) -> Result<()> {
    match fs::remove_file(record_path(record_dir, vm_uid)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).context("remove mount record"),
    }
}

/// One line of `/proc/<pid>/mountinfo`.
#[derive(Debug, Clone, PartialEq)]
pub struct MountInfoEntry {
    pub major: u64,
    pub minor: u64,
    pub root: String,
    pub mount_point: String,
    pub fs_type: String,
    pub source: String,
}

/// Parse mountinfo lines. Fields: id, parent, major:minor, root, mount
/// point, options, optional tags, `-`, fstype, source, super options.
pub fn parse_mountinfo(content: &str) -> Vec<MountInfoEntry> {
    let mut entries = Vec::new();
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let _id = fields.next();
        let _parent = fields.next();
        let Some(dev) = fields.next() else { continue };
        let Some((major, minor)) = dev.split_once(':') else {
            continue;
        };
        let (Ok(major), Ok(minor)) = (major.parse(), minor.parse()) else {
            continue;
        };
        let Some(root) = fields.next() else { continue };
        let Some(mount_point) = fields.next() else {
            continue;
        };
        let _options = fields.next();

        let mut rest: Vec<&str> = fields.collect();
        let Some(sep) = rest.iter().position(|f| *f == "-") else {
            continue;
        };
        rest.drain(..=sep);
        let fs_type = rest.first().copied().unwrap_or_default();
        let source = rest.get(1).copied().unwrap_or_default();

        entries.push(MountInfoEntry {
            major,
            minor,
            root: root.to_owned(),
            mount_point: mount_point.to_owned(),
            fs_type: fs_type.to_owned(),
            source: source.to_owned(),
        });
    }
    entries
}

pub fn read_mountinfo(pid: i32) -> Result<Vec<MountInfoEntry>> {
    let content = fs::read_to_string(format!("/proc/{}/mountinfo", pid))
        .with_context(|| format!("read mountinfo of pid {}", pid))?;
    Ok(parse_mountinfo(&content))
}

/// Find the mount of `/mnt/<volume>` inside the volume pod.
pub fn find_volume_mount<'a>(
    entries: &'a [MountInfoEntry],
    volume: &str,
) -> Option<&'a MountInfoEntry> {
    let mount_point = format!("/mnt/{}", volume);
    entries.iter().find(|e| e.mount_point == mount_point)
}

/// Resolve the host path of a volume-pod mount by matching `(major, minor)`,
/// root prefix and the pod UID in the host mount point. Two volumes sharing
/// a device can be ambiguous; the first match wins.
pub fn resolve_host_mount(
    host_entries: &[MountInfoEntry],
    volume_entry: &MountInfoEntry,
    pod_uid: &str,
) -> Option<String> {
    let mut candidates: Vec<&MountInfoEntry> = host_entries
        .iter()
        .filter(|e| {
            e.major == volume_entry.major
                && e.minor == volume_entry.minor
                && volume_entry.root.starts_with(e.root.trim_end_matches('/'))
        })
        .collect();
    candidates.sort_by_key(|e| !e.mount_point.contains(pod_uid));
    candidates.first().map(|host| {
        let suffix = volume_entry
            .root
            .strip_prefix(host.root.trim_end_matches('/'))
            .unwrap_or_default();
        format!("{}{}", host.mount_point.trim_end_matches('/'), suffix)
    })
}

/// Surface a block volume in the VM pod: a bare block node under the pod's
/// hotplug dir, carrying the volume pod device's major/minor.
pub fn mount_block_volume(target: &Path, major: u64, minor: u64) -> Result<()> {
    if target.exists() {
        return Ok(());
    }
    mknod(
        target,
        SFlag::S_IFBLK,
        Mode::from_bits_truncate(0o600),
        makedev(major, minor),
    )
    .with_context(|| format!("mknod {}", target.display()))?;
    info!(target = %target.display(), major, minor, "created hotplug block node");
    Ok(())
}

pub fn unmount_block_volume(target: &Path) -> Result<()> {
    match fs::remove_file(target) {
        Ok(()) => {
            info!(target = %target.display(), "removed hotplug block node");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove block node {}", target.display())),
    }
}

/// Surface a filesystem volume in the VM pod: bind-mount the source's
/// `disk.img` onto `<volume>.img` under the pod's hotplug dir.
pub fn mount_fs_volume(source: &Path, target: &Path) -> Result<()> {
    if !source.exists() {
        bail!("source image {} does not exist", source.display());
    }
    if !target.exists() {
        fs::write(target, b"").with_context(|| format!("create {}", target.display()))?;
    }
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .with_context(|| format!("bind mount {} on {}", source.display(), target.display()))?;
    info!(source = %source.display(), target = %target.display(), "bind mounted hotplug image");
    Ok(())
}

pub fn unmount_fs_volume(target: &Path) -> Result<()> {
    if !target.exists() {
        return Ok(());
    }
    match umount(target) {
        Ok(()) => {}
        Err(nix::errno::Errno::EINVAL) => {} // not mounted
        Err(e) => return Err(e).with_context(|| format!("umount {}", target.display())),
    }
    match fs::remove_file(target) {
        Ok(()) => {
            info!(target = %target.display(), "unmounted hotplug image");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove {}", target.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VOLUME_POD_MOUNTINFO: &str = "\
671 640 0:191 / / rw,relatime master:297 - overlay overlay rw,lowerdir=/lower,upperdir=/upper,workdir=/work
705 671 8:16 / /mnt/data rw,relatime - ext4 /dev/sdb rw
707 671 0:24 /pods/9e1b/volumes/kubernetes.io~empty-dir/hotplug /var/run/hotplug rw - tmpfs tmpfs rw
";

    const HOST_MOUNTINFO: &str = "\
98 1 8:1 / / rw,relatime - ext4 /dev/sda1 rw
640 98 8:16 / /var/lib/kubelet/pods/9e1bc1f2/volumes/kubernetes.io~csi/pvc-data/mount rw,relatime - ext4 /dev/sdb rw
652 98 8:16 / /var/lib/other/mount rw,relatime - ext4 /dev/sdb rw
";

    #[test]
    fn parses_mountinfo_lines() {
        let entries = parse_mountinfo(VOLUME_POD_MOUNTINFO);
        assert_eq!(entries.len(), 3);
        let data = find_volume_mount(&entries, "data").unwrap();
        assert_eq!((data.major, data.minor), (8, 16));
        assert_eq!(data.fs_type, "ext4");
        assert_eq!(data.source, "/dev/sdb");
    }

    #[test]
    fn resolves_host_mount_by_device_and_pod_uid() {
        let volume_entries = parse_mountinfo(VOLUME_POD_MOUNTINFO);
        let host_entries = parse_mountinfo(HOST_MOUNTINFO);
        let entry = find_volume_mount(&volume_entries, "data").unwrap();

        let host = resolve_host_mount(&host_entries, entry, "9e1bc1f2").unwrap();
        assert_eq!(
            host,
            "/var/lib/kubelet/pods/9e1bc1f2/volumes/kubernetes.io~csi/pvc-data/mount"
        );
    }

    #[test]
    fn host_mount_falls_back_to_first_device_match() {
        let volume_entries = parse_mountinfo(VOLUME_POD_MOUNTINFO);
        let host_entries = parse_mountinfo(HOST_MOUNTINFO);
        let entry = find_volume_mount(&volume_entries, "data").unwrap();

        let host = resolve_host_mount(&host_entries, entry, "no-such-uid").unwrap();
        assert_eq!(
            host,
            "/var/lib/kubelet/pods/9e1bc1f2/volumes/kubernetes.io~csi/pvc-data/mount"
        );
    }

    #[test]
    fn record_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let entries = vec![
            MountRecordEntry {
                volume: "data".into(),
                target: "/var/lib/kubelet/pods/uid/volumes/kubernetes.io~empty-dir/hotplug-volumes/data.img".into(),
            },
            MountRecordEntry {
                volume: "scratch".into(),
                target: "/var/lib/kubelet/pods/uid/volumes/kubernetes.io~empty-dir/hotplug-volumes/scratch".into(),
            },
        ];
        write_record(dir.path(), "vm-uid", &entries).unwrap();
        assert_eq!(read_record(dir.path(), "vm-uid").unwrap(), entries);

        write_record(dir.path(), "vm-uid", &entries[..1]).unwrap();
        assert_eq!(read_record(dir.path(), "vm-uid").unwrap(), entries[..1]);

        remove_record(dir.path(), "vm-uid").unwrap();
        assert!(read_record(dir.path(), "vm-uid").unwrap().is_empty());
        assert!(!record_path(dir.path(), "vm-uid").exists());
    }

    #[test]
    fn missing_record_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_record(dir.path(), "absent").unwrap().is_empty());
        remove_record(dir.path(), "absent").unwrap();
    }
}
