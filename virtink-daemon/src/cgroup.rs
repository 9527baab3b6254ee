//! Device cgroup management for the VMM process.
//!
//! The contract is a single `set(rules)` call carrying the complete desired
//! device list; v1/v2 detection is hidden behind it. On v1 the manager
//! rewrites `devices.allow`/`devices.deny`. The v2 device controller has no
//! file interface, so the manager assembles a `BPF_PROG_TYPE_CGROUP_DEVICE`
//! allowlist program and swaps it onto the cgroup via `bpf(2)`.
//!
//! The cgroup of the VMM is found from its PID (learned via SO_PEERCRED on
//! the control socket) and opened through `/proc/1/root/sys/fs/cgroup` so it
//! works from inside the daemon's own mount namespace.

use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Char,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceRule {
    pub device_type: DeviceType,
    /// -1 matches any major.
    pub major: i64,
    /// -1 matches any minor.
    pub minor: i64,
    pub allow: bool,
}

impl DeviceRule {
    pub fn allow_char(major: i64, minor: i64) -> Self {
        Self {
            device_type: DeviceType::Char,
            major,
            minor,
            allow: true,
        }
    }

    pub fn allow_block(major: i64, minor: i64) -> Self {
        Self {
            device_type: DeviceType::Block,
            major,
            minor,
            allow: true,
        }
    }
}

/// Devices every VMM needs: KVM, tun, null, urandom, ptmx and the pty
/// majors.
pub fn baseline_rules() -> Vec<DeviceRule> {
    let mut rules = vec![
        DeviceRule::allow_char(1, 3),    // /dev/null
        DeviceRule::allow_char(1, 9),    // /dev/urandom
        DeviceRule::allow_char(5, 2),    // /dev/ptmx
        DeviceRule::allow_char(10, 200), // /dev/net/tun
        DeviceRule::allow_char(10, 232), // /dev/kvm
    ];
    for major in 136..=151 {
        rules.push(DeviceRule::allow_char(major, -1));
    }
    rules
}

pub trait DeviceCgroup: Send + Sync {
    /// Apply the complete device rule set.
    fn set(&self, rules: &[DeviceRule]) -> Result<()>;
}

/// Resolve the device cgroup of a process.
pub fn manager_for_pid(pid: i32) -> Result<Box<dyn DeviceCgroup>> {
    let content = fs::read_to_string(format!("/proc/{}/cgroup", pid))
        .with_context(|| format!("read cgroup of pid {}", pid))?;
    let entries = parse_proc_cgroup(&content);

    if Path::new("/sys/fs/cgroup/cgroup.controllers").exists() {
        let rel = entries
            .iter()
            .find(|(_, controllers, _)| controllers.is_empty())
            .map(|(_, _, path)| path.clone())
            .context("no unified cgroup entry")?;
        let root = PathBuf::from("/proc/1/root/sys/fs/cgroup");
        let direct = root.join(rel.trim_start_matches('/'));
        let dir = if direct.is_dir() {
            direct
        } else {
            let base = Path::new(&rel)
                .file_name()
                .context("empty cgroup path")?
                .to_owned();
            find_dir_by_name(&root, &base).with_context(|| {
                format!("cgroup directory for {:?} not found under {}", rel, root.display())
            })?
        };
        Ok(Box::new(V2Manager { dir }))
    } else {
        let rel = entries
            .iter()
            .find(|(_, controllers, _)| controllers.iter().any(|c| c == "devices"))
            .map(|(_, _, path)| path.clone())
            .context("no devices cgroup entry")?;
        let dir = PathBuf::from("/proc/1/root/sys/fs/cgroup/devices")
            .join(rel.trim_start_matches('/'));
        Ok(Box::new(V1Manager { dir }))
    }
}

/// Parse `/proc/<pid>/cgroup` into (hierarchy, controllers, path) entries.
fn parse_proc_cgroup(content: &str) -> Vec<(u32, Vec<String>, String)> {
    content
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, ':');
            let id = parts.next()?.parse().ok()?;
            let controllers: Vec<String> = parts
                .next()?
                .split(',')
                .filter(|c| !c.is_empty())
                .map(str::to_owned)
                .collect();
            let path = parts.next()?.to_owned();
            Some((id, controllers, path))
        })
        .collect()
}

fn find_dir_by_name(root: &Path, name: &std::ffi::OsStr) -> Option<PathBuf> {
    let entries = fs::read_dir(root).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if path.file_name() == Some(name) {
            return Some(path);
        }
        if let Some(found) = find_dir_by_name(&path, name) {
            return Some(found);
        }
    }
    None
}

struct V1Manager {
    dir: PathBuf,
}

impl DeviceCgroup for V1Manager {
    fn set(&self, rules: &[DeviceRule]) -> Result<()> {
        // Reset to deny-all, then admit the full allow set.
        write_device_file(&self.dir.join("devices.deny"), "a")?;
        for rule in rules {
            let file = if rule.allow {
                "devices.allow"
            } else {
                "devices.deny"
            };
            write_device_file(&self.dir.join(file), &format_v1_rule(rule))?;
        }
        debug!(dir = %self.dir.display(), rules = rules.len(), "device cgroup v1 updated");
        Ok(())
    }
}

fn format_v1_rule(rule: &DeviceRule) -> String {
    let type_char = match rule.device_type {
        DeviceType::Char => 'c',
        DeviceType::Block => 'b',
    };
    let major = if rule.major < 0 {
        "*".to_owned()
    } else {
        rule.major.to_string()
    };
    let minor = if rule.minor < 0 {
        "*".to_owned()
    } else {
        rule.minor.to_string()
    };
    format!("{} {}:{} rwm", type_char, major, minor)
}

fn write_device_file(path: &Path, value: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(value.as_bytes())
        .with_context(|| format!("write {:?} to {}", value, path.display()))?;
    Ok(())
}

struct V2Manager {
    dir: PathBuf,
}

impl DeviceCgroup for V2Manager {
    fn set(&self, rules: &[DeviceRule]) -> Result<()> {
        let allowed: Vec<DeviceRule> = rules.iter().filter(|r| r.allow).copied().collect();
        let insns = build_device_program(&allowed);
        let prog = bpf_prog_load(&insns)?;

        let cgroup = fs::File::open(&self.dir)
            .with_context(|| format!("open cgroup dir {}", self.dir.display()))?;
        let old_ids = bpf_prog_query(cgroup.as_raw_fd())?;
        bpf_prog_attach(cgroup.as_raw_fd(), prog.as_raw_fd())?;
        for id in old_ids {
            if let Ok(old) = bpf_prog_get_fd_by_id(id) {
                let _ = bpf_prog_detach(cgroup.as_raw_fd(), old.as_raw_fd());
            }
        }
        debug!(dir = %self.dir.display(), rules = allowed.len(), "device cgroup v2 program swapped");
        Ok(())
    }
}

// struct bpf_cgroup_dev_ctx: access_type (type | access << 16), major, minor.
const BPF_DEVCG_DEV_BLOCK: i32 = 1;
const BPF_DEVCG_DEV_CHAR: i32 = 2;
const DEVCG_ACC_ALL: i32 = 0x7; // mknod | read | write

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq)]
struct BpfInsn {
    code: u8,
    regs: u8,
    off: i16,
    imm: i32,
}

fn insn(code: u8, dst: u8, src: u8, off: i16, imm: i32) -> BpfInsn {
    BpfInsn {
        code,
        regs: dst | (src << 4),
        off,
        imm,
    }
}

const LDXW: u8 = 0x61; // BPF_LDX | BPF_MEM | BPF_W
const AND32: u8 = 0x54; // BPF_ALU | BPF_K | BPF_AND
const RSH32: u8 = 0x74; // BPF_ALU | BPF_K | BPF_RSH
const JNE: u8 = 0x55; // BPF_JMP | BPF_JNE | BPF_K
const JSET: u8 = 0x45; // BPF_JMP | BPF_JSET | BPF_K
const MOV64: u8 = 0xb7; // BPF_ALU64 | BPF_K | BPF_MOV
const EXIT: u8 = 0x95; // BPF_JMP | BPF_EXIT

/// Assemble the allowlist program: load type/access/major/minor from the
/// context, compare against every rule, return 1 on the first match and 0
/// otherwise.
fn build_device_program(rules: &[DeviceRule]) -> Vec<BpfInsn> {
    let mut insns = vec![
        insn(LDXW, 2, 1, 0, 0),       // r2 = ctx->access_type
        insn(AND32, 2, 0, 0, 0xFFFF), // r2 = device type
        insn(LDXW, 3, 1, 0, 0),       // r3 = ctx->access_type
        insn(RSH32, 3, 0, 0, 16),     // r3 = requested access
        insn(LDXW, 4, 1, 4, 0),       // r4 = major
        insn(LDXW, 5, 1, 8, 0),       // r5 = minor
    ];

    for rule in rules {
        let device_type = match rule.device_type {
            DeviceType::Char => BPF_DEVCG_DEV_CHAR,
            DeviceType::Block => BPF_DEVCG_DEV_BLOCK,
        };
        let mut checks = vec![(JNE, 2u8, device_type)];
        // All granted rules carry rwm; a narrower grant would add a
        // JSET on the complement of the access mask here.
        if rule.major >= 0 {
            checks.push((JNE, 4, rule.major as i32));
        }
        if rule.minor >= 0 {
            checks.push((JNE, 5, rule.minor as i32));
        }

        let total = checks.len() as i16;
        for (i, (code, reg, imm)) in checks.into_iter().enumerate() {
            // Fail a check: jump past the rest of this rule block.
            let skip = total - i as i16 - 1 + 2;
            insns.push(insn(code, reg, 0, skip, imm));
        }
        insns.push(insn(MOV64, 0, 0, 0, 1));
        insns.push(insn(EXIT, 0, 0, 0, 0));
    }

    insns.push(insn(MOV64, 0, 0, 0, 0));
    insns.push(insn(EXIT, 0, 0, 0, 0));
    insns
}

const BPF_PROG_LOAD: i32 = 5;
const BPF_PROG_ATTACH: i32 = 8;
const BPF_PROG_DETACH: i32 = 9;
const BPF_PROG_GET_FD_BY_ID: i32 = 13;
const BPF_PROG_QUERY: i32 = 16;

const BPF_PROG_TYPE_CGROUP_DEVICE: u32 = 15;
const BPF_CGROUP_DEVICE: u32 = 6;
const BPF_F_ALLOW_MULTI: u32 = 2;

fn bpf(cmd: i32, attr: *const libc::c_void, size: usize) -> std::io::Result<i64> {
    let ret = unsafe { libc::syscall(libc::SYS_bpf, cmd, attr, size) };
    if ret < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

#[repr(C)]
#[derive(Default)]
struct BpfProgLoadAttr {
    prog_type: u32,
    insn_cnt: u32,
    insns: u64,
    license: u64,
    log_level: u32,
    log_size: u32,
    log_buf: u64,
    kern_version: u32,
    prog_flags: u32,
}

fn bpf_prog_load(insns: &[BpfInsn]) -> Result<OwnedFd> {
    let license = b"GPL\0";
    let attr = BpfProgLoadAttr {
        prog_type: BPF_PROG_TYPE_CGROUP_DEVICE,
        insn_cnt: insns.len() as u32,
        insns: insns.as_ptr() as u64,
        license: license.as_ptr() as u64,
        ..Default::default()
    };
    let fd = bpf(
        BPF_PROG_LOAD,
        &attr as *const _ as *const libc::c_void,
        std::mem::size_of::<BpfProgLoadAttr>(),
    )
    .context("load device cgroup program")?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd as i32) })
}

#[repr(C)]
#[derive(Default)]
struct BpfAttachAttr {
    target_fd: u32,
    attach_bpf_fd: u32,
    attach_type: u32,
    attach_flags: u32,
    replace_bpf_fd: u32,
}

fn bpf_prog_attach(cgroup_fd: i32, prog_fd: i32) -> Result<()> {
    let attr = BpfAttachAttr {
        target_fd: cgroup_fd as u32,
        attach_bpf_fd: prog_fd as u32,
        attach_type: BPF_CGROUP_DEVICE,
        attach_flags: BPF_F_ALLOW_MULTI,
        ..Default::default()
    };
    bpf(
        BPF_PROG_ATTACH,
        &attr as *const _ as *const libc::c_void,
        std::mem::size_of::<BpfAttachAttr>(),
    )
    .context("attach device cgroup program")?;
    Ok(())
}

fn bpf_prog_detach(cgroup_fd: i32, prog_fd: i32) -> Result<()> {
    let attr = BpfAttachAttr {
        target_fd: cgroup_fd as u32,
        attach_bpf_fd: prog_fd as u32,
        attach_type: BPF_CGROUP_DEVICE,
        ..Default::default()
    };
    bpf(
        BPF_PROG_DETACH,
        &attr as *const _ as *const libc::c_void,
        std::mem::size_of::<BpfAttachAttr>(),
    )
    .context("detach device cgroup program")?;
    Ok(())
}

#[repr(C)]
#[derive(Default)]
struct BpfQueryAttr {
    target_fd: u32,
    attach_type: u32,
    query_flags: u32,
    attach_flags: u32,
    prog_ids: u64,
    prog_cnt: u32,
}

fn bpf_prog_query(cgroup_fd: i32) -> Result<Vec<u32>> {
    let mut ids = vec![0u32; 64];
    let mut attr = BpfQueryAttr {
        target_fd: cgroup_fd as u32,
        attach_type: BPF_CGROUP_DEVICE,
        prog_ids: ids.as_mut_ptr() as u64,
        prog_cnt: ids.len() as u32,
        ..Default::default()
    };
    match bpf(
        BPF_PROG_QUERY,
        &attr as *const _ as *const libc::c_void,
        std::mem::size_of::<BpfQueryAttr>(),
    ) {
        Ok(_) => {
            ids.truncate(attr.prog_cnt as usize);
            Ok(ids)
        }
        // No programs attached yet.
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(Vec::new()),
        Err(e) => Err(e).context("query device cgroup programs"),
    }
}

#[repr(C)]
#[derive(Default)]
struct BpfGetFdByIdAttr {
    prog_id: u32,
    next_id: u32,
    open_flags: u32,
}

fn bpf_prog_get_fd_by_id(id: u32) -> Result<OwnedFd> {
    let attr = BpfGetFdByIdAttr {
        prog_id: id,
        ..Default::default()
    };
    let fd = bpf(
        BPF_PROG_GET_FD_BY_ID,
        &attr as *const _ as *const libc::c_void,
        std::mem::size_of::<BpfGetFdByIdAttr>(),
    )
    .context("get program fd by id")?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd as i32) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baseline_covers_vmm_devices() {
        let rules = baseline_rules();
        assert!(rules.contains(&DeviceRule::allow_char(10, 232))); // kvm
        assert!(rules.contains(&DeviceRule::allow_char(10, 200))); // tun
        assert!(rules.contains(&DeviceRule::allow_char(136, -1))); // pty
        assert!(rules.contains(&DeviceRule::allow_char(151, -1)));
        assert!(rules.iter().all(|r| r.allow));
    }

    #[test]
    fn v1_rule_formatting() {
        assert_eq!(format_v1_rule(&DeviceRule::allow_char(10, 232)), "c 10:232 rwm");
        assert_eq!(format_v1_rule(&DeviceRule::allow_block(8, 16)), "b 8:16 rwm");
        assert_eq!(format_v1_rule(&DeviceRule::allow_char(136, -1)), "c 136:* rwm");
    }

    #[test]
    fn parses_proc_cgroup_v1_and_v2() {
        let v2 = parse_proc_cgroup("0::/kubepods.slice/kubepods-pod1.slice/cri-abc.scope\n");
        assert_eq!(v2.len(), 1);
        assert!(v2[0].1.is_empty());
        assert_eq!(v2[0].2, "/kubepods.slice/kubepods-pod1.slice/cri-abc.scope");

        let v1 = parse_proc_cgroup("4:devices:/kubepods/pod1/abc\n2:cpu,cpuacct:/kubepods\n");
        let devices = v1
            .iter()
            .find(|(_, c, _)| c.iter().any(|c| c == "devices"))
            .unwrap();
        assert_eq!(devices.2, "/kubepods/pod1/abc");
    }

    #[test]
    fn device_program_shape() {
        let rules = vec![DeviceRule::allow_char(10, 232), DeviceRule::allow_char(136, -1)];
        let insns = build_device_program(&rules);

        // prologue (6) + rule with major+minor (3 checks + 2)
        // + rule with wildcard minor (2 checks + 2) + default (2)
        assert_eq!(insns.len(), 6 + 5 + 4 + 2);
        assert_eq!(insns[0].code, LDXW);
        // default deny tail
        let tail = &insns[insns.len() - 2..];
        assert_eq!(tail[0].code, MOV64);
        assert_eq!(tail[0].imm, 0);
        assert_eq!(tail[1].code, EXIT);
    }

    #[test]
    fn device_program_jumps_land_on_next_rule() {
        let rules = vec![DeviceRule::allow_char(10, 232)];
        let insns = build_device_program(&rules);
        // First check of the rule is at index 6; a failed type check must
        // skip the remaining 2 checks plus mov+exit, landing on the default
        // deny block.
        assert_eq!(insns[6].code, JNE);
        assert_eq!(insns[6].off, 4);
        assert_eq!(insns[7].off, 3);
        assert_eq!(insns[8].off, 2);
    }
}
