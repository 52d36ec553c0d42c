//! Progressive capability reduction across startup.
//!
//! Stages only ever narrow: boot grants a read-only view of the filesystem,
//! read-config keeps file reads, ready drops them to a small allowlist of
//! resolver/runtime files and pins TCP binds/connects to the configured
//! ports. Realized with Landlock on Linux (best-effort, older kernels run
//! unrestricted); other platforms are a no-op.

use crate::config::RoutineConfig;
use crate::error::{AppError, Result};
use crate::proxy::split_target;

/// Named lifecycle points at which capabilities are narrowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Boot,
    /// The re-exec'd daemon child already inherited a restricted view.
    BootDaemon,
    ReadConfig,
    Ready,
}

pub fn lock(stage: Stage) -> Result<()> {
    imp::lock(stage)
}

/// Narrow TCP operations to the ports the configured routines need: binds
/// for the health endpoint, the proxies and the client-tunnel listeners,
/// connects for the tunnel targets served off the host network.
pub fn lock_network(routines: &[RoutineConfig], info_addr: Option<&str>) -> Result<()> {
    let mut bind_ports = Vec::new();
    let mut connect_ports = Vec::new();

    if let Some(addr) = info_addr {
        bind_ports.push(extract_port(addr)?);
    }
    for routine in routines {
        match routine {
            RoutineConfig::Socks5 { bind_address, .. }
            | RoutineConfig::Http { bind_address, .. } => {
                bind_ports.push(extract_port(bind_address)?);
            }
            RoutineConfig::TcpClientTunnel {
                bind_address,
                target,
            } => {
                bind_ports.push(bind_address.port());
                connect_ports.push(extract_port(target)?);
            }
            RoutineConfig::TcpServerTunnel { target, .. } => {
                connect_ports.push(extract_port(target)?);
            }
            RoutineConfig::StdioTunnel { .. } => {}
        }
    }

    imp::lock_network(&bind_ports, &connect_ports)
}

fn extract_port(addr: &str) -> Result<u16> {
    let (_, port) = split_target(addr, 0);
    if port == 0 {
        return Err(AppError::Sandbox(format!(
            "failed to extract port from {addr}"
        )));
    }
    Ok(port)
}

#[cfg(target_os = "linux")]
mod imp {
    use landlock::{
        Access, AccessFs, AccessNet, NetPort, PathBeneath, PathFd, Ruleset, RulesetAttr,
        RulesetCreatedAttr, ABI,
    };

    use super::Stage;
    use crate::error::{AppError, Result};

    const FS_ABI: ABI = ABI::V2;

    /// Read-only files the resolver and runtime still need after `ready`.
    const READABLE_FILES: &[&str] = &[
        "/etc/resolv.conf",
        "/dev/fd",
        "/dev/zero",
        "/dev/urandom",
        "/etc/localtime",
        "/proc/self/stat",
        "/proc/self/status",
        "/usr/share/locale",
        "/proc/self/cmdline",
        "/usr/share/zoneinfo",
        "/proc/sys/kernel/version",
        "/proc/sys/kernel/ngroups_max",
        "/proc/sys/kernel/cap_last_cap",
        "/proc/sys/vm/overcommit_memory",
    ];

    const WRITABLE_FILES: &[&str] = &["/dev/log", "/dev/null", "/dev/full", "/proc/self/fd"];

    pub fn lock(stage: Stage) -> Result<()> {
        match stage {
            Stage::Boot => restrict_fs_read_root(),
            // The daemon child inherited the parent's restricted view.
            Stage::BootDaemon => Ok(()),
            // Nothing to narrow beyond boot here; Landlock cannot widen, so
            // the read-only view from boot stays in force while the config
            // is read.
            Stage::ReadConfig => Ok(()),
            Stage::Ready => restrict_fs_allowlist(),
        }
    }

    fn restrict_fs_read_root() -> Result<()> {
        let root = PathFd::new("/")
            .map_err(|e| AppError::Sandbox(format!("cannot open /: {e}")))?;
        Ruleset::default()
            .handle_access(AccessFs::from_all(FS_ABI))
            .map_err(sandbox_err)?
            .create()
            .map_err(sandbox_err)?
            .add_rule(PathBeneath::new(root, AccessFs::from_read(FS_ABI)))
            .map_err(sandbox_err)?
            .restrict_self()
            .map_err(sandbox_err)?;
        Ok(())
    }

    fn restrict_fs_allowlist() -> Result<()> {
        let mut ruleset = Ruleset::default()
            .handle_access(AccessFs::from_all(FS_ABI))
            .map_err(sandbox_err)?
            .create()
            .map_err(sandbox_err)?;

        for path in READABLE_FILES {
            // Absent paths are simply left out of the allowlist.
            let Ok(fd) = PathFd::new(path) else { continue };
            ruleset = ruleset
                .add_rule(PathBeneath::new(fd, AccessFs::ReadFile))
                .map_err(sandbox_err)?;
        }
        for path in WRITABLE_FILES {
            let Ok(fd) = PathFd::new(path) else { continue };
            ruleset = ruleset
                .add_rule(PathBeneath::new(
                    fd,
                    AccessFs::ReadFile | AccessFs::WriteFile,
                ))
                .map_err(sandbox_err)?;
        }

        ruleset.restrict_self().map_err(sandbox_err)?;
        Ok(())
    }

    pub fn lock_network(bind_ports: &[u16], connect_ports: &[u16]) -> Result<()> {
        let mut ruleset = Ruleset::default()
            .handle_access(AccessNet::BindTcp | AccessNet::ConnectTcp)
            .map_err(sandbox_err)?
            .create()
            .map_err(sandbox_err)?;

        for &port in bind_ports {
            ruleset = ruleset
                .add_rule(NetPort::new(port, AccessNet::BindTcp))
                .map_err(sandbox_err)?;
        }
        for &port in connect_ports {
            ruleset = ruleset
                .add_rule(NetPort::new(port, AccessNet::ConnectTcp))
                .map_err(sandbox_err)?;
        }

        ruleset.restrict_self().map_err(sandbox_err)?;
        Ok(())
    }

    fn sandbox_err<E: std::fmt::Display>(e: E) -> AppError {
        AppError::Sandbox(e.to_string())
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::Stage;
    use crate::error::Result;

    pub fn lock(_stage: Stage) -> Result<()> {
        Ok(())
    }

    pub fn lock_network(_bind_ports: &[u16], _connect_ports: &[u16]) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_port() {
        assert_eq!(extract_port("127.0.0.1:9080").unwrap(), 9080);
        assert_eq!(extract_port("[::1]:9080").unwrap(), 9080);
        assert!(extract_port("127.0.0.1").is_err());
    }

    #[test]
    fn test_lock_network_rejects_portless_bind() {
        let routines = vec![RoutineConfig::Socks5 {
            bind_address: "localhost".into(),
            username: String::new(),
            password: String::new(),
        }];
        assert!(lock_network(&routines, None).is_err());
    }
}
