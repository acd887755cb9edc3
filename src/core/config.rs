use anyhow::{bail, Context, Result};
use nix::unistd::{Gid, Uid};

use crate::core::addr::AddrMask;

/// The identity the new user namespace maps to: the invoking user, not the
/// elevated one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub uid: Uid,
    pub gid: Gid,
}

impl Identity {
    /// Resolve the invoking user from ambient process state.
    ///
    /// When the real user is already root the program must have been
    /// elevated, and the original identity is recovered from the
    /// `SUDO_UID`/`SUDO_GID` variables sudo leaves behind. Missing or
    /// non-numeric values are a configuration error.
    pub fn from_environment() -> Result<Self> {
        resolve_identity(
            Uid::current(),
            Gid::current(),
            std::env::var("SUDO_UID").ok().as_deref(),
            std::env::var("SUDO_GID").ok().as_deref(),
        )
    }
}

/// Pure resolution step, separated from `from_environment` so tests never
/// have to manipulate the process environment.
pub(crate) fn resolve_identity(
    uid: Uid,
    gid: Gid,
    sudo_uid: Option<&str>,
    sudo_gid: Option<&str>,
) -> Result<Identity> {
    let uid = if uid.is_root() {
        let raw = sudo_uid
            .context("running as root but SUDO_UID is not set; cannot resolve the invoking user")?;
        let parsed: u32 = raw
            .parse()
            .with_context(|| format!("SUDO_UID '{raw}' is not a numeric user ID"))?;
        Uid::from_raw(parsed)
    } else {
        uid
    };

    let gid = if gid.as_raw() == 0 {
        let raw = sudo_gid
            .context("running as root but SUDO_GID is not set; cannot resolve the invoking group")?;
        let parsed: u32 = raw
            .parse()
            .with_context(|| format!("SUDO_GID '{raw}' is not a numeric group ID"))?;
        Gid::from_raw(parsed)
    } else {
        gid
    };

    Ok(Identity { uid, gid })
}

/// Network wiring for one launch.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Host-side end of the veth pair.
    pub host_link: String,
    /// Peer end, moved into the new network namespace.
    pub ns_link: String,
    /// Address of the host end; also the namespace's gateway.
    pub host_addr: AddrMask,
    /// Address assigned to the peer inside the namespace.
    pub ns_addr: AddrMask,
}

impl NetworkConfig {
    /// Reject interface names the kernel would refuse anyway, before any
    /// namespace exists.
    pub fn validate(&self) -> Result<()> {
        for name in [&self.host_link, &self.ns_link] {
            if name.is_empty() || name.len() >= libc::IFNAMSIZ {
                bail!(
                    "interface name '{name}' must be 1 to {} characters",
                    libc::IFNAMSIZ - 1
                );
            }
            if name.contains(|c: char| c.is_whitespace() || c == '/') {
                bail!("interface name '{name}' contains invalid characters");
            }
        }
        if self.host_link == self.ns_link {
            bail!("host and namespace interface names must differ");
        }
        Ok(())
    }
}

/// Everything the launcher needs for one isolated launch.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Command and arguments executed inside the namespaces.
    pub cmd: Vec<String>,
    /// Hostname set in the new UTS namespace.
    pub hostname: String,
    /// Optional root filesystem to pivot into.
    pub rootfs: Option<String>,
    pub network: NetworkConfig,
    pub identity: Identity,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network(host_link: &str, ns_link: &str) -> NetworkConfig {
        NetworkConfig {
            host_link: host_link.into(),
            ns_link: ns_link.into(),
            host_addr: "10.0.0.1/24".parse().unwrap(),
            ns_addr: "10.0.0.2/24".parse().unwrap(),
        }
    }

    #[test]
    fn unprivileged_identity_is_used_directly() {
        let id = resolve_identity(Uid::from_raw(1000), Gid::from_raw(1000), None, None).unwrap();
        assert_eq!(id.uid.as_raw(), 1000);
        assert_eq!(id.gid.as_raw(), 1000);
    }

    #[test]
    fn root_identity_recovers_sudo_values() {
        let id = resolve_identity(
            Uid::from_raw(0),
            Gid::from_raw(0),
            Some("1000"),
            Some("985"),
        )
        .unwrap();
        assert_eq!(id.uid.as_raw(), 1000);
        assert_eq!(id.gid.as_raw(), 985);
    }

    #[test]
    fn root_without_sudo_uid_is_an_error() {
        let err = resolve_identity(Uid::from_raw(0), Gid::from_raw(0), None, Some("1000"))
            .unwrap_err();
        assert!(err.to_string().contains("SUDO_UID"));
    }

    #[test]
    fn root_without_sudo_gid_is_an_error() {
        let err = resolve_identity(Uid::from_raw(0), Gid::from_raw(0), Some("1000"), None)
            .unwrap_err();
        assert!(err.to_string().contains("SUDO_GID"));
    }

    #[test]
    fn non_numeric_sudo_uid_is_an_error() {
        let err = resolve_identity(
            Uid::from_raw(0),
            Gid::from_raw(0),
            Some("not-a-uid"),
            Some("1000"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("not-a-uid"));
    }

    #[test]
    fn validates_interface_names() {
        assert!(network("veth0", "ceth0").validate().is_ok());
        assert!(network("", "ceth0").validate().is_err());
        assert!(network("veth0", "veth0").validate().is_err());
        assert!(network("averylonginterface", "ceth0").validate().is_err());
        assert!(network("ve th0", "ceth0").validate().is_err());
    }
}
