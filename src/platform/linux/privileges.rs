use anyhow::{bail, Context, Result};
use nix::unistd::{chdir, seteuid, setgid, setuid, Uid};

use crate::core::config::Identity;

/// Give up root for the rest of the parent's lifetime, once host-side
/// configuration is done. A no-op when the caller was never elevated.
pub fn drop_if_elevated(identity: &Identity) -> Result<()> {
    if !Uid::current().is_root() {
        return Ok(());
    }

    // Group first: after setuid we no longer may change it.
    setgid(identity.gid).context("failed to drop group privileges")?;
    setuid(identity.uid).context("failed to drop user privileges")?;

    // Leave a possibly root-owned working directory behind.
    chdir("/").context("failed to chdir out of the elevated working directory")?;

    // The drop must be irreversible.
    if setuid(Uid::from_raw(0)).is_ok() || seteuid(Uid::from_raw(0)).is_ok() {
        bail!("still able to regain root after dropping privileges");
    }

    Ok(())
}
