use anyhow::{Context, Result};
use nix::sched::CloneFlags;

/// Return the set of namespace flags for an isolated launch.
///
/// Mount, UTS, IPC, PID, network, and user — all requested in one clone.
/// Asking for the user namespace alongside the others makes the kernel
/// create it first, so an unprivileged caller is still granted the rest.
pub fn isolation_flags() -> CloneFlags {
    CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWNET
        | CloneFlags::CLONE_NEWUSER
}

/// Set the hostname inside a UTS namespace.
pub fn set_hostname(name: &str) -> Result<()> {
    nix::unistd::sethostname(name).context("sethostname failed")?;
    Ok(())
}
