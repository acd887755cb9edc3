use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use nix::mount::{mount, umount2, MntFlags, MsFlags};

/// Prepare the child's mount namespace.
///
/// Always detach from the host's mount propagation first. With a rootfs
/// configured, pivot into it and populate `/proc` and a minimal `/dev`
/// inside; without one, just mount a fresh `/proc` so the new PID
/// namespace is what the child sees.
pub fn setup_child_mounts(rootfs: Option<&Path>) -> Result<()> {
    make_mount_private()?;

    match rootfs {
        Some(root) => {
            bind_mount_rootfs(root)?;
            pivot_root(root)?;
            mount_proc()?;
            mount_dev()?;
        }
        None => mount_proc()?,
    }

    Ok(())
}

/// Validate a rootfs path and return its canonical form.
pub fn validate_rootfs(rootfs: &str) -> Result<PathBuf> {
    if rootfs.is_empty() {
        bail!("rootfs path must not be empty");
    }

    let path = Path::new(rootfs);
    if !path.exists() {
        bail!("rootfs path '{rootfs}' does not exist");
    }

    let canon = fs::canonicalize(path)
        .with_context(|| format!("cannot canonicalize rootfs path '{rootfs}'"))?;

    if canon == Path::new("/") {
        bail!("refusing to use '/' as rootfs — this would destroy the host");
    }

    // Check it looks like a filesystem root (has bin/ or usr/ or etc/).
    let looks_like_root = canon.join("bin").is_dir()
        || canon.join("usr").is_dir()
        || canon.join("etc").is_dir();

    if !looks_like_root {
        bail!(
            "rootfs '{}' does not look like a filesystem root (no bin/, usr/, or etc/ found)",
            canon.display()
        );
    }

    Ok(canon)
}

/// Make the entire mount tree private so our changes do not leak to the host.
fn make_mount_private() -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .context("failed to make / private recursively")?;
    Ok(())
}

/// Bind-mount the rootfs onto itself so it becomes a mount point
/// (required for `pivot_root`).
fn bind_mount_rootfs(rootfs: &Path) -> Result<()> {
    mount(
        Some(rootfs),
        rootfs,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .with_context(|| format!("failed to bind-mount rootfs {}", rootfs.display()))?;
    Ok(())
}

/// Perform `pivot_root` to make `new_root` the new `/` and put the old root
/// under `new_root/.pivot_old`. Then unmount and remove the old root.
fn pivot_root(new_root: &Path) -> Result<()> {
    let put_old = new_root.join(".pivot_old");
    fs::create_dir_all(&put_old)
        .with_context(|| format!("failed to create {}", put_old.display()))?;

    nix::unistd::pivot_root(new_root, &put_old).with_context(|| {
        format!(
            "pivot_root({}, {}) failed",
            new_root.display(),
            put_old.display()
        )
    })?;

    // After pivot_root, `/.pivot_old` is the old root.
    nix::unistd::chdir("/").context("chdir / after pivot_root")?;

    umount2("/.pivot_old", MntFlags::MNT_DETACH)
        .context("failed to unmount old root at /.pivot_old")?;
    fs::remove_dir("/.pivot_old").context("failed to remove old root directory /.pivot_old")?;
    Ok(())
}

/// Mount a fresh `/proc` for the new PID namespace.
fn mount_proc() -> Result<()> {
    let proc_dir = Path::new("/proc");
    fs::create_dir_all(proc_dir).context("failed to create /proc")?;

    mount(
        Some("proc"),
        proc_dir,
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .context("failed to mount proc at /proc")?;
    Ok(())
}

/// Mount a minimal `/dev` backed by tmpfs.
fn mount_dev() -> Result<()> {
    let dev_dir = Path::new("/dev");
    fs::create_dir_all(dev_dir).context("failed to create /dev")?;

    mount(
        Some("tmpfs"),
        dev_dir,
        Some("tmpfs"),
        MsFlags::MS_NOSUID,
        Some("mode=0755,size=65536k"),
    )
    .context("failed to mount tmpfs on /dev")?;

    create_dev_nodes()?;

    Ok(())
}

/// Create minimal device nodes inside the container's /dev.
fn create_dev_nodes() -> Result<()> {
    use nix::sys::stat;

    let perm = stat::Mode::from_bits_truncate(0o666);
    let devices = [
        ("/dev/null", stat::makedev(1, 3)),
        ("/dev/zero", stat::makedev(1, 5)),
        ("/dev/urandom", stat::makedev(1, 9)),
        ("/dev/tty", stat::makedev(5, 0)),
    ];

    for (path, dev) in &devices {
        // mknod may fail without privileges for device nodes; ignore error.
        let _ = stat::mknod(Path::new(path), stat::SFlag::S_IFCHR, perm, *dev);
    }

    Ok(())
}
