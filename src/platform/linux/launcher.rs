use std::ffi::CString;
use std::fs::File;
use std::io::Read;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use anyhow::{bail, Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use crate::core::config::LaunchConfig;
use crate::platform::linux::{idmap, mounts, namespaces, netns, privileges};

/// Stack size handed to `clone(2)` for the child.
const CHILD_STACK_SIZE: usize = 1024 * 1024;

/// Outcome of one isolated launch.
pub struct LaunchResult {
    /// Exit code of the launched command (128+signal for signal death).
    pub exit_code: i32,
}

/// One-shot close-to-signal pipe.
///
/// The child blocks reading until end-of-file; the parent's close of the
/// write end is the only release signal, issued exactly once and only after
/// configuration succeeds. Both ends are owned, so every exit path closes
/// them.
struct SyncPipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl SyncPipe {
    fn open() -> Result<Self> {
        let (read, write) = nix::unistd::pipe().context("failed to create the sync pipe")?;
        Ok(Self { read, write })
    }
}

/// Run `config.cmd` in fresh mount, UTS, IPC, PID, network, and user
/// namespaces and return its exit status.
///
/// The parent configures the network bridge and the identity mapping while
/// the child is parked on the sync pipe; only after both succeed is the
/// barrier released. Any configuration failure kills and reaps the child —
/// a half-configured container is never allowed to run.
pub fn launch(config: &LaunchConfig) -> Result<LaunchResult> {
    let rootfs = config
        .rootfs
        .as_deref()
        .map(mounts::validate_rootfs)
        .transpose()?;

    // Exec arguments are built up front; the child borrows them until it
    // replaces its process image.
    let argv = build_argv(&config.cmd)?;

    let sync = SyncPipe::open()?;
    let read_raw = sync.read.as_raw_fd();
    let write_raw = sync.write.as_raw_fd();

    let mut stack = vec![0u8; CHILD_STACK_SIZE];

    // SAFETY: the callback only touches data owned by this frame, which
    // stays alive until the child has been reaped; the stack buffer is
    // used by the child alone.
    let child = unsafe {
        nix::sched::clone(
            Box::new(|| {
                child_entry(
                    read_raw,
                    write_raw,
                    &config.hostname,
                    rootfs.as_deref(),
                    &argv,
                )
            }),
            &mut stack,
            namespaces::isolation_flags(),
            Some(Signal::SIGCHLD as libc::c_int),
        )
    }
    .context("failed to clone the isolated child")?;

    // The child inherited copies of both pipe ends. The parent keeps only
    // the write end, so that closing it is observable as EOF.
    let SyncPipe { read, write } = sync;
    drop(read);
    let release = write;

    if let Err(e) = configure_child(child, config) {
        // Never release a child into a half-configured namespace.
        let _ = kill(child, Signal::SIGKILL);
        let _ = waitpid(child, None);
        return Err(e);
    }

    // Both configuration steps succeeded: open the barrier.
    drop(release);

    if let Err(e) = privileges::drop_if_elevated(&config.identity) {
        let _ = kill(child, Signal::SIGKILL);
        let _ = waitpid(child, None);
        return Err(e);
    }

    let exit_code = wait_for_child(child)?;
    Ok(LaunchResult { exit_code })
}

/// Host-side configuration performed while the child waits on the barrier.
/// Both steps must succeed before the barrier may be released; their order
/// relative to each other is free.
fn configure_child(child: Pid, config: &LaunchConfig) -> Result<()> {
    netns::prepare_network(child, &config.network).context("network namespace setup failed")?;
    idmap::map_identity(child, &config.identity).context("identity mapping failed")?;
    Ok(())
}

/// Entry point of the cloned child. Anything returned becomes the child's
/// exit status; on success `execvp` replaces the image and this never
/// returns.
fn child_entry(
    barrier_read: RawFd,
    barrier_write: RawFd,
    hostname: &str,
    rootfs: Option<&Path>,
    argv: &[CString],
) -> isize {
    if let Err(e) = child_main(barrier_read, barrier_write, hostname, rootfs, argv) {
        eprintln!("isorun: container setup failed: {e:#}");
    }
    1
}

fn child_main(
    barrier_read: RawFd,
    barrier_write: RawFd,
    hostname: &str,
    rootfs: Option<&Path>,
    argv: &[CString],
) -> Result<()> {
    // Close our copy of the write end first; the read below could never
    // see EOF otherwise.
    unsafe { libc::close(barrier_write) };

    wait_for_release(barrier_read)?;

    namespaces::set_hostname(hostname)?;
    mounts::setup_child_mounts(rootfs)?;

    nix::unistd::execvp(&argv[0], argv)
        .with_context(|| format!("failed to exec '{}'", argv[0].to_string_lossy()))?;
    unreachable!("execvp replaced the process image");
}

/// Block until the parent closes its write end. Any payload byte means the
/// control path is corrupt and the launch must not proceed.
fn wait_for_release(read_fd: RawFd) -> Result<()> {
    // SAFETY: read_fd is this process's copy of the pipe read end; the
    // File takes ownership and closes it.
    let mut pipe = unsafe { File::from_raw_fd(read_fd) };
    let mut byte = [0u8; 1];
    let n = pipe
        .read(&mut byte)
        .context("failed to read from the sync pipe")?;
    if n != 0 {
        bail!("unexpected data on the sync pipe before release");
    }
    Ok(())
}

/// Convert the command line into the C-style vector handed to `execvp`.
fn build_argv(cmd: &[String]) -> Result<Vec<CString>> {
    if cmd.is_empty() {
        bail!("no command specified");
    }
    cmd.iter()
        .map(|a| {
            CString::new(a.as_str()).with_context(|| format!("argument '{a}' contains a NUL byte"))
        })
        .collect()
}

/// Wait for a child process and return its exit code.
fn wait_for_child(pid: Pid) -> Result<i32> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(128 + sig as i32),
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => bail!("waitpid failed: {e}"),
        }
    }
}
