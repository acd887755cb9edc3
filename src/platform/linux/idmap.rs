use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;

use anyhow::{Context, Result};
use nix::unistd::Pid;

use crate::core::config::Identity;

/// Write the UID/GID mappings of the user namespace owned by `pid`: root
/// inside maps to the invoking user outside.
///
/// The kernel accepts exactly one write per mapping file for the lifetime
/// of the namespace; a rejected second write comes back as the write error
/// and is never retried.
pub fn map_identity(pid: Pid, identity: &Identity) -> Result<()> {
    let proc_dir = format!("/proc/{pid}");
    let proc_dir = Path::new(&proc_dir);

    // Writing gid_map without privileges requires setgroups to be denied
    // first.
    deny_setgroups(&proc_dir.join("setgroups"))?;

    write_mapping(
        &proc_dir.join("uid_map"),
        &map_line(0, identity.uid.as_raw(), 1),
    )?;
    write_mapping(
        &proc_dir.join("gid_map"),
        &map_line(0, identity.gid.as_raw(), 1),
    )?;

    Ok(())
}

/// One `inside outside count` mapping line.
fn map_line(inside: u32, outside: u32, count: u32) -> String {
    format!("{inside} {outside} {count}\n")
}

fn deny_setgroups(path: &Path) -> Result<()> {
    match fs::OpenOptions::new().write(true).open(path) {
        Ok(mut file) => file
            .write_all(b"deny")
            .with_context(|| format!("failed to write {}", path.display())),
        // Kernels before 3.19 have no setgroups file.
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to open {}", path.display())),
    }
}

/// Open write-only and write the line in a single call. The mapping files
/// must never be created or truncated from here, and a kernel refusal (for
/// example a second write into the same namespace) surfaces directly.
fn write_mapping(path: &Path, line: &str) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    file.write_all(line.as_bytes()).with_context(|| {
        format!(
            "failed to write '{}' to {}",
            line.trim_end(),
            path.display()
        )
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_line_has_three_fields_and_a_newline() {
        assert_eq!(map_line(0, 1000, 1), "0 1000 1\n");
    }

    #[test]
    fn write_mapping_writes_the_line() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("uid_map");
        fs::write(&path, "").unwrap();

        write_mapping(&path, "0 1000 1\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "0 1000 1\n");
    }

    #[test]
    fn write_mapping_does_not_create_missing_files() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("uid_map");

        let err = write_mapping(&path, "0 1000 1\n").unwrap_err();
        assert!(err.to_string().contains("uid_map"));
        assert!(!path.exists());
    }

    #[test]
    fn deny_setgroups_tolerates_a_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        deny_setgroups(&tmp.path().join("setgroups")).unwrap();
    }
}
