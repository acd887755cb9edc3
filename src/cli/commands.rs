use anyhow::{Context, Result};

use crate::cli::{Cli, Command};

/// Raw `run` options as parsed from the command line, before address and
/// identity resolution.
pub struct RunOpts {
    pub hostname: String,
    pub rootfs: Option<String>,
    pub host_link: String,
    pub ns_link: String,
    pub host_cidr: String,
    pub ns_cidr: String,
    pub cmd: Vec<String>,
}

/// Dispatch a parsed CLI command to the appropriate handler.
pub fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run {
            hostname,
            rootfs,
            host_link,
            ns_link,
            host_cidr,
            ns_cidr,
            cmd,
        } => cmd_run(RunOpts {
            hostname,
            rootfs,
            host_link,
            ns_link,
            host_cidr,
            ns_cidr,
            cmd,
        }),
    }
}

fn cmd_run(opts: RunOpts) -> Result<()> {
    #[cfg(not(target_os = "linux"))]
    {
        let _ = opts;
        anyhow::bail!("isorun only runs on Linux");
    }

    #[cfg(target_os = "linux")]
    {
        use crate::core::addr::AddrMask;
        use crate::core::config::{Identity, LaunchConfig, NetworkConfig};

        let host_addr: AddrMask = opts
            .host_cidr
            .parse()
            .with_context(|| format!("invalid --host-cidr '{}'", opts.host_cidr))?;
        let ns_addr: AddrMask = opts
            .ns_cidr
            .parse()
            .with_context(|| format!("invalid --ns-cidr '{}'", opts.ns_cidr))?;

        let network = NetworkConfig {
            host_link: opts.host_link,
            ns_link: opts.ns_link,
            host_addr,
            ns_addr,
        };
        network.validate()?;

        // Resolve who really invoked us before anything is cloned, so a
        // missing SUDO identity aborts while there is nothing to clean up.
        let identity = Identity::from_environment()?;

        let config = LaunchConfig {
            cmd: opts.cmd,
            hostname: opts.hostname,
            rootfs: opts.rootfs,
            network,
            identity,
        };

        let result = crate::platform::linux::launcher::launch(&config)
            .context("failed to launch isolated process")?;

        std::process::exit(result.exit_code);
    }
}
