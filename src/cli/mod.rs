pub mod commands;

use clap::{Parser, Subcommand};

/// IsoRun — launch a command in isolated Linux namespaces with egress networking.
#[derive(Parser, Debug)]
#[command(name = "isorun", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Launch a command in fresh namespaces wired to the host network.
    Run {
        /// Hostname to set inside the new UTS namespace.
        #[arg(long, default_value = "isorun")]
        hostname: String,

        /// Path to a root filesystem to pivot into (e.g. an extracted Alpine
        /// minirootfs). Without it the host filesystem stays visible, with a
        /// private /proc for the new PID namespace.
        #[arg(long)]
        rootfs: Option<String>,

        /// Name of the host-side end of the veth pair.
        #[arg(long, default_value = "veth0")]
        host_link: String,

        /// Name of the peer end moved into the new network namespace.
        #[arg(long, default_value = "ceth0")]
        ns_link: String,

        /// Address/prefix of the host end; also the namespace's gateway.
        #[arg(long, default_value = "10.0.0.1/24")]
        host_cidr: String,

        /// Address/prefix assigned to the peer inside the namespace.
        #[arg(long, default_value = "10.0.0.2/24")]
        ns_cidr: String,

        /// The command (and arguments) to execute inside the namespaces.
        /// Everything after `--` is treated as the command.
        #[arg(last = true, required = true)]
        cmd: Vec<String>,
    },
}

/// Parse CLI arguments. Called from `main`.
pub fn parse() -> Cli {
    Cli::parse()
}
