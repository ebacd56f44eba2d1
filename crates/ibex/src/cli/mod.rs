//! CLI command definitions and handlers.
//!
//! The CLI is a thin collaborator: it parses flags into a
//! [`LaunchOptions`] and hands everything to the launcher core. Exit codes
//! flow back unchanged, including `128+signal` for signalled containers.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;

use ibex_common::IbexError;

use crate::bundle::BundleSupervisor;
use crate::bundle::attach::{self, DEFAULT_DETACH_KEYS};
use crate::launcher::{HomeSpec, LaunchOptions, Launcher, NetworkMode};

/// ibex - OCI-mode container launcher for HPC workloads
#[derive(Parser)]
#[command(name = "ibex")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Launcher commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run a container from an extracted bundle
    Run(RunArgs),

    /// Query container state
    State {
        /// Container ID
        container_id: String,
    },

    /// Send a signal to a running container
    Kill {
        /// Container ID
        container_id: String,

        /// Signal to send (default: SIGTERM)
        #[arg(default_value = "SIGTERM")]
        signal: String,
    },

    /// Pause a running container
    Pause {
        /// Container ID
        container_id: String,
    },

    /// Resume a paused container
    Resume {
        /// Container ID
        container_id: String,
    },

    /// Delete a container and release its bundle
    Delete {
        /// Container ID
        container_id: String,
    },

    /// Attach to a running container's console
    Attach {
        /// Container ID
        container_id: String,

        /// Detach key sequence
        #[arg(long, default_value = DEFAULT_DETACH_KEYS)]
        detach_keys: String,
    },

    /// Internal callbacks invoked by the logging helper
    #[command(hide = true)]
    Oci {
        /// The callback to run.
        #[command(subcommand)]
        command: OciCallback,
    },
}

/// Callbacks the logging helper invokes on container exit.
#[derive(Subcommand)]
pub enum OciCallback {
    /// Remove per-container state after exit
    Cleanup {
        /// Container ID
        container_id: String,
    },
}

/// Arguments of the `run` subcommand.
#[derive(Parser)]
pub struct RunArgs {
    /// Path to the bundle directory (extracted rootfs + image config)
    pub bundle: PathBuf,

    /// Arguments for the container process
    #[arg(trailing_var_arg = true)]
    pub args: Vec<String>,

    /// Container name
    #[arg(long)]
    pub name: Option<String>,

    /// Run this program instead of the image entrypoint
    #[arg(long)]
    pub process: Option<String>,

    /// Network isolation mode (only "none" is supported)
    #[arg(long)]
    pub network: Option<String>,

    /// Do not create a PID namespace
    #[arg(long)]
    pub no_pid: bool,

    /// Container hostname (creates a UTS namespace)
    #[arg(long)]
    pub hostname: Option<String>,

    /// Home directory specification, src[:dest]
    #[arg(long)]
    pub home: Option<String>,

    /// Bind path specification, src[:dest[:opts]]
    #[arg(long = "bind", short = 'B')]
    pub binds: Vec<String>,

    /// Docker-style mount specification, key=value[,...]
    #[arg(long = "mount")]
    pub mounts: Vec<String>,

    /// Data-container image mounted whole, image[:dest]
    #[arg(long = "data")]
    pub data: Vec<String>,

    /// Overlay specification, path[:ro]
    #[arg(long = "overlay", short = 'O')]
    pub overlays: Vec<String>,

    /// Scratch directory created as tmpfs inside the container
    #[arg(long = "scratch", short = 'S')]
    pub scratch: Vec<PathBuf>,

    /// Make the root filesystem writable via an ephemeral tmpfs layer
    #[arg(long)]
    pub writable_tmpfs: bool,

    /// Run as root inside the container
    #[arg(long)]
    pub fakeroot: bool,

    /// Drop all capabilities
    #[arg(long)]
    pub no_privs: bool,

    /// Keep the caller's effective capabilities
    #[arg(long)]
    pub keep_privs: bool,

    /// Capabilities to add
    #[arg(long = "add-caps")]
    pub add_caps: Vec<String>,

    /// Capabilities to drop
    #[arg(long = "drop-caps")]
    pub drop_caps: Vec<String>,

    /// Allow setuid binaries in binds and overlays
    #[arg(long)]
    pub allow_suid: bool,

    /// Environment override, KEY=VALUE
    #[arg(long = "env")]
    pub env: Vec<String>,

    /// File of KEY=VALUE lines
    #[arg(long = "env-file")]
    pub env_files: Vec<PathBuf>,

    /// Comma-separated DNS servers for resolv.conf
    #[arg(long)]
    pub dns: Option<String>,

    /// CDI device selector, vendor.domain/class=name
    #[arg(long = "device")]
    pub devices: Vec<String>,

    /// Directories searched for CDI spec files
    #[arg(long = "cdi-dirs", value_delimiter = ',')]
    pub cdi_dirs: Vec<PathBuf>,

    /// File with cgroup resource limits as OCI resources JSON
    #[arg(long)]
    pub apply_cgroups: Option<PathBuf>,

    /// Working directory inside the container
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Umask for the container process (octal)
    #[arg(long)]
    pub umask: Option<String>,

    /// Do not set supplementary groups
    #[arg(long)]
    pub no_setgroups: bool,

    /// Native-emulation mode (system binds and cwd bind)
    #[arg(long)]
    pub no_compat: bool,

    /// Bind NVIDIA devices and libraries
    #[arg(long)]
    pub nvidia: bool,

    /// Bind ROCm devices and libraries
    #[arg(long)]
    pub rocm: bool,

    /// Additional host libraries bound into the container
    #[arg(long = "library")]
    pub libraries: Vec<PathBuf>,
}

impl RunArgs {
    /// Translate CLI flags into launch options.
    pub fn to_options(&self) -> Result<LaunchOptions, IbexError> {
        let network = match self.network.as_deref() {
            None => NetworkMode::Host,
            Some("none") => NetworkMode::None,
            Some(other) => {
                return Err(IbexError::config(format!(
                    "only \"none\" network isolation is supported, got {other:?}"
                )));
            }
        };

        let umask = self
            .umask
            .as_deref()
            .map(|s| {
                u32::from_str_radix(s, 8)
                    .map_err(|_| IbexError::config(format!("invalid octal umask: {s:?}")))
            })
            .transpose()?;

        let cgroup_json = self
            .apply_cgroups
            .as_deref()
            .map(std::fs::read_to_string)
            .transpose()
            .map_err(|e| IbexError::config(format!("cannot read cgroup resource file: {e}")))?;

        Ok(LaunchOptions {
            process: self.process.clone(),
            args: self.args.clone(),
            no_pid_ns: self.no_pid,
            network,
            hostname: self.hostname.clone(),
            home: self.home.as_deref().map(HomeSpec::parse),
            binds: self.binds.clone(),
            mounts: self.mounts.clone(),
            data: self.data.clone(),
            overlays: self.overlays.clone(),
            scratch: self.scratch.clone(),
            writable_tmpfs: self.writable_tmpfs,
            fakeroot: self.fakeroot,
            no_privs: self.no_privs,
            keep_privs: self.keep_privs,
            add_caps: self.add_caps.clone(),
            drop_caps: self.drop_caps.clone(),
            allow_suid: self.allow_suid,
            env: self.env.clone(),
            env_files: self.env_files.clone(),
            dns: self.dns.clone(),
            devices: self.devices.clone(),
            cdi_dirs: self.cdi_dirs.clone(),
            cgroup_json,
            cwd: self.cwd.clone(),
            umask,
            no_setgroups: self.no_setgroups,
            no_compat: self.no_compat,
            nvidia: self.nvidia,
            rocm: self.rocm,
            libraries: self.libraries.clone(),
            mount_policy: Default::default(),
        })
    }
}

impl Cli {
    /// Execute the parsed command, returning the process exit code.
    pub fn execute(self) -> Result<i32> {
        match self.command {
            Commands::Run(args) => {
                let options = args.to_options()?;
                let id = args
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("ibex-{}", uuid::Uuid::new_v4().simple()));
                let code = Launcher::new(options).launch(&args.bundle, &id)?;
                Ok(code)
            }
            Commands::State { container_id } => {
                let state = BundleSupervisor::new(&container_id)?.state()?;
                println!("{}", serde_json::to_string_pretty(&state)?);
                Ok(0)
            }
            Commands::Kill {
                container_id,
                signal,
            } => {
                BundleSupervisor::new(&container_id)?.kill(&signal)?;
                Ok(0)
            }
            Commands::Pause { container_id } => {
                BundleSupervisor::new(&container_id)?.pause()?;
                Ok(0)
            }
            Commands::Resume { container_id } => {
                BundleSupervisor::new(&container_id)?.resume()?;
                Ok(0)
            }
            Commands::Delete { container_id } => {
                BundleSupervisor::new(&container_id)?.delete_detached()?;
                Ok(0)
            }
            Commands::Attach {
                container_id,
                detach_keys,
            } => {
                let supervisor = BundleSupervisor::new(&container_id)?;
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()?;
                runtime.block_on(attach::attach(
                    &supervisor.state_paths().attach_socket(),
                    &detach_keys,
                ))?;
                Ok(0)
            }
            Commands::Oci {
                command: OciCallback::Cleanup { container_id },
            } => {
                BundleSupervisor::cleanup(&container_id)?;
                Ok(0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_run(args: &[&str]) -> RunArgs {
        let argv: Vec<&str> = ["ibex", "run"].iter().chain(args.iter()).copied().collect();
        let cli = Cli::parse_from(argv);
        match cli.command {
            Commands::Run(run) => run,
            _ => unreachable!(),
        }
    }

    #[test]
    fn run_flags_map_to_options() {
        let run = parse_run(&[
            "/tmp/bundle",
            "--bind",
            "/tmp:/mnt:ro",
            "--fakeroot",
            "--network",
            "none",
            "--umask",
            "022",
        ]);
        let options = run.to_options().unwrap();
        assert_eq!(options.binds, vec!["/tmp:/mnt:ro"]);
        assert!(options.fakeroot);
        assert_eq!(options.network, NetworkMode::None);
        assert_eq!(options.umask, Some(0o022));
    }

    #[test]
    fn unsupported_network_mode_is_rejected() {
        let run = parse_run(&["/tmp/bundle", "--network", "bridge"]);
        assert!(run.to_options().is_err());
    }

    #[test]
    fn invalid_umask_is_rejected() {
        let run = parse_run(&["/tmp/bundle", "--umask", "9999"]);
        assert!(run.to_options().is_err());
    }

    #[test]
    fn trailing_args_reach_the_container() {
        let run = parse_run(&["/tmp/bundle", "echo", "hello"]);
        let options = run.to_options().unwrap();
        assert_eq!(options.args, vec!["echo", "hello"]);
    }
}
