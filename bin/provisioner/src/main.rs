// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use clap::Parser;
use provision::providers;
use provision::State;
use provision_types::{ClusterRequest, DestroyOptions, Options};
use slog::{info, Logger};

mod launch;

/// Threads of the runtime driving providers and services.
const RT_THREADS: usize = 4;

fn parse_log_level(s: &str) -> anyhow::Result<slog::Level> {
    s.parse().map_err(|_| anyhow!("Invalid log level"))
}

fn default_state_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join(".talos")
        .join("clusters")
}

#[derive(Debug, Parser)]
#[clap(about, version)]
/// Creates and manages local and remote test clusters
struct Args {
    /// Logging level
    #[clap(
        long,
        global = true,
        default_value_t = slog::Level::Info,
        value_parser = parse_log_level
    )]
    log_level: slog::Level,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, clap::Args)]
struct ClusterRef {
    /// Name of the cluster
    #[clap(action)]
    name: String,

    /// Directory holding cluster state
    #[clap(long, default_value_os_t = default_state_dir())]
    state_dir: PathBuf,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Create a cluster from a YAML request file.
    Create {
        #[clap(action)]
        request: PathBuf,

        /// Backend to create the cluster with
        #[clap(long, default_value = "qemu")]
        provisioner: String,

        /// YAML file of create options
        #[clap(long)]
        options: Option<PathBuf>,

        /// Directory holding cluster state, when the request has none
        #[clap(long, default_value_os_t = default_state_dir())]
        state_dir: PathBuf,
    },
    /// Tear a cluster down.
    Destroy {
        #[clap(flatten)]
        cluster: ClusterRef,

        /// Write a support archive here before tearing down
        #[clap(long)]
        support_archive: Option<PathBuf>,

        /// Write the cluster's logs here before tearing down
        #[clap(long)]
        logs_archive: Option<PathBuf>,

        /// Keep the state directory when a teardown step fails
        #[clap(long)]
        keep_state_on_err: bool,
    },
    /// Print what is known about a cluster.
    Show {
        #[clap(flatten)]
        cluster: ClusterRef,
    },
    /// Bring a stopped cluster back up.
    Start {
        #[clap(flatten)]
        cluster: ClusterRef,
    },
    /// Print node console logs.
    Crashdump {
        #[clap(flatten)]
        cluster: ClusterRef,
    },

    #[clap(flatten)]
    Internal(launch::Internal),
}

fn build_logger(level: slog::Level) -> slog::Logger {
    use slog::Drain;

    let main_drain = if atty::is(atty::Stream::Stdout) {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    } else {
        let drain = slog_bunyan::with_name("provisioner", std::io::stdout())
            .build()
            .fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    };

    let filtered_main = slog::LevelFilter::new(main_drain, level);
    slog::Logger::root(filtered_main.fuse(), slog::o!())
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_yaml::from_slice(&bytes)
        .with_context(|| format!("failed to parse {}", path.display()))
}

/// Fill in what a request file may leave out.
fn complete_request(
    mut request: ClusterRequest,
    state_dir: &Path,
) -> anyhow::Result<ClusterRequest> {
    if request.state_directory.as_os_str().is_empty() {
        request.state_directory = state_dir.to_path_buf();
    }
    if request.self_executable.as_os_str().is_empty() {
        request.self_executable =
            std::env::current_exe().context("failed to locate own executable")?;
    }
    Ok(request)
}

async fn open(
    log: &Logger,
    cluster: &ClusterRef,
) -> anyhow::Result<(Box<dyn provision::Provisioner>, provision::Cluster)> {
    let state = State::load(&cluster.state_dir, &cluster.name)?;
    let prov = providers::factory(log, &state.provisioner_name).await?;
    let found = prov.reflect(&cluster.name, &cluster.state_dir).await?;
    Ok((prov, found))
}

async fn run(log: Logger, cmd: Command) -> anyhow::Result<()> {
    match cmd {
        Command::Create { request, provisioner, options, state_dir } => {
            let request = complete_request(read_yaml(&request)?, &state_dir)?;
            let opts = match options {
                Some(path) => read_yaml(&path)?,
                None => Options::default(),
            };
            let prov = providers::factory(&log, &provisioner).await?;
            let cluster = prov.create(&request, &opts).await?;
            info!(log, "cluster is up";
                "cluster" => &cluster.info().cluster_name,
                "endpoint" => &cluster.info().kubernetes_endpoint,
                "state" => %cluster.state_path().display());
            Ok(())
        }
        Command::Destroy {
            cluster,
            support_archive,
            logs_archive,
            keep_state_on_err,
        } => {
            let (prov, found) = open(&log, &cluster).await?;
            let opts = DestroyOptions {
                support_archive_path: support_archive,
                cluster_logs_archive_path: logs_archive,
                delete_state_on_err: !keep_state_on_err,
            };
            prov.destroy(&found, &opts).await
        }
        Command::Show { cluster } => {
            let (_, found) = open(&log, &cluster).await?;
            let yaml = serde_yaml::to_string(found.info())?;
            std::io::stdout().write_all(yaml.as_bytes())?;
            Ok(())
        }
        Command::Start { cluster } => {
            let (prov, found) = open(&log, &cluster).await?;
            prov.start(&found).await
        }
        Command::Crashdump { cluster } => {
            let (prov, found) = open(&log, &cluster).await?;
            let mut out = std::io::stdout();
            prov.crash_dump(&found, &mut out).await?;
            out.flush()?;
            Ok(())
        }
        Command::Internal(cmd) => launch::run(log, cmd).await,
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let log = build_logger(args.log_level);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(RT_THREADS)
        .thread_name("tokio-rt-provisioner")
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    let res = runtime.block_on(run(log.clone(), args.cmd));
    if let Err(e) = &res {
        if provision::is_stopped(e) {
            info!(log, "process stopped");
            return Ok(());
        }
        slog::error!(log, "command failed"; "error" => format!("{e:#}"));
    }
    res
}

#[cfg(test)]
mod test {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn destroy_flags() {
        let args = Args::try_parse_from([
            "provisioner",
            "destroy",
            "c1",
            "--state-dir",
            "/tmp/clusters",
            "--keep-state-on-err",
        ])
        .unwrap();
        let Command::Destroy { cluster, keep_state_on_err, support_archive, .. } =
            args.cmd
        else {
            panic!("expected destroy");
        };
        assert_eq!(cluster.name, "c1");
        assert_eq!(cluster.state_dir, PathBuf::from("/tmp/clusters"));
        assert!(keep_state_on_err);
        assert!(support_archive.is_none());
    }

    #[test]
    fn request_defaults_are_filled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.yaml");
        std::fs::write(
            &path,
            r#"
name: c1
network:
  name: c1
  cidrs: [10.5.0.0/24]
  gateway_addrs: [10.5.0.1]
  cni:
    bin_path: [/opt/cni/bin]
    conf_dir: /etc/cni/conf.d
    cache_dir: /var/lib/cni
nodes: []
"#,
        )
        .unwrap();
        let request: ClusterRequest = read_yaml(&path).unwrap();
        let request = complete_request(request, Path::new("/tmp/clusters")).unwrap();
        assert_eq!(request.state_directory, PathBuf::from("/tmp/clusters"));
        assert!(!request.self_executable.as_os_str().is_empty());
    }
}
