//! Stevedore command-line interface for object-storage node provisioning.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use schemars::schema_for;
use serde_json::to_string_pretty;
use std::collections::BTreeMap;
use std::path::PathBuf;
use stevedore_core::{
    config::{default_registry, Layout, SetupContext},
    logging,
    process::{run, run_checked},
    provision::{DirectoryAccounts, DirectoryError, MessageBusAdmin},
    store::open_store,
    workflow::{Orchestrator, Service, WorkflowLevel, WorkflowReport},
    FileKvStore, KeyResolver, StevedoreResult, Value,
};

const DEFAULT_STORE_URL: &str = "yaml:///etc/ostor/setup/setup.yaml";

/// Top-level command-line options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "stevedore",
    version,
    about = "Node provisioning for the ostor object-storage stack."
)]
struct Cli {
    /// Setup store URL (yaml://<path> or properties://<path>).
    #[arg(short, long, default_value = DEFAULT_STORE_URL)]
    store: String,

    #[command(subcommand)]
    command: Commands,
}

/// Subcommands covering the provisioning lifecycle of one node.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Configure the requested services on this node (all when omitted).
    Provision {
        /// Service names in any order; see `stevedore services`.
        services: Vec<String>,

        /// Layout override file (TOML or YAML).
        #[arg(long)]
        layout: Option<PathBuf>,

        /// Shared coordination file used for the cluster lock. Defaults to
        /// `coordination.yaml` next to a file-backed setup store.
        #[arg(long)]
        coordination: Option<PathBuf>,

        /// Message-bus admin tool; defaults to `install/msgbus/bus_admin.sh`
        /// under the install path.
        #[arg(long)]
        bus_admin: Option<PathBuf>,

        /// Directory account tool; defaults to
        /// `install/dirsvc/add_account.sh` under the install path.
        #[arg(long)]
        account_tool: Option<PathBuf>,
    },

    /// List the provisionable services in their fixed execution order.
    Services,

    /// Print the JSON schema of the layout override file.
    LayoutSchema,

    /// Read one key from the setup store.
    Get { key: String },

    /// Write one scalar key into the setup store.
    Set { key: String, value: String },
}

/// Message-bus administration through the packaged admin tool.
///
/// `<tool> list` prints one topic name per line; `<tool> create <name>
/// --partitions <n>` creates, with a non-zero exit on failure.
struct ProcessBus {
    tool: PathBuf,
}

impl MessageBusAdmin for ProcessBus {
    fn topic_exists(&self, _admin_id: &str, name: &str) -> StevedoreResult<bool> {
        let output = run_checked(&[
            self.tool.to_string_lossy().into_owned(),
            "list".to_string(),
        ])?;
        Ok(output.stdout.lines().any(|line| line.trim() == name))
    }

    fn create_topic(
        &self,
        admin_id: &str,
        names: &[String],
        partitions: u32,
    ) -> StevedoreResult<()> {
        for name in names {
            run_checked(&[
                self.tool.to_string_lossy().into_owned(),
                "create".to_string(),
                name.clone(),
                "--partitions".to_string(),
                partitions.to_string(),
                "--admin-id".to_string(),
                admin_id.to_string(),
            ])?;
        }
        Ok(())
    }
}

/// Directory accounts through the packaged account tool. The tool reports
/// failures as text on stderr, so errors are classified by message.
struct ProcessAccounts {
    tool: PathBuf,
}

impl DirectoryAccounts for ProcessAccounts {
    fn create_account(
        &self,
        user: &str,
        password: &str,
        params: &BTreeMap<String, String>,
        endpoint_url: &str,
    ) -> Result<(), DirectoryError> {
        let mut argv = vec![
            self.tool.to_string_lossy().into_owned(),
            "--url".to_string(),
            endpoint_url.to_string(),
            "--bind-user".to_string(),
            user.to_string(),
            "--bind-passwd".to_string(),
            password.to_string(),
        ];
        for (key, value) in params {
            argv.push(format!("--{}", key.replace('_', "-")));
            argv.push(value.clone());
        }
        let output = run(&argv).map_err(|err| DirectoryError::Backend(err.to_string()))?;
        if output.status == 0 {
            return Ok(());
        }
        Err(DirectoryError::classify(&output.stderr))
    }
}

fn main() {
    if let Err(err) = run_cli() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run_cli() -> Result<()> {
    logging::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Provision {
            services,
            layout,
            coordination,
            bus_admin,
            account_tool,
        } => provision(
            &cli.store,
            &services,
            layout.as_deref(),
            coordination,
            bus_admin,
            account_tool,
        ),
        Commands::Services => {
            for service in Service::ORDERED {
                println!("{}", service.name());
            }
            Ok(())
        }
        Commands::LayoutSchema => {
            let schema = schema_for!(Layout);
            println!("{}", to_string_pretty(&schema)?);
            Ok(())
        }
        Commands::Get { key } => {
            let store = open_store(&cli.store)
                .with_context(|| format!("failed to open setup store {}", cli.store))?;
            match store.get(&key) {
                Some(value) => {
                    println!("{value}");
                    Ok(())
                }
                None => anyhow::bail!("key '{key}' is not set in {}", cli.store),
            }
        }
        Commands::Set { key, value } => {
            let mut store = open_store(&cli.store)
                .with_context(|| format!("failed to open setup store {}", cli.store))?;
            store
                .set(&key, Value::Str(value), true)
                .with_context(|| format!("failed to write '{key}'"))?;
            Ok(())
        }
    }
}

fn provision(
    store_url: &str,
    service_names: &[String],
    layout_path: Option<&std::path::Path>,
    coordination: Option<PathBuf>,
    bus_admin: Option<PathBuf>,
    account_tool: Option<PathBuf>,
) -> Result<()> {
    let requested = if service_names.is_empty() {
        Service::ORDERED.to_vec()
    } else {
        service_names
            .iter()
            .map(|name| Service::parse(name).map_err(anyhow::Error::new))
            .collect::<Result<Vec<_>>>()?
    };

    let store = open_store(store_url)
        .with_context(|| format!("failed to open setup store {store_url}"))?;
    let resolver = KeyResolver::with_defaults(store.as_ref(), default_registry());
    let ctx = SetupContext::from_resolver(&resolver)
        .context("setup store is missing required provisioning keys")?;
    let layout = Layout::load_or_default(layout_path).context("failed to load layout override")?;

    info!(
        "provisioning node {} from {} ({} service(s) requested)",
        ctx.node_id,
        store_url,
        requested.len()
    );

    let coordination_path = coordination
        .unwrap_or_else(|| ctx.base_config_dir.join("setup").join("coordination.yaml"));
    info!("coordination store at {}", coordination_path.display());
    let kv = FileKvStore::open(&coordination_path).with_context(|| {
        format!(
            "failed to open coordination store {}",
            coordination_path.display()
        )
    })?;

    let bus = ProcessBus {
        tool: bus_admin.unwrap_or_else(|| ctx.install_dir.join("install/msgbus/bus_admin.sh")),
    };
    let accounts = ProcessAccounts {
        tool: account_tool
            .unwrap_or_else(|| ctx.install_dir.join("install/dirsvc/add_account.sh")),
    };

    let orchestrator = Orchestrator::new(&ctx, &resolver, &layout, &kv, &bus, &accounts);
    let report = orchestrator
        .run(&requested)
        .map_err(anyhow::Error::new)
        .context("provisioning run failed")?;
    print_report(report);
    Ok(())
}

fn print_report(report: WorkflowReport) {
    println!("{}", report.title);
    for event in report.events {
        println!("  [{}] {}", level_tag(event.level), event.message);
    }
}

/// Short tag used when printing workflow severity levels.
fn level_tag(level: WorkflowLevel) -> &'static str {
    match level {
        WorkflowLevel::Info => "INFO",
        WorkflowLevel::Success => "OK",
        WorkflowLevel::Warn => "WARN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::tempdir;

    fn write_script(path: &Path, body: &str) {
        fs::write(path, body).unwrap();
        let mut perms = fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).unwrap();
    }

    #[test]
    fn process_bus_matches_topic_names_exactly() {
        let dir = tempdir().unwrap();
        let tool = dir.path().join("bus_admin.sh");
        write_script(&tool, "#!/bin/sh\nprintf 'alpha\\nbgdelete\\n'\n");

        let bus = ProcessBus { tool };
        assert!(bus.topic_exists("admin", "bgdelete").unwrap());
        assert!(!bus.topic_exists("admin", "bgdel").unwrap());
    }

    #[test]
    fn process_accounts_classifies_already_exists_output() {
        let dir = tempdir().unwrap();
        let tool = dir.path().join("add_account.sh");
        write_script(
            &tool,
            "#!/bin/sh\necho 'Already exists: bgdelete-svc' >&2\nexit 1\n",
        );

        let accounts = ProcessAccounts { tool };
        let err = accounts
            .create_account("admin", "secret", &BTreeMap::new(), "ldap://dir.local")
            .unwrap_err();
        assert!(matches!(err, DirectoryError::AlreadyExists(_)));
    }
}
