use anyhow::{Context as _, Result, bail};
use clap::{Parser, Subcommand};
use secrecy::SecretString;
use serde_json::json;
use std::fmt::Write as _;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt::writer::BoxMakeWriter};
use vkgate_auth::TokenCipher;
use vkgate_config::{ConfigWatcher, LogConfig, LogFormat};
use vkgate_keyservice::{HttpKeyService, InMemoryKeyService};
use vkgate_provisioner::{KeyProvisioner, ProvisionOutcome, RevokeOutcome};
use vkgate_router::PolicyRouter;
use vkgate_store::SqliteCredentialStore;
use vkgate_types::{
    CredentialStore, KeyService, KeyStatus, KeyType, NewSystemProfile, Resolution, RoutingMode,
};

#[derive(Parser, Debug)]
#[command(name = "vkgate", about = "vkgate: BYOK routing and virtual key provisioning")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
    /// SQLite database path (default: ~/.vkgate/vkgate.db).
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,
    /// Never contact the key admin API; commands that need it fail.
    #[arg(long, global = true)]
    offline: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one reconciliation pass over due virtual keys.
    Reconcile {
        /// Maximum rows to process (default: provisioner.batch_limit).
        #[arg(long)]
        limit: Option<u32>,
        /// List the rows that would be processed without claiming them.
        #[arg(long)]
        dry_run: bool,
    },
    /// Queue every virtual key a caller needs.
    ProvisionCaller {
        #[arg(long)]
        id: String,
        #[arg(long)]
        dry_run: bool,
    },
    /// Revoke a virtual key row and delete its remote key.
    Revoke {
        /// Virtual key row id.
        #[arg(long)]
        id: i64,
        #[arg(long)]
        dry_run: bool,
    },
    /// Rotate a caller's virtual key.
    Rotate {
        #[arg(long)]
        id: String,
        #[arg(long, value_name = "TYPE")]
        key_type: String,
    },
    /// Reconcile periodically until interrupted.
    Run,
    /// Resolve a call for a caller and print the redacted descriptor.
    Resolve {
        #[arg(long)]
        scope: String,
        #[arg(long)]
        caller: String,
        #[arg(long)]
        byok_allowed: bool,
        /// Extra request tag; may be repeated.
        #[arg(long = "tag", value_name = "TAG")]
        tags: Vec<String>,
    },
    /// Manage system profiles.
    Profile {
        #[command(subcommand)]
        command: ProfileCommand,
    },
    /// Manage per-caller routing overrides.
    Override {
        #[command(subcommand)]
        command: OverrideCommand,
    },
    /// Manage caller preferences.
    Preference {
        #[command(subcommand)]
        command: PreferenceCommand,
    },
    /// Show a caller's virtual keys.
    Status {
        #[arg(long)]
        id: String,
    },
    /// Print a fresh base64 master key for encryption at rest.
    Keygen,
}

#[derive(Subcommand, Debug)]
enum ProfileCommand {
    /// Create or replace the system profile for a scope.
    Set {
        #[arg(long)]
        scope: String,
        /// Model alias on the downstream proxy.
        #[arg(long)]
        model: String,
        #[arg(long)]
        disabled: bool,
        /// JSON object of model parameters, e.g. '{"temperature":0.2}'.
        #[arg(long, value_name = "JSON")]
        params: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum OverrideCommand {
    /// Force a routing mode for a caller and scope.
    Set {
        #[arg(long)]
        caller: String,
        #[arg(long)]
        scope: String,
        /// force_system, force_byok or auto.
        #[arg(long, conflicts_with = "clear", required_unless_present = "clear")]
        mode: Option<String>,
        /// Remove the override.
        #[arg(long)]
        clear: bool,
    },
}

#[derive(Subcommand, Debug)]
enum PreferenceCommand {
    /// Set whether a caller prefers their own provider keys.
    Set {
        #[arg(long)]
        caller: String,
        #[arg(long, value_name = "BOOL", action = clap::ArgAction::Set)]
        use_own_keys: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Keygen = cli.command {
        use secrecy::ExposeSecret as _;
        println!("{}", TokenCipher::generate_key().expose_secret());
        return Ok(());
    }

    let watcher = Arc::new(ConfigWatcher::new(cli.config.clone())?);
    let config = watcher.arc().load_full();
    let _log_guard = init_tracing(&config.log)?;

    let store: Arc<dyn CredentialStore> =
        Arc::new(open_store(cli.db.clone().or_else(|| config.database.path.clone())).await?);

    match cli.command {
        Commands::Reconcile { limit, dry_run } => {
            cmd_reconcile(&cli, &watcher, store, limit, dry_run).await
        }
        Commands::ProvisionCaller { ref id, dry_run } => {
            cmd_provision_caller(&cli, &watcher, store, id, dry_run).await
        }
        Commands::Revoke { id, dry_run } => cmd_revoke(&cli, &watcher, store, id, dry_run).await,
        Commands::Rotate { ref key_type, .. } => {
            key_type.parse::<KeyType>()?;
            bail!("rotate is not implemented")
        }
        Commands::Run => cmd_run(&cli, watcher, store).await,
        Commands::Resolve {
            ref scope,
            ref caller,
            byok_allowed,
            ref tags,
        } => cmd_resolve(&watcher, store, scope, caller, byok_allowed, tags).await,
        Commands::Profile {
            command:
                ProfileCommand::Set {
                    ref scope,
                    ref model,
                    disabled,
                    ref params,
                },
        } => cmd_profile_set(store, scope, model, disabled, params.as_deref()).await,
        Commands::Override {
            command:
                OverrideCommand::Set {
                    ref caller,
                    ref scope,
                    ref mode,
                    clear,
                },
        } => {
            let mode = if clear {
                None
            } else {
                mode.as_deref().map(str::parse::<RoutingMode>).transpose()?
            };
            store.set_routing_override(caller, scope, mode).await?;
            match mode {
                Some(mode) => println!("{caller}/{scope}: {mode}"),
                None => println!("{caller}/{scope}: override removed"),
            }
            Ok(())
        }
        Commands::Preference {
            command:
                PreferenceCommand::Set {
                    ref caller,
                    use_own_keys,
                },
        } => {
            store.set_use_own_keys(caller, use_own_keys).await?;
            println!("{caller}: use_own_keys={use_own_keys}");
            Ok(())
        }
        Commands::Status { ref id } => cmd_status(store, id).await,
        Commands::Keygen => Ok(()),
    }
}

async fn cmd_reconcile(
    cli: &Cli,
    watcher: &ConfigWatcher,
    store: Arc<dyn CredentialStore>,
    limit: Option<u32>,
    dry_run: bool,
) -> Result<()> {
    let limit = limit.unwrap_or(watcher.load().provisioner.batch_limit);
    let access = if dry_run { KeyAccess::Local } else { KeyAccess::Remote("reconcile") };
    let provisioner = provisioner(cli, watcher, store, access)?;
    if dry_run {
        let due = provisioner.preview_due(limit).await?;
        for row in &due {
            println!(
                "{}\t{}\t{}\t{}\tretries={}",
                row.id, row.caller_id, row.key_type, row.status, row.retry_count
            );
        }
        println!("{} row(s) due", due.len());
        return Ok(());
    }
    let stats = provisioner.reconcile(limit).await?;
    println!("{stats}");
    Ok(())
}

async fn cmd_provision_caller(
    cli: &Cli,
    watcher: &ConfigWatcher,
    store: Arc<dyn CredentialStore>,
    caller_id: &str,
    dry_run: bool,
) -> Result<()> {
    let provisioner = provisioner(cli, watcher, store, KeyAccess::Local)?;
    let outcomes = if dry_run {
        provisioner.plan_caller(caller_id).await?
    } else {
        provisioner.provision_caller(caller_id).await?
    };
    for (key_type, outcome) in outcomes {
        let label = match (dry_run, outcome) {
            (true, ProvisionOutcome::Created) => "would create",
            (true, ProvisionOutcome::Requeued) => "would requeue",
            (_, outcome) => outcome.as_str(),
        };
        println!("{key_type}: {label}");
    }
    Ok(())
}

async fn cmd_revoke(
    cli: &Cli,
    watcher: &ConfigWatcher,
    store: Arc<dyn CredentialStore>,
    id: i64,
    dry_run: bool,
) -> Result<()> {
    if dry_run {
        let row = store
            .virtual_key_by_id(id)
            .await?
            .with_context(|| format!("virtual key not found: {id}"))?;
        if row.status == KeyStatus::Revoked {
            println!("{id}: already revoked");
        } else {
            let remote = if row.encrypted_token.is_some() {
                "delete remote key"
            } else {
                "no remote key"
            };
            println!("{id}: would revoke {} key of {} ({remote})", row.key_type, row.caller_id);
        }
        return Ok(());
    }
    let provisioner = provisioner(cli, watcher, store, KeyAccess::Remote("revoke"))?;
    match provisioner.revoke(id).await? {
        RevokeOutcome::Revoked { remote } => println!("{id}: revoked (remote: {remote:?})"),
        RevokeOutcome::AlreadyRevoked => println!("{id}: already revoked"),
    }
    Ok(())
}

async fn cmd_run(cli: &Cli, watcher: Arc<ConfigWatcher>, store: Arc<dyn CredentialStore>) -> Result<()> {
    let provisioner = provisioner(cli, &watcher, store, KeyAccess::Remote("run"))?;
    Arc::clone(&watcher).watch();
    eprintln!("vkgate reconciling as worker {}", provisioner.worker_id());
    provisioner
        .run_loop(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await;
    Ok(())
}

async fn cmd_resolve(
    watcher: &ConfigWatcher,
    store: Arc<dyn CredentialStore>,
    scope: &str,
    caller: &str,
    byok_allowed: bool,
    tags: &[String],
) -> Result<()> {
    let router = PolicyRouter::new(store, Arc::new(open_cipher(watcher)?), watcher.arc());
    match router.resolve(scope, caller, byok_allowed, tags).await? {
        Resolution::Resolved(call) => {
            let mut out = json!({
                "route": call.route,
                "key_type": call.key_type,
                "endpoint": call.endpoint,
                "model_alias": call.model_alias,
                "model_params": call.model_params,
                "metadata": call.request_metadata(),
            });
            if let Some(byok) = &call.byok {
                out["byok"] = json!({
                    "provider": byok.provider,
                    "model": byok.model,
                    "base_url": byok.base_url,
                    "api_version": byok.api_version,
                });
            }
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(())
        }
        Resolution::Pending { retry_after } => {
            println!("pending: retry after {}s", retry_after.as_secs());
            Ok(())
        }
        Resolution::Rejected(err) => bail!("rejected: {err}"),
    }
}

async fn cmd_profile_set(
    store: Arc<dyn CredentialStore>,
    scope: &str,
    model: &str,
    disabled: bool,
    params: Option<&str>,
) -> Result<()> {
    let model_params = params
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .context("--params must be a JSON object")?;
    if model_params.as_ref().is_some_and(|v| !v.is_object()) {
        bail!("--params must be a JSON object");
    }
    let profile = store
        .upsert_system_profile(&NewSystemProfile {
            scope: scope.to_string(),
            proxy_model_name: model.to_string(),
            enabled: !disabled,
            model_params,
        })
        .await?;
    println!(
        "{}: {} ({})",
        profile.scope,
        profile.proxy_model_name,
        if profile.enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

async fn cmd_status(store: Arc<dyn CredentialStore>, caller_id: &str) -> Result<()> {
    let keys = store.list_virtual_keys(Some(caller_id)).await?;
    if keys.is_empty() {
        println!("{caller_id}: no virtual keys");
        return Ok(());
    }
    for key in keys {
        let mut line = format!(
            "{}\t{}\t{}\t{}\tretries={}",
            key.id, key.key_type, key.status, key.key_alias, key.retry_count
        );
        if let Some(at) = key.next_retry_at {
            let _ = write!(line, "\tnext_retry_at={at}");
        }
        if let Some(err) = &key.last_error {
            let _ = write!(line, "\terror={err}");
        }
        println!("{line}");
    }
    Ok(())
}

/// Whether a command reaches the key admin API.
#[derive(Debug, Clone, Copy)]
enum KeyAccess {
    /// Only store reads and writes; the key service is never called.
    Local,
    /// Generates or deletes remote keys; named for error messages.
    Remote(&'static str),
}

fn provisioner(
    cli: &Cli,
    watcher: &ConfigWatcher,
    store: Arc<dyn CredentialStore>,
    access: KeyAccess,
) -> Result<KeyProvisioner> {
    let keys = key_service_for(watcher, cli.offline, access)?;
    Ok(KeyProvisioner::new(
        store,
        keys,
        Arc::new(open_cipher(watcher)?),
        watcher.arc(),
    ))
}

/// Local commands get a key service that is never called, so they need no
/// admin key. A fake service on a remote command would mark rows ACTIVE with
/// tokens the proxy never issued, hence `--offline` refuses them.
fn key_service_for(
    watcher: &ConfigWatcher,
    offline: bool,
    access: KeyAccess,
) -> Result<Arc<dyn KeyService>> {
    match access {
        KeyAccess::Local => Ok(Arc::new(InMemoryKeyService::new())),
        KeyAccess::Remote(command) if offline => {
            bail!("{command} needs the key admin API and cannot run with --offline")
        }
        KeyAccess::Remote(_) => http_key_service(watcher),
    }
}

fn http_key_service(watcher: &ConfigWatcher) -> Result<Arc<dyn KeyService>> {
    let config = watcher.load();
    let var = &config.key_service.admin_key_env;
    let admin_key = std::env::var(var)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .with_context(|| format!("admin key variable {var} is not set"))?;
    let service = HttpKeyService::new(
        config.key_service.base_url.clone(),
        SecretString::from(admin_key),
        config.request_timeout(),
    )?;
    Ok(Arc::new(service))
}

fn open_cipher(watcher: &ConfigWatcher) -> Result<TokenCipher> {
    Ok(TokenCipher::from_env(&watcher.load().cipher.master_key_env)?)
}

async fn open_store(db: Option<PathBuf>) -> Result<SqliteCredentialStore> {
    let path = db.unwrap_or_else(default_db_path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let url = format!("sqlite://{}", path.display());
    SqliteCredentialStore::new(&url)
        .await
        .map_err(|e| anyhow::anyhow!("database error: {e}"))
}

fn default_db_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".vkgate").join("vkgate.db")
}

/// Installs the global subscriber. `RUST_LOG` wins over `log.level`.
fn init_tracing(log: &LogConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let (writer, guard) = match &log.file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let file = path
                .file_name()
                .with_context(|| format!("log.file has no file name: {}", path.display()))?;
            let appender = tracing_appender::rolling::never(dir.unwrap_or(Path::new(".")), file);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(writer), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    let installed = match log.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install logger: {e}"))?;
    Ok(guard)
}
