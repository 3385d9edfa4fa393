mod server;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use rmcp::{ServiceExt, transport::stdio};
use tierkit_core::{
    Catalog, ComputedEntitlements, EntitlementEngine, FeatureValue, GateError, MissingTierPolicy,
    Requirement, SharedCatalog, Subscription, UNLIMITED,
};
use tierkit_store::{Store, catalog_path, default_base_dir, load_catalog, open_in_dir};

#[derive(Parser)]
#[command(name = "tierkit", about = "Subscription entitlement engine CLI and MCP server")]
struct Cli {
    /// Data directory (default: $TIERKIT_DATA_DIR, then ~/.tierkit)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Catalog file (default: $TIERKIT_CATALOG, then <data-dir>/catalog.toml)
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    /// Fail instead of resolving empty entitlements when a tier is undefined
    #[arg(long, global = true)]
    strict: bool,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start MCP server on stdio transport
    Serve,

    /// Create a subscription for an account
    Provision {
        account: String,
        /// Tier id from the catalog
        #[arg(long)]
        tier: String,
        /// Add-on id from the catalog (repeatable)
        #[arg(long = "addon")]
        addons: Vec<String>,
    },

    /// Show a stored subscription
    Show { account: String },

    /// List all account ids
    List,

    /// Move an account to another tier
    SetTier { account: String, tier: String },

    /// Attach an add-on to an account
    AddAddon { account: String, addon: String },

    /// Detach an add-on from an account
    RemoveAddon { account: String, addon: String },

    /// Set a per-account feature override (true/false, number, or text)
    SetFeature {
        account: String,
        feature: String,
        value: String,
    },

    /// Remove a per-account feature override
    UnsetFeature { account: String, feature: String },

    /// Delete an account's subscription
    Delete { account: String },

    /// Compute effective entitlements for an account
    Compute {
        account: String,
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Check one permission, feature or limit for an account
    Check {
        account: String,
        /// Required permission
        #[arg(long, conflicts_with_all = ["feature", "limit"])]
        permission: Option<String>,
        /// Required feature
        #[arg(long, conflicts_with = "limit")]
        feature: Option<String>,
        /// Expected feature value (default: true)
        #[arg(long, requires = "feature")]
        expect: Option<String>,
        /// Limit key to check against --usage
        #[arg(long, requires = "usage")]
        limit: Option<String>,
        /// Current usage count for --limit
        #[arg(long, requires = "limit")]
        usage: Option<u64>,
    },

    /// Validate the catalog and summarize it
    Catalog,
}

fn base_dir(cli: &Cli) -> PathBuf {
    cli.data_dir
        .clone()
        .or_else(|| std::env::var("TIERKIT_DATA_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(default_base_dir)
}

fn catalog_file(cli: &Cli) -> PathBuf {
    cli.catalog
        .clone()
        .or_else(|| std::env::var("TIERKIT_CATALOG").ok().map(PathBuf::from))
        .unwrap_or_else(|| catalog_path(&base_dir(cli)))
}

fn open_store(cli: &Cli) -> Result<Store> {
    open_in_dir(&base_dir(cli)).context("failed to open subscription store")
}

fn open_catalog(cli: &Cli) -> Result<Catalog> {
    let path = catalog_file(cli);
    load_catalog(&path).with_context(|| format!("failed to load catalog {}", path.display()))
}

fn build_engine(cli: &Cli, catalog: Catalog) -> EntitlementEngine {
    let policy = if cli.strict {
        MissingTierPolicy::Reject
    } else {
        MissingTierPolicy::Empty
    };
    EntitlementEngine::new(SharedCatalog::new(catalog)).with_policy(policy)
}

/// Look up the account and resolve it. `None` means no subscription exists.
pub(crate) fn compute_for_account(
    store: &Store,
    engine: &EntitlementEngine,
    account: &str,
) -> Result<Option<ComputedEntitlements>> {
    let Some(subscription) = store
        .get_subscription(account)
        .with_context(|| format!("failed to load subscription for '{account}'"))?
    else {
        return Ok(None);
    };
    let entitlements = engine
        .compute_entitlements(&subscription)
        .with_context(|| format!("failed to resolve entitlements for '{account}'"))?;
    tracing::debug!(
        "resolved '{account}': {} features, {} limits, {} permissions",
        entitlements.features.len(),
        entitlements.limits.len(),
        entitlements.permissions.len()
    );
    Ok(Some(entitlements))
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Serve => cmd_serve(&cli).await?,
        Commands::Provision {
            account,
            tier,
            addons,
        } => cmd_provision(&cli, account, tier, addons)?,
        Commands::Show { account } => cmd_show(&cli, account)?,
        Commands::List => cmd_list(&cli)?,
        Commands::SetTier { account, tier } => cmd_set_tier(&cli, account, tier)?,
        Commands::AddAddon { account, addon } => cmd_add_addon(&cli, account, addon)?,
        Commands::RemoveAddon { account, addon } => cmd_remove_addon(&cli, account, addon)?,
        Commands::SetFeature {
            account,
            feature,
            value,
        } => cmd_set_feature(&cli, account, feature, value)?,
        Commands::UnsetFeature { account, feature } => cmd_unset_feature(&cli, account, feature)?,
        Commands::Delete { account } => cmd_delete(&cli, account)?,
        Commands::Compute { account, json } => cmd_compute(&cli, account, *json)?,
        Commands::Check {
            account,
            permission,
            feature,
            expect,
            limit,
            usage,
        } => {
            let requirement = match (permission, feature, limit.as_ref().zip(*usage)) {
                (Some(p), None, None) => Requirement::permission(p),
                (None, Some(f), None) => Requirement::Feature {
                    key: f.clone(),
                    expected: expect
                        .as_deref()
                        .map(parse_value)
                        .unwrap_or(FeatureValue::Bool(true)),
                },
                (None, None, Some((l, u))) => Requirement::limit(l, u),
                _ => bail!("check needs exactly one of --permission, --feature, or --limit/--usage"),
            };
            return cmd_check(&cli, account, &requirement);
        }
        Commands::Catalog => cmd_catalog(&cli)?,
    }
    Ok(ExitCode::SUCCESS)
}

fn parse_value(raw: &str) -> FeatureValue {
    match raw.parse::<FeatureValue>() {
        Ok(value) => value,
        Err(never) => match never {},
    }
}

async fn cmd_serve(cli: &Cli) -> Result<()> {
    let store = open_store(cli)?;
    let catalog_path = catalog_file(cli);
    let engine = build_engine(cli, open_catalog(cli)?);
    tracing::info!("starting MCP server with catalog {}", catalog_path.display());

    let server = server::TierkitServer::new(store, engine, Some(catalog_path));
    let service = server
        .serve(stdio())
        .await
        .context("failed to start MCP server")?;
    service.waiting().await?;
    Ok(())
}

fn require_tier(catalog: &Catalog, tier: &str) -> Result<()> {
    if catalog.tier(tier).is_none() {
        let known: Vec<&str> = catalog.tier_ids().collect();
        bail!("unknown tier '{tier}' (catalog defines: {})", known.join(", "));
    }
    Ok(())
}

fn require_addon(catalog: &Catalog, addon: &str) -> Result<()> {
    if catalog.addon(addon).is_none() {
        let known: Vec<&str> = catalog.addon_ids().collect();
        bail!("unknown addon '{addon}' (catalog defines: {})", known.join(", "));
    }
    Ok(())
}

fn cmd_provision(cli: &Cli, account: &str, tier: &str, addons: &[String]) -> Result<()> {
    let catalog = open_catalog(cli)?;
    require_tier(&catalog, tier)?;
    for addon in addons {
        require_addon(&catalog, addon)?;
    }

    let mut subscription = Subscription::new(account, tier);
    for addon in addons {
        subscription = subscription.with_addon(addon);
    }

    let store = open_store(cli)?;
    store
        .create_subscription(&subscription)
        .with_context(|| format!("failed to provision '{account}'"))?;

    println!("provisioned {account} on tier {tier}");
    Ok(())
}

fn join_or_none<'a>(items: impl Iterator<Item = &'a String>) -> String {
    let joined = items.map(String::as_str).collect::<Vec<_>>().join(", ");
    if joined.is_empty() {
        "(none)".to_string()
    } else {
        joined
    }
}

fn cmd_show(cli: &Cli, account: &str) -> Result<()> {
    let store = open_store(cli)?;
    let Some(sub) = store
        .get_subscription(account)
        .context("failed to load subscription")?
    else {
        bail!("no subscription for account '{account}'");
    };

    println!("account:  {}", sub.account_id);
    println!("tier:     {}", sub.tier);
    println!("addons:   {}", join_or_none(sub.addons.iter()));
    println!("created:  {}", sub.created_at);
    println!("updated:  {}", sub.updated_at);
    if sub.custom_features.is_empty() {
        println!("custom:   (none)");
    } else {
        println!("custom:");
        for (key, value) in &sub.custom_features {
            println!("  {key} = {value}");
        }
    }
    Ok(())
}

fn cmd_list(cli: &Cli) -> Result<()> {
    let store = open_store(cli)?;
    for account in store.list_accounts().context("failed to list accounts")? {
        println!("{account}");
    }
    Ok(())
}

fn cmd_set_tier(cli: &Cli, account: &str, tier: &str) -> Result<()> {
    require_tier(&open_catalog(cli)?, tier)?;
    let store = open_store(cli)?;
    store
        .set_tier(account, tier)
        .with_context(|| format!("failed to change tier for '{account}'"))?;
    println!("{account} now on tier {tier}");
    Ok(())
}

fn cmd_add_addon(cli: &Cli, account: &str, addon: &str) -> Result<()> {
    require_addon(&open_catalog(cli)?, addon)?;
    let store = open_store(cli)?;
    let added = store
        .add_addon(account, addon)
        .with_context(|| format!("failed to add addon for '{account}'"))?;
    if added {
        println!("added {addon} to {account}");
    } else {
        println!("{account} already has {addon}");
    }
    Ok(())
}

fn cmd_remove_addon(cli: &Cli, account: &str, addon: &str) -> Result<()> {
    let store = open_store(cli)?;
    let removed = store
        .remove_addon(account, addon)
        .with_context(|| format!("failed to remove addon for '{account}'"))?;
    if removed {
        println!("removed {addon} from {account}");
    } else {
        println!("{account} does not have {addon}");
    }
    Ok(())
}

fn cmd_set_feature(cli: &Cli, account: &str, feature: &str, raw: &str) -> Result<()> {
    let value = parse_value(raw);
    let store = open_store(cli)?;
    store
        .set_custom_feature(account, feature, &value)
        .with_context(|| format!("failed to set feature for '{account}'"))?;
    println!("{account}: {feature} = {value}");
    Ok(())
}

fn cmd_unset_feature(cli: &Cli, account: &str, feature: &str) -> Result<()> {
    let store = open_store(cli)?;
    let removed = store
        .unset_custom_feature(account, feature)
        .with_context(|| format!("failed to unset feature for '{account}'"))?;
    if removed {
        println!("{account}: {feature} override removed");
    } else {
        println!("{account}: no override for {feature}");
    }
    Ok(())
}

fn cmd_delete(cli: &Cli, account: &str) -> Result<()> {
    let store = open_store(cli)?;
    if store.delete_subscription(account).context("failed to delete")? {
        println!("deleted {account}");
    } else {
        println!("no subscription for {account}");
    }
    Ok(())
}

fn format_limit(value: i64) -> String {
    if value == UNLIMITED {
        "unlimited".to_string()
    } else {
        value.to_string()
    }
}

fn cmd_compute(cli: &Cli, account: &str, json: bool) -> Result<()> {
    let engine = build_engine(cli, open_catalog(cli)?);
    let store = open_store(cli)?;
    let Some(ent) = compute_for_account(&store, &engine, account)? else {
        bail!("no subscription for account '{account}'");
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&ent)?);
        return Ok(());
    }

    println!("account:     {}", ent.account_id);
    println!("tier:        {}", ent.tier);
    println!("addons:      {}", join_or_none(ent.addons.iter()));
    println!("features:");
    for (key, value) in &ent.features {
        println!("  {key} = {value}");
    }
    println!("limits:");
    for (key, value) in &ent.limits {
        println!("  {key} = {}", format_limit(*value));
    }
    println!("permissions: {}", join_or_none(ent.permissions.iter()));
    println!("computed:    {}", ent.computed_at);
    Ok(())
}

fn exit_code(err: &GateError) -> u8 {
    match err {
        GateError::Unauthenticated => 2,
        GateError::Forbidden { .. } => 3,
        GateError::QuotaExceeded { .. } => 4,
    }
}

fn cmd_check(cli: &Cli, account: &str, requirement: &Requirement) -> Result<ExitCode> {
    let engine = build_engine(cli, open_catalog(cli)?);
    let store = open_store(cli)?;
    let entitlements = compute_for_account(&store, &engine, account)?;

    match requirement.check(entitlements.as_ref()) {
        Ok(()) => {
            println!("allowed");
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            tracing::info!("denied '{account}': {}", err.kind());
            eprintln!("denied: {err}");
            Ok(ExitCode::from(exit_code(&err)))
        }
    }
}

fn cmd_catalog(cli: &Cli) -> Result<()> {
    let path = catalog_file(cli);
    let catalog = open_catalog(cli)?;

    println!("catalog: {}", path.display());
    println!("tiers:   {}", catalog.tiers().len());
    for (id, tier) in catalog.tiers() {
        match &tier.inherits_from {
            Some(parent) => println!("  {id}  {} (inherits {parent})", tier.name),
            None => println!("  {id}  {}", tier.name),
        }
    }
    println!("addons:  {}", catalog.addons().len());
    for (id, addon) in catalog.addons() {
        println!("  {id}  {}", addon.name);
    }

    report_orphaned_tiers(&base_dir(cli), &catalog)?;
    Ok(())
}

/// Warn about stored subscriptions whose tier the catalog does not define.
fn report_orphaned_tiers(base: &Path, catalog: &Catalog) -> Result<()> {
    if !tierkit_store::database_path(base).exists() {
        return Ok(());
    }
    let store = open_in_dir(base).context("failed to open subscription store")?;
    for (tier, count) in store.tier_counts().context("failed to count tiers")? {
        if catalog.tier(&tier).is_none() {
            tracing::warn!("{count} subscription(s) reference undefined tier '{tier}'");
        }
    }
    Ok(())
}
