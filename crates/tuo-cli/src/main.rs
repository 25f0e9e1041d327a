//! `tier-upgrade`: run upgrade simulations and inspect tier configuration.

use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;
use tuo_core::{
    AccountPlan, AuditLog, Collaborators, InMemoryAccounts, MigrationExecutor, OrchestratorConfig,
    SimulatedBilling, UpgradeRequest, UpgradeSession, UpgradeState,
};
use tuo_snapshot::UserId;
use tuo_test_utils::{seed_items, FailureBudget, FaultyDataStore};
use tuo_tiers::{BillingInterval, Tier, TierCapabilitySet};

fn cli() -> Command {
    let config_arg = Arg::new("config")
        .long("config")
        .value_parser(value_parser!(PathBuf))
        .help("Orchestrator configuration file (TOML)");

    Command::new("tier-upgrade")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Tier upgrade orchestrator")
        .subcommand_required(true)
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON"),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run one upgrade end to end against simulated collaborators")
                .arg(
                    Arg::new("scenario")
                        .long("scenario")
                        .default_value("happy")
                        .value_parser(["happy", "decline", "migration-failure", "store-outage"])
                        .help("Failure to inject"),
                )
                .arg(
                    Arg::new("from")
                        .long("from")
                        .default_value("starter")
                        .value_parser(Tier::from_str)
                        .help("Current tier"),
                )
                .arg(
                    Arg::new("to")
                        .long("to")
                        .default_value("professional")
                        .value_parser(Tier::from_str)
                        .help("Target tier"),
                )
                .arg(
                    Arg::new("interval")
                        .long("interval")
                        .default_value("monthly")
                        .value_parser(BillingInterval::from_str)
                        .help("Billing interval for the target tier"),
                )
                .arg(
                    Arg::new("items")
                        .long("items")
                        .default_value("50")
                        .value_parser(value_parser!(usize))
                        .help("Number of user data items to seed"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print the final session as JSON"),
                )
                .arg(config_arg.clone()),
        )
        .subcommand(
            Command::new("tiers")
                .about("Print the tier capability table")
                .arg(
                    Arg::new("table")
                        .long("table")
                        .value_parser(value_parser!(PathBuf))
                        .help("External capability table (YAML, TOML or JSON)"),
                ),
        )
        .subcommand(
            Command::new("diff")
                .about("Show the capability diff between two tiers")
                .arg(
                    Arg::new("from")
                        .long("from")
                        .required(true)
                        .value_parser(Tier::from_str),
                )
                .arg(
                    Arg::new("to")
                        .long("to")
                        .required(true)
                        .value_parser(Tier::from_str),
                )
                .arg(config_arg.clone()),
        )
        .subcommand(
            Command::new("check-config")
                .about("Validate an orchestrator configuration file")
                .arg(config_arg.required(true)),
        )
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

fn load_config(args: &ArgMatches) -> Result<OrchestratorConfig> {
    match args.get_one::<PathBuf>("config") {
        Some(path) => OrchestratorConfig::load(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(OrchestratorConfig::default()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let matches = cli().get_matches();
    init_logging(matches.get_flag("json-logs"));

    let result = match matches.subcommand() {
        Some(("simulate", args)) => simulate(args).await,
        Some(("tiers", args)) => tiers(args),
        Some(("diff", args)) => diff(args),
        Some(("check-config", args)) => check_config(args),
        _ => Ok(false),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}

async fn simulate(args: &ArgMatches) -> Result<bool> {
    let scenario = args
        .get_one::<String>("scenario")
        .map_or("happy", String::as_str);
    let from = *args.get_one::<Tier>("from").context("missing --from")?;
    let to = *args.get_one::<Tier>("to").context("missing --to")?;
    let interval = *args
        .get_one::<BillingInterval>("interval")
        .context("missing --interval")?;
    let items = *args.get_one::<usize>("items").context("missing --items")?;
    let as_json = args.get_flag("json");

    let config = load_config(args)?.with_auto_compensate(true);
    let resolver = config.resolver()?;
    let data = Arc::new(FaultyDataStore::new());
    let billing = Arc::new(SimulatedBilling::with_table(Arc::new(resolver.table().clone())));
    let accounts = Arc::new(InMemoryAccounts::new());
    let audit = Arc::new(AuditLog::new());

    let user = UserId::new("sim-user");
    accounts.insert(user.clone(), AccountPlan::new(from, BillingInterval::Monthly));
    seed_items(data.inner(), &user, items);

    let diff = resolver.diff(from, to)?;
    match scenario {
        "happy" => {}
        "decline" => billing.set_decline(true),
        "migration-failure" => {
            let Some(transform) = diff.data_transforms.first() else {
                bail!("{from} -> {to} has no data transforms to fail");
            };
            let feature = match transform {
                tuo_tiers::DataTransform::ActivateFeature { feature }
                | tuo_tiers::DataTransform::ArchiveFeature { feature } => feature.clone(),
                tuo_tiers::DataTransform::ApplyLimits { .. } => {
                    bail!("{from} -> {to} only changes limits; nothing to fail")
                }
            };
            data.fail_feature(feature, FailureBudget::Always);
        }
        "store-outage" => data.set_unreachable(true),
        other => bail!("unknown scenario {other}"),
    }

    let executor = MigrationExecutor::new(
        config,
        resolver,
        Collaborators {
            data: data.clone(),
            billing: billing.clone(),
            accounts: accounts.clone(),
        },
    );
    executor.add_observer(audit.clone());

    let mut handle = executor
        .start_upgrade(UpgradeRequest::new(user.clone(), to, interval))
        .await?;
    loop {
        match handle.events.recv().await {
            Ok(event) => {
                if !as_json {
                    println!("[{:>3}%] {:<12} {}", event.progress_percent, event.state, event.message);
                }
            }
            Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "progress receiver lagged"),
            Err(RecvError::Closed) => break,
        }
    }
    let session = handle.wait().await?;

    data.set_unreachable(false);
    let status = executor.preservation_monitor().check_now(&user).await;
    let audit_ok = audit.verify_integrity().is_ok();

    if as_json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "session": session,
                "preservation": status,
                "tier_of_record": accounts.plan(&user).tier,
                "audit_entries": audit.len(),
                "audit_valid": audit_ok,
            }))?
        );
    } else {
        print_summary(&session);
        println!("Tier of record:  {}", accounts.plan(&user).tier);
        println!(
            "Data integrity:  {}% ({}/{} items)",
            status.data_integrity, status.preserved_items, status.total_items
        );
        println!("Audit log:       {} entries, {}", audit.len(), if audit_ok { "VALID" } else { "INVALID" });
    }

    Ok(audit_ok && matches!(session.state, UpgradeState::Completed | UpgradeState::RolledBack))
}

fn print_summary(session: &UpgradeSession) {
    println!();
    println!("Session {}", session.session_id);
    println!("  {} -> {} ({})", session.current_tier(), session.target_tier, session.billing_interval);
    println!("  State:    {}", session.state);
    if let Some(error) = &session.error {
        println!("  Failure:  {} at {}: {}", error.kind, error.step, error.message);
    }
    if let Some(rollback) = &session.last_rollback {
        println!(
            "  Rollback: {} ({} restored, {} unrestored)",
            if rollback.success { "complete" } else { "INCOMPLETE" },
            rollback.restored_items,
            rollback.unrestored_items.len()
        );
    }
    println!("  Message:  {}", session.user_message());
    println!();
}

fn tiers(args: &ArgMatches) -> Result<bool> {
    let table = match args.get_one::<PathBuf>("table") {
        Some(path) => Arc::new(TierCapabilitySet::load(path)?),
        None => TierCapabilitySet::builtin(),
    };
    print!("{}", table.to_yaml()?);
    Ok(true)
}

fn diff(args: &ArgMatches) -> Result<bool> {
    let from = *args.get_one::<Tier>("from").context("missing --from")?;
    let to = *args.get_one::<Tier>("to").context("missing --to")?;
    let resolver = load_config(args)?.resolver()?;
    let diff = resolver.diff(from, to)?;
    println!("{}", serde_json::to_string_pretty(&diff)?);
    Ok(true)
}

fn check_config(args: &ArgMatches) -> Result<bool> {
    let config = load_config(args)?;
    let resolver = config.resolver()?;
    println!("configuration OK");
    println!("  max_transform_attempts: {}", config.max_transform_attempts);
    println!("  auto_compensate:        {}", config.auto_compensate);
    println!("  snapshot_retention:     {:?}", config.snapshot_retention);
    println!("  currency:               {}", resolver.table().currency());
    for (tier, definition) in resolver.table().iter() {
        let intervals: Vec<String> = definition.pricing.keys().map(ToString::to_string).collect();
        println!("  {tier:<13} {} features, billed {}", definition.features.len(), intervals.join("/"));
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_simulate_defaults() {
        let matches = cli().try_get_matches_from(["tier-upgrade", "simulate"]).unwrap();
        let (name, args) = matches.subcommand().unwrap();
        assert_eq!(name, "simulate");
        assert_eq!(*args.get_one::<Tier>("to").unwrap(), Tier::Professional);
        assert_eq!(*args.get_one::<usize>("items").unwrap(), 50);
    }

    #[test]
    fn cli_rejects_unknown_tier() {
        assert!(cli()
            .try_get_matches_from(["tier-upgrade", "diff", "--from", "gold", "--to", "free"])
            .is_err());
    }

    #[test]
    fn cli_accepts_annual_alias() {
        let matches = cli()
            .try_get_matches_from(["tier-upgrade", "simulate", "--interval", "annual"])
            .unwrap();
        let (_, args) = matches.subcommand().unwrap();
        assert_eq!(*args.get_one::<BillingInterval>("interval").unwrap(), BillingInterval::Yearly);
    }

    #[test]
    fn cli_debug_assert() {
        cli().debug_assert();
    }

    #[tokio::test]
    async fn simulate_decline_rolls_back() {
        let matches = cli()
            .try_get_matches_from(["tier-upgrade", "simulate", "--scenario", "decline", "--items", "5", "--json"])
            .unwrap();
        let (_, args) = matches.subcommand().unwrap();
        assert!(simulate(args).await.unwrap());
    }
}
