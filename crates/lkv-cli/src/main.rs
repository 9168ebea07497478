mod logging;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use lkv_core::usage::UsageStats;
use lkv_core::{
    Cipher, ConfigLoader, KeyManager, Period, UsageTracker, VaultConfig, format_cost, mask_value,
};
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(
    name = "lkv",
    about = "LLM Key Vault: encrypted storage, validation and usage tracking for LLM API keys",
    version,
    after_help = "Examples:\n  lkv keygen\n  lkv set openai\n  lkv get openai\n  lkv list\n  lkv validate anthropic\n  lkv usage record openai --tokens 1200 --cost 0.018\n  lkv usage stats --month 2026-09"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// User the command acts for (defaults to `default_user` from config)
    #[arg(long, short, global = true, env = "LKV_USER")]
    user: Option<String>,

    /// Config file (default: ./lkv.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging to stderr
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Store an API key (read from a hidden prompt)
    Set {
        /// Provider id (e.g. openai)
        provider: String,

        /// Overwrite an existing key without confirmation
        #[arg(long)]
        force: bool,
    },

    /// Retrieve an API key (masked by default)
    Get {
        /// Provider id
        provider: String,

        /// Show raw value in terminal
        #[arg(long)]
        show: bool,

        /// Output raw value only (for piping). Blocked in non-interactive environments.
        #[arg(long)]
        plain: bool,

        /// Force raw output even in non-interactive environments (use with caution)
        #[arg(long)]
        force_plain: bool,
    },

    /// List stored keys
    #[command(alias = "ls")]
    List,

    /// Remove a stored key
    Rm {
        /// Provider id
        provider: String,

        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },

    /// Check that the stored key is accepted by the provider
    Validate {
        /// Provider id
        provider: String,
    },

    /// Record and report API usage
    #[command(subcommand)]
    Usage(UsageCommands),

    /// Print a fresh random master key (hex)
    Keygen,
}

#[derive(Subcommand)]
enum UsageCommands {
    /// Record one completed provider call
    Record {
        /// Provider id
        provider: String,

        /// Tokens consumed
        #[arg(long, allow_negative_numbers = true)]
        tokens: i64,

        /// Cost in USD
        #[arg(long, allow_negative_numbers = true)]
        cost: f64,
    },

    /// Show aggregated usage (current month by default)
    Stats {
        /// Provider id. Omit to show every provider with usage.
        provider: Option<String>,

        /// Calendar month, YYYY-MM
        #[arg(long, conflicts_with = "days")]
        month: Option<String>,

        /// Rolling window ending now
        #[arg(long)]
        days: Option<u32>,

        /// Aggregate across all users
        #[arg(long)]
        all_users: bool,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Vault(#[from] lkv_core::Error),

    #[error("No API key stored for '{provider}'")]
    KeyNotFound { provider: String },

    #[error("No user specified. Pass --user, set LKV_USER, or set default_user in lkv.toml")]
    NoUser,

    #[error("{0}")]
    Io(String),
}

type CliResult<T = ()> = Result<T, CliError>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        if let CliError::Vault(lkv_core::Error::Crypto(_)) = e {
            eprintln!("\n  Check that the master key matches the one the key was stored with.");
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> CliResult {
    if let Commands::Keygen = cli.command {
        return cmd_keygen(cli.json);
    }

    let config = ConfigLoader::load(cli.config.as_deref())?;
    logging::init(&config.logging, cli.verbose)?;
    let user = resolve_user(cli.user, &config)?;
    let backends = lkv_core::store::open(&config.storage).await?;

    match cli.command {
        Commands::Usage(command) => {
            let tracker = UsageTracker::new(backends.usage);
            match command {
                UsageCommands::Record {
                    provider,
                    tokens,
                    cost,
                } => cmd_usage_record(&tracker, &user, &provider, tokens, cost, cli.json).await,
                UsageCommands::Stats {
                    provider,
                    month,
                    days,
                    all_users,
                } => {
                    let period = select_period(month.as_deref(), days)?;
                    let user = (!all_users).then_some(user.as_str());
                    cmd_usage_stats(&tracker, user, provider.as_deref(), &period, cli.json).await
                }
            }
        }
        command => {
            let key = config.crypto.key_material()?;
            let manager = KeyManager::new(Arc::new(Cipher::new(&key)), backends.credentials)
                .configure(&config.validation);
            match command {
                Commands::Set { provider, force } => cmd_set(&manager, &user, &provider, force).await,
                Commands::Get {
                    provider,
                    show,
                    plain,
                    force_plain,
                } => cmd_get(&manager, &user, &provider, show, plain, force_plain, cli.json).await,
                Commands::List => cmd_list(&manager, &user, cli.json).await,
                Commands::Rm { provider, force } => cmd_rm(&manager, &user, &provider, force).await,
                Commands::Validate { provider } => cmd_validate(&manager, &user, &provider, cli.json).await,
                Commands::Usage(_) | Commands::Keygen => Ok(()),
            }
        }
    }
}

fn resolve_user(flag: Option<String>, config: &VaultConfig) -> CliResult<String> {
    let user = flag
        .or_else(|| config.default_user.clone())
        .ok_or(CliError::NoUser)?;
    lkv_core::keymanager::validate_user_id(&user)?;
    Ok(user)
}

fn select_period(month: Option<&str>, days: Option<u32>) -> CliResult<Period> {
    let period = match (month, days) {
        (Some(month), _) => Period::parse_month(month)?,
        (None, Some(days)) => Period::last_days(days)?,
        (None, None) => Period::current_month()?,
    };
    Ok(period)
}

fn confirm(prompt: &str) -> bool {
    eprint!("{} [y/N] ", prompt);
    io::stderr().flush().ok();
    let mut input = String::new();
    io::stdin().read_line(&mut input).ok();
    input.trim().eq_ignore_ascii_case("y")
}

fn print_json(value: &serde_json::Value) -> CliResult {
    let text = serde_json::to_string_pretty(value).map_err(|e| CliError::Io(e.to_string()))?;
    println!("{}", text);
    Ok(())
}

fn format_time(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M").to_string()
}

// ---------------------------------------------------------------------------
// Key commands
// ---------------------------------------------------------------------------

fn cmd_keygen(json: bool) -> CliResult {
    let key = Cipher::generate_key();
    if json {
        return print_json(&serde_json::json!({ "master_key": &*key }));
    }
    println!("{}", &*key);
    eprintln!("\n  Export it before using the vault:");
    eprintln!("    export LKV_MASTER_KEY=<key>");
    eprintln!("  Losing this key makes every stored API key unrecoverable.");
    Ok(())
}

async fn cmd_set(manager: &KeyManager, user: &str, provider: &str, force: bool) -> CliResult {
    lkv_core::keymanager::validate_provider(provider)?;

    if !force
        && manager.list_user_providers(user).await?.contains(provider)
        && !confirm(&format!("A key for '{}' already exists. Overwrite?", provider))
    {
        eprintln!("Cancelled.");
        return Ok(());
    }

    // Read value from prompt (not CLI args, which end up in shell history)
    eprint!("Enter API key for {}: ", provider);
    io::stderr().flush().ok();
    let value = Zeroizing::new(
        rpassword::read_password().map_err(|e| CliError::Io(format!("Failed to read input: {}", e)))?,
    );

    manager.store_api_key(user, provider, value.trim()).await?;

    eprintln!("Stored {} for {} ({})", provider, user, manager.backend_name());
    Ok(())
}

async fn cmd_get(
    manager: &KeyManager,
    user: &str,
    provider: &str,
    show: bool,
    plain: bool,
    force_plain: bool,
    json: bool,
) -> CliResult {
    let is_tty = io::stdout().is_terminal();

    // TTY guard: raw values only go to an interactive terminal unless forced.
    if (plain || show) && !is_tty && !force_plain {
        eprintln!("Error: --plain and --show are blocked in non-interactive environments.");
        eprintln!("  This prevents scripts and agents from extracting raw API keys via pipe.");
        eprintln!("  Use --force-plain to override (at your own risk).");
        std::process::exit(2);
    }

    if force_plain && !is_tty {
        eprintln!("Warning: outputting raw key value in non-interactive environment.");
    }

    let Some(value) = manager.get_decrypted_api_key(user, provider).await? else {
        suggest_providers(manager, user, provider).await;
        return Err(CliError::KeyNotFound {
            provider: provider.to_string(),
        });
    };

    if plain || force_plain {
        // Raw value only, no newline
        print!("{}", &*value);
        io::stdout().flush().ok();
        return Ok(());
    }

    if json {
        let display_value = if show {
            (*value).clone()
        } else {
            mask_value(&value)
        };
        return print_json(&serde_json::json!({
            "user": user,
            "provider": provider,
            "value": display_value,
        }));
    }

    if show {
        println!("{}", &*value);
    } else {
        println!("  {}  ({})", mask_value(&value), provider);
    }
    Ok(())
}

/// "Did you mean?" hints for a missing provider.
async fn suggest_providers(manager: &KeyManager, user: &str, provider: &str) {
    let Ok(providers) = manager.list_user_providers(user).await else {
        return;
    };
    let stem = &provider[..provider.len().min(3)];
    let suggestions: Vec<&String> = providers
        .iter()
        .filter(|p| p.starts_with(stem) || p.contains(provider) || provider.contains(p.as_str()))
        .collect();
    if !suggestions.is_empty() {
        eprintln!("\n  Did you mean?");
        for s in suggestions {
            eprintln!("    {}", s);
        }
    }
    eprintln!("\n  Run `lkv list` to see all stored keys.");
}

async fn cmd_list(manager: &KeyManager, user: &str, json: bool) -> CliResult {
    let entries = manager.list_keys(user).await?;

    if json {
        let value = serde_json::to_value(&entries).map_err(|e| CliError::Io(e.to_string()))?;
        return print_json(&value);
    }

    if entries.is_empty() {
        eprintln!("No keys stored for {}.\n", user);
        eprintln!("  Get started:");
        eprintln!("    lkv set openai");
        eprintln!("    lkv set anthropic");
        return Ok(());
    }

    println!("  {:<16} {:<18} {:<18} Value", "Provider", "Created", "Updated");
    println!("  {}", "-".repeat(70));
    for entry in &entries {
        println!(
            "  {:<16} {:<18} {:<18} {}",
            entry.provider,
            format_time(entry.created_at),
            format_time(entry.updated_at),
            entry.masked_value
        );
    }
    println!(
        "\n  {} key(s) stored for {} ({})",
        entries.len(),
        user,
        manager.backend_name()
    );
    Ok(())
}

async fn cmd_rm(manager: &KeyManager, user: &str, provider: &str, force: bool) -> CliResult {
    lkv_core::keymanager::validate_provider(provider)?;

    if !force && !confirm(&format!("Remove key '{}' for {}?", provider, user)) {
        eprintln!("Cancelled.");
        return Ok(());
    }

    manager.delete_api_key(user, provider).await?;
    eprintln!("Removed {}", provider);
    Ok(())
}

async fn cmd_validate(manager: &KeyManager, user: &str, provider: &str, json: bool) -> CliResult {
    let valid = manager.validate_api_key(user, provider).await?;

    if json {
        print_json(&serde_json::json!({
            "user": user,
            "provider": provider,
            "valid": valid,
        }))?;
    } else if valid {
        println!("  {}  valid", provider);
    } else {
        println!("  {}  invalid", provider);
    }

    if !valid {
        std::process::exit(1);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Usage commands
// ---------------------------------------------------------------------------

async fn cmd_usage_record(
    tracker: &UsageTracker,
    user: &str,
    provider: &str,
    tokens: i64,
    cost: f64,
    json: bool,
) -> CliResult {
    let record = tracker.record(user, provider, tokens, cost).await?;

    if json {
        let value = serde_json::to_value(&record).map_err(|e| CliError::Io(e.to_string()))?;
        return print_json(&value);
    }
    eprintln!(
        "Recorded {} tokens ({}) for {} at {}",
        record.tokens,
        format_cost(record.cost()),
        provider,
        format_time(record.timestamp)
    );
    Ok(())
}

async fn cmd_usage_stats(
    tracker: &UsageTracker,
    user: Option<&str>,
    provider: Option<&str>,
    period: &Period,
    json: bool,
) -> CliResult {
    let providers: Vec<String> = match provider {
        Some(p) => vec![p.to_string()],
        None => tracker.providers(user, period).await?.into_iter().collect(),
    };

    let mut reports: Vec<UsageStats> = Vec::new();
    for p in &providers {
        reports.push(tracker.stats(user, p, period).await?);
    }

    if json {
        let value = serde_json::to_value(&reports).map_err(|e| CliError::Io(e.to_string()))?;
        return print_json(&value);
    }

    if reports.is_empty() {
        eprintln!("No usage recorded in {}.", period.label);
        return Ok(());
    }

    let scope = user.unwrap_or("all users");
    for report in &reports {
        println!("\n  {} ({}, {})", report.provider, report.period, scope);
        println!("  {}", "-".repeat(50));
        println!("    {:<30} {}", "Requests", report.total_requests);
        println!("    {:<30} {}", "Tokens", report.tokens_used);
        println!("    {:<30} {}", "Estimated cost", format_cost(report.estimated_cost));
    }

    if reports.len() > 1 {
        let micros: u64 = reports.iter().map(|r| r.estimated_cost_micros).sum();
        let grand_total = micros as f64 / 1_000_000.0;
        println!("\n  {:<32} {}", "Grand Total", format_cost(grand_total));
    }

    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_usage_stats() {
        let cli = Cli::try_parse_from(["lkv", "usage", "stats", "openai", "--month", "2026-09", "--all-users"])
            .unwrap();
        match cli.command {
            Commands::Usage(UsageCommands::Stats {
                provider,
                month,
                days,
                all_users,
            }) => {
                assert_eq!(provider.as_deref(), Some("openai"));
                assert_eq!(month.as_deref(), Some("2026-09"));
                assert_eq!(days, None);
                assert!(all_users);
            }
            _ => panic!("expected usage stats"),
        }
    }

    #[test]
    fn test_cli_month_and_days_conflict() {
        assert!(Cli::try_parse_from(["lkv", "usage", "stats", "--month", "2026-09", "--days", "7"]).is_err());
    }

    #[test]
    fn test_cli_negative_tokens_reach_the_tracker() {
        let cli = Cli::try_parse_from(["lkv", "usage", "record", "openai", "--tokens", "-5", "--cost", "0.1"])
            .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Usage(UsageCommands::Record { tokens: -5, .. })
        ));
    }

    #[test]
    fn test_cli_ls_alias() {
        let cli = Cli::try_parse_from(["lkv", "ls", "--user", "alice"]).unwrap();
        assert!(matches!(cli.command, Commands::List));
        assert_eq!(cli.user.as_deref(), Some("alice"));
    }

    #[test]
    fn test_select_period() {
        assert_eq!(select_period(Some("2026-02"), None).unwrap().label, "2026-02");
        assert_eq!(select_period(None, Some(7)).unwrap().label, "last-7d");
        assert!(select_period(Some("2026-13"), None).is_err());
        assert!(select_period(None, Some(0)).is_err());
    }

    #[test]
    fn test_resolve_user_prefers_flag() {
        let config = VaultConfig {
            default_user: Some("bob".to_string()),
            ..VaultConfig::default()
        };
        assert_eq!(resolve_user(Some("alice".to_string()), &config).unwrap(), "alice");
        assert_eq!(resolve_user(None, &config).unwrap(), "bob");
        assert!(matches!(
            resolve_user(None, &VaultConfig::default()),
            Err(CliError::NoUser)
        ));
        assert!(resolve_user(Some("a/b".to_string()), &config).is_err());
    }
}
