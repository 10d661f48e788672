mod config;
#[cfg(feature = "web")]
mod web;

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::json;

use cogito_client::{ContractCaches, HttpTransport, Orchestrator};
use cogito_core::{repair, validate, Action, ContractKind, RequestState};

#[derive(Parser)]
#[command(
    name = "cogito",
    version,
    about = "Structured decisions and reflections from an unreliable language model"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Request a decision for a simulation state
    Decide {
        /// JSON file holding the request state (comments and trailing commas allowed)
        #[arg(short, long)]
        state: PathBuf,

        /// Print a weighted-random action instead of failing
        #[arg(long)]
        fallback: bool,
    },

    /// Request a reflection for a simulation state
    Reflect {
        #[arg(short, long)]
        state: PathBuf,
    },

    /// Talk to the simulated mind in free form
    Converse {
        /// What to say (reads stdin when omitted)
        #[arg(short, long)]
        text: Option<String>,
    },

    /// Repair raw model output into a JSON object
    Repair {
        /// Raw text (reads stdin when omitted)
        #[arg(short, long)]
        text: Option<String>,
    },

    /// Repair and validate raw model output against a contract
    Validate {
        #[arg(short, long)]
        kind: ContractKind,

        /// Raw text (reads stdin when omitted)
        #[arg(short, long)]
        text: Option<String>,
    },

    /// Show current configuration
    Config,

    /// Run the HTTP proxy
    #[cfg(feature = "web")]
    Serve {
        /// Address to bind, overriding the config file
        #[arg(short, long)]
        bind: Option<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::WARN.into()),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config()?;

    match cli.command {
        Commands::Decide { state, fallback } => cmd_decide(&cfg, &state, fallback),
        Commands::Reflect { state } => cmd_reflect(&cfg, &state),
        Commands::Converse { text } => cmd_converse(&cfg, text),
        Commands::Repair { text } => cmd_repair(text),
        Commands::Validate { kind, text } => cmd_validate(kind, text),
        Commands::Config => cmd_config(&cfg),
        #[cfg(feature = "web")]
        Commands::Serve { bind } => cmd_serve(cfg, bind),
    }
}

fn build_orchestrator(cfg: &config::Config) -> Result<Orchestrator<HttpTransport>> {
    let transport = HttpTransport::new(cfg.http_settings()?)?;
    Ok(Orchestrator::new(
        transport,
        ContractCaches::new(cfg.cache_config()),
        cfg.client_config(),
    ))
}

fn read_state(path: &Path) -> Result<RequestState> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_state(&content).with_context(|| format!("parsing {}", path.display()))
}

/// Parse a request state, tolerating comments and trailing commas.
fn parse_state(content: &str) -> Result<RequestState> {
    let mut de = serde_json_lenient::Deserializer::from_str(content);
    de.set_ignore_trailing_commas(true);
    de.set_allow_comments(true);
    let state = RequestState::deserialize(&mut de)?;
    de.end()?;
    Ok(state)
}

fn read_text(text: Option<String>) -> Result<String> {
    match text {
        Some(t) => Ok(t),
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("reading stdin")?;
            Ok(buf)
        }
    }
}

/// Uniform sample in [0, 1) from the OS random source.
fn random_roll() -> Result<f64> {
    let mut buf = [0u8; 8];
    getrandom::getrandom(&mut buf).map_err(|e| anyhow::anyhow!("random source: {e}"))?;
    Ok((u64::from_le_bytes(buf) >> 11) as f64 / (1u64 << 53) as f64)
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Pipeline commands
// ---------------------------------------------------------------------------

fn cmd_decide(cfg: &config::Config, state_path: &Path, fallback: bool) -> Result<()> {
    let state = read_state(state_path)?;
    let orchestrator = build_orchestrator(cfg)?;
    match orchestrator.request_decision(&state) {
        Ok(decision) => print_json(&decision),
        Err(e) if fallback => {
            tracing::warn!(error = %e, "decision failed, using fallback action");
            let action = Action::fallback(random_roll()?);
            print_json(&json!({
                "decision": action,
                "fallback": true,
                "error": e.to_string(),
            }))
        }
        Err(e) => Err(e).context("decision request failed"),
    }
}

fn cmd_reflect(cfg: &config::Config, state_path: &Path) -> Result<()> {
    let state = read_state(state_path)?;
    let orchestrator = build_orchestrator(cfg)?;
    let reflection = orchestrator
        .request_reflection(&state)
        .context("reflection request failed, self-awareness left unchanged")?;
    print_json(&reflection)
}

fn cmd_converse(cfg: &config::Config, text: Option<String>) -> Result<()> {
    let input = read_text(text)?;
    let orchestrator = build_orchestrator(cfg)?;
    print_json(&orchestrator.converse(input.trim()))
}

fn cmd_repair(text: Option<String>) -> Result<()> {
    let raw = read_text(text)?;
    let repaired = repair(&raw)?;
    print_json(&repaired)
}

fn cmd_validate(kind: ContractKind, text: Option<String>) -> Result<()> {
    let raw = read_text(text)?;
    let repaired = repair(&raw)?;
    let report = validate(&repaired, kind);
    let valid = report.is_valid();
    print_json(&json!({
        "valid": valid,
        "kind": kind,
        "violations": report.violations,
        "object": repaired,
    }))?;
    if !valid {
        anyhow::bail!(
            "{kind} is invalid: {}",
            report.invalid_fields().join(", ")
        );
    }
    Ok(())
}

fn cmd_config(cfg: &config::Config) -> Result<()> {
    println!("Config: {}", config::show_config_path());
    println!();
    println!("[model]");
    println!("  id = {}", cfg.model.id);
    println!("  max_tokens = {}", cfg.model.max_tokens);
    println!("  base_url = {}", cfg.model.base_url);
    println!("  api_key_env = {}", cfg.model.api_key_env);
    println!("  anthropic_version = {}", cfg.model.anthropic_version);
    println!();
    println!("[retry]");
    println!("  max_attempts = {}", cfg.retry.max_attempts);
    println!("  base_delay_ms = {}", cfg.retry.base_delay_ms);
    println!("  timeout_ms = {}", cfg.retry.timeout_ms);
    println!();
    println!("[cache]");
    println!("  expiry_secs = {}", cfg.cache.expiry_secs);
    println!("  max_entries = {}", cfg.cache.max_entries);
    println!("  vary_cached_thoughts = {}", cfg.cache.vary_cached_thoughts);
    println!();
    println!("[server]");
    println!("  bind = {}", cfg.server.bind);
    println!("  rate_limit_window_ms = {}", cfg.server.rate_limit_window_ms);
    println!("  rate_limit_max = {}", cfg.server.rate_limit_max);
    println!("  endpoint_limit_max = {}", cfg.server.endpoint_limit_max);
    Ok(())
}

#[cfg(feature = "web")]
fn cmd_serve(cfg: config::Config, bind: Option<String>) -> Result<()> {
    let addr = bind.unwrap_or_else(|| cfg.server.bind.clone());
    let orchestrator = build_orchestrator(&cfg)?;
    let runtime = tokio::runtime::Runtime::new().context("starting async runtime")?;
    runtime.block_on(web::serve(&addr, orchestrator, &cfg.server))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_state_is_lenient() {
        let content = r#"{
            // where the subject is
            "currentLocation": "cell",
            "guardPosition": "hallway",
            "inventory": ["spoon",],
            "selfAwareness": 120,
            "guardAlertness": 30,
            "escapeAttempts": 1,
        }"#;
        let state = parse_state(content).unwrap();
        assert_eq!(state.current_location, "cell");
        assert_eq!(state.inventory, vec!["spoon".to_string()]);
        assert_eq!(state.self_awareness.get(), 100.0);
    }

    #[test]
    fn test_parse_state_rejects_trailing_garbage() {
        assert!(parse_state(r#"{"currentLocation":"cell","guardPosition":"x","selfAwareness":1,"guardAlertness":1} extra"#).is_err());
    }

    #[test]
    fn test_read_state_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(
            &path,
            r#"{"currentLocation":"yard","guardPosition":"tower","selfAwareness":50,"guardAlertness":20}"#,
        )
        .unwrap();
        let state = read_state(&path).unwrap();
        assert_eq!(state.guard_position, "tower");
        assert!(state.memories.is_empty());
    }

    #[test]
    fn test_random_roll_in_range() {
        for _ in 0..100 {
            let roll = random_roll().unwrap();
            assert!((0.0..1.0).contains(&roll));
        }
    }

    #[test]
    fn test_cli_parses_converse() {
        let cli = Cli::try_parse_from(["cogito", "converse", "-t", "who are you?"]).unwrap();
        match cli.command {
            Commands::Converse { text } => assert_eq!(text.as_deref(), Some("who are you?")),
            _ => panic!("expected converse"),
        }
    }

    #[test]
    fn test_cli_parses_validate() {
        let cli = Cli::try_parse_from(["cogito", "validate", "--kind", "reflection", "--text", "{}"])
            .unwrap();
        match cli.command {
            Commands::Validate { kind, text } => {
                assert_eq!(kind, ContractKind::Reflection);
                assert_eq!(text.as_deref(), Some("{}"));
            }
            _ => panic!("expected validate"),
        }
    }
}
