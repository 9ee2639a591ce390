use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use txflow::{OrchestratorConfig, TxflowError};

use super::battle::{parse_script, Encounter, PlayerAction};
use super::sim::{LedgerTiming, SimSettings};

const CONFIG_PATH_ENV_VAR: &str = "ARENA_CONFIG";
const SCRIPT_ENV_VAR: &str = "ARENA_SCRIPT";
const DECLINE_SIGNATURE_ENV_VAR: &str = "ARENA_DECLINE_SIGNATURE";
const INDEXER_FAILURE_ENV_VAR: &str = "ARENA_INDEXER_FAILURE_EVERY";

const DEFAULT_SCRIPT: &str = "attack,flee,attack,attack,attack";
const DEFAULT_BEAST_HEALTH: u32 = 30;

pub(crate) struct AppWiring {
    pub(crate) config: OrchestratorConfig,
    pub(crate) sim: SimSettings,
    pub(crate) encounter: Encounter,
    pub(crate) beast_health: u32,
    pub(crate) script: Vec<PlayerAction>,
}

pub(crate) fn build_app() -> Result<AppWiring, TxflowError> {
    init_tracing();
    info!("=== Loot Arena Startup ===");

    let base = match read_env(CONFIG_PATH_ENV_VAR) {
        Some(path) => {
            let path = PathBuf::from(path);
            info!(path = %path.display(), "config_file_loading");
            OrchestratorConfig::load(&path)?
        }
        None => arena_config(),
    };
    let config = base.with_env_overrides();

    Ok(AppWiring {
        config,
        sim: sim_settings_from(read_env),
        encounter: Encounter::demo(),
        beast_health: DEFAULT_BEAST_HEALTH,
        script: script_from(read_env),
    })
}

/// A faster cadence than the library defaults so a session finishes in
/// seconds.
pub(crate) fn arena_config() -> OrchestratorConfig {
    OrchestratorConfig {
        poll_interval: Duration::from_millis(500),
        confirmation_timeout: Duration::from_secs(15),
        ..OrchestratorConfig::default()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .init();
}

fn read_env(var: &'static str) -> Option<String> {
    env::var(var).ok().filter(|value| !value.trim().is_empty())
}

fn script_from(lookup: impl Fn(&'static str) -> Option<String>) -> Vec<PlayerAction> {
    let Some(raw) = lookup(SCRIPT_ENV_VAR) else {
        return default_script();
    };
    match parse_script(&raw) {
        Ok(script) if !script.is_empty() => script,
        Ok(_) => default_script(),
        Err(reason) => {
            warn!(
                env_var = SCRIPT_ENV_VAR,
                value = raw.as_str(),
                reason = reason.as_str(),
                "invalid action script; using default"
            );
            default_script()
        }
    }
}

fn default_script() -> Vec<PlayerAction> {
    parse_script(DEFAULT_SCRIPT).unwrap_or_default()
}

fn sim_settings_from(lookup: impl Fn(&'static str) -> Option<String>) -> SimSettings {
    SimSettings {
        timing: LedgerTiming {
            accept_after: Duration::from_millis(800),
            index_lag: Duration::from_millis(1200),
        },
        decline_signature_at: optional_number(DECLINE_SIGNATURE_ENV_VAR, &lookup, Some(2)),
        indexer_failure_every: optional_number(INDEXER_FAILURE_ENV_VAR, &lookup, None),
    }
}

/// `none` or `0` disables the behavior; an unparsable value keeps `default`.
fn optional_number<T>(
    var: &'static str,
    lookup: &impl Fn(&'static str) -> Option<String>,
    default: Option<T>,
) -> Option<T>
where
    T: std::str::FromStr + PartialEq + Default,
{
    let Some(raw) = lookup(var) else {
        return default;
    };
    if raw.trim().eq_ignore_ascii_case("none") {
        return None;
    }
    match raw.trim().parse::<T>() {
        Ok(value) if value == T::default() => None,
        Ok(value) => Some(value),
        Err(_) => {
            warn!(env_var = var, value = raw.as_str(), "invalid env var value; using default");
            default
        }
    }
}
