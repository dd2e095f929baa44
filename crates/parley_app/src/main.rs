mod app;
mod effects;
mod input;
mod logging;
mod persistence;
mod render;

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::Context;
use parley_core::Secret;
use parley_engine::{ensure_dir, Environment, EnvironmentLoader, ValidationError};
use parley_logging::{parley_error, parley_info};

use crate::persistence::SystemConfigStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_dir = persistence::config_dir();
    let system = Arc::new(
        SystemConfigStore::open(config_dir.clone())
            .with_context(|| format!("loading system config from {}", config_dir.display()))?,
    );

    let data_dir = system.active_data_dir();
    ensure_dir(&data_dir)
        .with_context(|| format!("preparing data directory {}", data_dir.display()))?;
    logging::initialize(&system.snapshot(), &data_dir);
    parley_info!("parley starting; data directory {:?}", data_dir);

    let loader = Arc::new(EnvironmentLoader::new(system.clone(), std::process::id()));
    let environment = open_environment(&loader).inspect_err(|err| {
        parley_error!("Startup failed: {:#}", err);
    })?;

    app::run(system, loader, environment).await
}

/// Opens the active data directory, asking for its passphrase on the terminal
/// when it has one.
fn open_environment(loader: &EnvironmentLoader) -> anyhow::Result<Environment> {
    match loader.open_current(None) {
        Err(ValidationError::PassphraseRequired) => {
            let passphrase = prompt_passphrase()?;
            loader
                .open_current(Some(&passphrase))
                .context("opening data directory")
        }
        other => other.context("opening data directory"),
    }
}

fn prompt_passphrase() -> anyhow::Result<Secret> {
    let mut stderr = io::stderr();
    write!(stderr, "Passphrase: ")?;
    stderr.flush()?;
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("reading passphrase")?;
    Ok(Secret::new(line.trim_end_matches(['\r', '\n'])))
}
