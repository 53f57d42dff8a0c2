use anyhow::{Context, Result};

use roster_sync::config::Config;
use roster_sync::storage::SqliteRosterStore;

pub fn init(config: &Config) -> Result<()> {
    let path = &config.roster.path;
    let store = SqliteRosterStore::create(path)
        .with_context(|| format!("Failed to create roster {}", path.display()))?;

    println!("Roster ready at {}", path.display());
    println!("  rows: {}", store.row_count()?);
    Ok(())
}

pub fn pause(config: &Config) -> Result<()> {
    set_maintenance(config, true)?;
    println!("Maintenance flag set; runs will wait until it is cleared.");
    Ok(())
}

pub fn resume(config: &Config) -> Result<()> {
    set_maintenance(config, false)?;
    println!("Maintenance flag cleared.");
    Ok(())
}

fn set_maintenance(config: &Config, on: bool) -> Result<()> {
    let store = open(config)?;
    store.set_maintenance(on)?;
    tracing::info!(maintenance = on, "Maintenance flag updated");
    Ok(())
}

pub fn status(config: &Config) -> Result<()> {
    let store = open(config)?;
    let flag = store.maintenance_value()?;

    println!("Roster: {}", config.roster.path.display());
    println!("  rows: {}", store.row_count()?);
    println!(
        "  maintenance: {} ({flag:?})",
        if flag.is_set() { "on" } else { "off" }
    );
    match store.last_operation()? {
        Some(at) => println!("  last change: {}", at.to_rfc3339()),
        None => println!("  last change: never"),
    }
    Ok(())
}

fn open(config: &Config) -> Result<SqliteRosterStore> {
    SqliteRosterStore::open(&config.roster.path).with_context(|| {
        format!(
            "Failed to open roster {} (run `roster-sync init` first)",
            config.roster.path.display()
        )
    })
}
