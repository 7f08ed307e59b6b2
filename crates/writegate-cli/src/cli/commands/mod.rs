use super::args::Cli;
use anyhow::Context;
use writegate_core::{RuntimeConfig, SecurityRuntime};

mod check;
mod cleanup;
mod dispatch;
mod key;
mod nonce;
mod revoke;
mod selfcheck;

pub use dispatch::dispatch;

/// Load configuration (file → env → `--db`) and build the runtime.
pub(crate) fn open_runtime(cli: &Cli) -> anyhow::Result<SecurityRuntime> {
    let mut config = RuntimeConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(db) = &cli.db {
        config.db_path = db.clone();
    }
    let db_path = config.db_path.display().to_string();
    SecurityRuntime::open(config).with_context(|| format!("opening runtime at {db_path}"))
}
