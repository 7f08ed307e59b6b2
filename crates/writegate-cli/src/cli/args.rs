use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use writegate_core::SubjectKind;

#[derive(Parser)]
#[command(
    name = "writegate",
    version,
    about = "Exactly-once write coordination: nonces, revocations and signing keys"
)]
pub struct Cli {
    /// YAML config file (env variables still override it)
    #[arg(long, global = true, env = "WRITEGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database path (overrides config and WRITEGATE_DB_PATH)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Open the store, bootstrap the schema and run the health check
    Selfcheck,
    /// Issue nonces from the configured node and scope
    Nonce(NonceArgs),
    /// Revoke a token or session
    Revoke(RevokeArgs),
    /// Check whether a token or session is revoked (exit 1 if it is)
    Check(CheckArgs),
    /// Purge expired revocations and idempotency records
    Cleanup,
    /// Signing key management
    Key(KeyArgs),
}

#[derive(Args)]
pub struct NonceArgs {
    /// Number of nonces to issue
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
    pub count: u64,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum KindArg {
    Token,
    Session,
}

impl From<KindArg> for SubjectKind {
    fn from(k: KindArg) -> Self {
        match k {
            KindArg::Token => SubjectKind::Token,
            KindArg::Session => SubjectKind::Session,
        }
    }
}

#[derive(Args)]
pub struct RevokeArgs {
    pub kind: KindArg,
    pub id: String,
    /// How long the ban lasts, e.g. "15m", "2h", "7days"
    #[arg(long = "for", value_parser = humantime::parse_duration)]
    pub duration: Duration,
}

#[derive(Args)]
pub struct CheckArgs {
    pub kind: KindArg,
    pub id: String,
}

#[derive(Args)]
pub struct KeyArgs {
    #[command(subcommand)]
    pub cmd: KeySub,
}

#[derive(Subcommand)]
pub enum KeySub {
    /// Print the id of the current signing key
    Current,
    /// Install a key version as current for its signing key
    Install(KeyInstallArgs),
}

#[derive(Args)]
pub struct KeyInstallArgs {
    /// Parent signing key id
    #[arg(long)]
    pub signing_key: String,
    /// Version id (kid)
    #[arg(long)]
    pub kid: String,
    /// Key material: hex, or raw text
    #[arg(long, env = "WRITEGATE_KEY_MATERIAL", hide_env_values = true)]
    pub material: String,
    /// Expire the version after this long
    #[arg(long, value_parser = humantime::parse_duration)]
    pub valid_for: Option<Duration>,
}
