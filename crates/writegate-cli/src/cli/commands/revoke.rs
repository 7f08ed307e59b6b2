use crate::cli::args::RevokeArgs;
use crate::exit_codes::SUCCESS;
use anyhow::Context;
use chrono::SecondsFormat;
use writegate_core::{SecurityRuntime, SubjectKind};

pub fn run(runtime: &SecurityRuntime, args: RevokeArgs) -> anyhow::Result<i32> {
    let kind = SubjectKind::from(args.kind);
    let duration = chrono::Duration::from_std(args.duration).context("duration out of range")?;
    let until = runtime
        .revocations()
        .now()
        .checked_add_signed(duration)
        .context("duration out of range")?;

    runtime.revocations().revoke(&args.id, kind, until)?;
    println!(
        "revoked {kind} until {}",
        until.to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    Ok(SUCCESS)
}
