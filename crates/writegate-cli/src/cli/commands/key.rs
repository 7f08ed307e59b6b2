use crate::cli::args::KeyInstallArgs;
use crate::exit_codes::SUCCESS;
use anyhow::Context;
use writegate_core::{Clock, KeyResolver, SecurityRuntime};

/// Prints the key id only; material never leaves the process.
pub fn current(runtime: &SecurityRuntime) -> anyhow::Result<i32> {
    let key = runtime.keys().current()?;
    println!("{}", key.kid);
    Ok(SUCCESS)
}

pub fn install(runtime: &SecurityRuntime, args: KeyInstallArgs) -> anyhow::Result<i32> {
    let valid_until = match args.valid_for {
        Some(d) => {
            let d = chrono::Duration::from_std(d).context("validity out of range")?;
            Some(
                runtime
                    .clock()
                    .now()
                    .checked_add_signed(d)
                    .context("validity out of range")?,
            )
        }
        None => None,
    };

    runtime
        .keys()
        .install(&args.signing_key, &args.kid, &args.material, valid_until)?;
    println!("installed {}", args.kid.trim());
    Ok(SUCCESS)
}
