use crate::exit_codes::SUCCESS;
use anyhow::Context;
use writegate_core::SecurityRuntime;

pub fn run(runtime: &SecurityRuntime) -> anyhow::Result<i32> {
    runtime.health_check().context("health check failed")?;
    tracing::info!(
        event = "selfcheck_ok",
        db = %runtime.config().db_path.display(),
        node = %runtime.config().node_name
    );
    println!("writegate: selfcheck ok");
    Ok(SUCCESS)
}
