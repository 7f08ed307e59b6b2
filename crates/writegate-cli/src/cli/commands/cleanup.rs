use crate::exit_codes::SUCCESS;
use writegate_core::SecurityRuntime;

pub fn run(runtime: &SecurityRuntime) -> anyhow::Result<i32> {
    let report = runtime.cleanup()?;
    println!(
        "removed {} revocations, {} idempotency records",
        report.revocations, report.idempotency_records
    );
    Ok(SUCCESS)
}
