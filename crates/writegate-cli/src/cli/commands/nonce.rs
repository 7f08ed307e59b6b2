use crate::cli::args::NonceArgs;
use crate::exit_codes::SUCCESS;
use writegate_core::SecurityRuntime;

pub fn run(runtime: &SecurityRuntime, args: NonceArgs) -> anyhow::Result<i32> {
    let nonces = runtime.nonces();
    for _ in 0..args.count {
        println!("{}", nonces.next()?);
    }
    Ok(SUCCESS)
}
