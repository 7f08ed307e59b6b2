use crate::cli::args::CheckArgs;
use crate::exit_codes::{NEGATIVE, SUCCESS};
use writegate_core::{SecurityRuntime, SubjectKind};

pub fn run(runtime: &SecurityRuntime, args: CheckArgs) -> anyhow::Result<i32> {
    let guard = runtime.revocations();
    if guard.is_revoked(&args.id, SubjectKind::from(args.kind), guard.now())? {
        println!("revoked");
        Ok(NEGATIVE)
    } else {
        println!("active");
        Ok(SUCCESS)
    }
}
