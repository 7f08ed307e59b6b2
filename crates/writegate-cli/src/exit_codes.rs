//! Exit codes for the `writegate` binary. Part of the operator contract.

pub const SUCCESS: i32 = 0;
pub const NEGATIVE: i32 = 1; // A check answered "no" (e.g. subject is revoked)
pub const CONFIG_ERROR: i32 = 2; // Config, database or runtime failure
