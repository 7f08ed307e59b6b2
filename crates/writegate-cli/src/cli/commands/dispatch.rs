use super::super::args::{Cli, Command, KeySub};
use super::open_runtime;

pub fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    let runtime = open_runtime(&cli)?;
    match cli.cmd {
        Command::Selfcheck => super::selfcheck::run(&runtime),
        Command::Nonce(args) => super::nonce::run(&runtime, args),
        Command::Revoke(args) => super::revoke::run(&runtime, args),
        Command::Check(args) => super::check::run(&runtime, args),
        Command::Cleanup => super::cleanup::run(&runtime),
        Command::Key(args) => match args.cmd {
            KeySub::Current => super::key::current(&runtime),
            KeySub::Install(install) => super::key::install(&runtime, install),
        },
    }
}
