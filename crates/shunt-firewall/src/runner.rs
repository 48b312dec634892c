use std::io;
use std::process::Command;

/// Capability to run an external command and observe its exit code.
///
/// `argv[0]` is the program. Injected so rule generation can be tested with a
/// recording fake, and so callers control how the privileged binary is
/// actually invoked.
pub trait CommandRunner {
    fn run(&self, argv: &[String]) -> io::Result<i32>;
}

/// Runs commands synchronously through `std::process::Command`.
///
/// Firewall changes are rare, so blocking the calling thread for the few
/// milliseconds an iptables invocation takes is an accepted trade-off.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysCommandRunner;

impl CommandRunner for SysCommandRunner {
    fn run(&self, argv: &[String]) -> io::Result<i32> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty argv"))?;
        let status = Command::new(program).args(args).status()?;
        // A signal-terminated command reports no exit code; treat it as failed.
        Ok(status.code().unwrap_or(-1))
    }
}
