//! Shared helpers for spawning and reaping supervised processes.

use std::process::ExitStatus;
use tokio::process::Command;

/// Detach the child from the supervisor's console and signal group.
///
/// On unix the child becomes the leader of a new process group, so a stop
/// signal sent to the group also reaches anything it forked. On Windows the
/// console window is hidden.
#[cfg(unix)]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    cmd.process_group(0)
}

#[cfg(windows)]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    cmd.creation_flags(CREATE_NO_WINDOW)
}

#[cfg(not(any(unix, windows)))]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    cmd
}

/// Normalize an exit status to a shell-style code: signal deaths become `128 + signal`.
pub fn exit_code(status: ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.code().or_else(|| status.signal().map(|sig| 128 + sig))
    }
    #[cfg(not(unix))]
    {
        status.code()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    #[test]
    fn plain_exit_codes_pass_through() {
        assert_eq!(exit_code(ExitStatus::from_raw(0)), Some(0));
        // wait(2) encodes exit codes in the high byte
        assert_eq!(exit_code(ExitStatus::from_raw(1 << 8)), Some(1));
    }

    #[test]
    fn signal_deaths_map_to_128_plus_signal() {
        assert_eq!(exit_code(ExitStatus::from_raw(libc_sig::SIGTERM)), Some(143));
        assert_eq!(exit_code(ExitStatus::from_raw(libc_sig::SIGKILL)), Some(137));
    }

    mod libc_sig {
        pub const SIGKILL: i32 = 9;
        pub const SIGTERM: i32 = 15;
    }
}
