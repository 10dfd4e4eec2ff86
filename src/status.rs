//! Process exit statuses.

/// Normal termination.
pub const EXIT_SUCCESS: i32 = 0;

/// Usage or startup error; also the status for signal-driven
/// termination with no child left to wait for.
pub const EXIT_FAILURE: i32 = 1;

/// Fatal OS setup failure: pipe, fork, setsid, FIFO creation, PID file.
pub const EXIT_OS: i32 = 2;

/// Sentinel for the supervise loop returning without an exit status.
/// The loop only terminates through explicit exit paths, so this status
/// indicates a logic error.
pub const EXIT_NOTREACHED: i32 = 88;

/// Status a child uses to report failure before exec (environment setup,
/// privilege drop, chdir, startup script, or the exec itself). The child
/// writes its own diagnostic, so the supervisor suppresses the usual
/// exit-status log line for this value.
pub const EXIT_CHILD_SETUP: i32 = 99;
