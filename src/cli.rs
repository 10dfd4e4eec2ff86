use std::path::PathBuf;

use clap::Parser;

/// Command-line surface.
///
/// Everything before `--` configures the supervisor; everything after is
/// the child program and its arguments. With `-c NAME` and no child
/// program, the process runs as a one-shot client that writes a single
/// command byte to the FIFO of an already-running supervisor.
#[derive(Debug, Parser)]
#[command(
    name = "procmon",
    version,
    about = "Run a program under a pseudo-terminal, log its output, and restart it on exit"
)]
pub struct Cli {
    /// Working directory for the child
    #[arg(short = 'D', long = "dir", value_name = "DIR")]
    pub dir: Option<PathBuf>,

    /// Detach from the terminal and run as a daemon
    #[arg(short = 'd', long = "daemon")]
    pub daemon: bool,

    /// Clear the child environment before applying --env
    #[arg(short = 'C', long = "clear-env")]
    pub clear_env: bool,

    /// Send a command (start, stop, exit, hup, int) to a running supervisor
    #[arg(short = 'c', long = "command", value_name = "NAME")]
    pub command: Option<String>,

    /// Set KEY=VALUE in the child environment, or unset a bare KEY; repeatable
    #[arg(short = 'E', long = "env", value_name = "KEY[=VALUE]")]
    pub env: Vec<String>,

    /// Notification address (accepted but not implemented)
    #[arg(short = 'e', long = "email", value_name = "ADDR")]
    pub email: Option<String>,

    /// Log tag for lines produced by the child
    #[arg(short = 'L', long = "child-log-name", value_name = "NAME")]
    pub child_log_name: Option<String>,

    /// Log tag for supervisor messages
    #[arg(short = 'l', long = "log-name", value_name = "NAME")]
    pub log_name: Option<String>,

    /// Maximum delay between restarts, in seconds
    #[arg(
        short = 'M',
        long = "max-wait-time",
        value_name = "SECONDS",
        default_value_t = 300
    )]
    pub max_wait_time: u32,

    /// Minimum delay between restarts, in seconds
    #[arg(
        short = 'm',
        long = "min-wait-time",
        value_name = "SECONDS",
        default_value_t = 2
    )]
    pub min_wait_time: u32,

    /// Command FIFO path; created (mode 0610) if absent
    #[arg(short = 'P', long = "command-pipe", value_name = "PATH")]
    pub command_pipe: Option<PathBuf>,

    /// Write the supervisor PID to this file; removed at normal exit
    #[arg(short = 'p', long = "pid-file", value_name = "PATH")]
    pub pid_file: Option<PathBuf>,

    /// Shell command run in the child after privilege drop, before exec
    #[arg(short = 'S', long = "startup-script", value_name = "CMD")]
    pub startup_script: Option<String>,

    /// Run the child as USER[:GROUP]; each may be a name or numeric id
    #[arg(short = 'u', long = "user", value_name = "USER[:GROUP]")]
    pub user: Option<String>,

    /// Close all file descriptors >= 3 at startup
    #[arg(short = 'z', long = "release-allfd")]
    pub release_allfd: bool,

    /// Child program and its arguments
    #[arg(
        value_name = "PROGRAM [ARGS]...",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub program: Vec<String>,
}
