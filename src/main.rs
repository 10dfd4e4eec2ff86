mod cli;
mod client;
mod config;
mod daemon;
mod logging;
mod status;
mod supervisor;

use clap::Parser;

use cli::Cli;
use config::Config;
use status::{EXIT_FAILURE, EXIT_OS, EXIT_SUCCESS};

fn main() {
    let cli = Cli::parse();

    // One-shot client mode: translate the command name and write its
    // byte to the FIFO of a running supervisor.
    if let Some(name) = cli.command.clone() {
        if !cli.program.is_empty() {
            eprintln!("procmon: --command cannot be combined with a child program");
            std::process::exit(EXIT_FAILURE);
        }
        let Some(pipe) = cli.command_pipe else {
            eprintln!("procmon: --command requires --command-pipe");
            std::process::exit(EXIT_FAILURE);
        };
        match client::send(&name, &pipe) {
            Ok(()) => std::process::exit(EXIT_SUCCESS),
            Err(e) => {
                eprintln!("procmon: {e}");
                std::process::exit(EXIT_FAILURE);
            }
        }
    }

    let config = match Config::from_cli(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("procmon: {e}");
            std::process::exit(EXIT_FAILURE);
        }
    };

    // Startup order matters: fd hygiene first (before logging exists, so
    // failures are silent), then the detach fork, then logging (its
    // destination depends on the mode), then the PID file (it must
    // record the surviving process).
    if config.release_all_fds {
        daemon::close_inherited_fds();
    }

    if config.daemon
        && let Err(e) = daemon::detach()
    {
        eprintln!("procmon: {e}");
        std::process::exit(EXIT_OS);
    }

    logging::init(logging::Options {
        daemon: config.daemon,
        parent_tag: config.parent_tag.clone(),
        child_tag: config.child_tag.clone(),
    });

    if config.wait_clamped {
        tracing::info!(
            min = config.min_wait,
            "maximum wait time below minimum, raised to match"
        );
    }
    if config.email.is_some() {
        tracing::warn!("email notification is not implemented");
    }

    let pid_file = match &config.pid_file {
        Some(path) => match daemon::PidFile::create(path) {
            Ok(file) => Some(file),
            Err(e) => {
                tracing::error!("{e}");
                std::process::exit(EXIT_OS);
            }
        },
        None => None,
    };

    let mut supervisor = match supervisor::Supervisor::new(config) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            tracing::error!("{e}");
            drop(pid_file);
            std::process::exit(EXIT_OS);
        }
    };

    let code = supervisor.run();

    // Release supervisor fds before the PID file goes away.
    drop(supervisor);
    drop(pid_file);
    std::process::exit(code);
}
