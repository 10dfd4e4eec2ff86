//! Supervisor configuration, built once from the CLI and immutable
//! afterwards.

use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Group, Uid, User};

use crate::cli::Cli;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no child program given")]
    MissingProgram,
    #[error("empty --env entry")]
    EmptyEnvEntry,
    #[error("--env entry has an empty key: {0:?}")]
    EmptyEnvKey(String),
    #[error("--env entry contains a null byte")]
    NulInEnvEntry,
    #[error("empty user name in --user")]
    EmptyUser,
    #[error("unknown user: {0}")]
    UnknownUser(String),
    #[error("unknown group: {0}")]
    UnknownGroup(String),
    #[error("user database lookup failed: {0}")]
    UserLookup(nix::Error),
}

/// One ordered environment operation for the child.
///
/// `Set` keeps the raw `KEY=VALUE` form so application can be delegated to
/// the OS unchanged; duplicates are last-wins at apply time, not here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvOp {
    Set(String),
    Unset(String),
}

impl EnvOp {
    /// Parse an `--env` argument: `KEY=VALUE` sets, a bare `KEY` unsets.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        if raw.is_empty() {
            return Err(ConfigError::EmptyEnvEntry);
        }
        if raw.contains('\0') {
            return Err(ConfigError::NulInEnvEntry);
        }
        match raw.split_once('=') {
            Some(("", _)) => Err(ConfigError::EmptyEnvKey(raw.to_string())),
            Some(_) => Ok(EnvOp::Set(raw.to_string())),
            None => Ok(EnvOp::Unset(raw.to_string())),
        }
    }
}

/// Identity the child switches to before exec.
///
/// Each id is applied only if the corresponding part was present in the
/// `--user USER[:GROUP]` argument.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunAs {
    pub uid: Option<Uid>,
    pub gid: Option<Gid>,
}

impl RunAs {
    /// Parse `USER[:GROUP]`; each part may be a name or a numeric id.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let (user_part, group_part) = match spec.split_once(':') {
            Some((u, g)) => (u, Some(g)),
            None => (spec, None),
        };

        if user_part.is_empty() {
            return Err(ConfigError::EmptyUser);
        }

        let uid = Some(resolve_uid(user_part)?);
        let gid = match group_part {
            Some(g) if !g.is_empty() => Some(resolve_gid(g)?),
            _ => None,
        };

        Ok(RunAs { uid, gid })
    }
}

fn resolve_uid(part: &str) -> Result<Uid, ConfigError> {
    if let Ok(raw) = part.parse::<u32>() {
        return Ok(Uid::from_raw(raw));
    }
    match User::from_name(part) {
        Ok(Some(user)) => Ok(user.uid),
        Ok(None) => Err(ConfigError::UnknownUser(part.to_string())),
        Err(e) => Err(ConfigError::UserLookup(e)),
    }
}

fn resolve_gid(part: &str) -> Result<Gid, ConfigError> {
    if let Ok(raw) = part.parse::<u32>() {
        return Ok(Gid::from_raw(raw));
    }
    match Group::from_name(part) {
        Ok(Some(group)) => Ok(group.gid),
        Ok(None) => Err(ConfigError::UnknownGroup(part.to_string())),
        Err(e) => Err(ConfigError::UserLookup(e)),
    }
}

/// Immutable supervisor configuration.
#[derive(Debug)]
pub struct Config {
    /// Child program and arguments; never empty, `program[0]` is executed.
    pub program: Vec<String>,
    pub daemon: bool,
    pub clear_env: bool,
    pub env_ops: Vec<EnvOp>,
    pub work_dir: Option<PathBuf>,
    pub startup_script: Option<String>,
    pub run_as: RunAs,
    pub pid_file: Option<PathBuf>,
    pub command_pipe: Option<PathBuf>,
    pub min_wait: u32,
    pub max_wait: u32,
    /// `max_wait` was raised to `min_wait`; reported once logging is up.
    pub wait_clamped: bool,
    pub release_all_fds: bool,
    pub email: Option<String>,
    pub parent_tag: String,
    pub child_tag: String,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        if cli.program.is_empty() {
            return Err(ConfigError::MissingProgram);
        }

        let env_ops = cli
            .env
            .iter()
            .map(|raw| EnvOp::parse(raw))
            .collect::<Result<Vec<_>, _>>()?;

        let run_as = match cli.user.as_deref() {
            Some(spec) => RunAs::parse(spec)?,
            None => RunAs::default(),
        };

        let wait_clamped = cli.max_wait_time < cli.min_wait_time;
        let max_wait = cli.max_wait_time.max(cli.min_wait_time);

        let parent_tag = cli.log_name.unwrap_or_else(|| "procmon".to_string());
        let child_tag = cli
            .child_log_name
            .unwrap_or_else(|| program_basename(&cli.program[0]));

        Ok(Config {
            program: cli.program,
            daemon: cli.daemon,
            clear_env: cli.clear_env,
            env_ops,
            work_dir: cli.dir,
            startup_script: cli.startup_script,
            run_as,
            pid_file: cli.pid_file,
            command_pipe: cli.command_pipe,
            min_wait: cli.min_wait_time,
            max_wait,
            wait_clamped,
            release_all_fds: cli.release_allfd,
            email: cli.email,
            parent_tag,
            child_tag,
        })
    }
}

fn program_basename(program: &str) -> String {
    Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    fn config_from(args: &[&str]) -> Config {
        Config::from_cli(Cli::parse_from(args)).unwrap()
    }

    #[test]
    fn env_set_and_unset_parse() {
        assert_eq!(EnvOp::parse("K=V").unwrap(), EnvOp::Set("K=V".into()));
        assert_eq!(EnvOp::parse("K=").unwrap(), EnvOp::Set("K=".into()));
        assert_eq!(EnvOp::parse("K").unwrap(), EnvOp::Unset("K".into()));
    }

    #[test]
    fn env_rejects_empty_and_bad_entries() {
        assert!(matches!(
            EnvOp::parse(""),
            Err(ConfigError::EmptyEnvEntry)
        ));
        assert!(matches!(
            EnvOp::parse("=V"),
            Err(ConfigError::EmptyEnvKey(_))
        ));
        assert!(matches!(
            EnvOp::parse("K=a\0b"),
            Err(ConfigError::NulInEnvEntry)
        ));
    }

    #[test]
    fn duplicate_env_keys_kept_in_order() {
        let cfg = config_from(&["procmon", "-E", "K=V", "-E", "K=W", "/bin/env"]);
        assert_eq!(
            cfg.env_ops,
            vec![EnvOp::Set("K=V".into()), EnvOp::Set("K=W".into())]
        );
    }

    #[test]
    fn numeric_user_and_group_resolve_without_lookup() {
        let run_as = RunAs::parse("1000:1000").unwrap();
        assert_eq!(run_as.uid, Some(Uid::from_raw(1000)));
        assert_eq!(run_as.gid, Some(Gid::from_raw(1000)));
    }

    #[test]
    fn user_without_group_leaves_gid_unset() {
        let run_as = RunAs::parse("1000").unwrap();
        assert_eq!(run_as.uid, Some(Uid::from_raw(1000)));
        assert!(run_as.gid.is_none());
    }

    #[test]
    fn empty_user_rejected() {
        assert!(matches!(RunAs::parse(""), Err(ConfigError::EmptyUser)));
        assert!(matches!(RunAs::parse(":0"), Err(ConfigError::EmptyUser)));
    }

    #[test]
    fn max_wait_clamped_up_to_min() {
        let cfg = config_from(&["procmon", "-m", "20", "-M", "5", "/bin/false"]);
        assert_eq!(cfg.min_wait, 20);
        assert_eq!(cfg.max_wait, 20);
        assert!(cfg.wait_clamped);
    }

    #[test]
    fn default_tags_derived_from_program() {
        let cfg = config_from(&["procmon", "/usr/bin/some-daemon", "-x"]);
        assert_eq!(cfg.parent_tag, "procmon");
        assert_eq!(cfg.child_tag, "some-daemon");
    }

    #[test]
    fn explicit_tags_win() {
        let cfg = config_from(&[
            "procmon", "-l", "parent", "-L", "child", "/bin/sleep", "1",
        ]);
        assert_eq!(cfg.parent_tag, "parent");
        assert_eq!(cfg.child_tag, "child");
    }

    #[test]
    fn missing_program_rejected() {
        let err = Config::from_cli(Cli::parse_from(["procmon"])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingProgram));
    }
}
