use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::error::SupervisorError;

/// Environment variable through which a dev server learns its port.
pub const PORT_ENV: &str = "PORT";

/// Split a command line into program and arguments, honoring shell quoting.
pub fn split_command(command: &str) -> Result<Vec<String>, SupervisorError> {
    let argv = shell_words::split(command).map_err(|e| SupervisorError::InvalidCommand {
        command: command.to_string(),
        reason: e.to_string(),
    })?;
    if argv.is_empty() {
        return Err(SupervisorError::InvalidCommand {
            command: command.to_string(),
            reason: "command is empty".to_string(),
        });
    }
    Ok(argv)
}

/// The program a command line would execute, if it names one.
pub fn program_name(command: &str) -> Option<String> {
    shell_words::split(command).ok()?.into_iter().next()
}

/// Build a piped command for `argv` running in `cwd`.
///
/// The child becomes leader of its own process group so signals reach the
/// whole tree a dev server tends to spawn.
pub fn piped_command(argv: &[String], cwd: &Path) -> Command {
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    cmd
}

/// Build the dev server command.
///
/// The child inherits this process's environment with `env` layered on top.
/// [`PORT_ENV`] is applied last so the leased port always wins.
pub fn build_command(
    command: &str,
    cwd: &Path,
    env: &HashMap<String, String>,
    port: u16,
) -> Result<Command, SupervisorError> {
    let argv = split_command(command)?;
    let mut cmd = piped_command(&argv, cwd);
    cmd.envs(env).env(PORT_ENV, port.to_string());
    debug!("Built dev server command {:?} in {}", argv, cwd.display());
    Ok(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::ffi::OsStr;

    #[test]
    fn test_split_honors_quotes() {
        assert_eq!(
            split_command(r#"sh -c "echo hi; sleep 1""#).unwrap(),
            vec!["sh", "-c", "echo hi; sleep 1"]
        );
    }

    #[test]
    fn test_split_rejects_empty_and_unbalanced() {
        assert!(matches!(
            split_command("   "),
            Err(SupervisorError::InvalidCommand { .. })
        ));
        assert!(matches!(
            split_command("echo 'unterminated"),
            Err(SupervisorError::InvalidCommand { .. })
        ));
    }

    #[test]
    fn test_program_name() {
        assert_eq!(program_name("npm run dev").as_deref(), Some("npm"));
        assert_eq!(program_name(""), None);
    }

    #[test]
    fn test_leased_port_wins_over_caller_env() {
        let env = HashMap::from([
            ("NODE_ENV".to_string(), "development".to_string()),
            (PORT_ENV.to_string(), "9999".to_string()),
        ]);
        let cmd = build_command("npm run dev", Path::new("/tmp"), &env, 3001).unwrap();
        let std_cmd = cmd.as_std();

        assert_eq!(std_cmd.get_program(), OsStr::new("npm"));
        let envs: HashMap<_, _> = std_cmd.get_envs().collect();
        assert_eq!(
            envs.get(OsStr::new("NODE_ENV")).copied().flatten(),
            Some(OsStr::new("development"))
        );
        assert_eq!(
            envs.get(OsStr::new(PORT_ENV)).copied().flatten(),
            Some(OsStr::new("3001"))
        );
    }
}
