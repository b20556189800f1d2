//! Console launch options and their resolution into a concrete launch plan.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use protocol::messages::ConsoleRequest;

use super::{ConsoleError, SupervisorSettings};

/// Options for one console program. Every field is optional; defaults are
/// applied by [`resolve_launch`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsoleProgramOptions {
    /// Console key. Defaults to the base name of the first argument.
    pub key: Option<String>,
    /// Working directory. Defaults to the application directory.
    pub dir: Option<PathBuf>,
    /// Environment overrides.
    pub env: BTreeMap<String, String>,
    /// Command to run through the shell.
    pub argv: Vec<String>,
    /// Run through a shell. Defaults to `true`.
    pub use_shell: Option<bool>,
    /// Shell override.
    pub shell: Option<String>,
    /// Extra shell arguments.
    pub shell_args: Vec<String>,
    /// Keep the console after the request. Defaults to "a key was given".
    pub persist: Option<bool>,
    /// Login + interactive shell. Defaults to `false`.
    pub interactive: Option<bool>,
    /// Attach to a pseudo-terminal. Defaults to `true`.
    pub alloc_pty: Option<bool>,
    /// Idle timeout. `None` disables idle monitoring.
    pub idle_timeout: Option<Duration>,
}

impl From<ConsoleRequest> for ConsoleProgramOptions {
    fn from(request: ConsoleRequest) -> Self {
        Self {
            key: request.key,
            dir: request.dir.map(PathBuf::from),
            env: request.env,
            argv: request.argv,
            use_shell: request.use_shell,
            shell: request.shell,
            shell_args: request.shell_args,
            persist: request.persist,
            interactive: request.interactive,
            alloc_pty: request.alloc_pty,
            idle_timeout: request.idle_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// Everything needed to spawn a console program.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPlan {
    /// Console key.
    pub key: String,
    /// `<app>-<key>`.
    pub label: String,
    /// Full argument vector; `args[0]` is an absolute path.
    pub args: Vec<String>,
    /// Shell-quoted form of `args`.
    pub command_line: String,
    /// Working directory.
    pub dir: PathBuf,
    /// Environment overrides.
    pub env: BTreeMap<String, String>,
    /// Whether the console should persist.
    pub persist: bool,
    /// Idle timeout.
    pub idle_timeout: Option<Duration>,
}

/// Resolve `options` for the application `app_name` rooted at `app_dir`.
///
/// Fails before anything touches the filesystem or the process table when
/// the options are inconsistent, a mode is unsupported, or the executable
/// cannot be found.
pub fn resolve_launch(
    app_name: &str,
    app_dir: &Path,
    options: &ConsoleProgramOptions,
    settings: &SupervisorSettings,
) -> Result<LaunchPlan, ConsoleError> {
    let dir = options.dir.clone().unwrap_or_else(|| app_dir.to_path_buf());

    let key = options.key.clone().filter(|k| !k.is_empty());
    let persist = options.persist.unwrap_or(options.key.is_some());
    if persist && key.is_none() {
        return Err(ConsoleError::MissingKey);
    }

    if !options.alloc_pty.unwrap_or(true) {
        return Err(ConsoleError::NotImplemented("non-pty console programs"));
    }

    let process_shell = std::env::var("SHELL").ok();
    let mut args = full_args(options, process_shell.as_deref(), &settings.default_shell)?;

    let key = match key {
        Some(key) => key,
        None => base_name(&args[0]),
    };
    let label = format!("{}-{}", app_name, key);

    if !Path::new(&args[0]).is_absolute() {
        let resolved = which::which(&args[0])
            .map_err(|_| ConsoleError::ExecutableNotFound(args[0].clone()))?;
        args[0] = resolved.display().to_string();
    }
    let command_line = shell_words::join(&args);

    Ok(LaunchPlan {
        key,
        label,
        args,
        command_line,
        dir,
        env: options.env.clone(),
        persist,
        idle_timeout: options.idle_timeout,
    })
}

/// Shell resolution: the explicit option, then the request's `SHELL`, then
/// the daemon's `SHELL`, then the configured default.
fn pick_shell<'a>(
    options: &'a ConsoleProgramOptions,
    process_shell: Option<&'a str>,
    default_shell: &'a str,
) -> &'a str {
    [
        options.shell.as_deref(),
        options.env.get("SHELL").map(String::as_str),
        process_shell,
    ]
    .into_iter()
    .flatten()
    .find(|s| !s.is_empty())
    .unwrap_or(default_shell)
}

/// Build the full argument vector. The argv elements follow `-c` as
/// separate arguments: the first is the command string, the rest become the
/// shell's positional parameters.
fn full_args(
    options: &ConsoleProgramOptions,
    process_shell: Option<&str>,
    default_shell: &str,
) -> Result<Vec<String>, ConsoleError> {
    if !options.use_shell.unwrap_or(true) {
        if options.argv.is_empty() {
            return Err(ConsoleError::NoArguments);
        }
        return Err(ConsoleError::NotImplemented("non-shell console programs"));
    }

    let mut args = vec![pick_shell(options, process_shell, default_shell).to_string()];
    args.extend(options.shell_args.iter().cloned());
    if options.interactive.unwrap_or(false) {
        args.push("-l".to_string());
        args.push("-i".to_string());
    }
    if !options.argv.is_empty() {
        args.push("-c".to_string());
        args.extend(options.argv.iter().cloned());
    }
    Ok(args)
}

fn base_name(arg: &str) -> String {
    Path::new(arg)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| arg.to_string())
}
