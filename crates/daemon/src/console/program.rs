//! A single supervised console program.

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use protocol::events::EventRecord;
use protocol::messages::{ConsoleInfo, ConsoleState};
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::cleanup::CleanupGuard;
use super::pty::{self, RawMode, SharedMaster};
use super::{
    resolve_launch, CleanupActions, ConsoleError, ConsoleProgramOptions, LaunchPlan, Scope,
    SupervisorSettings,
};
use crate::apps::App;
use crate::events::EventEmitter;

/// Capacity of the output line relay.
const OUTPUT_CAPACITY: usize = 256;

/// How a console process exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code reported by the OS.
    pub code: u32,
    /// Whether the exit counts as success.
    pub success: bool,
}

/// A console program attached to a pseudo-terminal.
pub struct ConsoleProgram {
    app: Arc<App>,
    key: String,
    label: String,
    command_line: String,
    persist: bool,
    idle_timeout: Option<Duration>,
    pid: Option<u32>,
    tty: Option<PathBuf>,
    tmp_dir: TempDir,
    scope: Arc<Scope>,
    ready: CancellationToken,
    last_use: Mutex<Option<Instant>>,
    cleanup: Arc<CleanupActions>,
    exit: watch::Receiver<Option<ProcessExit>>,
    events: EventEmitter,
    settings: SupervisorSettings,
}

impl ConsoleProgram {
    /// Launch a console program for `app` and wait until it is ready.
    ///
    /// On failure everything set up so far has been released and no process
    /// is left running.
    pub async fn start(
        app: Arc<App>,
        options: &ConsoleProgramOptions,
        events: EventEmitter,
        settings: SupervisorSettings,
    ) -> Result<Arc<Self>, ConsoleError> {
        let plan = resolve_launch(app.name(), app.dir(), options, &settings)?;
        Self::launch(app, plan, events, settings).await
    }

    /// Launch an already resolved plan and wait until it is ready.
    pub async fn launch(
        app: Arc<App>,
        plan: LaunchPlan,
        events: EventEmitter,
        settings: SupervisorSettings,
    ) -> Result<Arc<Self>, ConsoleError> {
        let label = plan.label.clone();
        let startup_error = |source: ConsoleError| ConsoleError::Startup {
            label: label.clone(),
            source: Box::new(source),
        };

        let tmp_dir = tempfile::Builder::new()
            .prefix(&format!("{}.tmp-", plan.label))
            .tempdir()
            .map_err(|e| startup_error(ConsoleError::resource("creating temp dir", e)))?;

        let cleanup = Arc::new(CleanupActions::new(plan.label.clone()));
        let process = pty::spawn(&plan.args, &plan.dir, &plan.env).map_err(startup_error)?;
        let pid = process.pid;
        let tty = process.tty.clone();
        let exit = watch_exit(process.child, plan.label.clone());

        if let Err(e) = attach_terminal(&process.master, tty.as_deref(), &plan.label, &cleanup) {
            pty::kill_now(pid);
            cleanup.run();
            return Err(startup_error(e));
        }

        let program = Arc::new(Self {
            app,
            key: plan.key,
            label: plan.label,
            command_line: plan.command_line,
            persist: plan.persist,
            idle_timeout: plan.idle_timeout,
            pid,
            tty,
            tmp_dir,
            scope: Scope::new(),
            ready: CancellationToken::new(),
            last_use: Mutex::new(None),
            cleanup,
            exit,
            events,
            settings,
        });

        program.app.set_booting();
        program.app.attach_console(&program.label);
        tracing::info!(
            label = %program.label,
            pid = ?program.pid,
            command_line = %program.command_line,
            "Booting console program"
        );
        program
            .emit(program.event("booting_app").field("cmdline", program.command_line.clone()))
            .await;

        program.spawn_output_relay(process.reader);

        program.scope.go("watch", program.clone().watch());
        if let Some(timeout) = program.idle_timeout {
            program.scope.go("idle_monitor", program.clone().idle_monitor(timeout));
        }
        program.scope.go("run", program.clone().run());

        if let Err(e) = program.wait_til_ready().await {
            program.cleanup.run();
            return Err(startup_error(e));
        }

        program.app.set_running(program.pid);
        Ok(program)
    }

    /// Block until the program is ready or the scope is dying. Dying wins
    /// ties. Success stamps the last-use time.
    pub async fn wait_til_ready(&self) -> Result<(), ConsoleError> {
        wait_ready(&self.ready, &self.scope).await?;
        self.touch();
        Ok(())
    }

    /// Kill the program with `reason`.
    ///
    /// Marks the scope dying and sends `SIGTERM`. Cleanup is left to the
    /// watch task, which reacts to the process exiting. Calling this again
    /// re-sends the signal while the process is still alive.
    pub async fn kill(&self, reason: &str) -> Result<(), ConsoleError> {
        self.scope.kill(ConsoleError::Killed {
            reason: reason.to_string(),
        });
        self.emit(self.event("killing_console_program").field("reason", reason))
            .await;
        tracing::info!(label = %self.label, pid = ?self.pid, reason = %reason, "Killing console program");

        match self.signal(Signal::SIGTERM) {
            Ok(()) => {
                self.emit(self.event("shutdown")).await;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(label = %self.label, error = %e, "Error trying to kill console program");
                self.emit(self.event("killing_error").field("error", e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    /// Register an extra cleanup action. Runs immediately if cleanup has
    /// already happened.
    pub fn on_cleanup<F>(&self, name: &'static str, action: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.cleanup.push(name, action);
    }

    /// Record use now, postponing the idle timeout.
    pub fn touch(&self) {
        *self.last_use.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    /// True once the program has been unused for longer than its idle
    /// timeout. Never true without a timeout or before the program is ready.
    pub fn is_timed_out(&self) -> bool {
        let last_use = *self.last_use.lock().unwrap_or_else(|e| e.into_inner());
        match (self.idle_timeout, last_use) {
            (Some(timeout), Some(last_use)) => last_use.elapsed() > timeout,
            _ => false,
        }
    }

    /// Wait until every supervised task has finished and cleanup has run.
    pub async fn wait(&self) {
        self.scope.wait().await;
    }

    /// The scope's terminal error, if it is dying.
    pub fn err(&self) -> Option<ConsoleError> {
        self.scope.err()
    }

    /// Exit status, once the process has been reaped.
    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit.borrow()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConsoleState {
        if self.cleanup.has_run() {
            ConsoleState::Dead
        } else if self.scope.is_dying() {
            ConsoleState::Dying
        } else if self.ready.is_cancelled() {
            ConsoleState::Ready
        } else {
            ConsoleState::Starting
        }
    }

    /// Owning application.
    pub fn app(&self) -> &Arc<App> {
        &self.app
    }

    /// Console key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// `<app>-<key>`.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Shell-quoted command line.
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Child pid.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the console was asked to persist.
    pub fn persist(&self) -> bool {
        self.persist
    }

    /// Private scratch directory, removed when the program is dropped.
    pub fn tmp_dir(&self) -> &Path {
        self.tmp_dir.path()
    }

    /// Read-only view for management responses.
    pub fn info(&self) -> ConsoleInfo {
        ConsoleInfo {
            app: self.app.name().to_string(),
            key: self.key.clone(),
            label: self.label.clone(),
            command_line: self.command_line.clone(),
            pid: self.pid,
            state: self.state(),
            tty: self.tty.as_ref().map(|t| t.display().to_string()),
            persist: self.persist,
            idle_timeout_secs: self.idle_timeout.map(|t| t.as_secs()),
        }
    }

    /// Wait for the scope to die (a process exiting on its own kills it),
    /// then reap the process and run cleanup exactly once.
    async fn watch(self: Arc<Self>) -> Result<(), ConsoleError> {
        let _cleanup = CleanupGuard(&self.cleanup);
        let mut exit = self.exit.clone();

        tokio::select! {
            _ = self.scope.dying() => {}
            status = wait_exit(&mut exit) => {
                let code = status.map_or(0, |s| s.code);
                tracing::info!(label = %self.label, code, "Console program exited");
                self.scope.kill(ConsoleError::UnexpectedExit { code });
            }
        }

        let status = match tokio::time::timeout(self.settings.kill_grace, wait_exit(&mut exit)).await {
            Ok(status) => status,
            Err(_) => {
                tracing::warn!(label = %self.label, pid = ?self.pid, "Console program ignored SIGTERM, sending SIGKILL");
                let _ = self.signal(Signal::SIGKILL);
                wait_exit(&mut exit).await
            }
        };

        self.app.detach_console(&self.label);
        let mut record = self.event("shutdown");
        if let Some(status) = status {
            record = record.field("exitCode", status.code);
        }
        self.emit(record).await;
        tracing::info!(label = %self.label, "Console program shut down and cleaned up");
        Ok(())
    }

    /// Mark the program ready after the ready delay, unless the scope dies
    /// first.
    async fn run(self: Arc<Self>) -> Result<(), ConsoleError> {
        self.emit(self.event("waiting_on_app")).await;

        tokio::select! {
            biased;

            _ = self.scope.dying() => {
                self.emit(self.event("dying_on_start")).await;
                tracing::warn!(label = %self.label, "Console program died on start");
                Err(ConsoleError::DiedBeforeBooting)
            }
            _ = tokio::time::sleep(self.settings.ready_delay) => {
                self.emit(self.event("app_ready")).await;
                self.ready.cancel();
                tracing::info!(label = %self.label, "Console program booted");
                Ok(())
            }
        }
    }

    /// Kill the program once it has been idle for longer than `timeout`.
    async fn idle_monitor(self: Arc<Self>, timeout: Duration) -> Result<(), ConsoleError> {
        let period = self.settings.idle_check_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                biased;

                _ = self.scope.dying() => return Ok(()),
                _ = ticker.tick() => {
                    if self.is_timed_out() {
                        self.scope.kill(ConsoleError::IdleTimeout(timeout));
                        return self.kill("idle timeout").await;
                    }
                }
            }
        }
    }

    fn spawn_output_relay(self: &Arc<Self>, reader: Box<dyn Read + Send>) {
        let (line_tx, mut line_rx) = mpsc::channel::<String>(OUTPUT_CAPACITY);
        let label = self.label.clone();

        tokio::task::spawn_blocking(move || {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf).into_owned();
                        if line_tx.blocking_send(line).is_err() {
                            break;
                        }
                    }
                    // EIO once the last slave descriptor is closed.
                    Err(_) => break,
                }
            }
            tracing::trace!(label = %label, "Console output closed");
        });

        let app = self.app.clone();
        let events = self.events.clone();
        let label = self.label.clone();
        tokio::spawn(async move {
            while let Some(line) = line_rx.recv().await {
                if line.trim().is_empty() {
                    continue;
                }
                app.record_log_line(&line);
                events.console_log(app.name(), &label, &line).await;
            }
        });
    }

    fn signal(&self, sig: Signal) -> Result<(), ConsoleError> {
        if self.exit.borrow().is_some() {
            return Err(ConsoleError::AlreadyExited(self.label.clone()));
        }
        let pid = self
            .pid
            .ok_or_else(|| ConsoleError::Signal(format!("no pid for {}", self.label)))?;
        signal::kill(Pid::from_raw(pid as i32), sig).map_err(|e| ConsoleError::Signal(e.to_string()))
    }

    fn event(&self, name: &str) -> EventRecord {
        let mut record = EventRecord::new(name)
            .app(self.app.name())
            .field("type", "console_prog")
            .field("programKey", self.label.clone());
        if let Some(pid) = self.pid {
            record = record.field("pid", pid);
        }
        record
    }

    async fn emit(&self, record: EventRecord) {
        self.events.emit(record).await;
    }
}

impl std::fmt::Debug for ConsoleProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleProgram")
            .field("label", &self.label)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish()
    }
}

/// Race readiness against the scope dying. Dying wins ties: if both have
/// fired, the scope's error is returned.
pub async fn wait_ready(ready: &CancellationToken, scope: &Scope) -> Result<(), ConsoleError> {
    let died = || scope.err().unwrap_or(ConsoleError::DiedBeforeBooting);

    tokio::select! {
        _ = ready.cancelled() => {
            if scope.is_dying() {
                Err(died())
            } else {
                Ok(())
            }
        }
        _ = scope.dying() => Err(died()),
    }
}

/// Register the pty-related cleanup actions (close pty, stop the resize
/// relay, restore the terminal mode), in that order, as each piece is set
/// up.
fn attach_terminal(
    master: &SharedMaster,
    tty: Option<&Path>,
    label: &str,
    cleanup: &CleanupActions,
) -> Result<(), ConsoleError> {
    let closing = master.clone();
    cleanup.push("close pty", move || {
        closing.lock().unwrap_or_else(|e| e.into_inner()).take();
        Ok(())
    });

    let relay_stop = CancellationToken::new();
    pty::spawn_resize_relay(master.clone(), label.to_string(), relay_stop.clone())?;
    cleanup.push("stop resize relay", move || {
        relay_stop.cancel();
        Ok(())
    });
    pty::resize(master, label);

    let tty = tty.ok_or_else(|| ConsoleError::resource("setting raw mode", "pty has no tty name"))?;
    let raw = RawMode::enter(tty)?;
    cleanup.push("restore terminal mode", move || raw.restore());
    Ok(())
}

/// Reap `child` on a blocking thread and publish its exit status.
fn watch_exit(
    mut child: Box<dyn portable_pty::Child + Send + Sync>,
    label: String,
) -> watch::Receiver<Option<ProcessExit>> {
    let (exit_tx, exit_rx) = watch::channel(None);
    tokio::task::spawn_blocking(move || {
        let exit = match child.wait() {
            Ok(status) => ProcessExit {
                code: status.exit_code(),
                success: status.success(),
            },
            Err(e) => {
                tracing::warn!(label = %label, error = %e, "Failed waiting for console program");
                ProcessExit {
                    code: 1,
                    success: false,
                }
            }
        };
        let _ = exit_tx.send(Some(exit));
    });
    exit_rx
}

async fn wait_exit(exit: &mut watch::Receiver<Option<ProcessExit>>) -> Option<ProcessExit> {
    match exit.wait_for(Option::is_some).await {
        Ok(status) => *status,
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_ready_success() {
        let ready = CancellationToken::new();
        let scope = Scope::new();
        ready.cancel();
        assert!(wait_ready(&ready, &scope).await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_ready_dying_wins_ties() {
        let ready = CancellationToken::new();
        let scope = Scope::new();
        ready.cancel();
        scope.kill(ConsoleError::Killed {
            reason: "test".to_string(),
        });

        for _ in 0..50 {
            let err = wait_ready(&ready, &scope).await.unwrap_err();
            assert!(matches!(err, ConsoleError::Killed { .. }));
        }
    }

    #[tokio::test]
    async fn test_wait_ready_dying_first() {
        let ready = CancellationToken::new();
        let scope = Scope::new();

        let killer = scope.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            killer.kill(ConsoleError::UnexpectedExit { code: 1 });
        });

        let err = wait_ready(&ready, &scope).await.unwrap_err();
        assert!(matches!(err, ConsoleError::UnexpectedExit { code: 1 }));
    }

    mod lifecycle {
        use super::*;
        use crate::hub::{Hub, HubConfig, Outbox};
        use protocol::messages::AppStatus;
        use serde_json::Value;
        use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
        use tempfile::TempDir;
        use tokio::time::timeout;

        fn settings() -> SupervisorSettings {
            SupervisorSettings {
                ready_delay: Duration::from_millis(50),
                idle_check_interval: Duration::from_millis(50),
                kill_grace: Duration::from_secs(1),
                default_shell: "/bin/sh".to_string(),
            }
        }

        fn options(command: &str) -> ConsoleProgramOptions {
            ConsoleProgramOptions {
                key: Some("worker".to_string()),
                argv: vec![command.to_string()],
                shell: Some("/bin/sh".to_string()),
                ..Default::default()
            }
        }

        async fn setup() -> (Arc<App>, EventEmitter, Outbox, TempDir) {
            let dir = TempDir::new().unwrap();
            let app = Arc::new(App::new("blog", dir.path()));
            let (hub, handle) = Hub::new(HubConfig::default());
            tokio::spawn(hub.run());
            let (_client, outbox) = handle.connect(["blog".to_string()]).await.unwrap();
            (app, EventEmitter::new(handle), outbox, dir)
        }

        fn count_cleanups(program: &ConsoleProgram) -> Arc<AtomicUsize> {
            let runs = Arc::new(AtomicUsize::new(0));
            let counter = runs.clone();
            program.on_cleanup("count", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            runs
        }

        async fn next_event(outbox: &mut Outbox) -> Value {
            let bytes = timeout(Duration::from_secs(2), outbox.recv())
                .await
                .expect("timeout")
                .expect("outbox closed");
            serde_json::from_slice(&bytes).unwrap()
        }

        #[tokio::test]
        async fn test_kill_cleans_up_once() {
            let (app, events, _outbox, _dir) = setup().await;
            let program = ConsoleProgram::start(app.clone(), &options("sleep 30"), events, settings())
                .await
                .unwrap();

            assert_eq!(program.state(), ConsoleState::Ready);
            assert_eq!(program.label(), "blog-worker");
            assert_eq!(app.status(), AppStatus::Running);
            assert_eq!(app.consoles(), vec!["blog-worker".to_string()]);
            assert!(program.tmp_dir().exists());
            let cleanups = count_cleanups(&program);

            program.kill("test").await.unwrap();
            timeout(Duration::from_secs(5), program.wait()).await.unwrap();

            assert_eq!(cleanups.load(Ordering::SeqCst), 1);
            assert_eq!(program.state(), ConsoleState::Dead);
            assert!(matches!(program.err(), Some(ConsoleError::Killed { .. })));
            assert!(program.exit_status().is_some());
            assert_eq!(app.status(), AppStatus::Dead);
            assert!(app.consoles().is_empty());

            let late = Arc::new(AtomicBool::new(false));
            let flag = late.clone();
            program.on_cleanup("late", move || {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            });
            assert!(late.load(Ordering::SeqCst));

            let err = program.kill("again").await.unwrap_err();
            assert!(matches!(err, ConsoleError::AlreadyExited(_)));
            assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn test_unexpected_exit_after_ready() {
            let (app, events, _outbox, _dir) = setup().await;
            let program = ConsoleProgram::start(app.clone(), &options("sleep 0.4"), events, settings())
                .await
                .unwrap();
            let cleanups = count_cleanups(&program);

            timeout(Duration::from_secs(5), program.wait()).await.unwrap();

            assert_eq!(cleanups.load(Ordering::SeqCst), 1);
            assert_eq!(program.state(), ConsoleState::Dead);
            assert!(matches!(
                program.err(),
                Some(ConsoleError::UnexpectedExit { code: 0 })
            ));
            assert_eq!(app.status(), AppStatus::Dead);
        }

        #[tokio::test]
        async fn test_exit_before_ready_fails_start() {
            let (app, events, _outbox, _dir) = setup().await;
            let mut settings = settings();
            settings.ready_delay = Duration::from_secs(2);

            let err = ConsoleProgram::start(app.clone(), &options("exit 3"), events, settings)
                .await
                .unwrap_err();

            match err {
                ConsoleError::Startup { label, source } => {
                    assert_eq!(label, "blog-worker");
                    assert!(matches!(*source, ConsoleError::UnexpectedExit { code: 3 }));
                }
                other => panic!("unexpected error: {other}"),
            }
        }

        #[tokio::test]
        async fn test_idle_timeout_kills_program() {
            let (app, events, _outbox, _dir) = setup().await;
            let mut options = options("sleep 30");
            options.idle_timeout = Some(Duration::from_millis(150));

            let program = ConsoleProgram::start(app, &options, events, settings())
                .await
                .unwrap();
            assert!(!program.is_timed_out());
            let cleanups = count_cleanups(&program);

            timeout(Duration::from_secs(5), program.wait()).await.unwrap();

            assert_eq!(cleanups.load(Ordering::SeqCst), 1);
            assert_eq!(program.state(), ConsoleState::Dead);
            assert!(matches!(program.err(), Some(ConsoleError::IdleTimeout(_))));
        }

        #[tokio::test]
        async fn test_persist_without_key_spawns_nothing() {
            let (app, events, _outbox, _dir) = setup().await;
            let mut options = options("sleep 30");
            options.key = None;
            options.persist = Some(true);

            let err = ConsoleProgram::start(app.clone(), &options, events, settings())
                .await
                .unwrap_err();

            assert!(matches!(err, ConsoleError::MissingKey));
            assert!(app.consoles().is_empty());
            assert_eq!(app.status(), AppStatus::Dead);
        }

        #[tokio::test]
        async fn test_lifecycle_events() {
            let (app, events, mut outbox, _dir) = setup().await;
            let program = ConsoleProgram::start(app, &options("sleep 30"), events, settings())
                .await
                .unwrap();

            let booting = next_event(&mut outbox).await;
            assert_eq!(booting["event"], "booting_app");
            assert_eq!(booting["type"], "console_prog");
            assert_eq!(booting["programKey"], "blog-worker");
            assert_eq!(booting["pid"], program.pid().unwrap());

            let mut seen = Vec::new();
            while !seen.iter().any(|e| e == "app_ready") {
                let value = next_event(&mut outbox).await;
                seen.push(value["event"].as_str().unwrap().to_string());
            }
            assert_eq!(seen.first().map(String::as_str), Some("waiting_on_app"));

            program.kill("done").await.unwrap();
            timeout(Duration::from_secs(5), program.wait()).await.unwrap();
        }
    }
}
