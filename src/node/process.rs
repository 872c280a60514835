//! External process node - keeps a sidecar process alive for the whole run.
//!
//! The process is launched once in `on_start` and is checked for liveness
//! before every `batchStart`. It gets no direct stimulus from the pipeline;
//! upstream producers talk to it over the network.
//!
//! Its stdout and stderr are drained on two threads into
//! `<log_file><restart index>` and mirrored to `tracing` at trace level.
//!
//! On unix the child leads its own process group. Shutdown closes the child's
//! stdin and sends `SIGTERM` to the group, waits up to `shutdown_timeout`, then
//! sends `SIGKILL` to the group. Whatever is left in the group once the child
//! has exited is killed as well, so wrapper scripts cannot hold the output
//! pipes open.
//!
//! A process stopped by the termination request or killed after the timeout
//! counts as a clean stop. One that exited on its own with a non-zero status
//! fails the run.

use super::{NodeContext, StepContext};
use crate::error::{PipelineError, PipelineResult};
use std::fs::File;
use std::io::{BufRead, BufReader, LineWriter, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type SharedLog = Arc<Mutex<LineWriter<File>>>;

/// Process launch settings.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Log path prefix; the restart index is appended
    pub log_file: Option<PathBuf>,
    /// Grace period after launch before the first liveness check
    pub startup_delay: Duration,
    pub shutdown_timeout: Duration,
    /// Interval for exit polling during shutdown
    pub poll: Duration,
}

impl ProcessConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            log_file: None,
            startup_delay: Duration::ZERO,
            shutdown_timeout: Duration::from_millis(5000),
            poll: Duration::from_millis(20),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_log_file(mut self, log_file: impl Into<PathBuf>) -> Self {
        self.log_file = Some(log_file.into());
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Log file for the `restart`-th launch (1-based).
    pub fn log_path(&self, restart: u32) -> Option<PathBuf> {
        self.log_file
            .as_ref()
            .map(|prefix| PathBuf::from(format!("{}{}", prefix.display(), restart)))
    }

    fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How the process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// Exited on its own
    Exited(ExitStatus),
    /// Stopped by the termination request (`SIGTERM`, or the `128 + 15`
    /// status a JVM reports for it)
    Terminated(ExitStatus),
    /// Killed after the shutdown timeout
    Killed,
}

pub struct ExternalProcessNode {
    name: String,
    config: ProcessConfig,
    child: Option<Child>,
    drains: Vec<JoinHandle<()>>,
    restarts: u32,
    exit: Option<ProcessExit>,
}

impl ExternalProcessNode {
    pub fn new(name: impl Into<String>, config: ProcessConfig) -> Self {
        Self {
            name: name.into(),
            config,
            child: None,
            drains: Vec::new(),
            restarts: 0,
            exit: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of launches so far.
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Set once the process has been stopped.
    pub fn exit(&self) -> Option<ProcessExit> {
        self.exit
    }

    pub fn on_start(&mut self, _ctx: &NodeContext) -> PipelineResult<()> {
        self.launch()?;
        if !self.config.startup_delay.is_zero() {
            thread::sleep(self.config.startup_delay);
        }
        self.check_alive()
    }

    fn launch(&mut self) -> PipelineResult<()> {
        self.restarts += 1;
        let log = match self.config.log_path(self.restarts) {
            Some(path) => {
                let file = File::create(&path)?;
                tracing::debug!("Process output goes to {:?}", path);
                Some(Arc::new(Mutex::new(LineWriter::new(file))))
            }
            None => None,
        };

        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(|source| PipelineError::ProcessSpawn {
            command: self.config.command_line(),
            source,
        })?;
        tracing::info!("Started '{}' (pid {})", self.config.command_line(), child.id());

        if let Some(stdout) = child.stdout.take() {
            self.drains
                .push(spawn_drain(format!("{}_stdout", self.name), stdout, log.clone())?);
        }
        if let Some(stderr) = child.stderr.take() {
            self.drains
                .push(spawn_drain(format!("{}_stderr", self.name), stderr, log)?);
        }
        self.child = Some(child);
        Ok(())
    }

    fn check_alive(&mut self) -> PipelineResult<()> {
        let child = self.child.as_mut().ok_or_else(|| PipelineError::ProcessCrashed {
            node: self.name.clone(),
            status: "not running".to_string(),
        })?;
        match child.try_wait()? {
            None => Ok(()),
            Some(status) => {
                tracing::error!("Process exited between steps: {}", status);
                Err(PipelineError::ProcessCrashed {
                    node: self.name.clone(),
                    status: status.to_string(),
                })
            }
        }
    }

    pub fn before_step(&mut self, _ctx: &StepContext) -> PipelineResult<()> {
        self.check_alive()
    }

    pub fn on_step(&mut self, ctx: &StepContext) -> PipelineResult<()> {
        tracing::trace!("Process {:?} serving step {}", self.pid(), ctx.step);
        Ok(())
    }

    pub fn on_finish(&mut self, _ctx: &NodeContext) -> PipelineResult<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        let exit = match child.try_wait()? {
            Some(status) => ProcessExit::Exited(status),
            None => {
                drop(child.stdin.take());
                request_termination(&child);
                wait_or_kill(&mut child, self.config.shutdown_timeout, self.config.poll)?
            }
        };
        kill_leftovers(&child);
        self.exit = Some(exit);

        join_drains(
            std::mem::take(&mut self.drains),
            self.config.shutdown_timeout,
            self.config.poll,
        );

        match exit {
            ProcessExit::Killed => {
                tracing::info!("Process killed after {:?}", self.config.shutdown_timeout);
                Ok(())
            }
            ProcessExit::Terminated(status) => {
                tracing::info!("Process stopped on request: {}", status);
                Ok(())
            }
            ProcessExit::Exited(status) if status.success() => {
                tracing::info!("Process exited cleanly");
                Ok(())
            }
            ProcessExit::Exited(status) => Err(PipelineError::ProcessExit {
                node: self.name.clone(),
                code: status.code().unwrap_or(-1),
            }),
        }
    }
}

fn wait_or_kill(child: &mut Child, timeout: Duration, poll: Duration) -> PipelineResult<ProcessExit> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(classify_stop(status));
        }
        if Instant::now() >= deadline {
            break;
        }
        thread::sleep(poll);
    }

    force_kill(child);
    // Lost the race against a late exit: report the real status
    if let Some(status) = child.try_wait()? {
        if !killed_by_harness(status) {
            return Ok(classify_stop(status));
        }
    }
    child.wait()?;
    Ok(ProcessExit::Killed)
}

/// Wait for the output threads, detaching any still blocked once `timeout`
/// has passed.
fn join_drains(drains: Vec<JoinHandle<()>>, timeout: Duration, poll: Duration) {
    let deadline = Instant::now() + timeout;
    for drain in drains {
        while !drain.is_finished() && Instant::now() < deadline {
            thread::sleep(poll);
        }
        if drain.is_finished() {
            let _ = drain.join();
        } else {
            tracing::warn!(
                "Process output {:?} still open after {:?}, detaching",
                drain.thread().name(),
                timeout
            );
        }
    }
}

#[cfg(unix)]
mod signals {
    use super::ProcessExit;
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{Child, ExitStatus};

    /// Status a JVM exits with after running its shutdown hooks on `SIGTERM`.
    const JVM_TERM_STATUS: i32 = 128 + Signal::SIGTERM as i32;

    fn signal_group(child: &Child, signal: Signal) {
        match killpg(Pid::from_raw(child.id() as i32), signal) {
            Ok(()) => tracing::debug!("Sent {} to process group {}", signal, child.id()),
            Err(Errno::ESRCH) => {}
            Err(e) => tracing::warn!("Failed to send {} to process group {}: {}", signal, child.id(), e),
        }
    }

    pub(super) fn request_termination(child: &Child) {
        signal_group(child, Signal::SIGTERM);
    }

    pub(super) fn force_kill(child: &mut Child) {
        signal_group(child, Signal::SIGKILL);
    }

    pub(super) fn kill_leftovers(child: &Child) {
        signal_group(child, Signal::SIGKILL);
    }

    pub(super) fn killed_by_harness(status: ExitStatus) -> bool {
        status.signal() == Some(Signal::SIGKILL as i32)
    }

    pub(super) fn classify_stop(status: ExitStatus) -> ProcessExit {
        let terminated = status.signal() == Some(Signal::SIGTERM as i32)
            || status.code() == Some(JVM_TERM_STATUS);
        if terminated {
            ProcessExit::Terminated(status)
        } else {
            ProcessExit::Exited(status)
        }
    }
}

#[cfg(not(unix))]
mod signals {
    use super::ProcessExit;
    use std::process::{Child, ExitStatus};

    pub(super) fn request_termination(_child: &Child) {}

    pub(super) fn force_kill(child: &mut Child) {
        if let Err(e) = child.kill() {
            tracing::debug!("Kill failed: {}", e);
        }
    }

    pub(super) fn kill_leftovers(_child: &Child) {}

    pub(super) fn killed_by_harness(_status: ExitStatus) -> bool {
        true
    }

    pub(super) fn classify_stop(status: ExitStatus) -> ProcessExit {
        ProcessExit::Exited(status)
    }
}

use signals::{classify_stop, force_kill, kill_leftovers, killed_by_harness, request_termination};

fn spawn_drain<R>(name: String, source: R, log: Option<SharedLog>) -> PipelineResult<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    let handle = thread::Builder::new().name(name).spawn(move || {
        let mut reader = BufReader::new(source);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line);
                    tracing::trace!(target: "msgpipe_rs::process_output", "{}", text.trim_end());
                    if let Some(log) = &log {
                        let mut log = log.lock().unwrap_or_else(|e| e.into_inner());
                        if let Err(e) = log.write_all(&line) {
                            tracing::warn!("Process log write failed: {}", e);
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!("Process output closed: {}", e);
                    break;
                }
            }
        }
    })?;
    Ok(handle)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::atomic::AtomicBool;

    fn sh(script: &str) -> ProcessConfig {
        ProcessConfig::new("sh").with_args(["-c", script])
    }

    fn node_ctx<'a>(running: &'a Arc<AtomicBool>) -> NodeContext<'a> {
        NodeContext {
            node: "proc",
            running,
        }
    }

    #[test]
    fn test_log_path_appends_restart_index() {
        let config = ProcessConfig::new("java").with_log_file("/tmp/server.log.");
        assert_eq!(config.log_path(1), Some(PathBuf::from("/tmp/server.log.1")));
        assert_eq!(ProcessConfig::new("java").log_path(1), None);
    }

    /// Wait until the drained log shows `needle`, i.e. the script got past
    /// its setup.
    fn wait_for_log(path: &std::path::Path, needle: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if std::fs::read_to_string(path).is_ok_and(|log| log.contains(needle)) {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("{:?} never showed {:?}", path, needle);
    }

    #[test]
    #[serial]
    fn test_output_is_logged_and_clean_exit_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("proc.log.");
        let log = dir.path().join("proc.log.1");
        let running = Arc::new(AtomicBool::new(true));

        let mut node = ExternalProcessNode::new(
            "proc",
            sh("trap 'exit 0' TERM; echo hello; echo oops >&2; while :; do sleep 0.05; done")
                .with_log_file(&prefix),
        );
        node.on_start(&node_ctx(&running)).unwrap();
        assert_eq!(node.restarts(), 1);
        wait_for_log(&log, "oops");
        node.on_finish(&node_ctx(&running)).unwrap();

        assert!(matches!(node.exit(), Some(ProcessExit::Exited(s)) if s.success()));
        let log = std::fs::read_to_string(&log).unwrap();
        assert!(log.contains("hello"));
        assert!(log.contains("oops"));
    }

    #[test]
    #[serial]
    fn test_server_ignoring_stdin_is_asked_to_terminate() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("proc.log.1");
        let running = Arc::new(AtomicBool::new(true));

        let mut node = ExternalProcessNode::new(
            "proc",
            sh("trap 'exit 0' TERM; echo ready; while :; do sleep 0.05; done")
                .with_log_file(dir.path().join("proc.log."))
                .with_shutdown_timeout(Duration::from_secs(10)),
        );
        node.on_start(&node_ctx(&running)).unwrap();
        wait_for_log(&log, "ready");

        let started = Instant::now();
        node.on_finish(&node_ctx(&running)).unwrap();
        assert!(matches!(node.exit(), Some(ProcessExit::Exited(s)) if s.success()));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    #[serial]
    fn test_default_termination_counts_as_clean_stop() {
        let running = Arc::new(AtomicBool::new(true));
        let mut node = ExternalProcessNode::new(
            "proc",
            ProcessConfig::new("sleep")
                .with_args(["30"])
                .with_shutdown_timeout(Duration::from_secs(10)),
        );
        node.on_start(&node_ctx(&running)).unwrap();

        let started = Instant::now();
        node.on_finish(&node_ctx(&running)).unwrap();
        assert!(matches!(node.exit(), Some(ProcessExit::Terminated(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    #[serial]
    fn test_hung_process_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("proc.log.1");
        let running = Arc::new(AtomicBool::new(true));
        let mut node = ExternalProcessNode::new(
            "proc",
            sh("trap '' TERM; echo ready; sleep 30")
                .with_log_file(dir.path().join("proc.log."))
                .with_shutdown_timeout(Duration::from_millis(100)),
        );
        node.on_start(&node_ctx(&running)).unwrap();
        wait_for_log(&log, "ready");

        let started = Instant::now();
        node.on_finish(&node_ctx(&running)).unwrap();
        assert_eq!(node.exit(), Some(ProcessExit::Killed));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    #[serial]
    fn test_wrapper_script_children_do_not_hold_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("proc.log.1");
        let running = Arc::new(AtomicBool::new(true));

        // The wrapper neither execs nor forwards signals; its child ignores TERM
        let mut node = ExternalProcessNode::new(
            "proc",
            sh("echo ready; (trap '' TERM; sleep 8); true")
                .with_log_file(dir.path().join("proc.log."))
                .with_shutdown_timeout(Duration::from_millis(200)),
        );
        node.on_start(&node_ctx(&running)).unwrap();
        wait_for_log(&log, "ready");

        let started = Instant::now();
        node.on_finish(&node_ctx(&running)).unwrap();
        assert!(node.exit().is_some());
        assert!(
            started.elapsed() < Duration::from_secs(4),
            "shutdown took {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn test_jvm_term_status_is_a_requested_stop() {
        use std::os::unix::process::ExitStatusExt;
        // Raw wait statuses: exit code in the high byte, signal in the low bits
        assert!(matches!(
            classify_stop(ExitStatus::from_raw(143 << 8)),
            ProcessExit::Terminated(_)
        ));
        assert!(matches!(
            classify_stop(ExitStatus::from_raw(15)),
            ProcessExit::Terminated(_)
        ));
        assert!(matches!(
            classify_stop(ExitStatus::from_raw(3 << 8)),
            ProcessExit::Exited(s) if s.code() == Some(3)
        ));
    }

    #[test]
    #[serial]
    fn test_crash_between_steps_is_detected() {
        let running = Arc::new(AtomicBool::new(true));
        let mut node = ExternalProcessNode::new("proc", sh("sleep 0.2; exit 3"));
        node.on_start(&node_ctx(&running)).unwrap();
        thread::sleep(Duration::from_millis(800));

        let err = node.check_alive().unwrap_err();
        assert!(err.is_run_fatal());

        let err = node.on_finish(&node_ctx(&running)).unwrap_err();
        assert!(matches!(err, PipelineError::ProcessExit { code: 3, .. }));
    }

    #[test]
    fn test_spawn_failure() {
        let running = Arc::new(AtomicBool::new(true));
        let mut node = ExternalProcessNode::new("proc", ProcessConfig::new("/nonexistent/server"));
        let err = node.on_start(&node_ctx(&running)).unwrap_err();
        assert!(matches!(err, PipelineError::ProcessSpawn { .. }));
        assert!(err.is_run_fatal());
    }
}
