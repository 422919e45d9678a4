//! Side-effect boundary between the provisioning steps and the machine.
//!
//! Steps never touch processes or the filesystem directly; they go through a
//! [`Host`]. [`SystemHost`] performs the work, [`DryRunHost`] only prints it.

use std::env;
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};

use tracing::{debug, warn};

use crate::command::{CommandFailure, CommandOutput, CommandSpec, Invocation, OutputMode};
use crate::errors::{SetupError, SetupResult};

pub trait Host {
    /// Run an invocation to completion.
    fn run(&mut self, invocation: &Invocation) -> Result<CommandOutput, CommandFailure>;

    /// Read a text file; `Ok(None)` when the file does not exist.
    fn read_to_string(&mut self, path: &Path) -> SetupResult<Option<String>>;

    /// Replace a file owned by the invoking user.
    fn write_file(&mut self, path: &Path, contents: &str) -> SetupResult<()>;

    fn append_line(&mut self, path: &Path, line: &str) -> SetupResult<()>;

    /// Create a directory and its parents; existing directories are kept.
    fn create_dir_all(&mut self, path: &Path) -> SetupResult<()>;

    /// Remove a directory tree; a missing directory is not an error.
    fn remove_dir_all(&mut self, path: &Path) -> SetupResult<()>;

    /// Make `dir` searchable for every later command of this process.
    fn prepend_search_path(&mut self, dir: &Path);

    /// Render an invocation the way this host would execute it.
    fn render(&self, invocation: &Invocation) -> String;

    fn is_dry_run(&self) -> bool {
        false
    }
}

/// Executes commands and filesystem operations for real.
pub struct SystemHost {
    use_sudo: bool,
    extra_path: Vec<PathBuf>,
}

impl SystemHost {
    pub fn new(use_sudo: bool) -> Self {
        Self {
            use_sudo,
            extra_path: Vec::new(),
        }
    }

    fn command(&self, spec: &CommandSpec) -> Command {
        let mut command = if spec.elevated && self.use_sudo {
            let mut command = Command::new("sudo");
            command.arg(&spec.program);
            command
        } else {
            Command::new(&spec.program)
        };
        command.args(&spec.args);
        if let Some(dir) = &spec.current_dir {
            command.current_dir(dir);
        }
        if let Some(path) = self.search_path() {
            command.env("PATH", path);
        }
        command
    }

    fn search_path(&self) -> Option<OsString> {
        if self.extra_path.is_empty() {
            return None;
        }
        let inherited = env::var_os("PATH").unwrap_or_default();
        let dirs = self
            .extra_path
            .iter()
            .cloned()
            .chain(env::split_paths(&inherited));
        match env::join_paths(dirs) {
            Ok(joined) => Some(joined),
            Err(err) => {
                warn!(target = "story_setup::host", "unable to extend PATH: {err}");
                None
            }
        }
    }

    fn run_single(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandFailure> {
        let rendered = spec.render(self.use_sudo);
        let mut command = self.command(spec);
        configure_stdio(&mut command, spec.output, spec.stdin.is_some());
        let child = command
            .spawn()
            .map_err(|err| CommandFailure::new(&rendered, format!("failed to spawn: {err}")))?;
        let child = feed_stdin(child, spec.stdin.as_deref()).map_err(|err| {
            CommandFailure::new(&rendered, format!("failed to write stdin: {err}"))
        })?;
        let output = child
            .wait_with_output()
            .map_err(|err| CommandFailure::new(&rendered, format!("failed to wait: {err}")))?;
        finish(&rendered, output.status, &output.stdout, &output.stderr)
    }

    fn run_pipe(
        &self,
        producer: &CommandSpec,
        consumer: &CommandSpec,
    ) -> Result<CommandOutput, CommandFailure> {
        let rendered = format!(
            "{} | {}",
            producer.render(self.use_sudo),
            consumer.render(self.use_sudo)
        );
        let mut upstream = self.command(producer);
        upstream
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        let mut producer_child = upstream.spawn().map_err(|err| {
            CommandFailure::new(&rendered, format!("failed to spawn producer: {err}"))
        })?;
        let pipe = producer_child
            .stdout
            .take()
            .ok_or_else(|| CommandFailure::new(&rendered, "producer stdout was not piped"))?;

        let mut downstream = self.command(consumer);
        configure_stdio(&mut downstream, consumer.output, false);
        downstream.stdin(Stdio::from(pipe));
        let spawned = downstream.spawn();
        // The command still owns the read end of the pipe. Close it so the
        // producer sees EPIPE once the consumer exits.
        drop(downstream);
        let consumer_child = match spawned {
            Ok(child) => child,
            Err(err) => {
                let _ = producer_child.kill();
                let _ = producer_child.wait();
                return Err(CommandFailure::new(
                    &rendered,
                    format!("failed to spawn consumer: {err}"),
                ));
            }
        };

        let output = consumer_child
            .wait_with_output()
            .map_err(|err| CommandFailure::new(&rendered, format!("failed to wait: {err}")))?;
        let producer_status = producer_child
            .wait()
            .map_err(|err| CommandFailure::new(&rendered, format!("failed to wait: {err}")))?;
        if output.status.success() && !producer_status.success() {
            return Err(CommandFailure::new(
                &rendered,
                format!("producer {}", describe_exit(producer_status)),
            )
            .with_output(String::from_utf8_lossy(&output.stderr).into_owned()));
        }
        finish(&rendered, output.status, &output.stdout, &output.stderr)
    }
}

impl Host for SystemHost {
    fn run(&mut self, invocation: &Invocation) -> Result<CommandOutput, CommandFailure> {
        debug!(
            target = "story_setup::host",
            command = %invocation.render(self.use_sudo),
            "executing"
        );
        match invocation {
            Invocation::Single(spec) => self.run_single(spec),
            Invocation::Pipe { producer, consumer } => self.run_pipe(producer, consumer),
        }
    }

    fn read_to_string(&mut self, path: &Path) -> SetupResult<Option<String>> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(SetupError::io(path, err)),
        }
    }

    fn write_file(&mut self, path: &Path, contents: &str) -> SetupResult<()> {
        fs::write(path, contents).map_err(|err| SetupError::io(path, err))
    }

    fn append_line(&mut self, path: &Path, line: &str) -> SetupResult<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| SetupError::io(path, err))?;
        writeln!(file, "\n{line}").map_err(|err| SetupError::io(path, err))
    }

    fn create_dir_all(&mut self, path: &Path) -> SetupResult<()> {
        fs::create_dir_all(path).map_err(|err| SetupError::io(path, err))
    }

    fn remove_dir_all(&mut self, path: &Path) -> SetupResult<()> {
        match fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(SetupError::io(path, err)),
        }
    }

    fn prepend_search_path(&mut self, dir: &Path) {
        if !self.extra_path.iter().any(|existing| existing == dir) {
            self.extra_path.insert(0, dir.to_path_buf());
        }
    }

    fn render(&self, invocation: &Invocation) -> String {
        invocation.render(self.use_sudo)
    }
}

/// Prints the plan without touching the machine. Reads still hit the real
/// filesystem so configuration patches can be previewed.
pub struct DryRunHost {
    use_sudo: bool,
}

impl DryRunHost {
    pub fn new(use_sudo: bool) -> Self {
        Self { use_sudo }
    }

    fn announce(&self, line: impl AsRef<str>) {
        println!("[dry-run] {}", line.as_ref());
    }
}

impl Host for DryRunHost {
    fn run(&mut self, invocation: &Invocation) -> Result<CommandOutput, CommandFailure> {
        let mut line = invocation.render(self.use_sudo);
        if let Invocation::Single(CommandSpec {
            stdin: Some(input), ..
        }) = invocation
        {
            line.push_str(&format!(" <<< ({} bytes)", input.len()));
        }
        self.announce(line);
        Ok(CommandOutput::default())
    }

    fn read_to_string(&mut self, path: &Path) -> SetupResult<Option<String>> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(SetupError::io(path, err)),
        }
    }

    fn write_file(&mut self, path: &Path, contents: &str) -> SetupResult<()> {
        self.announce(format!("write {} ({} bytes)", path.display(), contents.len()));
        Ok(())
    }

    fn append_line(&mut self, path: &Path, line: &str) -> SetupResult<()> {
        self.announce(format!("append to {}: {line}", path.display()));
        Ok(())
    }

    fn create_dir_all(&mut self, path: &Path) -> SetupResult<()> {
        self.announce(format!("create directory {}", path.display()));
        Ok(())
    }

    fn remove_dir_all(&mut self, path: &Path) -> SetupResult<()> {
        self.announce(format!("remove directory {}", path.display()));
        Ok(())
    }

    fn prepend_search_path(&mut self, dir: &Path) {
        self.announce(format!("prepend {} to PATH", dir.display()));
    }

    fn render(&self, invocation: &Invocation) -> String {
        invocation.render(self.use_sudo)
    }

    fn is_dry_run(&self) -> bool {
        true
    }
}

fn configure_stdio(command: &mut Command, mode: OutputMode, has_stdin: bool) {
    command.stdin(if has_stdin { Stdio::piped() } else { Stdio::null() });
    match mode {
        OutputMode::Capture | OutputMode::Quiet => {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        OutputMode::Inherit => {
            command.stdin(if has_stdin { Stdio::piped() } else { Stdio::inherit() });
            command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }
    }
}

fn feed_stdin(mut child: Child, input: Option<&str>) -> io::Result<Child> {
    if let Some(input) = input {
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes())?;
        }
    }
    Ok(child)
}

fn finish(
    rendered: &str,
    status: ExitStatus,
    stdout: &[u8],
    stderr: &[u8],
) -> Result<CommandOutput, CommandFailure> {
    let stdout = String::from_utf8_lossy(stdout).into_owned();
    if status.success() {
        return Ok(CommandOutput { stdout });
    }
    let mut output = String::from_utf8_lossy(stderr).into_owned();
    if !stdout.trim().is_empty() {
        if !output.is_empty() && !output.ends_with('\n') {
            output.push('\n');
        }
        output.push_str(&stdout);
    }
    Err(CommandFailure::new(rendered, describe_exit(status)).with_output(output))
}

fn describe_exit(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit status {code}"),
        None => "terminated by signal".to_string(),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory host recording every side effect in order.

    use std::collections::{BTreeMap, BTreeSet};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Event {
        Run(String),
        Write(PathBuf),
        Append(PathBuf, String),
        CreateDir(PathBuf),
        RemoveDir(PathBuf),
        SearchPath(PathBuf),
    }

    #[derive(Default)]
    pub struct RecordingHost {
        pub events: Vec<Event>,
        pub files: BTreeMap<PathBuf, String>,
        pub dirs: BTreeSet<PathBuf>,
        pub stdin: BTreeMap<String, String>,
        failing: Vec<String>,
        responses: Vec<(String, String)>,
    }

    impl RecordingHost {
        pub fn new() -> Self {
            Self::default()
        }

        /// Commands whose rendered line contains `needle` exit with status 1.
        pub fn fail_on(mut self, needle: &str) -> Self {
            self.failing.push(needle.to_string());
            self
        }

        /// Commands whose rendered line contains `needle` print `stdout`.
        pub fn respond(mut self, needle: &str, stdout: &str) -> Self {
            self.responses.push((needle.to_string(), stdout.to_string()));
            self
        }

        pub fn with_file(mut self, path: impl Into<PathBuf>, contents: &str) -> Self {
            self.files.insert(path.into(), contents.to_string());
            self
        }

        pub fn commands(&self) -> Vec<String> {
            self.events
                .iter()
                .filter_map(|event| match event {
                    Event::Run(line) => Some(line.clone()),
                    _ => None,
                })
                .collect()
        }

        pub fn position(&self, wanted: &Event) -> usize {
            self.events
                .iter()
                .position(|event| event == wanted)
                .unwrap_or_else(|| panic!("event {wanted:?} not recorded in {:#?}", self.events))
        }

        pub fn run_position(&self, line: &str) -> usize {
            self.position(&Event::Run(line.to_string()))
        }
    }

    impl Host for RecordingHost {
        fn run(&mut self, invocation: &Invocation) -> Result<CommandOutput, CommandFailure> {
            let line = invocation.render(true);
            self.events.push(Event::Run(line.clone()));
            if let Invocation::Single(CommandSpec {
                stdin: Some(input), ..
            }) = invocation
            {
                self.stdin.insert(line.clone(), input.clone());
            }
            if self.failing.iter().any(|needle| line.contains(needle.as_str())) {
                return Err(
                    CommandFailure::new(&line, "exit status 1").with_output("simulated failure")
                );
            }
            let stdout = self
                .responses
                .iter()
                .find(|(needle, _)| line.contains(needle.as_str()))
                .map(|(_, stdout)| stdout.clone())
                .unwrap_or_default();
            Ok(CommandOutput { stdout })
        }

        fn read_to_string(&mut self, path: &Path) -> SetupResult<Option<String>> {
            Ok(self.files.get(path).cloned())
        }

        fn write_file(&mut self, path: &Path, contents: &str) -> SetupResult<()> {
            self.events.push(Event::Write(path.to_path_buf()));
            self.files.insert(path.to_path_buf(), contents.to_string());
            Ok(())
        }

        fn append_line(&mut self, path: &Path, line: &str) -> SetupResult<()> {
            self.events
                .push(Event::Append(path.to_path_buf(), line.to_string()));
            let entry = self.files.entry(path.to_path_buf()).or_default();
            entry.push('\n');
            entry.push_str(line);
            entry.push('\n');
            Ok(())
        }

        fn create_dir_all(&mut self, path: &Path) -> SetupResult<()> {
            self.events.push(Event::CreateDir(path.to_path_buf()));
            self.dirs.insert(path.to_path_buf());
            Ok(())
        }

        fn remove_dir_all(&mut self, path: &Path) -> SetupResult<()> {
            self.events.push(Event::RemoveDir(path.to_path_buf()));
            self.dirs.retain(|dir| !dir.starts_with(path));
            Ok(())
        }

        fn prepend_search_path(&mut self, dir: &Path) {
            self.events.push(Event::SearchPath(dir.to_path_buf()));
        }

        fn render(&self, invocation: &Invocation) -> String {
            invocation.render(true)
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn captures_stdout_of_successful_commands() {
        let mut host = SystemHost::new(false);
        let output = host
            .run(&CommandSpec::new("echo").arg("hello").into())
            .expect("echo succeeds");
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[test]
    fn non_zero_exit_is_reported_with_stderr() {
        let mut host = SystemHost::new(false);
        let failure = host
            .run(&CommandSpec::new("sh").args(["-c", "echo boom >&2; exit 3"]).into())
            .expect_err("command fails");
        assert_eq!(failure.reason, "exit status 3");
        assert!(failure.output.contains("boom"));
    }

    #[test]
    fn missing_program_is_a_failure_not_a_panic() {
        let mut host = SystemHost::new(false);
        let failure = host
            .run(&CommandSpec::new("definitely-not-a-real-tool-4711").into())
            .expect_err("spawn fails");
        assert!(failure.reason.starts_with("failed to spawn"));
    }

    #[test]
    fn pipe_streams_producer_into_consumer() {
        let mut host = SystemHost::new(false);
        let output = host
            .run(&Invocation::pipe(
                CommandSpec::new("printf").arg("alpha\\nbeta\\n"),
                CommandSpec::new("grep").arg("beta"),
            ))
            .expect("pipe succeeds");
        assert_eq!(output.stdout.trim(), "beta");
    }

    #[test]
    fn stdin_is_delivered_to_the_command() {
        let mut host = SystemHost::new(false);
        let output = host
            .run(&CommandSpec::new("cat").stdin("unit body").into())
            .expect("cat succeeds");
        assert_eq!(output.stdout, "unit body");
    }

    #[test]
    fn removing_a_missing_directory_succeeds() {
        let mut host = SystemHost::new(false);
        let dir =
            std::env::temp_dir().join(format!("story-setup-missing-{}", std::process::id()));
        host.remove_dir_all(&dir).expect("missing dir is fine");
    }

    #[test]
    fn failing_producer_fails_the_pipe() {
        let mut host = SystemHost::new(false);
        let failure = host
            .run(&Invocation::pipe(
                CommandSpec::new("sh").args(["-c", "exit 3"]),
                CommandSpec::new("cat"),
            ))
            .expect_err("producer failure is reported");
        assert_eq!(failure.reason, "producer exit status 3");
        assert_eq!(failure.command, "sh -c 'exit 3' | cat");
    }

    #[test]
    fn pipe_returns_when_the_consumer_exits_early() {
        let (sender, receiver) = mpsc::channel();
        thread::spawn(move || {
            let mut host = SystemHost::new(false);
            let result = host.run(&Invocation::pipe(
                CommandSpec::new("yes"),
                CommandSpec::new("false"),
            ));
            let _ = sender.send(result);
        });

        let result = receiver
            .recv_timeout(Duration::from_secs(20))
            .expect("pipe finishes after the consumer exits");
        let failure = result.expect_err("consumer failure is reported");
        assert_eq!(failure.reason, "exit status 1");
    }
}
