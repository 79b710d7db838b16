//! Stages backed by an external process.
//!
//! The argument vector is realized once per item, before anything is
//! spawned; a realization error therefore never reaches the tool. The
//! process is then run up to `max_tries` times until it exits with one of
//! the accepted codes.

use super::Stage;
use crate::context::{Item, ItemTemplate};
use crate::core::{StageKind, StageOutput};
use crate::errors::PipelineError;
use async_trait::async_trait;
use std::fmt::Debug;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Number of trailing stderr lines kept in logs for a failed attempt.
const STDERR_TAIL_LINES: usize = 20;

/// Produces the argument vector (program first) for one item.
pub trait ArgsRealizer: Send + Sync + Debug {
    /// Realizes the arguments; may record derived values on the item.
    ///
    /// # Errors
    ///
    /// Returns an error when the item cannot be turned into a command line.
    fn realize(&self, item: &mut Item) -> Result<Vec<String>, PipelineError>;

    /// The argument layout without the program, per-item parts left as
    /// `{key}` placeholders.
    fn layout(&self) -> String;
}

/// Arguments given as a list of templates.
#[derive(Debug, Clone)]
pub struct TemplateArgs(pub Vec<ItemTemplate>);

impl TemplateArgs {
    /// Creates template arguments from string templates.
    #[must_use]
    pub fn new(args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self(args.into_iter().map(|a| ItemTemplate::new(a)).collect())
    }
}

impl ArgsRealizer for TemplateArgs {
    fn realize(&self, item: &mut Item) -> Result<Vec<String>, PipelineError> {
        self.0.iter().map(|t| t.realize(item)).collect()
    }

    fn layout(&self) -> String {
        self.0
            .iter()
            .skip(1)
            .map(ItemTemplate::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A fully realized command ready to spawn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Data written to the process's stdin.
    pub stdin: Option<String>,
}

impl Invocation {
    /// Creates an invocation from an argument vector.
    #[must_use]
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            ..Self::default()
        }
    }
}

/// Result of a process run that ended with an accepted exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// The accepted exit code.
    pub exit_code: i32,
    /// Attempts it took.
    pub attempts: usize,
}

/// Exit-code allow-list and retry bound for a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessPolicy {
    /// Total attempts, including the first.
    pub max_tries: usize,
    /// Exit codes counted as success.
    pub accept_on_exit_code: Vec<i32>,
    /// Pause between attempts.
    pub retry_delay: Duration,
}

impl Default for ProcessPolicy {
    fn default() -> Self {
        Self {
            max_tries: 1,
            accept_on_exit_code: vec![0],
            retry_delay: Duration::from_secs(30),
        }
    }
}

impl ProcessPolicy {
    /// Short stable description used in fingerprints.
    #[must_use]
    pub fn describe(&self) -> String {
        format!(
            "tries={} accept={:?} delay_ms={}",
            self.max_tries,
            self.accept_on_exit_code,
            self.retry_delay.as_millis()
        )
    }

    /// Returns true if `code` is an accepted outcome.
    #[must_use]
    pub fn accepts(&self, code: i32) -> bool {
        self.accept_on_exit_code.contains(&code)
    }

    /// Runs the invocation until it exits with an accepted code.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Process` after `max_tries` failed attempts.
    /// A missing argument vector fails immediately.
    pub async fn run(
        &self,
        name: &str,
        item: &mut Item,
        invocation: &Invocation,
    ) -> Result<ProcessOutcome, PipelineError> {
        let Some((program, args)) = invocation.argv.split_first() else {
            return Err(PipelineError::Process {
                name: name.to_string(),
                exit_code: None,
                attempts: 0,
                reason: "empty argument vector".to_string(),
            });
        };

        let max_tries = self.max_tries.max(1);
        let mut last_code = None;
        let mut last_reason = String::new();

        for attempt in 1..=max_tries {
            tracing::debug!(stage = name, attempt, program = %program, "Spawning process");

            match spawn_once(program, args, invocation).await {
                Ok((code, stderr_tail)) => {
                    last_code = code;
                    if let Some(code) = code.filter(|c| self.accepts(*c)) {
                        if code != 0 {
                            tracing::info!(stage = name, exit_code = code, "Process finished with accepted exit code");
                        }
                        return Ok(ProcessOutcome {
                            exit_code: code,
                            attempts: attempt,
                        });
                    }
                    last_reason = code.map_or_else(
                        || "terminated by signal".to_string(),
                        |c| format!("exit code {c}"),
                    );
                    if !stderr_tail.is_empty() {
                        tracing::debug!(stage = name, stderr = %stderr_tail, "Process stderr");
                    }
                }
                Err(e) => {
                    last_code = None;
                    last_reason = format!("could not start {program}: {e}");
                }
            }

            item.log_output(format!(
                "Process {name} failed ({last_reason}), attempt {attempt} of {max_tries}."
            ));

            if attempt < max_tries {
                item.log_output(format!("Retrying {name} after {} seconds...", self.retry_delay.as_secs()));
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        tracing::error!(stage = name, attempts = max_tries, reason = %last_reason, "Process failed");
        Err(PipelineError::Process {
            name: name.to_string(),
            exit_code: last_code,
            attempts: max_tries,
            reason: last_reason,
        })
    }
}

async fn spawn_once(
    program: &str,
    args: &[String],
    invocation: &Invocation,
) -> std::io::Result<(Option<i32>, String)> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(if invocation.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(ref cwd) = invocation.cwd {
        cmd.current_dir(cwd);
    }

    let mut child = cmd.spawn()?;
    if let (Some(input), Some(mut stdin)) = (invocation.stdin.as_ref(), child.stdin.take()) {
        // A tool may exit without reading its input.
        match stdin.write_all(input.as_bytes()).await {
            Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e),
            _ => {}
        }
        drop(stdin);
    }

    let output = child.wait_with_output().await?;
    let stderr = String::from_utf8_lossy(&output.stderr);
    let lines: Vec<&str> = stderr.lines().collect();
    let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");

    Ok((output.status.code(), tail))
}

/// A generic stage that runs an external tool for each item.
#[derive(Debug)]
pub struct ExternalProcess {
    name: String,
    kind: StageKind,
    args: Box<dyn ArgsRealizer>,
    env: Vec<(String, ItemTemplate)>,
    cwd: Option<ItemTemplate>,
    policy: ProcessPolicy,
}

impl ExternalProcess {
    /// Creates a process stage.
    pub fn new(name: impl Into<String>, args: impl ArgsRealizer + 'static) -> Self {
        Self {
            name: name.into(),
            kind: StageKind::Transfer,
            args: Box::new(args),
            env: Vec::new(),
            cwd: None,
            policy: ProcessPolicy::default(),
        }
    }

    /// Sets the total number of attempts.
    #[must_use]
    pub fn with_max_tries(mut self, max_tries: usize) -> Self {
        self.policy.max_tries = max_tries;
        self
    }

    /// Sets the accepted exit codes.
    #[must_use]
    pub fn with_accept_on_exit_code(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        self.policy.accept_on_exit_code = codes.into_iter().collect();
        self
    }

    /// Sets the delay between attempts.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.policy.retry_delay = delay;
        self
    }

    /// Adds an environment variable realized from the item.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<ItemTemplate>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the working directory, realized from the item.
    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<ItemTemplate>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Sets the stage kind.
    #[must_use]
    pub fn with_kind(mut self, kind: StageKind) -> Self {
        self.kind = kind;
        self
    }

    /// Returns the process policy.
    #[must_use]
    pub fn policy(&self) -> &ProcessPolicy {
        &self.policy
    }

    /// Realizes the full invocation for an item without running it.
    ///
    /// # Errors
    ///
    /// Returns the realization error of the arguments or any template.
    pub fn realize(&self, item: &mut Item) -> Result<Invocation, PipelineError> {
        let argv = self.args.realize(item)?;
        let env = self
            .env
            .iter()
            .map(|(k, v)| Ok((k.clone(), v.realize(item)?)))
            .collect::<Result<Vec<_>, PipelineError>>()?;
        let cwd = self
            .cwd
            .as_ref()
            .map(|t| t.realize(item).map(PathBuf::from))
            .transpose()?;

        Ok(Invocation {
            argv,
            env,
            cwd,
            stdin: None,
        })
    }
}

#[async_trait]
impl Stage for ExternalProcess {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        self.kind
    }

    fn fingerprint(&self) -> String {
        let env: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| format!("{k}={}", v.as_str()))
            .collect();
        format!(
            "args=[{}] env=[{}] {}",
            self.args.layout(),
            env.join(" "),
            self.policy.describe()
        )
    }

    async fn execute(&self, item: &mut Item) -> Result<StageOutput, PipelineError> {
        let invocation = self.realize(item)?;
        let outcome = self.policy.run(&self.name, item, &invocation).await?;

        Ok(StageOutput::ok()
            .with_metadata("exit_code", serde_json::json!(outcome.exit_code))
            .with_metadata("attempts", serde_json::json!(outcome.attempts)))
    }
}
