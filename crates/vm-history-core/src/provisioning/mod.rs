//! # Provisioning Executor
//!
//! Runs the external infrastructure-as-code tool (Terraform by default) as a
//! subprocess and records each invocation through the [`OperationTracker`].
//!
//! - Exit code 0 completes the event as `SUCCESS` with the parsed output.
//! - A nonzero exit completes it as `FAILED` with stderr as the error detail.
//! - Values of sensitive variables and outputs are masked inside the
//!   recorded stdout and stderr.
//! - Exceeding the configured timeout kills the child and records a
//!   `timeout` failure.
//!
//! Callers get a `Result`; [`ProvisioningOutcome`] offers the flattened
//! `(success, result_or_error)` view for code that prefers not to match.

use crate::history::{EventType, FailureKind};
use crate::masking::SensitiveDataMasker;
use crate::tracker::{OperationTracker, TrackingSpec};
use crate::{CredentialId, UserId, VmId};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, info_span, warn, Span};

pub mod output;

pub use output::{IpAddresses, ParsedOutput};

/// File written by [`VariableInjection::VarsFile`]
pub const VARS_FILE_NAME: &str = "terraform.tfvars.json";

/// Environment prefix used by [`VariableInjection::Environment`]
pub const VARIABLE_ENV_PREFIX: &str = "TF_VAR_";

// ============================================================================
// Commands
// ============================================================================

/// Provisioning tool subcommand
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProvisioningCommand {
    Apply,
    Destroy,
    Plan,
    Init,
    Output,
    /// Passed to the tool verbatim without extra flags
    Other(String),
}

impl ProvisioningCommand {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
            Self::Plan => "plan",
            Self::Init => "init",
            Self::Output => "output",
            Self::Other(command) => command,
        }
    }

    /// Known subcommands by name, anything else as [`Self::Other`]
    pub fn from_name(name: &str) -> Self {
        match name.trim() {
            "apply" => Self::Apply,
            "destroy" => Self::Destroy,
            "plan" => Self::Plan,
            "init" => Self::Init,
            "output" => Self::Output,
            other => Self::Other(other.to_string()),
        }
    }

    /// Full argument list for the tool, non-interactive where applicable
    pub fn args(&self) -> Vec<String> {
        let flags: &[&str] = match self {
            Self::Apply | Self::Destroy => &["-auto-approve", "-input=false", "-no-color"],
            Self::Plan | Self::Init => &["-input=false", "-no-color"],
            Self::Output => &["-no-color"],
            Self::Other(_) => &[],
        };

        std::iter::once(self.as_str())
            .chain(flags.iter().copied())
            .map(str::to_string)
            .collect()
    }

    /// Event type recorded when the request does not name one
    pub fn default_event_type(&self) -> EventType {
        match self {
            Self::Destroy => EventType::TerraformDestroy,
            Self::Plan => EventType::TerraformPlan,
            Self::Init => EventType::TerraformInit,
            Self::Apply | Self::Output | Self::Other(_) => EventType::TerraformApply,
        }
    }
}

impl fmt::Display for ProvisioningCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProvisioningCommand {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_name(s))
    }
}

impl Serialize for ProvisioningCommand {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ProvisioningCommand {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::from_name(&raw))
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// How request variables reach the tool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableInjection {
    /// One `TF_VAR_<name>` environment variable per entry
    #[default]
    Environment,
    /// A `terraform.tfvars.json` file in the working directory
    VarsFile,
}

/// Provisioning tool settings
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Executable to run
    pub program: String,
    /// Arguments placed before the subcommand
    pub program_args: Vec<String>,
    pub timeout_seconds: u64,
    pub variable_injection: VariableInjection,
    /// Provider credentials exported to every invocation, never recorded
    pub extra_env: BTreeMap<String, String>,
}

impl ProvisioningConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            program: "terraform".to_string(),
            program_args: Vec::new(),
            timeout_seconds: 1800,
            variable_injection: VariableInjection::Environment,
            extra_env: BTreeMap::new(),
        }
    }
}

impl fmt::Debug for ProvisioningConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisioningConfig")
            .field("program", &self.program)
            .field("program_args", &self.program_args)
            .field("timeout_seconds", &self.timeout_seconds)
            .field("variable_injection", &self.variable_injection)
            .field("extra_env", &self.extra_env.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ============================================================================
// Requests and Results
// ============================================================================

/// One tool invocation
///
/// Serializes to the parameters recorded on the event: `command`,
/// `working_dir` and `variables`. Identifiers and the per-request
/// environment are not part of the snapshot.
#[derive(Clone, Serialize)]
pub struct ProvisioningRequest {
    pub command: ProvisioningCommand,
    pub working_dir: PathBuf,
    pub variables: Map<String, Value>,

    #[serde(skip)]
    pub event_type: Option<EventType>,
    #[serde(skip)]
    pub user_id: Option<UserId>,
    #[serde(skip)]
    pub vm_id: Option<VmId>,
    #[serde(skip)]
    pub credential_id: Option<CredentialId>,
    /// Provider credentials for this invocation only
    #[serde(skip)]
    pub env: BTreeMap<String, String>,
}

impl ProvisioningRequest {
    pub fn new(command: ProvisioningCommand, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command,
            working_dir: working_dir.into(),
            variables: Map::new(),
            event_type: None,
            user_id: None,
            vm_id: None,
            credential_id: None,
            env: BTreeMap::new(),
        }
    }

    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn with_event_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn for_user(mut self, user_id: Option<UserId>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn for_vm(mut self, vm_id: Option<VmId>) -> Self {
        self.vm_id = vm_id;
        self
    }

    pub fn with_credential(mut self, credential_id: Option<CredentialId>) -> Self {
        self.credential_id = credential_id;
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    /// `TF_VAR_*` environment for the variables
    ///
    /// Strings are passed raw, every other value as JSON.
    pub fn variable_env(&self) -> Vec<(String, String)> {
        self.variables
            .iter()
            .map(|(name, value)| {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (format!("{}{}", VARIABLE_ENV_PREFIX, name), rendered)
            })
            .collect()
    }
}

impl fmt::Debug for ProvisioningRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisioningRequest")
            .field("command", &self.command)
            .field("working_dir", &self.working_dir)
            .field("variables", &self.variables.keys().collect::<Vec<_>>())
            .field("event_type", &self.event_type)
            .field("user_id", &self.user_id)
            .field("vm_id", &self.vm_id)
            .finish_non_exhaustive()
    }
}

/// Captured output of a successful invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningResult {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    #[serde(flatten)]
    pub parsed: ParsedOutput,
}

impl ProvisioningResult {
    pub fn instance_id(&self) -> Option<&str> {
        self.parsed.instance_id.as_deref()
    }

    /// Copy with every known secret masked in the captured streams
    fn redacted(&self, redactor: &OutputRedactor<'_>) -> Self {
        Self {
            stdout: redactor.redact(&self.stdout),
            stderr: redactor.redact(&self.stderr),
            ..self.clone()
        }
    }
}

/// Why an invocation did not succeed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisioningFailure {
    #[error("{command} exited with code {code}")]
    NonZeroExit {
        command: String,
        code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("{command} timed out after {after_seconds}s")]
    Timeout { command: String, after_seconds: u64 },

    #[error("Failed to run {program}: {message}")]
    Spawn { program: String, message: String },

    #[error("Failed to prepare working directory {path}: {message}")]
    Workspace { path: String, message: String },
}

impl ProvisioningFailure {
    /// Failure kind recorded on the event
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::NonZeroExit { .. } => FailureKind::NonZeroExit,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::Spawn { .. } | Self::Workspace { .. } => FailureKind::Spawn,
        }
    }

    /// Extended diagnostics, the tool's stderr for nonzero exits
    pub fn detail(&self) -> Option<String> {
        match self {
            Self::NonZeroExit { stderr, .. } if !stderr.trim().is_empty() => Some(stderr.clone()),
            _ => None,
        }
    }

    /// Captured stdout, empty when the tool never completed
    pub fn stdout(&self) -> &str {
        match self {
            Self::NonZeroExit { stdout, .. } => stdout,
            _ => "",
        }
    }
}

/// Flattened outcome: `success` plus either the result or the error
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProvisioningOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ProvisioningResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
}

impl From<Result<ProvisioningResult, ProvisioningFailure>> for ProvisioningOutcome {
    fn from(result: Result<ProvisioningResult, ProvisioningFailure>) -> Self {
        match result {
            Ok(result) => Self {
                success: true,
                result: Some(result),
                error: None,
                error_detail: None,
                failure_kind: None,
            },
            Err(failure) => Self {
                success: false,
                result: None,
                error: Some(failure.to_string()),
                error_detail: failure.detail(),
                failure_kind: Some(failure.kind()),
            },
        }
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Runs tool invocations under the operation tracker
#[derive(Debug, Clone)]
pub struct ProvisioningExecutor {
    tracker: OperationTracker,
    config: ProvisioningConfig,
    span: Span,
}

impl ProvisioningExecutor {
    pub fn new(tracker: OperationTracker, config: ProvisioningConfig) -> Self {
        let span = info_span!("provisioning_executor", program = %config.program);
        Self {
            tracker,
            config,
            span,
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> &ProvisioningConfig {
        &self.config
    }

    /// Run one invocation and record it
    ///
    /// # Errors
    ///
    /// Returns [`ProvisioningFailure`] when the tool cannot be started,
    /// exits nonzero or exceeds the timeout. The event is completed before
    /// the error is returned.
    pub async fn execute(
        &self,
        request: ProvisioningRequest,
    ) -> Result<ProvisioningResult, ProvisioningFailure> {
        let spec = tracking_spec(&request);
        let invocation = self.tracker.start(&spec, &request).await;

        match self.run_tool(&request).await {
            Ok(result) => {
                info!(
                    parent: &self.span,
                    command = %request.command,
                    elapsed_ms = invocation.elapsed().as_millis() as u64,
                    "Provisioning command succeeded"
                );
                let redactor = OutputRedactor::new(self.tracker.masker(), &request, &result.stdout);
                invocation.succeed(&result.redacted(&redactor)).await;
                Ok(result)
            }
            Err(failure) => {
                warn!(
                    parent: &self.span,
                    command = %request.command,
                    kind = ?failure.kind(),
                    error = %failure,
                    "Provisioning command failed"
                );
                let redactor = OutputRedactor::new(self.tracker.masker(), &request, failure.stdout());
                let detail = failure.detail().map(|detail| redactor.redact(&detail));
                invocation
                    .fail(failure.kind(), failure.to_string(), detail)
                    .await;
                Err(failure)
            }
        }
    }

    /// [`execute`](Self::execute) flattened into a [`ProvisioningOutcome`]
    pub async fn execute_outcome(&self, request: ProvisioningRequest) -> ProvisioningOutcome {
        self.execute(request).await.into()
    }

    async fn run_tool(
        &self,
        request: &ProvisioningRequest,
    ) -> Result<ProvisioningResult, ProvisioningFailure> {
        ensure_working_dir(&request.working_dir).await?;

        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.program_args)
            .args(request.command.args())
            .current_dir(&request.working_dir)
            .envs(&self.config.extra_env)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match self.config.variable_injection {
            VariableInjection::Environment => {
                command.envs(request.variable_env());
            }
            VariableInjection::VarsFile => {
                write_vars_file(&request.working_dir, &request.variables).await?;
            }
        }

        let child = command.spawn().map_err(|e| ProvisioningFailure::Spawn {
            program: self.config.program.clone(),
            message: e.to_string(),
        })?;

        // Dropping the pending wait kills the child
        let limit = self.config.timeout();
        let output = match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| ProvisioningFailure::Spawn {
                program: self.config.program.clone(),
                message: e.to_string(),
            })?,
            Err(_) => {
                return Err(ProvisioningFailure::Timeout {
                    command: request.command.to_string(),
                    after_seconds: self.config.timeout_seconds,
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        // Killed by a signal
        let exit_code = output.status.code().unwrap_or(-1);

        if !output.status.success() {
            return Err(ProvisioningFailure::NonZeroExit {
                command: request.command.to_string(),
                code: exit_code,
                stdout,
                stderr,
            });
        }

        Ok(ProvisioningResult {
            command: request.command.to_string(),
            exit_code,
            parsed: output::parse_output(&request.command, &stdout),
            stdout,
            stderr,
        })
    }
}

// ============================================================================
// Output Redaction
// ============================================================================

/// Masks secret values wherever they appear in free-form tool output
///
/// Secrets are the values of sensitive variables and of sensitive entries
/// in the `Outputs:` block.
struct OutputRedactor<'a> {
    masker: &'a SensitiveDataMasker,
    secrets: Vec<String>,
}

impl<'a> OutputRedactor<'a> {
    fn new(masker: &'a SensitiveDataMasker, request: &ProvisioningRequest, stdout: &str) -> Self {
        let variables = request
            .variables
            .iter()
            .filter(|(name, _)| masker.is_sensitive_key(name))
            .map(|(_, value)| match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        let outputs = output::output_values(stdout)
            .into_iter()
            .filter(|(name, _)| masker.is_sensitive_key(name))
            .map(|(_, value)| value);

        let mut secrets: Vec<String> = variables.chain(outputs).filter(|s| !s.is_empty()).collect();
        // Longest first so a secret containing another is replaced whole
        secrets.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        secrets.dedup();

        Self { masker, secrets }
    }

    fn redact(&self, text: &str) -> String {
        self.secrets.iter().fold(text.to_string(), |text, secret| {
            text.replace(secret.as_str(), &self.masker.mask_value(secret))
        })
    }
}

fn tracking_spec(request: &ProvisioningRequest) -> TrackingSpec<ProvisioningRequest> {
    let user_id = request.user_id;
    let vm_id = request.vm_id;
    let credential_id = request.credential_id;

    TrackingSpec::new(
        request
            .event_type
            .unwrap_or_else(|| request.command.default_event_type()),
    )
    .user_id(move |_| Ok(user_id))
    .vm_id(move |_| Ok(vm_id))
    .credential_id(move |_| Ok(credential_id))
}

async fn ensure_working_dir(path: &Path) -> Result<(), ProvisioningFailure> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(workspace_error(path, "not a directory")),
        Err(e) => Err(workspace_error(path, &e.to_string())),
    }
}

async fn write_vars_file(
    working_dir: &Path,
    variables: &Map<String, Value>,
) -> Result<(), ProvisioningFailure> {
    let json = serde_json::to_vec_pretty(variables)
        .map_err(|e| workspace_error(working_dir, &e.to_string()))?;

    tokio::fs::write(working_dir.join(VARS_FILE_NAME), json)
        .await
        .map_err(|e| workspace_error(working_dir, &e.to_string()))
}

fn workspace_error(path: &Path, message: &str) -> ProvisioningFailure {
    ProvisioningFailure::Workspace {
        path: path.display().to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
