use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CodexError;
use crate::options::SandboxMode;

/// Default cap on a single output line.
pub const DEFAULT_MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

const ORIGINATOR_ENV: &str = "CODEX_INTERNAL_ORIGINATOR_OVERRIDE";
const ORIGINATOR: &str = "codex_sdk_rs";

/// Everything one `codex exec` invocation needs.
#[derive(Debug, Clone, Default)]
pub struct ExecArgs {
    pub input: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    /// Set when resuming an existing thread.
    pub thread_id: Option<String>,
    pub model: Option<String>,
    pub sandbox_mode: Option<SandboxMode>,
    pub working_directory: Option<PathBuf>,
    pub skip_git_repo_check: bool,
    pub output_schema_path: Option<PathBuf>,
    pub images: Vec<PathBuf>,
    pub config_overrides: BTreeMap<String, Value>,
}

/// Receives each non-blank output line, in order.
///
/// Returning an error stops the run and terminates the process.
#[async_trait]
pub trait LineHandler: Send {
    async fn handle_line(&mut self, line: String) -> Result<(), CodexError>;
}

/// Launches one `codex exec` per call and feeds its output to `handler`.
#[async_trait]
pub trait ExecRunner: Send + Sync {
    async fn run(
        &self,
        args: ExecArgs,
        cancel: CancellationToken,
        handler: &mut dyn LineHandler,
    ) -> Result<(), CodexError>;
}

// --- Command line ---

pub fn build_command_args(args: &ExecArgs) -> Vec<OsString> {
    let mut out: Vec<OsString> = vec!["exec".into(), "--experimental-json".into()];

    if let Some(profile) = args.config_overrides.get("profile") {
        out.push("--profile".into());
        out.push(override_value(profile).into());
    }
    // BTreeMap iteration is already key-sorted.
    for (key, value) in args.config_overrides.iter().filter(|(k, _)| *k != "profile") {
        out.push("-c".into());
        out.push(format!("{key}={}", override_value(value)).into());
    }

    if let Some(model) = &args.model {
        out.push("--model".into());
        out.push(model.into());
    }
    if let Some(mode) = args.sandbox_mode {
        out.push("--sandbox".into());
        out.push(mode.as_str().into());
    }
    if let Some(dir) = &args.working_directory {
        out.push("--cd".into());
        out.push(dir.into());
    }
    if args.skip_git_repo_check {
        out.push("--skip-git-repo-check".into());
    }
    if let Some(path) = &args.output_schema_path {
        out.push("--output-schema".into());
        out.push(path.into());
    }
    for image in &args.images {
        out.push("--image".into());
        out.push(image.into());
    }
    if let Some(id) = &args.thread_id {
        out.push("resume".into());
        out.push(id.into());
    }
    out
}

fn override_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Variables added on top of the inherited environment.
pub fn build_env(base_url: Option<&str>, api_key: Option<&str>) -> Vec<(String, String)> {
    let mut env = Vec::new();
    if std::env::var_os(ORIGINATOR_ENV).is_none() {
        env.push((ORIGINATOR_ENV.to_string(), ORIGINATOR.to_string()));
    }
    if let Some(url) = base_url {
        env.push(("OPENAI_BASE_URL".to_string(), url.to_string()));
    }
    if let Some(key) = api_key {
        env.push(("CODEX_API_KEY".to_string(), key.to_string()));
    }
    env
}

// --- Process ---

#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub envs: Vec<(String, String)>,
    pub max_line_bytes: usize,
}

/// Run one process to completion.
///
/// Writes `input` to stdin and closes it, then hands every non-blank stdout
/// line to `handler`. The process is killed if the handler fails, a line
/// exceeds the cap, or `cancel` fires; cancellation always surfaces as
/// [`CodexError::Cancelled`].
pub async fn run_process(
    spec: ProcessSpec,
    input: &str,
    cancel: &CancellationToken,
    handler: &mut dyn LineHandler,
) -> Result<(), CodexError> {
    let mut child = Command::new(&spec.program)
        .args(&spec.args)
        .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(CodexError::Spawn)?;
    debug!(program = %spec.program.display(), pid = ?child.id(), "codex exec started");

    let stderr = child.stderr.take().map(|mut pipe| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Err(err) = pipe.read_to_end(&mut buf).await {
                debug!(error = %err, "stderr read ended early");
            }
            String::from_utf8_lossy(&buf).into_owned()
        })
    });

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CodexError::Cancelled),
        res = drive(&mut child, input, handler, spec.max_line_bytes) => res,
    };

    let status = match outcome {
        Ok(status) => status,
        Err(err) => {
            if let Err(kill_err) = child.kill().await {
                debug!(error = %kill_err, "kill after failed run");
            }
            if let Some(task) = stderr {
                task.abort();
            }
            if cancel.is_cancelled() {
                info!("codex exec cancelled");
                return Err(CodexError::Cancelled);
            }
            warn!(error = %err, "codex exec aborted");
            return Err(err);
        }
    };

    // A grandchild can inherit stderr and hold it open past the exit.
    let stderr = match stderr {
        Some(mut task) => tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                task.abort();
                info!("codex exec cancelled while collecting stderr");
                return Err(CodexError::Cancelled);
            }
            text = &mut task => text.unwrap_or_default(),
        },
        None => String::new(),
    };
    if cancel.is_cancelled() {
        return Err(CodexError::Cancelled);
    }
    if !status.success() {
        warn!(code = ?status.code(), "codex exec exited unsuccessfully");
        return Err(CodexError::Process {
            code: status.code(),
            stderr,
        });
    }
    debug!("codex exec finished");
    Ok(())
}

async fn drive(
    child: &mut Child,
    input: &str,
    handler: &mut dyn LineHandler,
    max_line_bytes: usize,
) -> Result<ExitStatus, CodexError> {
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input.as_bytes())
            .await
            .map_err(CodexError::Stdin)?;
        stdin.shutdown().await.map_err(CodexError::Stdin)?;
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CodexError::Read(std::io::Error::other("stdout was not captured")))?;
    let mut lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(max_line_bytes));

    while let Some(line) = lines.next().await {
        let line = line.map_err(|err| match err {
            LinesCodecError::MaxLineLengthExceeded => CodexError::LineTooLong {
                limit: max_line_bytes,
            },
            LinesCodecError::Io(err) => CodexError::Read(err),
        })?;
        if line.trim().is_empty() {
            continue;
        }
        handler.handle_line(line).await?;
    }

    child.wait().await.map_err(CodexError::Io)
}

// --- Runner ---

/// The real runner: spawns the `codex` CLI.
#[derive(Debug, Clone)]
pub struct CodexExec {
    program: PathBuf,
    max_line_bytes: usize,
}

impl CodexExec {
    /// Resolve the binary: `path_override` if given (it must exist), else
    /// `codex` on `PATH`.
    pub fn new(path_override: Option<PathBuf>) -> Result<Self, CodexError> {
        let program = match path_override {
            Some(path) if path.exists() => path,
            Some(path) => {
                return Err(CodexError::Binary(format!(
                    "{} does not exist",
                    path.display()
                )))
            }
            None => locate(std::env::var_os("PATH"))?,
        };
        debug!(program = %program.display(), "resolved codex binary");
        Ok(Self {
            program,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        })
    }

    pub fn with_max_line_bytes(mut self, limit: usize) -> Self {
        self.max_line_bytes = limit;
        self
    }

    pub fn program(&self) -> &std::path::Path {
        &self.program
    }
}

const CODEX_BINARY: &str = "codex";

/// Find an executable `codex` in `search_path`.
fn locate(search_path: Option<OsString>) -> Result<PathBuf, CodexError> {
    let cwd = std::env::current_dir()?;
    which::which_in(CODEX_BINARY, search_path, cwd)
        .map_err(|e| CodexError::Binary(format!("{CODEX_BINARY} not found on PATH: {e}")))
}

#[async_trait]
impl ExecRunner for CodexExec {
    async fn run(
        &self,
        args: ExecArgs,
        cancel: CancellationToken,
        handler: &mut dyn LineHandler,
    ) -> Result<(), CodexError> {
        let spec = ProcessSpec {
            program: self.program.clone(),
            args: build_command_args(&args),
            envs: build_env(args.base_url.as_deref(), args.api_key.as_deref()),
            max_line_bytes: self.max_line_bytes,
        };
        run_process(spec, &args.input, &cancel, handler).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn command_args_follow_cli_order() {
        let mut overrides = BTreeMap::new();
        overrides.insert("profile".to_string(), json!("work"));
        overrides.insert("sandbox_workspace_write.network_access".to_string(), json!(true));
        overrides.insert("approval_policy".to_string(), json!("never"));

        let args = ExecArgs {
            input: "ignored".into(),
            thread_id: Some("thread_9".into()),
            model: Some("gpt-5-codex".into()),
            sandbox_mode: Some(SandboxMode::WorkspaceWrite),
            working_directory: Some("/work".into()),
            skip_git_repo_check: true,
            output_schema_path: Some("/tmp/s/schema.json".into()),
            images: vec!["/tmp/a.png".into(), "/tmp/b.jpg".into()],
            config_overrides: overrides,
            ..Default::default()
        };

        assert_eq!(
            strings(&build_command_args(&args)),
            vec![
                "exec",
                "--experimental-json",
                "--profile",
                "work",
                "-c",
                "approval_policy=never",
                "-c",
                "sandbox_workspace_write.network_access=true",
                "--model",
                "gpt-5-codex",
                "--sandbox",
                "workspace-write",
                "--cd",
                "/work",
                "--skip-git-repo-check",
                "--output-schema",
                "/tmp/s/schema.json",
                "--image",
                "/tmp/a.png",
                "--image",
                "/tmp/b.jpg",
                "resume",
                "thread_9",
            ]
        );
    }

    #[test]
    fn minimal_args() {
        assert_eq!(
            strings(&build_command_args(&ExecArgs::default())),
            vec!["exec", "--experimental-json"]
        );
    }

    #[test]
    fn env_carries_endpoint_and_key() {
        let env = build_env(Some("http://localhost:9"), Some("sk-test"));
        assert!(env.contains(&("OPENAI_BASE_URL".into(), "http://localhost:9".into())));
        assert!(env.contains(&("CODEX_API_KEY".into(), "sk-test".into())));

        let env = build_env(None, None);
        assert!(!env.iter().any(|(k, _)| k == "OPENAI_BASE_URL" || k == "CODEX_API_KEY"));
    }

    #[test]
    fn missing_override_binary_is_rejected() {
        let err = CodexExec::new(Some("/definitely/not/here/codex".into())).unwrap_err();
        assert!(matches!(err, CodexError::Binary(_)));
    }

    #[cfg(unix)]
    #[test]
    fn path_lookup_skips_non_executable_candidates() {
        use std::os::unix::fs::PermissionsExt;

        let shadow = tempfile::tempdir().unwrap();
        let real = tempfile::tempdir().unwrap();
        std::fs::write(shadow.path().join("codex"), "not a program").unwrap();
        let program = real.path().join("codex");
        std::fs::write(&program, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();

        let search = std::env::join_paths([shadow.path(), real.path()]).unwrap();
        assert_eq!(locate(Some(search)).unwrap(), program);

        let empty = tempfile::tempdir().unwrap();
        let err = locate(Some(empty.path().as_os_str().to_owned())).unwrap_err();
        assert!(matches!(err, CodexError::Binary(_)));
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::time::Duration;

        #[derive(Default)]
        struct Collect {
            lines: Vec<String>,
            fail_after: Option<usize>,
        }

        #[async_trait]
        impl LineHandler for Collect {
            async fn handle_line(&mut self, line: String) -> Result<(), CodexError> {
                self.lines.push(line);
                if self.fail_after == Some(self.lines.len()) {
                    return Err(CodexError::Input("handler gave up".into()));
                }
                Ok(())
            }
        }

        fn sh(script: &str) -> ProcessSpec {
            ProcessSpec {
                program: "sh".into(),
                args: vec!["-c".into(), script.into()],
                envs: vec![("CODEX_TEST_MARKER".into(), "on".into())],
                max_line_bytes: 64,
            }
        }

        #[tokio::test]
        async fn prompt_reaches_stdin_and_blank_lines_are_skipped() {
            let spec = sh(r#"read -r p; printf '%s\n\n' "got:$p"; echo "$CODEX_TEST_MARKER""#);
            let mut handler = Collect::default();
            run_process(spec, "hello", &CancellationToken::new(), &mut handler)
                .await
                .unwrap();
            assert_eq!(handler.lines, vec!["got:hello", "on"]);
        }

        #[tokio::test]
        async fn nonzero_exit_reports_code_and_stderr() {
            let spec = sh("cat >/dev/null; echo oops >&2; exit 3");
            let err = run_process(spec, "x", &CancellationToken::new(), &mut Collect::default())
                .await
                .unwrap_err();
            match err {
                CodexError::Process { code, stderr } => {
                    assert_eq!(code, Some(3));
                    assert!(stderr.contains("oops"));
                }
                other => panic!("unexpected error: {other}"),
            }
        }

        #[tokio::test]
        async fn overlong_line_fails_loudly() {
            let spec = sh("cat >/dev/null; head -c 200 /dev/zero | tr '\\0' a; echo");
            let err = run_process(spec, "x", &CancellationToken::new(), &mut Collect::default())
                .await
                .unwrap_err();
            assert!(matches!(err, CodexError::LineTooLong { limit: 64 }));
        }

        #[tokio::test]
        async fn handler_error_stops_the_process() {
            let spec = sh("cat >/dev/null; echo one; exec sleep 30");
            let mut handler = Collect {
                fail_after: Some(1),
                ..Default::default()
            };
            let res = tokio::time::timeout(
                Duration::from_secs(10),
                run_process(spec, "x", &CancellationToken::new(), &mut handler),
            )
            .await
            .expect("run did not stop");
            assert!(matches!(res, Err(CodexError::Input(_))));
        }

        #[tokio::test]
        async fn cancel_kills_the_process() {
            let dir = tempfile::tempdir().unwrap();
            let pidfile = dir.path().join("pid");
            let spec = sh(&format!("echo $$ > {}; exec sleep 30", pidfile.display()));
            let cancel = CancellationToken::new();

            let task = {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    run_process(spec, "x", &cancel, &mut Collect::default()).await
                })
            };

            let mut pid = String::new();
            for _ in 0..200 {
                if let Ok(text) = std::fs::read_to_string(&pidfile) {
                    if text.ends_with('\n') {
                        pid = text.trim().to_string();
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert!(!pid.is_empty(), "child never wrote its pid");

            cancel.cancel();
            let res = tokio::time::timeout(Duration::from_secs(10), task)
                .await
                .expect("run did not stop")
                .unwrap();
            assert!(res.unwrap_err().is_cancelled());

            let alive = std::process::Command::new("kill")
                .args(["-0", &pid])
                .stderr(Stdio::null())
                .status()
                .unwrap();
            assert!(!alive.success(), "process {pid} survived cancellation");
        }

        #[tokio::test]
        async fn cancel_is_honoured_while_a_grandchild_holds_stderr() {
            let spec = sh("cat >/dev/null; sleep 30 >/dev/null & exit 0");
            let cancel = CancellationToken::new();
            let task = {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    run_process(spec, "x", &cancel, &mut Collect::default()).await
                })
            };

            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
            let res = tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .expect("stderr collection ignored cancellation")
                .unwrap();
            assert!(res.unwrap_err().is_cancelled());
        }

        #[tokio::test]
        async fn spawn_failure_is_reported() {
            let mut spec = sh("true");
            spec.program = "/definitely/not/here/codex".into();
            let err = run_process(spec, "x", &CancellationToken::new(), &mut Collect::default())
                .await
                .unwrap_err();
            assert!(matches!(err, CodexError::Spawn(_)));
        }
    }
}
