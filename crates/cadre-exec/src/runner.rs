use crate::proc::{drain_into, group_command, wait_with_deadline, CapBuf};
use crate::{detect_dangerous, ExecError, ExecResult};
use cadre_types::{Language, RunMode, RunRequest, RunResult};
use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

const OUTPUT_LIMIT: usize = 512 * 1024;
const TIMEOUT_SUFFIX: &str = "\n--- TIMEOUT ---\n";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_CONCURRENT_RUNS: usize = 3;

#[derive(Debug, Clone)]
pub struct CodeRunnerConfig {
    pub project_root: PathBuf,
    pub default_timeout: Duration,
    pub output_limit: usize,
}

impl CodeRunnerConfig {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            default_timeout: DEFAULT_TIMEOUT,
            output_limit: OUTPUT_LIMIT,
        }
    }
}

/// Per-language ephemeral execution with quotas. Each run gets a scratch
/// directory under the instance temp root (removed when the run finishes)
/// and its own process group; the instance root itself is removed exactly
/// once, on drop at shutdown.
pub struct CodeRunner {
    config: CodeRunnerConfig,
    temp_root: tempfile::TempDir,
    semaphore: Arc<Semaphore>,
    go_available: bool,
    node_available: bool,
    tsx_command: Option<PathBuf>,
}

impl CodeRunner {
    pub fn new(config: CodeRunnerConfig) -> std::io::Result<Self> {
        let temp_root = tempfile::Builder::new().prefix("cadre-runner-").tempdir()?;
        let go_available = probe_tool("go", &["version"]);
        let node_available = probe_tool("node", &["--version"]);
        let tsx_command = find_tsx(&config.project_root);
        Ok(Self {
            config,
            temp_root,
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_RUNS)),
            go_available,
            node_available,
            tsx_command,
        })
    }

    pub async fn run(&self, ctx: &CancellationToken, req: RunRequest) -> ExecResult<RunResult> {
        let permit = tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| ExecError::Cancelled)?
            }
            _ = ctx.cancelled() => return Err(ExecError::Cancelled),
        };
        let _permit = permit;

        let timeout = match req.timeout_secs {
            Some(0) | None => self.config.default_timeout,
            Some(secs) => Duration::from_secs(secs),
        };
        let work_dir = match req.work_dir.as_deref() {
            Some(dir) => resolve_work_dir(&self.config.project_root, dir)?,
            None => self.config.project_root.clone(),
        };

        let scratch = tempfile::Builder::new()
            .prefix("run-")
            .tempdir_in(self.temp_root.path())?;

        let (program, args, cwd) = self.build_invocation(&req, scratch.path(), &work_dir)?;

        let started = Instant::now();
        let mut cmd = group_command(&program);
        cmd.args(&args).current_dir(&cwd);
        let mut child = cmd.spawn()?;

        let sink = Arc::new(Mutex::new(CapBuf::new(self.config.output_limit)));
        let stdout_task = child
            .stdout
            .take()
            .map(|s| tokio::spawn(drain_into(s, sink.clone())));
        let stderr_task = child
            .stderr
            .take()
            .map(|s| tokio::spawn(drain_into(s, sink.clone())));

        let wait = async { wait_with_deadline(child, timeout).await };
        let outcome = tokio::select! {
            outcome = wait => outcome,
            _ = ctx.cancelled() => {
                // Parent cancel maps to the same path as a deadline.
                crate::proc::WaitOutcome { exit_code: -1, timed_out: true }
            }
        };
        if let Some(task) = stdout_task {
            let _ = task.await;
        }
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        let buf = std::mem::replace(&mut *sink.lock().unwrap(), CapBuf::new(0));
        let truncated = buf.truncated();
        let mut output = buf.into_string();
        if outcome.timed_out {
            output.push_str(TIMEOUT_SUFFIX);
        }

        // scratch dir drops here, like a defer.
        Ok(RunResult {
            success: !outcome.timed_out && outcome.exit_code == 0,
            exit_code: if outcome.timed_out { -1 } else { outcome.exit_code },
            output,
            truncated,
            timed_out: outcome.timed_out,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn build_invocation(
        &self,
        req: &RunRequest,
        scratch: &Path,
        work_dir: &Path,
    ) -> ExecResult<(String, Vec<String>, PathBuf)> {
        if req.mode == RunMode::ProjectCmd {
            let command = req.command.trim();
            if command.is_empty() {
                return Err(ExecError::Validation("project command is empty".into()));
            }
            if let Some(pattern) = detect_dangerous(command) {
                return Err(ExecError::Policy(format!(
                    "command matches dangerous pattern `{pattern}` and was not run"
                )));
            }
            return Ok((
                "sh".to_string(),
                vec!["-c".to_string(), command.to_string()],
                work_dir.to_path_buf(),
            ));
        }

        if req.code.trim().is_empty() {
            return Err(ExecError::Validation("code must not be empty".into()));
        }
        let language = req
            .language
            .ok_or_else(|| ExecError::Validation("language is required".into()))?;

        match language {
            Language::Go => {
                if !self.go_available {
                    return Err(ExecError::Validation("go toolchain not available".into()));
                }
                match req.mode {
                    RunMode::Run => {
                        let program = ensure_go_program(&req.code);
                        std::fs::write(scratch.join("main.go"), program)?;
                        Ok((
                            "go".to_string(),
                            vec!["run".to_string(), "main.go".to_string()],
                            scratch.to_path_buf(),
                        ))
                    }
                    RunMode::Test => {
                        std::fs::write(scratch.join("go.mod"), "module scratch\n\ngo 1.22\n")?;
                        std::fs::write(scratch.join("main_test.go"), ensure_go_package(&req.code))?;
                        let mut args = vec!["test".to_string()];
                        if let Some(func) = req.test_func.as_deref() {
                            args.push("-run".to_string());
                            args.push(format!("^{}$", regex::escape(func)));
                        }
                        args.push(".".to_string());
                        Ok(("go".to_string(), args, scratch.to_path_buf()))
                    }
                    RunMode::ProjectCmd => unreachable!(),
                }
            }
            Language::Javascript => {
                if !self.node_available {
                    return Err(ExecError::Validation("node runtime not available".into()));
                }
                let file = if req.mode == RunMode::Test {
                    "main.test.js"
                } else {
                    "main.js"
                };
                std::fs::write(scratch.join(file), &req.code)?;
                let mut args = Vec::new();
                if req.mode == RunMode::Test {
                    args.push("--test".to_string());
                    if let Some(func) = req.test_func.as_deref() {
                        args.push(format!(
                            "--test-name-pattern=^{}$",
                            regex::escape(func)
                        ));
                    }
                }
                args.push(file.to_string());
                Ok(("node".to_string(), args, scratch.to_path_buf()))
            }
            Language::Typescript => {
                let tsx = self
                    .tsx_command
                    .as_ref()
                    .ok_or_else(|| ExecError::Validation("tsx runtime not available".into()))?;
                let file = if req.mode == RunMode::Test {
                    "main.test.ts"
                } else {
                    "main.ts"
                };
                std::fs::write(scratch.join(file), &req.code)?;
                let mut args = Vec::new();
                if req.mode == RunMode::Test {
                    args.push("--test".to_string());
                    if let Some(func) = req.test_func.as_deref() {
                        args.push(format!(
                            "--test-name-pattern=^{}$",
                            regex::escape(func)
                        ));
                    }
                }
                args.push(file.to_string());
                Ok((tsx.to_string_lossy().into_owned(), args, scratch.to_path_buf()))
            }
        }
    }
}

/// Custom work dirs must resolve strictly inside the project root after
/// symlink resolution. The relative-path check distinguishes `root` from
/// `root2` where a string-prefix check would not.
fn resolve_work_dir(project_root: &Path, requested: &str) -> ExecResult<PathBuf> {
    let root = project_root
        .canonicalize()
        .map_err(|e| ExecError::Validation(format!("project root unavailable: {e}")))?;
    let candidate = if Path::new(requested).is_absolute() {
        PathBuf::from(requested)
    } else {
        root.join(requested)
    };
    let resolved = candidate
        .canonicalize()
        .map_err(|_| ExecError::Validation(format!("work_dir does not exist: {requested}")))?;
    let rel = resolved
        .strip_prefix(&root)
        .map_err(|_| ExecError::Validation(format!("work_dir escapes project root: {requested}")))?;
    if rel
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(ExecError::Validation(format!(
            "work_dir escapes project root: {requested}"
        )));
    }
    if !resolved.is_dir() {
        return Err(ExecError::Validation(format!(
            "work_dir is not a directory: {requested}"
        )));
    }
    Ok(resolved)
}

fn probe_tool(program: &str, args: &[&str]) -> bool {
    std::process::Command::new(program)
        .args(args)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// `tsx` from PATH, else a local `node_modules/.bin/tsx` when it is a
/// regular executable file.
fn find_tsx(project_root: &Path) -> Option<PathBuf> {
    if probe_tool("tsx", &["--version"]) {
        return Some(PathBuf::from("tsx"));
    }
    let local = project_root.join("node_modules").join(".bin").join("tsx");
    let meta = std::fs::metadata(&local).ok()?;
    if !meta.is_file() {
        return None;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return None;
        }
    }
    Some(local)
}

const GO_STDLIB_WHITELIST: &[(&str, &str)] = &[
    ("bufio", "bufio"),
    ("bytes", "bytes"),
    ("errors", "errors"),
    ("filepath", "path/filepath"),
    ("fmt", "fmt"),
    ("io", "io"),
    ("json", "encoding/json"),
    ("math", "math"),
    ("os", "os"),
    ("rand", "math/rand"),
    ("regexp", "regexp"),
    ("sort", "sort"),
    ("strconv", "strconv"),
    ("strings", "strings"),
    ("time", "time"),
    ("unicode", "unicode"),
];

fn go_ident_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b([a-z][A-Za-z0-9]*)\.[A-Z]\w*").unwrap())
}

fn has_go_package(code: &str) -> bool {
    code.lines().any(|line| line.trim_start().starts_with("package "))
}

fn ensure_go_package(code: &str) -> String {
    if has_go_package(code) {
        code.to_string()
    } else {
        format!("package main\n\n{code}")
    }
}

/// Strip comments line-wise so they never contribute imports: `//` tails
/// and `/* */` blocks are dropped before scanning.
fn non_comment_lines(code: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut in_block = false;
    for line in code.lines() {
        let mut cleaned = String::new();
        let mut rest = line;
        loop {
            if in_block {
                match rest.find("*/") {
                    Some(end) => {
                        in_block = false;
                        rest = &rest[end + 2..];
                    }
                    None => break,
                }
            } else {
                let line_comment = rest.find("//");
                let block_start = rest.find("/*");
                match (line_comment, block_start) {
                    (Some(lc), Some(bs)) if lc < bs => {
                        cleaned.push_str(&rest[..lc]);
                        break;
                    }
                    (Some(lc), None) => {
                        cleaned.push_str(&rest[..lc]);
                        break;
                    }
                    (_, Some(bs)) => {
                        cleaned.push_str(&rest[..bs]);
                        in_block = true;
                        rest = &rest[bs + 2..];
                    }
                    (None, None) => {
                        cleaned.push_str(rest);
                        break;
                    }
                }
            }
            if rest.is_empty() {
                break;
            }
        }
        out.push(cleaned);
    }
    out
}

/// Wrap a bare snippet into a runnable Go program. Imports come only from
/// whitelisted stdlib packages actually referenced outside comments; a
/// `func main` is added unless the snippet already has one.
fn ensure_go_program(code: &str) -> String {
    if has_go_package(code) {
        return code.to_string();
    }

    let cleaned = non_comment_lines(code);
    let mut imports: Vec<&str> = Vec::new();
    for line in &cleaned {
        for capture in go_ident_re().captures_iter(line) {
            let pkg = capture.get(1).map(|m| m.as_str()).unwrap_or_default();
            if let Some((_, path)) = GO_STDLIB_WHITELIST.iter().find(|(name, _)| *name == pkg) {
                if !imports.contains(path) {
                    imports.push(path);
                }
            }
        }
    }
    imports.sort_unstable();

    let mut program = String::from("package main\n\n");
    if !imports.is_empty() {
        program.push_str("import (\n");
        for path in &imports {
            program.push_str(&format!("\t\"{path}\"\n"));
        }
        program.push_str(")\n\n");
    }
    if code.contains("func main(") {
        program.push_str(code);
        program.push('\n');
    } else {
        program.push_str("func main() {\n");
        for line in code.lines() {
            program.push_str("\t");
            program.push_str(line);
            program.push('\n');
        }
        program.push_str("}\n");
    }
    program
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner_in(dir: &Path) -> CodeRunner {
        CodeRunner::new(CodeRunnerConfig::new(dir)).expect("runner")
    }

    #[tokio::test]
    async fn project_cmd_runs_in_project_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let runner = runner_in(dir.path());
        let result = runner
            .run(
                &CancellationToken::new(),
                RunRequest {
                    mode: RunMode::ProjectCmd,
                    language: None,
                    code: String::new(),
                    command: "ls".into(),
                    test_func: None,
                    work_dir: None,
                    timeout_secs: Some(10),
                },
            )
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.output.contains("marker.txt"));
    }

    #[tokio::test]
    async fn timeout_kills_the_whole_group_and_tags_output() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner_in(dir.path());
        let started = Instant::now();
        let result = runner
            .run(
                &CancellationToken::new(),
                RunRequest {
                    mode: RunMode::ProjectCmd,
                    language: None,
                    code: String::new(),
                    command: "sleep 60".into(),
                    test_func: None,
                    work_dir: None,
                    timeout_secs: Some(2),
                },
            )
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(!result.success);
        assert!(result.timed_out);
        assert_eq!(result.exit_code, -1);
        assert!(result.output.ends_with("--- TIMEOUT ---\n"));
    }

    #[tokio::test]
    async fn dangerous_project_commands_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner_in(dir.path());
        let err = runner
            .run(
                &CancellationToken::new(),
                RunRequest {
                    mode: RunMode::ProjectCmd,
                    language: None,
                    code: String::new(),
                    command: "rm -rf /".into(),
                    test_func: None,
                    work_dir: None,
                    timeout_secs: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Policy(_)));
    }

    #[test]
    fn work_dir_rejects_sibling_prefix_paths() {
        let base = tempfile::tempdir().unwrap();
        let root = base.path().join("work");
        let sibling = base.path().join("work2");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&sibling).unwrap();

        assert!(resolve_work_dir(&root, root.to_str().unwrap()).is_ok());
        assert!(resolve_work_dir(&root, sibling.to_str().unwrap()).is_err());
    }

    #[test]
    fn work_dir_allows_dot_dot_named_dir_inside_root() {
        let base = tempfile::tempdir().unwrap();
        let root = base.path().join("work");
        let odd = root.join("..x");
        std::fs::create_dir_all(&odd).unwrap();
        assert!(resolve_work_dir(&root, "..x").is_ok());
        assert!(resolve_work_dir(&root, "../work2").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn work_dir_rejects_symlink_leaving_root() {
        let base = tempfile::tempdir().unwrap();
        let root = base.path().join("work");
        let outside = base.path().join("outside");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, root.join("escape")).unwrap();
        assert!(resolve_work_dir(&root, "escape").is_err());
    }

    #[test]
    fn go_wrap_collects_imports_from_code_not_comments() {
        let code = "// fmt.Println in a comment\n/* strings.ToUpper too */\nx := strconv.Itoa(7)\nfmt.Println(x)";
        let program = ensure_go_program(code);
        assert!(program.starts_with("package main"));
        assert!(program.contains("\"fmt\""));
        assert!(program.contains("\"strconv\""));
        assert!(!program.contains("\"strings\""));
        assert!(program.contains("func main() {"));
    }

    #[test]
    fn go_wrap_respects_existing_package_and_main() {
        let with_package = "package main\nfunc main() {}\n";
        assert_eq!(ensure_go_program(with_package), with_package);

        let with_main = "func main() {\n\tfmt.Println(\"hi\")\n}";
        let program = ensure_go_program(with_main);
        assert!(program.contains("func main() {"));
        assert!(!program.contains("func main() {\nfunc main()"));
        assert_eq!(program.matches("func main(").count(), 1);
    }

    #[test]
    fn go_wrap_ignores_non_whitelisted_packages() {
        let program = ensure_go_program("mylib.Do()\nfmt.Println(\"x\")");
        assert!(program.contains("\"fmt\""));
        assert!(!program.contains("mylib\n"));
    }

    #[test]
    fn test_func_filter_escapes_regex_metacharacters() {
        assert_eq!(regex::escape("TestFoo$Bar"), r"TestFoo\$Bar");
    }

    #[tokio::test]
    async fn cancelled_context_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner_in(dir.path());
        let ctx = CancellationToken::new();
        ctx.cancel();
        // With all permits free the select may still pick the permit arm,
        // but the run itself observes the cancel during the wait.
        let result = runner
            .run(
                &ctx,
                RunRequest {
                    mode: RunMode::ProjectCmd,
                    language: None,
                    code: String::new(),
                    command: "sleep 30".into(),
                    test_func: None,
                    work_dir: None,
                    timeout_secs: Some(25),
                },
            )
            .await;
        match result {
            Err(ExecError::Cancelled) => {}
            Ok(run) => assert!(run.timed_out),
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }
}
