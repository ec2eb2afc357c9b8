use std::path::Path;
use std::time::Duration;

use crate::COMPILE_ERROR_EXIT_CODE;
use crate::ProcessExecuteResult;
use crate::ProcessExecutor;
use crate::Result;
use crate::SandboxErr;

/// Overhead absorbed by the wall deadline on top of the execution limit
/// (interpreter startup, compile-stage teardown).
const WALL_CLOCK_SLACK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// A pre-run step; non-zero exit short-circuits to a compile error.
    Compile,
    Run,
}

/// One command line of an adapter's plan.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub command: Vec<String>,
    pub kind: StageKind,
}

impl Stage {
    pub fn compile(command: Vec<String>) -> Self {
        Self {
            command,
            kind: StageKind::Compile,
        }
    }

    pub fn run(command: Vec<String>) -> Self {
        Self {
            command,
            kind: StageKind::Run,
        }
    }
}

/// What a language contributes: a staged command plan over a fresh working
/// directory, and an optional post-processing step on the final result.
/// Adding a language to the judge means implementing this trait.
pub trait LanguageAdapter: Send + Sync {
    fn prepare(&self, workdir: &Path, source: &str) -> Result<Vec<Stage>>;

    fn postprocess(&self, result: ProcessExecuteResult) -> ProcessExecuteResult {
        result
    }
}

/// Drives an adapter's stages inside one temp directory, applying the wall
/// deadline to every stage.
pub struct ScriptExecutor {
    executor: ProcessExecutor,
    adapter: Box<dyn LanguageAdapter>,
}

impl ScriptExecutor {
    pub fn new(adapter: Box<dyn LanguageAdapter>) -> Self {
        Self {
            executor: ProcessExecutor,
            adapter,
        }
    }

    /// Run `source` to completion: prepare the working directory, execute the
    /// stages in order, and post-process the final stage's result. The
    /// directory is removed when the returned future resolves.
    pub async fn execute_script(
        &self,
        source: &str,
        stdin: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<ProcessExecuteResult> {
        let wall_deadline = timeout.map(|t| t + WALL_CLOCK_SLACK);
        let workdir = tempfile::Builder::new().prefix("judge-").tempdir()?;

        let stages = self.adapter.prepare(workdir.path(), source)?;
        let mut last = None;
        for stage in stages {
            let result = self
                .executor
                .execute(&stage.command, workdir.path(), stdin, wall_deadline)
                .await?;
            if stage.kind == StageKind::Compile && !result.success() {
                return Ok(ProcessExecuteResult {
                    stdout: String::new(),
                    stderr: result.stderr,
                    exit_code: COMPILE_ERROR_EXIT_CODE,
                    cost: 0.0,
                });
            }
            last = Some(result);
        }

        let last = last.ok_or(SandboxErr::NoStages)?;
        Ok(self.adapter.postprocess(last))
    }
}

/// Substitute `{placeholder}` paths into a command template (shell-quoted)
/// and split the result into argv. Templates are never handed to a shell.
pub fn render_command(template: &str, substitutions: &[(&str, &Path)]) -> Result<Vec<String>> {
    let mut rendered = template.to_string();
    for (placeholder, path) in substitutions {
        let text = path.to_string_lossy();
        let quoted = shlex::try_quote(&text)
            .map_err(|_| SandboxErr::UnquotablePath)?
            .into_owned();
        rendered = rendered.replace(&format!("{{{placeholder}}}"), &quoted);
    }
    shlex::split(&rendered).ok_or(SandboxErr::BadTemplate(rendered))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    #[test]
    fn render_substitutes_and_splits() {
        let source = PathBuf::from("/tmp/j/source.py");
        let workdir = PathBuf::from("/tmp/j");
        let argv = render_command(
            "python3 {source}",
            &[("source", source.as_path()), ("workdir", workdir.as_path())],
        )
        .expect("render");
        assert_eq!(argv, vec!["python3".to_string(), "/tmp/j/source.py".to_string()]);
    }

    #[test]
    fn render_quotes_awkward_paths() {
        let source = PathBuf::from("/tmp/with space/source.py");
        let argv = render_command("python3 {source}", &[("source", source.as_path())])
            .expect("render");
        assert_eq!(
            argv,
            vec!["python3".to_string(), "/tmp/with space/source.py".to_string()]
        );
    }

    #[test]
    fn unterminated_template_is_an_error() {
        let source = PathBuf::from("/tmp/s");
        let err = render_command("python3 '{source}", &[("source", source.as_path())]);
        assert!(err.is_err());
    }
}
