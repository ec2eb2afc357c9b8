use std::path::Path;

use crate::LanguageAdapter;
use crate::Result;
use crate::Stage;
use crate::TIMEOUT_EXIT_CODE;
use crate::script::render_command;

// Included ahead of the user source. The global constructor applies the same
// rlimit+alarm setup the Python preamble does, before main() runs.
const RESOURCE_LIMIT_TEMPLATE: &str = r#"#include <sys/resource.h>
#include <stdio.h>
#include <stdlib.h>
#include <unistd.h>
#include <signal.h>

static void handler(int sig) {
    printf("Suicide from timeout.\n");
    fflush(stdout);
    killpg(0, SIGKILL);
    kill(0, SIGKILL);
    _exit({timeout_exit_code});
}

class ResourceLimit {
public:
    ResourceLimit(int timeout, long memory_limit) {
        struct rlimit rlim;
        if (timeout > 0) {
            getrlimit(RLIMIT_CPU, &rlim);
            rlim.rlim_cur = timeout;
            setrlimit(RLIMIT_CPU, &rlim);
        }
        if (memory_limit > 0) {
            getrlimit(RLIMIT_AS, &rlim);
            rlim.rlim_cur = memory_limit;
            setrlimit(RLIMIT_AS, &rlim);
        }
        getrlimit(RLIMIT_CORE, &rlim);
        rlim.rlim_cur = 0;
        setrlimit(RLIMIT_CORE, &rlim);

        alarm(timeout);
        signal(SIGALRM, handler);
    }
};

ResourceLimit _exec_resource_limit = ResourceLimit({timeout}, {memory_limit}L);
"#;

/// Compiles a C++ submission against the injected resource-limit header,
/// then runs the binary. A failing compile stage surfaces as a compile
/// error carrying the compiler's stderr.
pub struct CppAdapter {
    compile_template: String,
    run_template: String,
    timeout_secs: Option<u64>,
    memory_limit_bytes: Option<u64>,
}

impl CppAdapter {
    pub fn new(
        compile_template: impl Into<String>,
        run_template: impl Into<String>,
        timeout_secs: Option<u64>,
        memory_limit_bytes: Option<u64>,
    ) -> Self {
        Self {
            compile_template: compile_template.into(),
            run_template: run_template.into(),
            timeout_secs,
            memory_limit_bytes,
        }
    }
}

impl LanguageAdapter for CppAdapter {
    fn prepare(&self, workdir: &Path, source: &str) -> Result<Vec<Stage>> {
        let header = RESOURCE_LIMIT_TEMPLATE
            .replace("{timeout_exit_code}", &TIMEOUT_EXIT_CODE.to_string())
            .replace("{timeout}", &self.timeout_secs.unwrap_or(0).to_string())
            .replace(
                "{memory_limit}",
                &self.memory_limit_bytes.unwrap_or(0).to_string(),
            );
        std::fs::write(workdir.join("resource_limit.h"), header)?;

        let source_path = workdir.join("source.cpp");
        let mut wrapped = String::with_capacity(source.len() + 32);
        wrapped.push_str("#include \"resource_limit.h\"\n");
        wrapped.push_str(source);
        std::fs::write(&source_path, wrapped)?;

        let exe_path = workdir.join("run");
        let substitutions = [
            ("source", source_path.as_path()),
            ("exe", exe_path.as_path()),
            ("workdir", workdir),
        ];
        let compile = render_command(&self.compile_template, &substitutions)?;
        let run = render_command(&self.run_template, &substitutions)?;
        Ok(vec![Stage::compile(compile), Stage::run(run)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StageKind;
    use pretty_assertions::assert_eq;

    fn adapter() -> CppAdapter {
        CppAdapter::new(
            "g++ -O2 -o {exe} {source}",
            "{exe}",
            Some(10),
            Some(256 * 1024 * 1024),
        )
    }

    #[test]
    fn prepare_plans_compile_then_run() {
        let workdir = tempfile::tempdir().expect("tempdir");
        let stages = adapter()
            .prepare(workdir.path(), "int main(){return 0;}")
            .expect("prepare");

        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].kind, StageKind::Compile);
        assert_eq!(stages[1].kind, StageKind::Run);
        assert_eq!(stages[0].command[0], "g++");
        let exe = workdir.path().join("run");
        assert_eq!(stages[1].command, vec![exe.to_string_lossy().into_owned()]);
    }

    #[test]
    fn prepare_writes_header_and_wrapped_source() {
        let workdir = tempfile::tempdir().expect("tempdir");
        adapter()
            .prepare(workdir.path(), "int main(){return 0;}")
            .expect("prepare");

        let header = std::fs::read_to_string(workdir.path().join("resource_limit.h"))
            .expect("read header");
        assert!(header.contains(&format!("_exit({TIMEOUT_EXIT_CODE})")));
        assert!(header.contains("ResourceLimit(10, 268435456L)"));
        assert!(header.contains("alarm(timeout)"));

        let source =
            std::fs::read_to_string(workdir.path().join("source.cpp")).expect("read source");
        assert!(source.starts_with("#include \"resource_limit.h\"\n"));
        assert!(source.ends_with("int main(){return 0;}"));
    }
}
