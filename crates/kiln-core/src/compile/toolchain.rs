//! External tools used by the build pipeline.
//!
//! The translator turns model source into generated code; the native
//! toolchain turns generated code plus rendered glue into a loadable
//! module. Both are traits so the orchestrator can be driven by in-process
//! fakes in tests; the command implementations run external programs.

use std::ffi::OsString;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::naming::ModuleIdentifier;

use super::abort::AbortHandle;
use super::capture::CaptureGuard;

/// How often a waiting worker checks for abort while a tool runs.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Why a tool step did not produce output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    /// The tool ran and rejected its input. Carries its diagnostics.
    Rejected(String),
    /// The tool could not be run at all.
    Unavailable(String),
    /// The step was aborted.
    Cancelled,
}

/// Everything the native build step needs, laid out in one work directory.
#[derive(Debug, Clone)]
pub struct BuildUnit {
    pub module: ModuleIdentifier,
    /// Per-build scratch directory holding all inputs and the output.
    pub work_dir: PathBuf,
    /// Translator output.
    pub generated_path: PathBuf,
    /// Rendered glue code.
    pub glue_path: PathBuf,
    /// Fixed include directories followed by `work_dir`.
    pub include_dirs: Vec<PathBuf>,
    /// Where the toolchain must write the loadable module.
    pub output_path: PathBuf,
}

/// Source language → generated code.
pub trait Translator: Send + Sync {
    /// Version string; part of every model name.
    fn version(&self) -> &str;

    /// Translate `source` for `module`, writing generated code to `output`.
    fn translate(
        &self,
        source: &str,
        module: &ModuleIdentifier,
        output: &Path,
        abort: &AbortHandle,
    ) -> std::result::Result<(), ToolError>;
}

/// Generated code + glue → loadable module.
pub trait NativeToolchain: Send + Sync {
    /// Build `unit`, writing all tool output to `capture`.
    fn build(
        &self,
        unit: &BuildUnit,
        capture: &mut CaptureGuard<'_>,
        abort: &AbortHandle,
    ) -> std::result::Result<(), ToolError>;
}

/// Translator backed by an external program.
#[derive(Debug, Clone)]
pub struct CommandTranslator {
    program: PathBuf,
    args: Vec<String>,
    version: String,
}

impl CommandTranslator {
    /// Locate `program` on PATH and query its version with `--version`.
    pub fn new(program: &Path, args: Vec<String>) -> Result<Self> {
        let program = find_program(program)?;
        let version = detect_version(&program)?;
        Ok(Self {
            program,
            args,
            version,
        })
    }

    /// Use an explicit version string instead of asking the program.
    pub fn with_version(program: &Path, args: Vec<String>, version: impl Into<String>) -> Result<Self> {
        Ok(Self {
            program: find_program(program)?,
            args,
            version: version.into(),
        })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl Translator for CommandTranslator {
    fn version(&self) -> &str {
        &self.version
    }

    fn translate(
        &self,
        source: &str,
        module: &ModuleIdentifier,
        output: &Path,
        abort: &AbortHandle,
    ) -> std::result::Result<(), ToolError> {
        let source_path = output.with_extension("model");
        fs::write(&source_path, source)
            .map_err(|e| ToolError::Unavailable(format!("failed to write model source: {}", e)))?;

        let source_arg = source_path.to_string_lossy();
        let output_arg = output.to_string_lossy();
        let args = expand_args(
            &self.args,
            &[
                ("source", source_arg.as_ref()),
                ("output", output_arg.as_ref()),
                ("module", module.as_str()),
            ],
            &[],
        );

        // Translator diagnostics go to a private sink; only the native build
        // step uses the shared capture.
        let mut sink = tempfile::tempfile()
            .map_err(|e| ToolError::Unavailable(format!("failed to create output sink: {}", e)))?;
        let (out, err) = match (sink.try_clone(), sink.try_clone()) {
            (Ok(out), Ok(err)) => (Stdio::from(out), Stdio::from(err)),
            _ => (Stdio::null(), Stdio::null()),
        };

        tracing::debug!("Running translator {} for {}", self.program.display(), module);

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(out)
            .stderr(err)
            .spawn()
            .map_err(|e| {
                ToolError::Unavailable(format!("failed to run {}: {}", self.program.display(), e))
            })?;

        let status = wait_with_abort(child, abort)?;

        let diagnostics = read_diagnostics(&mut sink, module);

        if !status.success() {
            return Err(ToolError::Rejected(diagnostics));
        }

        if !output.exists() {
            return Err(ToolError::Rejected(format!(
                "{}translator produced no output at {}",
                diagnostics,
                output.display()
            )));
        }

        Ok(())
    }
}

/// Native toolchain backed by an external compiler driver.
#[derive(Debug, Clone)]
pub struct CommandToolchain {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandToolchain {
    /// Locate `program` on PATH.
    pub fn new(program: &Path, args: Vec<String>) -> Result<Self> {
        Ok(Self {
            program: find_program(program)?,
            args,
        })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl NativeToolchain for CommandToolchain {
    fn build(
        &self,
        unit: &BuildUnit,
        capture: &mut CaptureGuard<'_>,
        abort: &AbortHandle,
    ) -> std::result::Result<(), ToolError> {
        let glue = unit.glue_path.to_string_lossy();
        let generated = unit.generated_path.to_string_lossy();
        let output = unit.output_path.to_string_lossy();
        let work_dir = unit.work_dir.to_string_lossy();
        let args = expand_args(
            &self.args,
            &[
                ("glue", glue.as_ref()),
                ("generated", generated.as_ref()),
                ("output", output.as_ref()),
                ("module", unit.module.as_str()),
                ("work_dir", work_dir.as_ref()),
            ],
            &unit.include_dirs,
        );

        tracing::debug!(
            "Running toolchain {} {:?}",
            self.program.display(),
            args
        );

        let (out, err) = capture.child_stdio();
        let child = Command::new(&self.program)
            .args(&args)
            .current_dir(&unit.work_dir)
            .stdin(Stdio::null())
            .stdout(out)
            .stderr(err)
            .spawn()
            .map_err(|e| {
                ToolError::Unavailable(format!("failed to run {}: {}", self.program.display(), e))
            })?;

        let status = wait_with_abort(child, abort)?;
        if status.success() {
            Ok(())
        } else {
            Err(ToolError::Rejected(format!(
                "{} exited with {}",
                self.program.display(),
                status
            )))
        }
    }
}

/// Substitute `{name}` placeholders; a bare `{include}` argument expands to `-I<dir>` per dir.
pub fn expand_args(templates: &[String], vars: &[(&str, &str)], include: &[PathBuf]) -> Vec<OsString> {
    let mut args = Vec::with_capacity(templates.len() + include.len());

    for template in templates {
        if template == "{include}" {
            for dir in include {
                let mut arg = OsString::from("-I");
                arg.push(dir.as_os_str());
                args.push(arg);
            }
            continue;
        }

        let mut arg = template.clone();
        for (name, value) in vars {
            arg = arg.replace(&format!("{{{}}}", name), value);
        }
        args.push(OsString::from(arg));
    }

    args
}

/// Wait for `child`, killing it if `abort` is raised first.
/// Everything written to `sink`, from the start. Read failures are logged and yield what was read.
fn read_diagnostics(sink: &mut (impl Read + Seek), module: &ModuleIdentifier) -> String {
    let mut bytes = Vec::new();
    let read = sink
        .seek(SeekFrom::Start(0))
        .and_then(|_| sink.read_to_end(&mut bytes));
    if let Err(e) = read {
        tracing::warn!("Failed to read translator output for {}: {}", module, e);
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

fn wait_with_abort(mut child: Child, abort: &AbortHandle) -> std::result::Result<ExitStatus, ToolError> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {}
            Err(e) => return Err(ToolError::Unavailable(format!("failed to wait for tool: {}", e))),
        }

        if abort.is_aborted() {
            if let Err(e) = child.kill() {
                tracing::warn!("Failed to kill aborted tool process: {}", e);
            }
            let _ = child.wait();
            return Err(ToolError::Cancelled);
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Resolve a program name or path.
fn find_program(program: &Path) -> Result<PathBuf> {
    which::which(program).map_err(|_| {
        Error::Toolchain(format!("{} not found in PATH", program.display()))
    })
}

/// Get a tool's version string from `--version`.
fn detect_version(program: &Path) -> Result<String> {
    let output = Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .map_err(|e| Error::Toolchain(format!("Failed to run {}: {}", program.display(), e)))?;

    if !output.status.success() {
        return Err(Error::Toolchain(format!(
            "Failed to get {} version",
            program.display()
        )));
    }

    let mut version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if version.is_empty() {
        version = String::from_utf8_lossy(&output.stderr).trim().to_string();
    }
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::capture::OutputCapture;
    use crate::naming::{ModelName, derive_module_identifier};
    use tempfile::TempDir;

    struct UnreadableSink;

    impl Read for UnreadableSink {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("sink gone"))
        }
    }

    impl Seek for UnreadableSink {
        fn seek(&mut self, _pos: SeekFrom) -> std::io::Result<u64> {
            Ok(0)
        }
    }

    #[test]
    fn test_read_diagnostics() {
        let mut sink = std::io::Cursor::new(b"warning: unused variable".to_vec());
        sink.set_position(7);
        assert_eq!(read_diagnostics(&mut sink, &module()), "warning: unused variable");

        assert_eq!(read_diagnostics(&mut UnreadableSink, &module()), "");
    }

    fn module() -> ModuleIdentifier {
        derive_module_identifier(&ModelName::parse("models/0123456789").unwrap())
    }

    #[test]
    fn test_expand_args() {
        let args = expand_args(
            &[
                "-o".to_string(),
                "{output}".to_string(),
                "{include}".to_string(),
                "--name={module}".to_string(),
            ],
            &[("output", "/tmp/out.so"), ("module", "model_ab")],
            &[PathBuf::from("/opt/rt"), PathBuf::from("/tmp/work")],
        );
        assert_eq!(
            args,
            vec![
                OsString::from("-o"),
                OsString::from("/tmp/out.so"),
                OsString::from("-I/opt/rt"),
                OsString::from("-I/tmp/work"),
                OsString::from("--name=model_ab"),
            ]
        );
    }

    #[test]
    fn test_missing_program() {
        let result = CommandToolchain::new(Path::new("kiln-no-such-compiler-xyz"), Vec::new());
        assert!(matches!(result, Err(Error::Toolchain(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_translator_success() {
        let dir = TempDir::new().unwrap();
        let translator = CommandTranslator::with_version(
            Path::new("sh"),
            vec!["-c".to_string(), "cp {source} {output}".to_string()],
            "sh-translator 1.0",
        )
        .unwrap();

        let output = dir.path().join("model_0123456789.hpp");
        translator
            .translate("model {}", &module(), &output, &AbortHandle::new())
            .unwrap();
        assert_eq!(fs::read_to_string(&output).unwrap(), "model {}");
        assert_eq!(translator.version(), "sh-translator 1.0");
    }

    #[cfg(unix)]
    #[test]
    fn test_command_translator_rejects() {
        let dir = TempDir::new().unwrap();
        let translator = CommandTranslator::with_version(
            Path::new("sh"),
            vec![
                "-c".to_string(),
                "echo 'Syntax error in line 1' 1>&2; exit 1".to_string(),
            ],
            "sh-translator 1.0",
        )
        .unwrap();

        let output = dir.path().join("model_0123456789.hpp");
        let err = translator
            .translate("model {", &module(), &output, &AbortHandle::new())
            .unwrap_err();
        match err {
            ToolError::Rejected(diagnostics) => assert!(diagnostics.contains("Syntax error")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_command_toolchain_captures_output() {
        let dir = TempDir::new().unwrap();
        let toolchain = CommandToolchain::new(
            Path::new("sh"),
            vec![
                "-c".to_string(),
                "echo building {module}; printf bin > {output}".to_string(),
            ],
        )
        .unwrap();

        let unit = BuildUnit {
            module: module(),
            work_dir: dir.path().to_path_buf(),
            generated_path: dir.path().join("model_0123456789.hpp"),
            glue_path: dir.path().join("model_0123456789.cpp"),
            include_dirs: vec![dir.path().to_path_buf()],
            output_path: dir.path().join("model_0123456789.so"),
        };

        let capture = OutputCapture::new();
        let mut guard = capture.acquire();
        toolchain
            .build(&unit, &mut guard, &AbortHandle::new())
            .unwrap();
        assert!(guard.finish().contains("building model_0123456789"));
        assert_eq!(fs::read(&unit.output_path).unwrap(), b"bin");
    }

    #[cfg(unix)]
    #[test]
    fn test_abort_kills_running_tool() {
        let dir = TempDir::new().unwrap();
        let toolchain = CommandToolchain::new(
            Path::new("sh"),
            vec!["-c".to_string(), "sleep 30".to_string()],
        )
        .unwrap();
        let unit = BuildUnit {
            module: module(),
            work_dir: dir.path().to_path_buf(),
            generated_path: dir.path().join("g.hpp"),
            glue_path: dir.path().join("g.cpp"),
            include_dirs: Vec::new(),
            output_path: dir.path().join("g.so"),
        };

        let abort = AbortHandle::new();
        let trigger = abort.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            trigger.abort();
        });

        let capture = OutputCapture::new();
        let mut guard = capture.acquire();
        let started = std::time::Instant::now();
        let result = toolchain.build(&unit, &mut guard, &abort);
        assert_eq!(result, Err(ToolError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
