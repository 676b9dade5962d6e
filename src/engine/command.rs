// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Engine backed by an external inference program.
//!
//! The program is invoked once per job:
//!
//! ```text
//! <program> [args..] --resource-dir <dir> --prompt <p> --negative-prompt <n>
//!           --seed <s> --steps <n> --guidance <g> [--image <path> --strength <f>]
//!           --output <file>
//! ```
//!
//! and once with `--resource-dir <dir> --warm-up` before the engine is
//! published. It reports progress as `step <done>/<total>` lines on stdout,
//! writes the encoded image to `--output` and exits 0. Exit code 3 means the
//! output was rejected by the program's safety checker.

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context};
use tracing::{debug, warn};

use super::{ComputeEngine, EngineFactory, JobOutput, JobRequest, StepControl, StepProgress};
use crate::error::JobFailure;
use crate::resource::ResourceVersion;

/// Exit code the program uses for a safety rejection.
pub const EXIT_REJECTED: i32 = 3;

/// Builds [`CommandEngine`]s for a given program.
#[derive(Debug, Clone)]
pub struct CommandEngineFactory {
    program: String,
    args: Vec<String>,
}

impl CommandEngineFactory {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl EngineFactory for CommandEngineFactory {
    fn build(
        &self,
        resource_dir: &Path,
        version: &ResourceVersion,
    ) -> anyhow::Result<Arc<dyn ComputeEngine>> {
        if !resource_dir.is_dir() {
            bail!(
                "resource directory for {} is missing: {}",
                version.key,
                resource_dir.display()
            );
        }
        debug!(program = %self.program, dir = %resource_dir.display(), "building command engine");
        Ok(Arc::new(CommandEngine {
            program: self.program.clone(),
            args: self.args.clone(),
            resource_dir: resource_dir.to_path_buf(),
        }))
    }
}

/// One external program bound to one resource directory.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
    resource_dir: PathBuf,
}

impl CommandEngine {
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--resource-dir")
            .arg(&self.resource_dir)
            .stdin(Stdio::null());
        cmd
    }

    fn job_command(&self, request: &JobRequest, output: &Path) -> Command {
        let mut cmd = self.command();
        cmd.arg("--prompt")
            .arg(&request.prompt)
            .arg("--negative-prompt")
            .arg(&request.negative_prompt)
            .arg("--seed")
            .arg(request.seed.to_string())
            .arg("--steps")
            .arg(request.steps.to_string())
            .arg("--guidance")
            .arg(request.guidance.to_string());
        if let Some(image) = &request.source_image {
            cmd.arg("--image")
                .arg(image)
                .arg("--strength")
                .arg(request.strength.to_string());
        }
        cmd.arg("--output")
            .arg(output)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

impl ComputeEngine for CommandEngine {
    fn warm_up(&self) -> anyhow::Result<()> {
        let output = self
            .command()
            .arg("--warm-up")
            .output()
            .with_context(|| format!("failed to start {}", self.program))?;
        if !output.status.success() {
            bail!(
                "warm-up exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    fn run(
        &self,
        request: &JobRequest,
        on_step: &mut dyn FnMut(StepProgress) -> StepControl,
    ) -> Result<JobOutput, JobFailure> {
        let output_path = std::env::temp_dir().join(format!("genstudio-{}.png", request.id));
        let mut child = self
            .job_command(request, &output_path)
            .spawn()
            .map_err(|e| JobFailure::Failed(format!("failed to start {}: {}", self.program, e)))?;

        let stderr = child.stderr.take().map(collect_stderr);
        let Some(stdout) = child.stdout.take() else {
            kill(&mut child);
            return Err(JobFailure::Failed("engine stdout unavailable".to_string()));
        };

        for line in BufReader::new(stdout).lines() {
            let Ok(line) = line else { break };
            let Some(progress) = parse_step(&line, request.steps) else {
                continue;
            };
            if on_step(progress) == StepControl::Abort {
                debug!(id = %request.id, step = progress.step, "aborting engine run");
                kill(&mut child);
                let _ = std::fs::remove_file(&output_path);
                return Err(JobFailure::Aborted);
            }
        }

        let status = child
            .wait()
            .map_err(|e| JobFailure::Failed(format!("failed to wait for engine: {}", e)))?;
        let stderr = stderr.and_then(|h| h.join().ok()).unwrap_or_default();
        finish_run(status, &output_path, stderr.trim())
    }
}

fn finish_run(status: ExitStatus, output_path: &Path, stderr: &str) -> Result<JobOutput, JobFailure> {
    let result = match status.code() {
        Some(0) => std::fs::read(output_path)
            .map(|bytes| JobOutput { bytes })
            .map_err(|e| JobFailure::Failed(format!("engine produced no output: {}", e))),
        Some(EXIT_REJECTED) => Err(JobFailure::Rejected(if stderr.is_empty() {
            "output rejected by safety checker".to_string()
        } else {
            stderr.to_string()
        })),
        _ => Err(JobFailure::Failed(format!("engine exited with {}: {}", status, stderr))),
    };
    let _ = std::fs::remove_file(output_path);
    result
}

fn kill(child: &mut Child) {
    if let Err(e) = child.kill() {
        warn!("failed to kill engine process: {}", e);
    }
    let _ = child.wait();
}

fn collect_stderr<R: Read + Send + 'static>(stream: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut text = String::new();
        let _ = BufReader::new(stream).read_to_string(&mut text);
        text
    })
}

/// Parse a `step <done>/<total>` progress line.
///
/// A missing or zero total falls back to `steps`.
fn parse_step(line: &str, steps: u32) -> Option<StepProgress> {
    let rest = line.trim().strip_prefix("step")?.trim_start();
    let (done, total) = match rest.split_once('/') {
        Some((done, total)) => (done.trim(), total.trim().parse::<u32>().ok()),
        None => (rest, None),
    };
    let step = done.parse::<u32>().ok()?;
    let total = total.filter(|t| *t > 0).unwrap_or(steps);
    Some(StepProgress {
        step: step.min(total),
        total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_parse_step() {
        assert_eq!(
            parse_step("step 3/20", 25),
            Some(StepProgress { step: 3, total: 20 })
        );
        assert_eq!(
            parse_step("  step 4 ", 25),
            Some(StepProgress { step: 4, total: 25 })
        );
        assert_eq!(
            parse_step("step 40/20", 25),
            Some(StepProgress { step: 20, total: 20 })
        );
        assert_eq!(parse_step("loading weights", 25), None);
        assert_eq!(parse_step("step x/20", 25), None);
    }

    #[test]
    fn test_factory_requires_resource_dir() {
        let factory = CommandEngineFactory::new("true", Vec::new());
        let version = ResourceVersion::new("sd-test", 1, 512);
        assert!(factory
            .build(Path::new("/nonexistent/genstudio-resource"), &version)
            .is_err());
    }

    #[cfg(unix)]
    fn script_engine(dir: &Path, body: &str) -> CommandEngine {
        let script = dir.join("engine.sh");
        std::fs::write(&script, format!("#!/bin/sh\n{}\n", body)).expect("write script");
        CommandEngine {
            program: "sh".to_string(),
            args: vec![script.to_string_lossy().to_string()],
            resource_dir: dir.to_path_buf(),
        }
    }

    #[cfg(unix)]
    fn request(steps: u32) -> JobRequest {
        JobRequest {
            id: Uuid::new_v4(),
            prompt: "a red kite".to_string(),
            negative_prompt: String::new(),
            seed: 7,
            steps,
            guidance: 7.5,
            source_image: None,
            strength: 0.75,
        }
    }

    #[cfg(unix)]
    const WRITES_OUTPUT: &str = r#"
out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "--output" ]; then out="$2"; fi
  shift
done
echo "step 1/2"
echo "step 2/2"
[ -n "$out" ] && printf 'PNG' > "$out"
exit 0
"#;

    #[cfg(unix)]
    #[test]
    fn test_run_reports_steps_and_reads_output() {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let engine = script_engine(temp_dir.path(), WRITES_OUTPUT);

        let mut seen = Vec::new();
        let output = engine
            .run(&request(2), &mut |p| {
                seen.push(p.step);
                StepControl::Continue
            })
            .expect("run succeeds");

        assert_eq!(output.bytes, b"PNG");
        assert_eq!(seen, vec![1, 2]);
    }

    #[cfg(unix)]
    #[test]
    fn test_abort_stops_run() {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let engine = script_engine(temp_dir.path(), WRITES_OUTPUT);

        let result = engine.run(&request(2), &mut |_| StepControl::Abort);
        assert_eq!(result, Err(JobFailure::Aborted));
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_codes_map_to_failures() {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");

        let rejected = script_engine(temp_dir.path(), "echo nsfw >&2\nexit 3");
        assert_eq!(
            rejected.run(&request(2), &mut |_| StepControl::Continue),
            Err(JobFailure::Rejected("nsfw".to_string()))
        );

        let broken = script_engine(temp_dir.path(), "exit 1");
        assert!(matches!(
            broken.run(&request(2), &mut |_| StepControl::Continue),
            Err(JobFailure::Failed(_))
        ));
    }
}
