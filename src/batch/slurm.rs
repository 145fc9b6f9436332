use async_trait::async_trait;
use std::fmt::Write as _;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use super::{BatchScheduler, JobArraySpec, JobStatus};
use crate::chain_config::BatchSection;
use crate::errors::BackendError;

const JOB_SCRIPT: &str = "job.sh";

const FAILED_STATES: &[&str] = &[
    "FAILED",
    "CANCELLED",
    "TIMEOUT",
    "OUT_OF_MEMORY",
    "NODE_FAIL",
    "BOOT_FAIL",
    "DEADLINE",
];

/// Slurm job arrays via `sbatch` and `sacct`.
#[derive(Debug, Clone)]
pub struct SlurmScheduler {
    sbatch_cmd: String,
    sacct_cmd: String,
    partition: Option<String>,
    extra_args: Vec<String>,
}

impl SlurmScheduler {
    pub fn new(section: &BatchSection) -> Self {
        Self {
            sbatch_cmd: section.sbatch_cmd.clone(),
            sacct_cmd: section.sacct_cmd.clone(),
            partition: section.partition.clone(),
            extra_args: section.extra_args.clone(),
        }
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<String, BackendError> {
        debug!(program, ?args, "Running scheduler command");
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| BackendError::Spawn {
                command: program.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(BackendError::CommandFailed {
                command: program.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Quote a word for `/bin/sh`.
fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,+@%".contains(c))
    {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}

/// Job script running the task selected by `SLURM_ARRAY_TASK_ID`.
pub(crate) fn job_script(spec: &JobArraySpec, partition: Option<&str>) -> String {
    let mut script = String::from("#!/bin/sh\n");
    let _ = writeln!(script, "#SBATCH --job-name={}", spec.name);
    let _ = writeln!(script, "#SBATCH --output={}/task-%a.log", spec.dir.display());
    if let Some(partition) = partition {
        let _ = writeln!(script, "#SBATCH --partition={}", partition);
    }
    script.push_str("\ncase \"$SLURM_ARRAY_TASK_ID\" in\n");
    for (i, argv) in spec.tasks.iter().enumerate() {
        let command: Vec<String> = argv.iter().map(|w| shell_quote(w)).collect();
        let _ = writeln!(script, "  {}) exec {} ;;", i, command.join(" "));
    }
    script.push_str("  *) echo \"unknown task $SLURM_ARRAY_TASK_ID\" >&2; exit 1 ;;\nesac\n");
    script
}

/// Job id from `sbatch --parsable` output (`<id>[;<cluster>]`).
pub(crate) fn parse_job_id(stdout: &str) -> Result<String, BackendError> {
    stdout
        .lines()
        .next()
        .and_then(|line| line.split(';').next())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| BackendError::Parse(format!("no job id in {:?}", stdout)))
}

/// Count task states in `sacct --parsable2` output.
///
/// Only array task lines (`<job>_<n>|STATE`) are counted; job steps
/// (`<job>_<n>.batch`) and pending ranges (`<job>_[2-9]`) are ignored, which
/// leaves those tasks counted as pending.
pub(crate) fn parse_sacct(stdout: &str, tasks: usize) -> JobStatus {
    let mut status = JobStatus {
        total: tasks,
        ..Default::default()
    };
    for line in stdout.lines() {
        let mut fields = line.trim().split('|');
        let (Some(id), Some(state)) = (fields.next(), fields.next()) else {
            continue;
        };
        let Some((_, task)) = id.rsplit_once('_') else {
            continue;
        };
        if task.parse::<usize>().is_err() {
            continue;
        }
        let state = state.split_whitespace().next().unwrap_or_default();
        if state == "COMPLETED" {
            status.completed += 1;
        } else if FAILED_STATES.contains(&state) {
            status.failed += 1;
        }
    }
    status
}

#[async_trait]
impl BatchScheduler for SlurmScheduler {
    async fn submit(&self, spec: &JobArraySpec) -> Result<String, BackendError> {
        if spec.tasks.is_empty() {
            return Err(BackendError::Parse(format!("job {} has no tasks", spec.name)));
        }
        tokio::fs::create_dir_all(&spec.dir)
            .await
            .map_err(|e| BackendError::Other(e.into()))?;
        let script_path = spec.dir.join(JOB_SCRIPT);
        tokio::fs::write(&script_path, job_script(spec, self.partition.as_deref()))
            .await
            .map_err(|e| BackendError::Other(e.into()))?;

        let mut args = vec![
            "--parsable".to_string(),
            format!("--array=0-{}", spec.tasks.len() - 1),
            format!("--chdir={}", spec.dir.display()),
        ];
        args.extend(self.extra_args.iter().cloned());
        args.push(script_path.display().to_string());

        let stdout = self.run(&self.sbatch_cmd, &args).await?;
        parse_job_id(&stdout)
    }

    async fn status(&self, job: &str, tasks: usize) -> Result<JobStatus, BackendError> {
        let args = [
            "-j",
            job,
            "--array",
            "--noheader",
            "--parsable2",
            "--format=JobID,State",
        ]
        .map(String::from);
        let stdout = self.run(&self.sacct_cmd, &args).await?;
        Ok(parse_sacct(&stdout, tasks))
    }
}
