use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use super::{Engine, RelaxMode, RelaxRequest};

/// Engine backed by an external program.
///
/// The program is called with one of the subcommands `relax`,
/// `relax-incremental`, `merge` and `combine`. Relax and combine print the
/// quality score of the best projection as the last line of stdout.
#[derive(Debug, Clone)]
pub struct ProgramEngine {
    program: String,
}

impl ProgramEngine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn relax_args(request: &RelaxRequest, output: &Path) -> Vec<String> {
        let mut args = match &request.mode {
            RelaxMode::Scratch { .. } => vec!["relax".to_string()],
            RelaxMode::Incremental => vec!["relax-incremental".to_string()],
        };
        args.extend([
            "--input".to_string(),
            request.input.display().to_string(),
            "--output".to_string(),
            output.display().to_string(),
            "--optimizations".to_string(),
            request.optimizations.to_string(),
            "--keep".to_string(),
            request.keep_projections.to_string(),
        ]);
        if let RelaxMode::Scratch {
            dimensions,
            minimum_column_basis,
        } = &request.mode
        {
            args.extend([
                "--dimensions".to_string(),
                dimensions.to_string(),
                "--minimum-column-basis".to_string(),
                minimum_column_basis.clone(),
            ]);
        }
        args
    }

    async fn run(&self, args: &[String]) -> Result<String> {
        debug!(program = %self.program, ?args, "Running engine");
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run engine program {}", self.program))?;

        if !output.status.success() {
            bail!(
                "{} {} exited with {}: {}",
                self.program,
                args.first().map(String::as_str).unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run, then move the temporary output into place.
    async fn run_into(&self, args: &[String], tmp: &Path, output: &Path) -> Result<String> {
        let stdout = match self.run(args).await {
            Ok(stdout) => stdout,
            Err(e) => {
                let _ = tokio::fs::remove_file(tmp).await;
                return Err(e);
            }
        };
        if !tmp.exists() {
            bail!("Engine did not write {}", tmp.display());
        }
        tokio::fs::rename(tmp, output)
            .await
            .with_context(|| format!("Failed to move {} into place", output.display()))?;
        Ok(stdout)
    }
}

/// Temporary sibling of an output file.
fn partial_path(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    output.with_file_name(format!(".{}.partial", name))
}

/// Parse the quality score from the last non-empty line of engine output.
pub(crate) fn parse_quality(stdout: &str) -> Result<f64> {
    let line = stdout
        .lines()
        .map(str::trim)
        .rfind(|l| !l.is_empty())
        .context("Engine printed no quality score")?;
    line.parse::<f64>()
        .with_context(|| format!("Cannot parse quality score from {:?}", line))
}

#[async_trait]
impl Engine for ProgramEngine {
    async fn relax(&self, request: &RelaxRequest) -> Result<f64> {
        let tmp = partial_path(&request.output);
        let args = Self::relax_args(request, &tmp);
        let stdout = self.run_into(&args, &tmp, &request.output).await?;
        parse_quality(&stdout)
    }

    async fn merge(&self, master: &Path, addition: &Path, output: &Path) -> Result<()> {
        let tmp = partial_path(output);
        let args = vec![
            "merge".to_string(),
            "--mode".to_string(),
            "incremental".to_string(),
            "--master".to_string(),
            master.display().to_string(),
            "--addition".to_string(),
            addition.display().to_string(),
            "--output".to_string(),
            tmp.display().to_string(),
        ];
        self.run_into(&args, &tmp, output).await?;
        Ok(())
    }

    async fn combine(
        &self,
        partials: &[PathBuf],
        output: &Path,
        keep_projections: u32,
    ) -> Result<f64> {
        let tmp = partial_path(output);
        let mut args = vec![
            "combine".to_string(),
            "--keep".to_string(),
            keep_projections.to_string(),
            "--output".to_string(),
            tmp.display().to_string(),
        ];
        args.extend(partials.iter().map(|p| p.display().to_string()));
        let stdout = self.run_into(&args, &tmp, output).await?;
        parse_quality(&stdout)
    }

    fn relax_argv(&self, request: &RelaxRequest) -> Vec<String> {
        let mut argv = vec![self.program.clone()];
        argv.extend(Self::relax_args(request, &request.output));
        argv
    }
}
