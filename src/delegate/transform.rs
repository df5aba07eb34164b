use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::process::Command;

use crate::fetch::FetchResult;
use crate::workflow::{Artifact, RunContext, Transform};

/// Runs an external converter once per fetched file.
///
/// The command line is split on whitespace and executed without a shell;
/// `{input}` and `{output}` are replaced by the fetched file and the file the
/// command is expected to write. Without a command, fetched files pass
/// through unchanged.
#[derive(Debug, Clone, Default)]
pub struct CommandTransform {
    argv: Option<Vec<String>>,
    output_extension: Option<String>,
}

impl CommandTransform {
    pub fn passthrough() -> Self {
        Self::default()
    }

    pub fn new(command: &str, output_extension: Option<String>) -> anyhow::Result<Self> {
        let argv: Vec<String> = command.split_whitespace().map(String::from).collect();
        if argv.is_empty() {
            bail!("Transform command is empty");
        }
        Ok(Self {
            argv: Some(argv),
            output_extension,
        })
    }

    fn output_path(&self, input: &Path) -> PathBuf {
        let input_ext = input.extension().and_then(|e| e.to_str()).unwrap_or("");
        match self.output_extension.as_deref() {
            Some(ext) if ext != input_ext => input.with_extension(ext),
            _ => {
                let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
                let ext = if input_ext.is_empty() { "out" } else { input_ext };
                input.with_file_name(format!("{}.out.{}", stem, ext))
            }
        }
    }

    async fn run_one(&self, argv: &[String], input: &Path, ctx: &RunContext) -> anyhow::Result<PathBuf> {
        let output = self.output_path(input);
        let args: Vec<String> = argv
            .iter()
            .map(|a| {
                a.replace("{input}", &input.to_string_lossy())
                    .replace("{output}", &output.to_string_lossy())
            })
            .collect();
        let (program, rest) = args.split_first().context("Transform command is empty")?;

        tracing::debug!(dataset = %ctx.dataset_id, command = %args.join(" "), "Running transform");
        let child = Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => bail!("Transform cancelled"),
            r = child => r.with_context(|| format!("Failed to start `{}`", program))?,
        };
        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            bail!(
                "`{}` exited with {}: {}",
                program,
                result.status,
                stderr.trim().lines().last().unwrap_or("")
            );
        }
        if !output.exists() {
            bail!("`{}` did not produce {}", program, output.display());
        }
        Ok(output)
    }
}

#[async_trait]
impl Transform for CommandTransform {
    async fn transform(&self, fetched: &FetchResult, ctx: &RunContext) -> anyhow::Result<Artifact> {
        let Some(argv) = &self.argv else {
            return Ok(Artifact {
                files: fetched.files.iter().map(|f| f.path.clone()).collect(),
            });
        };

        let mut files = Vec::with_capacity(fetched.files.len());
        for file in &fetched.files {
            files.push(self.run_one(argv, &file.path, ctx).await?);
        }
        Ok(Artifact { files })
    }
}
