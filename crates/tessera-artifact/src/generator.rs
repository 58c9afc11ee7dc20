//! Invocation of the external report-generation tool.

use std::path::Path;
use std::process::Stdio;

use tessera_config::GeneratorConfig;
use tokio::process::Command;
use tracing::{debug, info};

use crate::Error;

const INPUT_PLACEHOLDER: &str = "{input}";
const OUTPUT_PLACEHOLDER: &str = "{output}";
const STDERR_TAIL: usize = 2048;

/// Runs the configured generator as an opaque child process that turns a
/// directory of result archives into a static report directory.
#[derive(Debug, Clone)]
pub struct ReportGenerator {
  config: GeneratorConfig,
}

impl ReportGenerator {
  pub fn new(config: GeneratorConfig) -> Self {
    Self { config }
  }

  /// Generate a report from the archives in `input` into `output`.
  ///
  /// Fails unless the tool exits successfully and leaves an `index.html` in
  /// `output`.
  pub async fn run(&self, input: &Path, output: &Path) -> Result<(), Error> {
    let input_str = input.to_string_lossy();
    let output_str = output.to_string_lossy();
    let substitute = |value: &str| {
      value
        .replace(INPUT_PLACEHOLDER, &input_str)
        .replace(OUTPUT_PLACEHOLDER, &output_str)
    };

    let args: Vec<String> = self.config.args.iter().map(|a| substitute(a)).collect();
    let mut command = Command::new(&self.config.program);
    command
      .args(&args)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);
    for (key, value) in &self.config.env {
      command.env(key, substitute(value));
    }

    info!(program = %self.config.program, args = ?args, "running report generator");
    let out = command.output().await.map_err(|e| {
      Error::Generation(format!(
        "failed to start '{}': {}",
        self.config.program, e
      ))
    })?;

    if !out.status.success() {
      let stderr = String::from_utf8_lossy(&out.stderr);
      let tail_start = stderr.len().saturating_sub(STDERR_TAIL);
      let tail_start = (tail_start..stderr.len())
        .find(|i| stderr.is_char_boundary(*i))
        .unwrap_or(stderr.len());
      return Err(Error::Generation(format!(
        "'{}' exited with {}: {}",
        self.config.program,
        out.status,
        stderr[tail_start..].trim()
      )));
    }
    debug!(stdout = %String::from_utf8_lossy(&out.stdout), "report generator finished");

    if !tokio::fs::try_exists(output.join(crate::keys::REPORT_INDEX)).await? {
      return Err(Error::Generation(format!(
        "'{}' produced no {}",
        self.config.program,
        crate::keys::REPORT_INDEX
      )));
    }

    Ok(())
  }
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;
  use std::collections::BTreeMap;

  fn shell(script: &str) -> ReportGenerator {
    ReportGenerator::new(GeneratorConfig {
      program: "sh".to_string(),
      args: vec!["-c".to_string(), script.to_string()],
      env: BTreeMap::new(),
    })
  }

  #[tokio::test]
  async fn test_placeholders_are_substituted() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in");
    let output = dir.path().join("out");
    std::fs::create_dir_all(&input).unwrap();
    std::fs::write(input.join("a.zip"), b"zip").unwrap();

    let generator = shell("mkdir -p {output} && ls {input} > {output}/index.html");
    generator.run(&input, &output).await.unwrap();

    let listing = std::fs::read_to_string(output.join("index.html")).unwrap();
    assert_eq!(listing.trim(), "a.zip");
  }

  #[tokio::test]
  async fn test_env_is_substituted() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out");
    let generator = ReportGenerator::new(GeneratorConfig {
      program: "sh".to_string(),
      args: vec![
        "-c".to_string(),
        "mkdir -p \"$OUT\" && echo ok > \"$OUT/index.html\"".to_string(),
      ],
      env: BTreeMap::from([("OUT".to_string(), "{output}".to_string())]),
    });

    generator.run(dir.path(), &output).await.unwrap();
    assert!(output.join("index.html").exists());
  }

  #[tokio::test]
  async fn test_non_zero_exit_is_generation_error() {
    let dir = tempfile::tempdir().unwrap();
    let generator = shell("echo 'no results' >&2; exit 3");
    let err = generator
      .run(dir.path(), &dir.path().join("out"))
      .await
      .unwrap_err();

    match err {
      Error::Generation(message) => assert!(message.contains("no results")),
      other => panic!("expected generation error, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_missing_index_is_generation_error() {
    let dir = tempfile::tempdir().unwrap();
    let generator = shell("mkdir -p {output}");
    let err = generator
      .run(dir.path(), &dir.path().join("out"))
      .await
      .unwrap_err();
    assert!(matches!(err, Error::Generation(_)));
  }
}
