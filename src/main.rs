use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use futures::TryStreamExt;
use serde_json::{Map, Value};
use tokio_util::io::ReaderStream;
use tracing_subscriber::EnvFilter;

use tessera_artifact::{ByteStream, ReportRequest};
use tessera_cache::{ListQuery, TestKey};
use tessera_config::ServerConfig;
use tessera_service::Service;

/// Tessera - test result storage and report generation
#[derive(Parser)]
#[command(name = "tessera")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.tessera)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// Path to a server configuration file (JSON)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Upload a result archive
  Upload {
    /// Path to the archive (zip)
    file: PathBuf,

    /// Result ID to use instead of a generated one
    #[arg(long)]
    id: Option<String>,

    #[arg(long)]
    project: Option<String>,

    #[arg(long)]
    title: Option<String>,

    /// Extra metadata as key=value, repeatable
    #[arg(long = "tag", value_parser = parse_tag)]
    tags: Vec<(String, String)>,
  },

  /// Generate a report from one or more results
  Generate {
    #[arg(required = true)]
    result_ids: Vec<String>,

    #[arg(long, default_value = "")]
    project: String,

    #[arg(long)]
    title: Option<String>,
  },

  /// Inspect and manage reports
  Reports {
    #[command(subcommand)]
    action: ReportsAction,
  },

  /// Inspect and manage results
  Results {
    #[command(subcommand)]
    action: ResultsAction,
  },

  /// Rebuild the metadata cache from storage
  RefreshCache {
    /// Also discard test history
    #[arg(long)]
    reset: bool,
  },

  /// Show storage totals
  Info,

  /// List known projects
  Projects,

  /// Read or change the site configuration
  Config {
    #[command(subcommand)]
    action: ConfigAction,
  },

  /// Test history and quarantine
  Tests {
    #[command(subcommand)]
    action: TestsAction,
  },
}

#[derive(Args)]
struct ListArgs {
  #[arg(long)]
  project: Option<String>,

  #[arg(long)]
  search: Option<String>,

  #[arg(long)]
  limit: Option<u32>,

  #[arg(long, default_value_t = 0)]
  offset: u32,
}

impl ListArgs {
  fn query(self) -> ListQuery {
    let mut query = ListQuery::default();
    if let Some(project) = self.project {
      query = query.project(project);
    }
    if let Some(search) = self.search {
      query = query.search(search);
    }
    if let Some(limit) = self.limit {
      query = query.page(limit, self.offset);
    }
    query
  }
}

#[derive(Subcommand)]
enum ReportsAction {
  List(ListArgs),
  Show {
    report_id: String,
  },
  /// Merge a JSON object into a report's metadata
  Update {
    report_id: String,
    patch: String,
  },
  Delete {
    #[arg(required = true)]
    report_ids: Vec<String>,
  },
}

#[derive(Subcommand)]
enum ResultsAction {
  List(ListArgs),
  Show {
    result_id: String,
  },
  Delete {
    #[arg(required = true)]
    result_ids: Vec<String>,
  },
}

#[derive(Subcommand)]
enum ConfigAction {
  Show,
  /// Merge a JSON object into the site configuration
  Set {
    patch: String,
  },
}

#[derive(Args)]
struct TestArgs {
  test_id: String,

  #[arg(long)]
  file_id: String,

  #[arg(long)]
  project: String,
}

impl From<TestArgs> for TestKey {
  fn from(args: TestArgs) -> Self {
    TestKey::new(args.test_id, args.file_id, args.project)
  }
}

#[derive(Subcommand)]
enum TestsAction {
  Quarantine {
    #[command(flatten)]
    test: TestArgs,

    #[arg(long)]
    reason: Option<String>,
  },
  Unquarantine {
    #[command(flatten)]
    test: TestArgs,
  },
  Fixed {
    #[command(flatten)]
    test: TestArgs,
  },
  History {
    #[command(flatten)]
    test: TestArgs,

    #[arg(long)]
    limit: Option<u32>,
  },
  /// List tests whose latest run is quarantined
  Quarantined,
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(std::io::stderr)
    .with_target(false)
    .init();

  let Some(command) = cli.command else {
    println!("tessera - use --help to see available commands");
    return Ok(());
  };

  let data_dir = match cli.data_dir {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".tessera"),
  };
  let config = ServerConfig::load(cli.config.as_deref(), Some(data_dir))
    .context("failed to load server configuration")?;

  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async { run(command, config).await })
}

async fn run(command: Commands, config: ServerConfig) -> Result<()> {
  tracing::debug!(data_dir = %config.data_dir.display(), "configuration loaded");
  let service = Service::from_config(&config)
    .await
    .context("failed to start tessera")?;

  match command {
    Commands::Upload {
      file,
      id,
      project,
      title,
      tags,
    } => {
      let handle = tokio::fs::File::open(&file)
        .await
        .with_context(|| format!("failed to open {}", file.display()))?;
      let length = handle.metadata().await?.len();
      let data: ByteStream = Box::pin(ReaderStream::new(handle).map_err(tessera_artifact::Error::from));

      let mut details = Map::new();
      if let Some(project) = project {
        details.insert("project".to_string(), Value::String(project));
      }
      if let Some(title) = title {
        details.insert("title".to_string(), Value::String(title));
      }
      for (key, value) in tags {
        details.insert(key, Value::String(value));
      }

      let uploaded = service
        .upload_result(id, data, Some(length), details)
        .await
        .context("upload failed")?;
      print_json(&uploaded.record)?;
    }
    Commands::Generate {
      result_ids,
      project,
      title,
    } => {
      let request = ReportRequest {
        project,
        title,
        ..Default::default()
      };
      let report = service
        .generate_report(&result_ids, request)
        .await
        .context("report generation failed")?;
      print_json(&report)?;
    }
    Commands::Reports { action } => match action {
      ReportsAction::List(args) => print_json(&service.reports(&args.query()).await?)?,
      ReportsAction::Show { report_id } => print_json(&service.report(&report_id).await?)?,
      ReportsAction::Update { report_id, patch } => {
        let patch = parse_object(&patch)?;
        print_json(&service.update_report(&report_id, patch).await?)?;
      }
      ReportsAction::Delete { report_ids } => {
        let removed = service.delete_reports(&report_ids).await?;
        eprintln!("Deleted {} report(s)", removed);
      }
    },
    Commands::Results { action } => match action {
      ResultsAction::List(args) => print_json(&service.results(&args.query()).await?)?,
      ResultsAction::Show { result_id } => print_json(&service.result(&result_id).await?)?,
      ResultsAction::Delete { result_ids } => {
        let removed = service.delete_results(&result_ids).await?;
        eprintln!("Deleted {} result(s)", removed);
      }
    },
    Commands::RefreshCache { reset } => {
      let summary = if reset {
        service.reset_cache().await?
      } else {
        service.refresh_cache().await?
      };
      print_json(&summary)?;
    }
    Commands::Info => print_json(&service.server_info().await?)?,
    Commands::Projects => print_json(&service.projects().await?)?,
    Commands::Config { action } => match action {
      ConfigAction::Show => print_json(&service.site_config().await?)?,
      ConfigAction::Set { patch } => {
        let patch = parse_object(&patch)?;
        print_json(&service.update_site_config(patch).await?)?;
      }
    },
    Commands::Tests { action } => match action {
      TestsAction::Quarantine { test, reason } => {
        service
          .quarantine_test(&test.into(), reason.as_deref())
          .await?;
      }
      TestsAction::Unquarantine { test } => service.unquarantine_test(&test.into()).await?,
      TestsAction::Fixed { test } => service.mark_test_fixed(&test.into()).await?,
      TestsAction::History { test, limit } => {
        print_json(&service.test_history(&test.into(), limit).await?)?;
      }
      TestsAction::Quarantined => print_json(&service.quarantined_tests().await?)?,
    },
  }

  Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

fn parse_object(raw: &str) -> Result<Value> {
  let value: Value = serde_json::from_str(raw).context("patch is not valid JSON")?;
  if !value.is_object() {
    bail!("patch must be a JSON object");
  }
  Ok(value)
}

fn parse_tag(raw: &str) -> Result<(String, String), String> {
  match raw.split_once('=') {
    Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
    _ => Err(format!("expected key=value, got '{}'", raw)),
  }
}
