mod cache;
mod clients;
mod config;
mod control;
mod db;
mod host;
mod lifecycle;
mod logging;
mod net;
mod push;
mod queue;
mod router;
mod stdio;
#[cfg(test)]
mod testing;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;

use crate::control::ControlMessage;
use crate::host::{ChannelHost, Host};
use crate::net::{HttpTransport, Request};
use crate::worker::{FetchOutcome, Outcome, ServiceWorker, WorkerEvent};

#[derive(Parser, Debug)]
#[command(name = "offsync")]
#[command(about = "Offline-capable request interception, caching and replay worker")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offsync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Database file (overrides the config file)
  #[arg(long, global = true)]
  database: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run as a long-lived worker speaking JSON lines on stdin/stdout
  Run,
  /// Precache the manifest and activate this version
  Install,
  /// Intercept a single request
  Fetch {
    url: String,
    #[arg(short, long, default_value = "GET")]
    method: String,
    /// Treat as a full-page navigation
    #[arg(long)]
    navigate: bool,
    #[arg(long)]
    body: Option<String>,
  },
  /// Replay queued requests (every tag unless one is given)
  Sync {
    #[arg(short, long)]
    tag: Option<String>,
  },
  /// Send a control message, e.g. '{"type":"CLEAR_CACHE"}'
  Message { json: String },
  /// Deliver a push payload
  Push { payload: String },
  /// Show partitions, queues and lifecycle state
  Status,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let config = match args.database {
    Some(path) => config::Config {
      database: Some(path),
      ..config
    },
    None => config,
  };

  let _guard = logging::init(&config::data_dir()?.join("logs"))?;

  let db = Arc::new(db::Database::open(config.database.as_deref())?);
  let transport = Arc::new(HttpTransport::new()?);
  let (host, rx) = ChannelHost::new();
  let writer = tokio::spawn(stdio::write_commands(rx, tokio::io::stdout()));

  let host: Arc<dyn Host> = Arc::new(host);
  let worker = Arc::new(ServiceWorker::new(config, db, transport, Arc::clone(&host))?);

  match args.command {
    Command::Run => {
      worker.start().await?;
      let (handle, task) = worker::spawn(Arc::clone(&worker));
      stdio::serve(BufReader::new(tokio::io::stdin()), handle, Arc::clone(&host)).await?;
      task.await.map_err(|e| eyre!("Worker task failed: {}", e))?;
    }
    Command::Install => {
      let state = worker.start().await?;
      println!("{}", serde_json::to_string(&state)?);
    }
    Command::Fetch {
      url,
      method,
      navigate,
      body,
    } => {
      worker.start().await?;
      let url = worker.resolve(&url)?;
      let mut request = Request::new(&method, url);
      request.navigate = navigate;
      if let Some(body) = body {
        request = request.with_body(body);
      }

      match worker.dispatch(WorkerEvent::Fetch(request)).await? {
        Outcome::Fetch(FetchOutcome::Respond(result)) => {
          eprintln!("{} ({:?})", result.response.status, result.source);
          println!("{}", String::from_utf8_lossy(&result.response.body));
        }
        _ => eprintln!("declined (pass-through)"),
      }
    }
    Command::Sync { tag } => {
      worker.start().await?;
      let event = match tag {
        Some(tag) => WorkerEvent::Sync { tag },
        None => WorkerEvent::Online,
      };
      if let Outcome::Replay(reports) = worker.dispatch(event).await? {
        for report in reports {
          println!(
            "{}: replayed {}, failed {}, dropped {}",
            report.tag, report.replayed, report.failed, report.dropped
          );
        }
      }
    }
    Command::Message { json } => {
      let message: ControlMessage =
        serde_json::from_str(&json).map_err(|e| eyre!("Invalid control message: {}", e))?;
      worker.start().await?;
      let outcome = worker.dispatch(WorkerEvent::Message(message)).await?;
      println!("{:?}", outcome);
    }
    Command::Push { payload } => {
      worker.start().await?;
      worker
        .dispatch(WorkerEvent::Push(payload.into_bytes()))
        .await?;
    }
    Command::Status => {
      let status = worker.status()?;
      println!("{}", serde_json::to_string_pretty(&status)?);
    }
  }

  // Close the output channel so the writer drains and exits
  drop(worker);
  drop(host);
  writer
    .await
    .map_err(|e| eyre!("Output task failed: {}", e))??;

  Ok(())
}
