//! JSON-lines frontend: platform events in on stdin, host commands out on stdout.

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use url::Url;

use crate::control::ControlMessage;
use crate::host::{Host, HostCommand};
use crate::net::Request;
use crate::worker::{FetchOutcome, Outcome, WorkerEvent, WorkerHandle};

/// One line of input from the platform.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
  Fetch {
    id: String,
    request: Request,
  },
  Push {
    data: String,
  },
  NotificationClick {
    id: String,
    #[serde(default)]
    data: Value,
  },
  Message {
    message: ControlMessage,
  },
  Sync {
    tag: String,
  },
  Online,
  ClientOpened {
    id: String,
    url: Url,
  },
  ClientNavigated {
    id: String,
    url: Url,
  },
  ClientClosed {
    id: String,
  },
}

/// Read events until EOF, then wait for every pending reply to be emitted.
pub async fn serve<R>(input: R, handle: WorkerHandle, host: Arc<dyn Host>) -> Result<()>
where
  R: AsyncBufRead + Unpin,
{
  let mut lines = input.lines();
  let mut pending = JoinSet::new();

  while let Some(line) = lines
    .next_line()
    .await
    .map_err(|e| eyre!("Failed to read input: {}", e))?
  {
    let line = line.trim();
    if line.is_empty() {
      continue;
    }

    let message: InboundMessage = match serde_json::from_str(line) {
      Ok(message) => message,
      Err(e) => {
        warn!(error = %e, "skipping malformed input line");
        continue;
      }
    };
    debug!(?message, "inbound");

    match message {
      InboundMessage::Fetch { id, request } => {
        let handle = handle.clone();
        let host = Arc::clone(&host);
        pending.spawn(async move {
          let command = match handle.request(WorkerEvent::Fetch(request)).await {
            Ok(Outcome::Fetch(FetchOutcome::Respond(result))) => HostCommand::FetchResponse {
              id,
              source: result.source,
              response: result.response,
            },
            Ok(_) => HostCommand::FetchDeclined { id },
            Err(e) => HostCommand::FetchFailed {
              id,
              error: e.to_string(),
            },
          };
          host.emit(command);
        });
      }
      InboundMessage::Message { message } => {
        let handle = handle.clone();
        let host = Arc::clone(&host);
        pending.spawn(async move {
          let kind = message.kind().to_string();
          let error = handle
            .request(WorkerEvent::Message(message))
            .await
            .err()
            .map(|e| e.to_string());
          host.emit(HostCommand::MessageHandled { kind, error });
        });
      }
      InboundMessage::Push { data } => handle.send(WorkerEvent::Push(data.into_bytes()))?,
      InboundMessage::NotificationClick { id, data } => {
        handle.send(WorkerEvent::NotificationClick { id, data })?
      }
      InboundMessage::Sync { tag } => handle.send(WorkerEvent::Sync { tag })?,
      InboundMessage::Online => handle.send(WorkerEvent::Online)?,
      InboundMessage::ClientOpened { id, url } => {
        handle.send(WorkerEvent::ClientOpened { id, url })?
      }
      InboundMessage::ClientNavigated { id, url } => {
        handle.send(WorkerEvent::ClientNavigated { id, url })?
      }
      InboundMessage::ClientClosed { id } => handle.send(WorkerEvent::ClientClosed { id })?,
    }
  }

  while pending.join_next().await.is_some() {}
  Ok(())
}

/// Write host commands as JSON lines until the channel closes.
pub async fn write_commands<W>(mut rx: mpsc::UnboundedReceiver<HostCommand>, mut output: W) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  while let Some(command) = rx.recv().await {
    let mut line =
      serde_json::to_vec(&command).map_err(|e| eyre!("Failed to serialize command: {}", e))?;
    line.push(b'\n');
    output
      .write_all(&line)
      .await
      .map_err(|e| eyre!("Failed to write output: {}", e))?;
    output
      .flush()
      .await
      .map_err(|e| eyre!("Failed to flush output: {}", e))?;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::db::Database;
  use crate::host::ChannelHost;
  use crate::net::Response;
  use crate::testing::{test_config, MockTransport, RecordingHost};
  use crate::worker::{self, ServiceWorker};

  #[test]
  fn test_parse_inbound_messages() {
    let fetch: InboundMessage = serde_json::from_str(
      r#"{"type":"fetch","id":"1","request":{"method":"GET","url":"https://app.test/","navigate":true}}"#,
    )
    .unwrap();
    assert!(matches!(fetch, InboundMessage::Fetch { ref request, .. } if request.navigate));

    let message: InboundMessage = serde_json::from_str(
      r#"{"type":"message","message":{"type":"CACHE_URLS","payload":{"urls":["/a"]}}}"#,
    )
    .unwrap();
    assert!(matches!(
      message,
      InboundMessage::Message {
        message: ControlMessage::CacheUrls { .. }
      }
    ));

    let online: InboundMessage = serde_json::from_str(r#"{"type":"online"}"#).unwrap();
    assert!(matches!(online, InboundMessage::Online));
  }

  #[tokio::test]
  async fn test_serve_round_trip() {
    let transport = Arc::new(MockTransport::new());
    transport.respond("/", Response::new(200, "home"));
    transport.respond("/offline", Response::new(200, "offline"));
    transport.respond("/app.js", Response::new(200, "js"));
    let host = Arc::new(RecordingHost::default());
    let worker = ServiceWorker::new(
      test_config(),
      Arc::new(Database::open_in_memory().unwrap()),
      transport,
      host.clone(),
    )
    .unwrap();
    worker.start().await.unwrap();
    let (handle, task) = worker::spawn(Arc::new(worker));

    let input = concat!(
      "{\"type\":\"fetch\",\"id\":\"a\",\"request\":{\"method\":\"GET\",\"url\":\"https://app.test/app.js\"}}\n",
      "not json at all\n",
      "\n",
      "{\"type\":\"fetch\",\"id\":\"b\",\"request\":{\"method\":\"GET\",\"url\":\"https://cdn.test/x.js\"}}\n",
      "{\"type\":\"message\",\"message\":{\"type\":\"SKIP_WAITING\"}}\n",
    );
    serve(input.as_bytes(), handle, host.clone()).await.unwrap();
    task.await.unwrap();

    let commands = host.commands();
    assert!(commands.iter().any(|c| matches!(
      c,
      HostCommand::FetchResponse { id, source: CacheSource::Network, response }
        if id == "a" && response.body == b"js"
    )));
    assert!(commands
      .iter()
      .any(|c| matches!(c, HostCommand::FetchDeclined { id } if id == "b")));
    assert!(commands.iter().any(|c| matches!(
      c,
      HostCommand::MessageHandled { kind, error: None } if kind == "SKIP_WAITING"
    )));
  }

  #[tokio::test]
  async fn test_write_commands_emits_json_lines() {
    let (host, rx) = ChannelHost::new();
    host.emit(HostCommand::OpenWindow {
      url: "https://app.test/".to_string(),
    });
    host.emit(HostCommand::FetchDeclined {
      id: "7".to_string(),
    });
    drop(host);

    let mut out = Vec::new();
    write_commands(rx, &mut out).await.unwrap();

    let text = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(
      lines[1],
      r#"{"type":"fetch_declined","id":"7"}"#
    );
  }
}
