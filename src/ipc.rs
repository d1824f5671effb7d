// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Newline-delimited JSON over the process's standard streams.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::command::{HostCommand, HostResponse};

#[derive(Debug)]
pub enum IpcInput {
    Command(HostCommand),
    /// A line that is not a valid command, with the parse error.
    Malformed(String),
}

/// Reads one command per line until `input` closes, then drops `tx`.
pub fn spawn_reader<R>(input: R, tx: mpsc::Sender<IpcInput>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(input).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Failed to read from controller: {}", e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let input = match serde_json::from_str::<HostCommand>(&line) {
                Ok(command) => IpcInput::Command(command),
                Err(e) => IpcInput::Malformed(format!("{}: {}", e, line)),
            };
            if tx.send(input).await.is_err() {
                break;
            }
        }
        tracing::debug!("Controller input closed");
    })
}

/// Writes one response per line until every sender is dropped.
pub fn spawn_writer<W>(mut output: W, mut rx: mpsc::UnboundedReceiver<HostResponse>) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            let mut line = match serde_json::to_string(&response) {
                Ok(line) => line,
                Err(e) => {
                    tracing::error!("Failed to encode response: {}", e);
                    continue;
                }
            };
            line.push('\n');
            if let Err(e) = output.write_all(line.as_bytes()).await {
                tracing::error!("Failed to write to controller: {}", e);
                break;
            }
            if let Err(e) = output.flush().await {
                tracing::error!("Failed to flush controller output: {}", e);
                break;
            }
        }
    })
}
