use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::time::{timeout, timeout_at, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

use crate::config::ServerArgs;
use crate::protocol::{AUTH, CONNECTION_SUCCESS};

#[derive(Parser, Debug)]
#[command(name = "huddle-signal", version)]
#[command(about = "Huddle WebRTC signaling coordinator and probe client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub server: ServerArgs,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect, authenticate and print the frames the coordinator sends back
    Probe {
        /// WebSocket endpoint (e.g., ws://localhost:8080/ws)
        #[arg(short, long, default_value = "ws://localhost:8080/ws")]
        url: String,

        /// Credential presented in the auth frame
        #[arg(short, long)]
        token: String,

        /// Seconds to keep listening after connecting
        #[arg(short, long, default_value_t = 5)]
        wait_secs: u64,
    },
}

pub async fn run_probe(url: String, token: String, wait_secs: u64) -> Result<()> {
    debug!("Connecting to {}", url);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", url, e);
            return Err(anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            error!("Connection timeout after 5 seconds");
            return Err(anyhow!("Connection timeout - is the coordinator running?"));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let auth = json!({ "type": AUTH, "payload": { "token": token } });
    write.send(Message::Text(auth.to_string().into())).await?;

    let deadline = Instant::now() + Duration::from_secs(wait_secs);
    let mut joined = false;
    loop {
        let msg = match timeout_at(deadline, read.next()).await {
            Err(_) => break,
            Ok(None) => break,
            Ok(Some(msg)) => msg?,
        };
        match msg {
            Message::Text(text) => {
                let frame: serde_json::Value = serde_json::from_str(text.as_str())?;
                if frame["type"] == CONNECTION_SUCCESS {
                    joined = true;
                }
                println!("{}", serde_json::to_string_pretty(&frame)?);
            }
            Message::Close(frame) => {
                match frame {
                    Some(frame) => {
                        println!("closed: {} {}", u16::from(frame.code), frame.reason.as_str())
                    }
                    None => println!("closed"),
                }
                if !joined {
                    bail!("coordinator closed the connection before authentication succeeded");
                }
                return Ok(());
            }
            _ => {}
        }
    }

    let _ = write.send(Message::Close(None)).await;
    if !joined {
        bail!("no connection-success received within {} seconds", wait_secs);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn probe_arguments_parse() {
        let cli = Cli::try_parse_from([
            "huddle-signal",
            "probe",
            "--token",
            "tok",
            "--wait-secs",
            "2",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Probe {
                url,
                token,
                wait_secs,
            }) => {
                assert_eq!(url, "ws://localhost:8080/ws");
                assert_eq!(token, "tok");
                assert_eq!(wait_secs, 2);
            }
            None => panic!("expected probe subcommand"),
        }
    }

    #[test_timeout::timeout]
    fn server_flags_without_subcommand() {
        let cli = Cli::try_parse_from(["huddle-signal", "--dev-token", "t=m"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.server.dev_tokens, vec!["t=m".to_string()]);
    }
}
