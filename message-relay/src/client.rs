use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    select,
    sync::mpsc,
};
use tracing::{debug, warn};

use crate::{
    agent::{Agent, MessageListener},
    cli::ClientArgs,
    message::{Envelope, SEPARATOR},
};

/// What the receive task hands to the terminal loop.
#[derive(Debug)]
enum ConsoleEvent {
    Message(Envelope),
    Disconnected,
}

struct ConsoleListener {
    events: mpsc::UnboundedSender<ConsoleEvent>,
}

impl MessageListener for ConsoleListener {
    fn on_message(&self, envelope: Envelope) {
        if self.events.send(ConsoleEvent::Message(envelope)).is_err() {
            debug!("console closed; dropping envelope");
        }
    }

    fn on_disconnected(&self) {
        if self.events.send(ConsoleEvent::Disconnected).is_err() {
            debug!("console closed; dropping disconnect notice");
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum OutputFormat {
    Text,
    Json,
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let agent = Agent::new(args.relay.clone());
    agent
        .set_listener(ConsoleListener { events: events_tx })
        .await;
    agent.connect(args.username.as_str()).await?;
    write_stdout(&format!("*** connected as {}", args.username)).await?;

    let format = if args.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    let result = run_client_loop(&agent, &mut events, &mut stdin, &mut input, format).await;
    agent.disconnect().await;

    result
}

async fn run_client_loop(
    agent: &Agent,
    events: &mut mpsc::UnboundedReceiver<ConsoleEvent>,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
    format: OutputFormat,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            event = events.recv() => {
                if !handle_event(event, format).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, agent).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_event(event: Option<ConsoleEvent>, format: OutputFormat) -> Result<bool> {
    match event {
        Some(ConsoleEvent::Message(envelope)) => {
            render_envelope(&envelope, format).await?;
            Ok(true)
        }
        Some(ConsoleEvent::Disconnected) | None => {
            write_stdout("*** disconnected from relay").await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    agent: &Agent,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    let Some((receiver, body)) = text.split_once(SEPARATOR) else {
        write_stderr("!!! expected <receiver>:<message>").await?;
        return Ok(true);
    };

    if let Err(err) = agent.send_message(receiver, body).await {
        write_stderr(&format!("!!! {err:#}")).await?;
        return Ok(agent.is_connected().await);
    }
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn render_envelope(envelope: &Envelope, format: OutputFormat) -> Result<()> {
    let line = match format {
        OutputFormat::Text => format!("<{}> {}", envelope.sender, envelope.body),
        OutputFormat::Json => {
            serde_json::to_string(envelope).context("failed to encode envelope as JSON")?
        }
    };
    write_stdout(&line).await?;
    Ok(())
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
