use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn cli_relay_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("message_relay");

    let (mut relay_child, mut relay_stdout) = spawn_relay(&binary).await?;
    let port = read_relay_port(&mut relay_stdout).await?;

    let mut alice = spawn_client(&binary, "alice", port, false).await?;
    wait_for_log(&mut relay_stdout, &["client registered", "alice"]).await?;
    let mut bob = spawn_client(&binary, "bob", port, false).await?;
    wait_for_log(&mut relay_stdout, &["client registered", "bob"]).await?;

    // Alice greets Bob; only Bob sees it.
    alice.send_line("bob:hi").await.context("alice send line")?;
    let bob_hears_alice =
        read_line_expect(&mut bob.stdout, "waiting for bob to hear alice").await?;
    assert_eq!(bob_hears_alice, "<alice> hi");

    // The body keeps its separators.
    alice.send_line("bob:a:b").await.context("alice send a:b")?;
    let bob_hears_separator =
        read_line_expect(&mut bob.stdout, "waiting for bob to hear a:b").await?;
    assert_eq!(bob_hears_separator, "<alice> a:b");

    // Bob leaves; the relay drops his registration.
    bob.send_line("/quit").await.context("bob send quit")?;
    let bob_quit = read_line_expect(&mut bob.stdout, "waiting for bob quit confirmation").await?;
    assert_eq!(bob_quit, "*** leaving chat");
    ensure_success(&mut bob.child, "bob client").await?;
    wait_for_log(&mut relay_stdout, &["client unregistered", "bob"]).await?;

    // A message for the absent Bob vanishes without disturbing Alice.
    alice
        .send_line("bob:still there?")
        .await
        .context("alice send to absent bob")?;
    alice.send_line("alice:ping").await.context("alice ping")?;
    let alice_ping = read_line_expect(&mut alice.stdout, "waiting for alice ping").await?;
    assert_eq!(alice_ping, "<alice> ping");

    alice.send_line("/quit").await.context("alice send quit")?;
    let alice_quit =
        read_line_expect(&mut alice.stdout, "waiting for alice quit confirmation").await?;
    assert_eq!(alice_quit, "*** leaving chat");
    ensure_success(&mut alice.child, "alice client").await?;

    // The relay keeps running after clients leave; terminate it manually.
    let _ = relay_child.kill().await;
    let _ = relay_child.wait().await;

    Ok(())
}

#[tokio::test]
async fn cli_json_output_carries_full_envelope() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("message_relay");

    let (mut relay_child, mut relay_stdout) = spawn_relay(&binary).await?;
    let port = read_relay_port(&mut relay_stdout).await?;

    let mut carol = spawn_client(&binary, "carol", port, true).await?;
    wait_for_log(&mut relay_stdout, &["client registered", "carol"]).await?;

    carol.send_line("carol:note:to self").await?;
    let line = read_line_expect(&mut carol.stdout, "waiting for carol json").await?;
    let value: serde_json::Value = serde_json::from_str(&line).context("json line")?;
    assert_eq!(
        value,
        serde_json::json!({"sender": "carol", "receiver": "carol", "body": "note:to self"})
    );

    carol.send_line("/quit").await?;
    read_line_expect(&mut carol.stdout, "waiting for carol quit").await?;
    ensure_success(&mut carol.child, "carol client").await?;

    let _ = relay_child.kill().await;
    let _ = relay_child.wait().await;
    Ok(())
}

struct ClientProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ClientProcess {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }
}

async fn spawn_relay(binary: &Path) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut cmd = Command::new(binary);
    cmd.arg("serve")
        .arg("--host")
        .arg("127.0.0.1")
        .arg("--port")
        .arg("0")
        .env("RUST_LOG", "info")
        .env("NO_COLOR", "1")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd.spawn().context("failed to spawn relay")?;
    let stdout = child
        .stdout
        .take()
        .context("relay stdout missing after spawn")?;

    Ok((child, BufReader::new(stdout)))
}

async fn read_relay_port(reader: &mut BufReader<ChildStdout>) -> Result<u16> {
    let line = read_line(reader)
        .await?
        .context("relay did not emit listening address")?;
    let trimmed = line.trim();
    let addr = trimmed
        .split_whitespace()
        .last()
        .context("unexpected relay banner format")?;
    let (_, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("relay banner missing socket: {trimmed}"))?;
    port.parse::<u16>()
        .with_context(|| format!("relay banner has a bad port: {trimmed}"))
}

async fn wait_for_log(reader: &mut BufReader<ChildStdout>, needles: &[&str]) -> Result<()> {
    loop {
        let line = read_line(reader)
            .await?
            .with_context(|| format!("relay exited before logging {needles:?}"))?;
        if needles.iter().all(|needle| line.contains(needle)) {
            return Ok(());
        }
    }
}

async fn spawn_client(binary: &Path, username: &str, port: u16, json: bool) -> Result<ClientProcess> {
    let mut cmd = Command::new(binary);
    cmd.arg("client")
        .arg("--username")
        .arg(username)
        .arg("--host")
        .arg("127.0.0.1")
        .arg("--port")
        .arg(port.to_string());
    if json {
        cmd.arg("--json");
    }
    cmd.env("RUST_LOG", "warn")
        .env("NO_COLOR", "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn client {username}"))?;

    let stdin = child
        .stdin
        .take()
        .context("client stdin missing after spawn")?;
    let stdout = child
        .stdout
        .take()
        .context("client stdout missing after spawn")?;

    let mut process = ClientProcess {
        child,
        stdin,
        stdout: BufReader::new(stdout),
    };

    let welcome = read_line_expect(&mut process.stdout, "waiting for welcome banner").await?;
    if welcome != format!("*** connected as {username}") {
        return Err(anyhow!(
            "expected welcome banner for {username}, got '{welcome}'"
        ));
    }

    Ok(process)
}

async fn read_line_expect(
    reader: &mut BufReader<ChildStdout>,
    description: &str,
) -> Result<String> {
    match read_line(reader).await {
        Ok(Some(line)) => Ok(line),
        Ok(None) => Err(anyhow!("{description}: stream closed")),
        Err(err) => Err(err.context(format!("{description}: failed to read line"))),
    }
}

async fn read_line(reader: &mut BufReader<ChildStdout>) -> Result<Option<String>> {
    let mut line = String::new();
    let read_future = reader.read_line(&mut line);
    let bytes_io = match timeout(READ_TIMEOUT, read_future).await {
        Ok(result) => result,
        Err(_) => return Err(anyhow!("timed out waiting for line")),
    };
    let byte_count = bytes_io?;
    if byte_count == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn ensure_success(child: &mut Child, name: &str) -> Result<()> {
    let status = child
        .wait()
        .await
        .with_context(|| format!("failed to await {name} process"))?;
    if !status.success() {
        return Err(anyhow!("{name} exited with status {status}"));
    }
    Ok(())
}
