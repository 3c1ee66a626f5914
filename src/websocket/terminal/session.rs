//! Terminal session state machines
//!
//! Restricted sessions line-edit input inside the gateway, run either
//! supervisor pseudo-commands or allowlisted worker invocations, and
//! stream PTY output back. Binary frames carry terminal bytes in both
//! directions; Text frames carry structured control messages (resize).
//! Full-access sessions skip all of that and pipe the socket straight
//! into a shell PTY.

use axum::extract::ws::{Message, WebSocket};
use clawgate_core::redact::redact_secrets;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use pty_process::Size;
use serde::Deserialize;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::command::{parse_line, ParsedLine, PseudoCommand, WORKER_PROGRAM};
use super::TerminalMode;
use crate::server::AppState;

const PROMPT: &str = "openclaw> ";

/// Structured client control messages, sent as Text frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlMessage {
    Resize { cols: u16, rows: u16 },
}

type WsSender = SplitSink<WebSocket, Message>;

/// Entry point after the WebSocket upgrade.
pub async fn run(socket: WebSocket, state: Arc<AppState>, mode: TerminalMode) {
    match mode {
        TerminalMode::Restricted => {
            RestrictedSession::new(state).run(socket).await;
        }
        TerminalMode::FullAccess => {
            run_full_access(socket, state).await;
        }
    }
    debug!("terminal session closed");
}

async fn send_output(sender: &mut WsSender, bytes: impl Into<Vec<u8>>) -> bool {
    sender.send(Message::Binary(bytes.into())).await.is_ok()
}

// ── Restricted mode ─────────────────────────────────────────────────

/// A PTY subprocess spawned for one allowlisted command.
struct ActivePty {
    reader: pty_process::OwnedReadPty,
    writer: pty_process::OwnedWritePty,
    child: tokio::process::Child,
}

/// Outcome of feeding one input byte to the line editor.
enum EditStep {
    /// Byte consumed, nothing to send
    Quiet,
    /// Echo these bytes back to the client
    Echo(Vec<u8>),
    /// A complete line was submitted
    Submit(String),
}

/// Byte-at-a-time line editing for the Idle state.
#[derive(Default)]
struct LineEditor {
    buffer: String,
    /// CR seen as the previous input byte (CRLF folding)
    last_was_cr: bool,
}

impl LineEditor {
    fn feed(&mut self, byte: u8) -> EditStep {
        let was_cr = std::mem::take(&mut self.last_was_cr);
        match byte {
            // Terminals submit with CR; a bare LF from piped input is
            // treated the same, but the LF of a CRLF pair is dropped so
            // it cannot double-submit.
            b'\n' if was_cr => EditStep::Quiet,
            b'\r' | b'\n' => {
                self.last_was_cr = byte == b'\r';
                EditStep::Submit(std::mem::take(&mut self.buffer))
            }
            // Backspace (DEL or BS)
            0x7f | 0x08 => {
                if self.buffer.pop().is_some() {
                    EditStep::Echo(b"\x08 \x08".to_vec())
                } else {
                    EditStep::Quiet
                }
            }
            // ^U kill line
            0x15 => {
                let erase = b"\x08 \x08".repeat(self.buffer.len());
                self.buffer.clear();
                EditStep::Echo(erase)
            }
            // ^C abandon line
            0x03 => {
                self.buffer.clear();
                EditStep::Echo(format!("^C\r\n{PROMPT}").into_bytes())
            }
            // Printable ASCII is buffered and echoed; everything else
            // is dropped (the allowlist rejects it anyway).
            0x20..=0x7e => {
                self.buffer.push(byte as char);
                EditStep::Echo(vec![byte])
            }
            _ => EditStep::Quiet,
        }
    }
}

struct RestrictedSession {
    state: Arc<AppState>,
    editor: LineEditor,
    cols: u16,
    rows: u16,
    /// Some while a command subprocess runs; input is forwarded
    /// verbatim until it exits.
    active: Option<ActivePty>,
}

impl RestrictedSession {
    fn new(state: Arc<AppState>) -> Self {
        Self {
            state,
            editor: LineEditor::default(),
            cols: 80,
            rows: 24,
            active: None,
        }
    }

    async fn run(mut self, socket: WebSocket) {
        info!("restricted terminal session started");
        let (mut sender, mut receiver) = socket.split();

        if !send_output(&mut sender, format!("clawgate terminal (type 'help')\r\n{PROMPT}"))
            .await
        {
            return;
        }

        let mut pty_buf = [0u8; 4096];
        loop {
            // Reading the PTY only when a subprocess is active keeps
            // the select honest; otherwise the branch pends forever.
            let pty_read = async {
                match &mut self.active {
                    Some(pty) => pty.reader.read(&mut pty_buf).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                msg = receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(bytes))) => {
                            if !self.handle_input(&mut sender, &bytes).await {
                                break;
                            }
                        }
                        Some(Ok(Message::Text(text))) => self.handle_control(&text).await,
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(error = %e, "terminal socket error");
                            break;
                        }
                    }
                }
                read = pty_read => {
                    match read {
                        Ok(0) | Err(_) => {
                            if !self.finish_subprocess(&mut sender).await {
                                break;
                            }
                        }
                        Ok(n) => {
                            let text = redact_secrets(&String::from_utf8_lossy(&pty_buf[..n]));
                            if !send_output(&mut sender, text.into_bytes()).await {
                                break;
                            }
                        }
                    }
                }
            }
        }

        // Session owns its subprocess; never leave one behind.
        if let Some(mut pty) = self.active.take() {
            let _ = pty.child.start_kill();
            let _ = pty.child.wait().await;
        }
    }

    /// Handle raw input bytes. Returns false when the session should end.
    async fn handle_input(&mut self, sender: &mut WsSender, bytes: &[u8]) -> bool {
        // Running state: everything goes to the subprocess verbatim.
        if let Some(pty) = &mut self.active {
            if pty.writer.write_all(bytes).await.is_err() {
                return self.finish_subprocess(sender).await;
            }
            return true;
        }

        // Idle state: line editing.
        for &byte in bytes {
            match self.editor.feed(byte) {
                EditStep::Quiet => {}
                EditStep::Echo(out) => {
                    if !send_output(sender, out).await {
                        return false;
                    }
                }
                EditStep::Submit(line) => {
                    if !send_output(sender, b"\r\n".to_vec()).await {
                        return false;
                    }
                    if !self.handle_line(sender, &line).await {
                        return false;
                    }
                }
            }
        }
        true
    }

    async fn handle_control(&mut self, text: &str) {
        match serde_json::from_str::<ControlMessage>(text) {
            Ok(ControlMessage::Resize { cols, rows }) => {
                self.cols = cols;
                self.rows = rows;
                if let Some(pty) = &self.active {
                    if let Err(e) = pty.writer.resize(Size::new(rows, cols)) {
                        warn!(error = %e, "pty resize failed");
                    }
                }
            }
            Err(e) => debug!(error = %e, "ignoring malformed control message"),
        }
    }

    /// Process one complete line. Returns false to end the session.
    async fn handle_line(&mut self, sender: &mut WsSender, line: &str) -> bool {
        match parse_line(line) {
            ParsedLine::Empty => self.prompt(sender).await,
            ParsedLine::Rejected(reason) => {
                let err = clawgate_core::Error::CommandRejected(reason);
                send_output(sender, format!("{err}\r\n{PROMPT}").into_bytes()).await
            }
            ParsedLine::Pseudo(PseudoCommand::Exit) => {
                let _ = send_output(sender, b"bye\r\n".to_vec()).await;
                false
            }
            ParsedLine::Pseudo(cmd) => {
                let reply = self.run_pseudo(cmd).await;
                send_output(sender, format!("{reply}\r\n{PROMPT}").into_bytes()).await
            }
            ParsedLine::External(argv) => match self.spawn_command(&argv) {
                Ok(()) => true,
                Err(e) => {
                    send_output(sender, format!("error: {e}\r\n{PROMPT}").into_bytes()).await
                }
            },
        }
    }

    async fn prompt(&self, sender: &mut WsSender) -> bool {
        send_output(sender, PROMPT.as_bytes().to_vec()).await
    }

    async fn run_pseudo(&self, cmd: PseudoCommand) -> String {
        let supervisor = &self.state.supervisor;
        let timeout = supervisor.settings().start_timeout;
        match cmd {
            PseudoCommand::Help => format!(
                "commands:\r\n  help | status | start | stop | restart | exit\r\n  {WORKER_PROGRAM} <subcommand> [args]"
            ),
            PseudoCommand::Status => {
                let status = supervisor.status().await;
                let mut out = format!(
                    "worker: {:?} (ready: {})",
                    status.state, status.ready
                );
                if let Some(pid) = status.pid {
                    out.push_str(&format!("\r\npid: {pid}"));
                }
                if status.restart_attempts > 0 {
                    out.push_str(&format!("\r\nrestart attempts: {}", status.restart_attempts));
                }
                if let Some(err) = status.last_error {
                    out.push_str(&format!("\r\nlast error: {err}"));
                }
                out
            }
            PseudoCommand::Start => {
                supervisor.clear_stop().await;
                match supervisor.ensure_running(timeout).await {
                    Ok(()) => "worker is ready".to_string(),
                    Err(e) => format!("start failed: {e}"),
                }
            }
            PseudoCommand::Stop => match supervisor.stop().await {
                Ok(()) => "worker stopped".to_string(),
                Err(e) => format!("stop failed: {e}"),
            },
            PseudoCommand::Restart => match supervisor.restart(timeout).await {
                Ok(()) => "worker restarted".to_string(),
                Err(e) => format!("restart failed: {e}"),
            },
            PseudoCommand::Exit => String::new(),
        }
    }

    /// Spawn an allowlisted worker invocation in a fresh PTY.
    fn spawn_command(&mut self, argv: &[String]) -> Result<(), String> {
        // argv[0] is the allowlist token; the configured binary path is
        // what actually runs.
        let bin = self.state.supervisor.settings().bin.clone();
        let pty = spawn_pty(&bin, &argv[1..], self.rows, self.cols)?;
        info!(command = %argv.join(" "), "terminal subprocess started");
        self.active = Some(pty);
        Ok(())
    }

    /// Reap the finished subprocess and return to Idle.
    async fn finish_subprocess(&mut self, sender: &mut WsSender) -> bool {
        let Some(mut pty) = self.active.take() else {
            return true;
        };
        let note = match pty.child.wait().await {
            Ok(status) if status.success() => String::new(),
            Ok(status) => format!("[exit: {status}]\r\n"),
            Err(e) => format!("[wait failed: {e}]\r\n"),
        };
        send_output(sender, format!("\r\n{note}{PROMPT}").into_bytes()).await
    }
}

/// Attach `bin` with `args` to a fresh PTY of the given dimensions.
fn spawn_pty(
    bin: &std::path::Path,
    args: &[String],
    rows: u16,
    cols: u16,
) -> Result<ActivePty, String> {
    let (pty, pts) = pty_process::open().map_err(|e| format!("pty allocation failed: {e}"))?;
    pty.resize(Size::new(rows, cols))
        .map_err(|e| format!("pty resize failed: {e}"))?;
    let child = pty_process::Command::new(bin)
        .args(args)
        .env("TERM", "xterm-256color")
        .spawn(pts)
        .map_err(|e| format!("spawn failed: {e}"))?;
    let (reader, writer) = pty.into_split();
    Ok(ActivePty {
        reader,
        writer,
        child,
    })
}

// ── Full-access mode ────────────────────────────────────────────────

/// Unrestricted shell session. No allowlist, no line editing; the
/// socket is piped straight into a shell PTY for its whole lifetime.
async fn run_full_access(socket: WebSocket, state: Arc<AppState>) {
    info!("full-access terminal session started");
    let (mut sender, mut receiver) = socket.split();

    let shell = state.config.terminal.shell.clone();
    let (pty, pts) = match pty_process::open() {
        Ok(pair) => pair,
        Err(e) => {
            warn!(error = %e, "pty allocation failed");
            let _ = send_output(&mut sender, format!("error: {e}\r\n").into_bytes()).await;
            return;
        }
    };
    let mut child = match pty_process::Command::new(&shell)
        .env("TERM", "xterm-256color")
        .spawn(pts)
    {
        Ok(c) => c,
        Err(e) => {
            warn!(shell, error = %e, "shell spawn failed");
            let _ = send_output(&mut sender, format!("error: {e}\r\n").into_bytes()).await;
            return;
        }
    };

    let (mut reader, mut writer) = pty.into_split();
    let mut pty_buf = [0u8; 4096];
    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(bytes))) => {
                        if writer.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(ControlMessage::Resize { cols, rows }) =
                            serde_json::from_str(&text)
                        {
                            if let Err(e) = writer.resize(Size::new(rows, cols)) {
                                warn!(error = %e, "pty resize failed");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            read = reader.read(&mut pty_buf) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if !send_output(&mut sender, pty_buf[..n].to_vec()).await {
                            break;
                        }
                    }
                }
            }
        }
    }

    // Shell dies with the session.
    let _ = child.start_kill();
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(editor: &mut LineEditor, input: &[u8]) -> Vec<String> {
        let mut submits = Vec::new();
        for &b in input {
            if let EditStep::Submit(line) = editor.feed(b) {
                submits.push(line);
            }
        }
        submits
    }

    #[test]
    fn crlf_submits_a_single_line() {
        let mut ed = LineEditor::default();
        assert_eq!(feed_all(&mut ed, b"status\r\n"), vec!["status".to_string()]);
    }

    #[test]
    fn bare_newlines_each_submit() {
        let mut ed = LineEditor::default();
        assert_eq!(
            feed_all(&mut ed, b"a\n\n"),
            vec!["a".to_string(), String::new()]
        );
    }

    #[test]
    fn backspace_removes_the_last_character() {
        let mut ed = LineEditor::default();
        assert_eq!(
            feed_all(&mut ed, b"statx\x7fus\r"),
            vec!["status".to_string()]
        );
    }

    #[test]
    fn backspace_on_an_empty_line_echoes_nothing() {
        let mut ed = LineEditor::default();
        assert!(matches!(ed.feed(0x7f), EditStep::Quiet));
    }

    #[test]
    fn kill_line_erases_the_buffer() {
        let mut ed = LineEditor::default();
        for &b in b"garbage" {
            ed.feed(b);
        }
        let EditStep::Echo(erase) = ed.feed(0x15) else {
            panic!("kill line must echo erases");
        };
        assert_eq!(erase.len(), 3 * "garbage".len());
        assert_eq!(feed_all(&mut ed, b"status\r"), vec!["status".to_string()]);
    }

    #[test]
    fn interrupt_abandons_the_line() {
        let mut ed = LineEditor::default();
        for &b in b"half" {
            ed.feed(b);
        }
        let EditStep::Echo(out) = ed.feed(0x03) else {
            panic!("interrupt must echo");
        };
        assert!(String::from_utf8_lossy(&out).contains("^C"));
        assert_eq!(feed_all(&mut ed, b"status\r"), vec!["status".to_string()]);
    }

    #[test]
    fn control_bytes_are_dropped() {
        let mut ed = LineEditor::default();
        assert!(matches!(ed.feed(0x1b), EditStep::Quiet));
        assert_eq!(feed_all(&mut ed, b"ok\r"), vec!["ok".to_string()]);
    }

    #[tokio::test]
    async fn submitted_worker_command_spawns_one_pty_child() {
        let mut ed = LineEditor::default();
        let submits = feed_all(&mut ed, b"openclaw status\r\n");
        assert_eq!(submits.len(), 1, "one line, one submission");

        let ParsedLine::External(argv) = parse_line(&submits[0]) else {
            panic!("worker invocation must parse as external");
        };

        // Stand-in binary; the session wiring passes argv[1..] the same way.
        let mut pty =
            spawn_pty(std::path::Path::new("/bin/echo"), &argv[1..], 24, 80).unwrap();
        let mut output = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            match pty.reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => output.extend_from_slice(&buf[..n]),
            }
        }
        assert!(pty.child.wait().await.unwrap().success());
        assert!(String::from_utf8_lossy(&output).contains("status"));
    }
}
