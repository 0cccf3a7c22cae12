//! SMTP listener and session state machine.
//!
//! Each accepted connection runs in its own task. A completed DATA phase is
//! handed to the [`MessageIntake`] and the session waits for its reply before
//! answering the client.

use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::email::{Envelope, RawTransaction};
use crate::intake::MessageIntake;
use crate::reply::Reply;

/// DATA is collected in chunks of roughly this size.
const CHUNK_SIZE: usize = 64 * 1024;

/// Longest accepted command line, CRLF included.
const MAX_COMMAND_LINE: u64 = 1000;

/// Upper bound on a single read during DATA; longer lines arrive in pieces.
const DATA_READ_LIMIT: u64 = CHUNK_SIZE as u64;

/// SMTP session configuration.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub server_name: String,
    pub max_message_size: usize,
}

/// Accept connections until `shutdown` fires, then wait for open sessions.
///
/// `abort` is handed to every session and intake call; it closes idle
/// sessions and cancels in-flight deliveries.
pub async fn run_smtp_server(
    listener: TcpListener,
    intake: Arc<dyn MessageIntake>,
    config: SmtpConfig,
    shutdown: CancellationToken,
    abort: CancellationToken,
) {
    let sessions = TaskTracker::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!("SMTP connection from {addr}");
                        let intake = Arc::clone(&intake);
                        let config = config.clone();
                        let abort = abort.clone();
                        sessions.spawn(async move {
                            if let Err(e) = handle_connection(stream, intake, config, abort).await {
                                debug!("SMTP session error: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {e}");
                    }
                }
            }
            () = shutdown.cancelled() => {
                break;
            }
        }
    }

    drop(listener);
    sessions.close();
    info!(open_sessions = sessions.len(), "SMTP listener stopped, draining sessions");
    sessions.wait().await;
}

enum CommandResult {
    Continue,
    Quit,
}

async fn handle_connection(
    stream: TcpStream,
    intake: Arc<dyn MessageIntake>,
    config: SmtpConfig,
    abort: CancellationToken,
) -> io::Result<()> {
    run_session(stream, intake.as_ref(), &config, &abort).await
}

/// Drive one SMTP session over any byte stream.
pub async fn run_session<S>(
    stream: S,
    intake: &dyn MessageIntake,
    config: &SmtpConfig,
    abort: &CancellationToken,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);
    let mut session = Session::default();

    let greeting = Reply::with_text(220, format!("{} ESMTP smtp-graph-relay", config.server_name));
    send_reply(&mut stream, &greeting).await?;

    loop {
        let mut line = Vec::new();
        let mut limited = (&mut stream).take(MAX_COMMAND_LINE);
        let read = tokio::select! {
            r = limited.read_until(b'\n', &mut line) => Some(r?),
            () = abort.cancelled() => None,
        };
        let Some(bytes_read) = read else {
            send_reply(&mut stream, &Reply::SHUTTING_DOWN).await?;
            return Ok(());
        };
        if bytes_read == 0 {
            return Ok(());
        }
        if !line.ends_with(b"\n") && line.len() as u64 >= MAX_COMMAND_LINE {
            send_reply(&mut stream, &Reply::LINE_TOO_LONG).await?;
            return Ok(());
        }

        let line = String::from_utf8_lossy(&line);
        match process_command(&mut stream, &mut session, line.trim(), config, intake, abort).await? {
            CommandResult::Continue => {}
            CommandResult::Quit => return Ok(()),
        }
    }
}

async fn process_command<S>(
    stream: &mut BufReader<S>,
    session: &mut Session,
    line: &str,
    config: &SmtpConfig,
    intake: &dyn MessageIntake,
    abort: &CancellationToken,
) -> io::Result<CommandResult>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!("=> {line}");
    let cmd = line.to_uppercase();

    let reply = if cmd.starts_with("EHLO") {
        session.reset();
        Reply::with_text(
            250,
            format!(
                "{} Hello\nSIZE {}\n8BITMIME",
                config.server_name, config.max_message_size
            ),
        )
    } else if cmd.starts_with("HELO") {
        session.reset();
        Reply::with_text(250, format!("{} Hello", config.server_name))
    } else if cmd.starts_with("MAIL FROM:") {
        if session.mail_from.is_some() {
            Reply::new(503, "5.5.1 Nested MAIL command")
        } else {
            let (addr, params) = split_path(&line[10..]);
            match declared_size(params) {
                Some(size) if size > config.max_message_size => Reply::TOO_LARGE,
                _ => {
                    session.mail_from = Some(addr);
                    Reply::OK
                }
            }
        }
    } else if cmd.starts_with("RCPT TO:") {
        if session.mail_from.is_none() {
            Reply::new(503, "5.5.1 MAIL FROM required first")
        } else {
            let (addr, _) = split_path(&line[8..]);
            if addr.is_empty() {
                Reply::new(501, "5.1.3 Recipient address required")
            } else {
                session.rcpt_to.push(addr);
                Reply::OK
            }
        }
    } else if cmd == "DATA" {
        if session.mail_from.is_none() {
            Reply::new(503, "5.5.1 MAIL FROM required first")
        } else if session.rcpt_to.is_empty() {
            Reply::new(503, "5.5.1 RCPT TO required first")
        } else {
            send_reply(stream, &Reply::START_DATA).await?;
            let envelope = session.take_envelope();
            let outcome = tokio::select! {
                r = read_data(&mut *stream, config.max_message_size) => Some(r?),
                () = abort.cancelled() => None,
            };
            match outcome {
                None => {
                    send_reply(stream, &Reply::SHUTTING_DOWN).await?;
                    return Ok(CommandResult::Quit);
                }
                Some(DataOutcome::Complete(chunks)) => {
                    let transaction = RawTransaction::new(envelope, chunks);
                    intake.intake(transaction, abort).await
                }
                Some(DataOutcome::TooLarge) => Reply::TOO_LARGE,
            }
        }
    } else if cmd == "RSET" {
        session.reset();
        Reply::OK
    } else if cmd == "NOOP" || cmd.starts_with("NOOP ") {
        Reply::OK
    } else if cmd.starts_with("VRFY") {
        Reply::CANNOT_VRFY
    } else if cmd == "QUIT" {
        send_reply(stream, &Reply::BYE).await?;
        return Ok(CommandResult::Quit);
    } else if cmd.starts_with("STARTTLS") || cmd.starts_with("AUTH") || cmd.starts_with("EXPN") {
        Reply::NOT_IMPLEMENTED
    } else {
        Reply::SYNTAX_ERROR
    };

    send_reply(stream, &reply).await?;
    Ok(CommandResult::Continue)
}

async fn send_reply<W: AsyncWrite + Unpin>(stream: &mut W, reply: &Reply) -> io::Result<()> {
    debug!("<= {reply}");
    stream.write_all(&reply.to_bytes()).await?;
    stream.flush().await
}

#[derive(Default)]
struct Session {
    mail_from: Option<String>,
    rcpt_to: Vec<String>,
}

impl Session {
    fn reset(&mut self) {
        self.mail_from = None;
        self.rcpt_to.clear();
    }

    fn take_envelope(&mut self) -> Envelope {
        Envelope {
            mail_from: self.mail_from.take(),
            rcpt_to: std::mem::take(&mut self.rcpt_to),
        }
    }
}

/// Split `<path> PARAM=...` into the bare address and the parameter text.
fn split_path(s: &str) -> (String, &str) {
    let s = s.trim();
    if let (Some(start), Some(end)) = (s.find('<'), s.find('>')) {
        if start < end {
            return (s[start + 1..end].trim().to_string(), &s[end + 1..]);
        }
    }
    match s.split_once(char::is_whitespace) {
        Some((addr, params)) => (addr.to_string(), params),
        None => (s.to_string(), ""),
    }
}

fn declared_size(params: &str) -> Option<usize> {
    params.split_whitespace().find_map(|p| {
        let (key, value) = p.split_once('=')?;
        if key.eq_ignore_ascii_case("SIZE") {
            value.parse().ok()
        } else {
            None
        }
    })
}

enum DataOutcome {
    Complete(Vec<Bytes>),
    TooLarge,
}

/// Read DATA up to the lone-dot terminator, undoing dot-stuffing.
///
/// Oversized payloads are drained and dropped so the session stays in sync.
/// Memory held is bounded by `max` plus one read, even for lines without LF.
async fn read_data<R: AsyncBufRead + Unpin>(reader: &mut R, max: usize) -> io::Result<DataOutcome> {
    let mut chunks = Vec::new();
    let mut current = BytesMut::with_capacity(CHUNK_SIZE);
    let mut total = 0usize;
    let mut too_large = false;
    let mut line = Vec::new();
    let mut at_line_start = true;

    loop {
        line.clear();
        let bytes_read = (&mut *reader)
            .take(DATA_READ_LIMIT)
            .read_until(b'\n', &mut line)
            .await?;
        if bytes_read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed during DATA",
            ));
        }
        let starts_line = at_line_start;
        at_line_start = line.ends_with(b"\n");
        if starts_line && (line == b".\r\n" || line == b".\n") {
            break;
        }

        let content = if starts_line && line.starts_with(b".") {
            &line[1..]
        } else {
            &line[..]
        };
        total += content.len();
        if total > max {
            too_large = true;
        }
        if too_large {
            continue;
        }

        current.extend_from_slice(content);
        if current.len() >= CHUNK_SIZE {
            chunks.push(current.split().freeze());
        }
    }

    if too_large {
        return Ok(DataOutcome::TooLarge);
    }
    if !current.is_empty() {
        chunks.push(current.freeze());
    }
    Ok(DataOutcome::Complete(chunks))
}
