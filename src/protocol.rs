//! Scanning-channel wire protocol: line-based command + headers + body,
//! Content-Length delimited, CRLF replies.
//!
//! Two variants are spoken on the same port: the native protocol and a
//! spamc-compatible one for legacy clients. The variant and version come
//! from the command line and are echoed in the reply status line.

use std::collections::HashMap;

use crate::error::ProtocolError;
use crate::filters::MetricResult;

pub const CRLF: &str = "\r\n";
pub const NATIVE_PROTO: &str = "MAILVET";
pub const SPAMC_PROTO: &str = "SPAMC";
pub const DEFAULT_VERSION: &str = "1.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Check,
    Symbols,
    Report,
    Process,
    Ping,
}

impl Command {
    pub fn parse(s: &str) -> Option<Command> {
        match s.to_ascii_uppercase().as_str() {
            "CHECK" => Some(Command::Check),
            "SYMBOLS" => Some(Command::Symbols),
            "REPORT" => Some(Command::Report),
            "PROCESS" => Some(Command::Process),
            "PING" => Some(Command::Ping),
            _ => None,
        }
    }

    /// PING carries no message; everything else does.
    pub fn requires_message(&self) -> bool {
        !matches!(self, Command::Ping)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVariant {
    Native,
    SpamcCompat,
}

impl ProtocolVariant {
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolVariant::Native => NATIVE_PROTO,
            ProtocolVariant::SpamcCompat => SPAMC_PROTO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandLine {
    pub command: Command,
    pub variant: ProtocolVariant,
    pub version: String,
}

/// Parse `SYMBOLS MAILVET/1.1` style command lines.
pub fn parse_command_line(line: &str) -> Result<CommandLine, ProtocolError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ProtocolError::BadCommandLine("empty line".to_string()));
    }
    let mut words = line.split_whitespace();
    let cmd_word = words.next().unwrap_or_default();
    let command = Command::parse(cmd_word)
        .ok_or_else(|| ProtocolError::UnknownCommand(cmd_word.to_string()))?;

    let (variant, version) = match words.next() {
        None => (ProtocolVariant::Native, DEFAULT_VERSION.to_string()),
        Some(proto) => {
            let (name, ver) = proto
                .split_once('/')
                .ok_or_else(|| ProtocolError::BadCommandLine(proto.to_string()))?;
            let variant = match name.to_ascii_uppercase().as_str() {
                NATIVE_PROTO => ProtocolVariant::Native,
                SPAMC_PROTO => ProtocolVariant::SpamcCompat,
                other => {
                    return Err(ProtocolError::BadCommandLine(format!(
                        "unknown protocol {other}"
                    )))
                }
            };
            if !ver.chars().all(|c| c.is_ascii_digit() || c == '.') || ver.is_empty() {
                return Err(ProtocolError::BadVersion(ver.to_string()));
            }
            (variant, ver.to_string())
        }
    };

    Ok(CommandLine {
        command,
        variant,
        version,
    })
}

/// Envelope metadata a client may pass in the request headers.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub content_length: Option<usize>,
    pub helo: Option<String>,
    pub from: Option<String>,
    pub rcpt: Vec<String>,
    pub queue_id: Option<String>,
    pub user: Option<String>,
    pub subject: Option<String>,
    pub deliver_to: Option<String>,
    pub pass_all: bool,
}

impl RequestMeta {
    /// Apply one `Name: value` request header. Unknown names are a protocol
    /// error; clients that want extensions negotiate a higher version first.
    pub fn apply_header(&mut self, line: &str) -> Result<(), ProtocolError> {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProtocolError::BadHeader(line.to_string()))?;
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "content-length" => {
                let n = value
                    .parse::<usize>()
                    .map_err(|_| ProtocolError::BadHeader(line.to_string()))?;
                self.content_length = Some(n);
            }
            "helo" => self.helo = Some(value.to_string()),
            "from" => self.from = Some(value.to_string()),
            "rcpt" => self.rcpt.push(value.to_string()),
            "queue-id" => self.queue_id = Some(value.to_string()),
            "user" => self.user = Some(value.to_string()),
            "subject" => self.subject = Some(value.to_string()),
            "deliver-to" => self.deliver_to = Some(value.to_string()),
            "pass" => self.pass_all = value.eq_ignore_ascii_case("all"),
            _ => return Err(ProtocolError::BadHeader(line.to_string())),
        }
        Ok(())
    }
}

/// Data the reply formatter needs; assembled by the finalize path.
#[derive(Debug, Clone)]
pub struct ReplyData {
    pub variant: ProtocolVariant,
    pub version: String,
    pub command: Command,
    pub metrics: HashMap<String, MetricResult>,
    pub thresholds: HashMap<String, f64>,
    pub queue_id: Option<String>,
    pub messages: Vec<String>,
}

pub fn format_reply(data: &ReplyData) -> String {
    let mut out = String::with_capacity(256);
    out.push_str(data.variant.name());
    out.push('/');
    out.push_str(&data.version);
    out.push_str(" 0 OK");
    out.push_str(CRLF);

    if data.command == Command::Ping {
        out.push_str("PONG");
        out.push_str(CRLF);
        out.push_str(CRLF);
        return out;
    }

    let mut names: Vec<&String> = data.metrics.keys().collect();
    names.sort();
    for name in names {
        let m = &data.metrics[name];
        let threshold = data.thresholds.get(name).copied().unwrap_or(f64::INFINITY);
        let verdict = if m.score >= threshold { "True" } else { "False" };
        out.push_str(&format!(
            "Metric: {name}; {verdict}; {:.2} / {:.2}{CRLF}",
            m.score, threshold
        ));
        if data.command != Command::Check {
            for sym in &m.symbols {
                match &sym.description {
                    Some(d) => out.push_str(&format!(
                        "Symbol: {}({:.2}); {d}{CRLF}",
                        sym.name, sym.score
                    )),
                    None => {
                        out.push_str(&format!("Symbol: {}({:.2}){CRLF}", sym.name, sym.score))
                    }
                }
            }
        }
    }

    if let Some(qid) = &data.queue_id {
        out.push_str(&format!("Queue-ID: {qid}{CRLF}"));
    }
    for msg in &data.messages {
        out.push_str(&format!("Message: {msg}{CRLF}"));
    }
    out.push_str(CRLF);
    out
}

pub fn format_error(variant: ProtocolVariant, version: &str, code: u16, error: &str) -> String {
    format!("{}/{version} {code} {error}{CRLF}{CRLF}", variant.name())
}
