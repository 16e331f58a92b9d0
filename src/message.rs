//! Decoded message structure, consumed by the filters as an opaque,
//! read-only object. Decoding happens once per task; every filter then
//! observes the same stable view.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use lazy_static::lazy_static;
use regex::Regex;
use url::Url;

use crate::error::DecodeError;

lazy_static! {
    static ref URL_RE: Regex =
        Regex::new(r#"https?://[^\s<>"')\]]+"#).expect("url regex");
}

#[derive(Debug, Clone)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartKind {
    Text,
    Html,
    Other,
}

#[derive(Debug, Clone)]
pub struct MimePart {
    pub kind: PartKind,
    pub content_type: String,
    pub body: String,
}

/// Parsed message: headers, parts, extracted URLs. Built once, read-only
/// afterwards.
#[derive(Debug, Clone, Default)]
pub struct ParsedMessage {
    pub headers: Vec<Header>,
    pub parts: Vec<MimePart>,
    pub urls: Vec<Url>,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub message_id: Option<String>,
    pub raw_len: usize,
}

impl ParsedMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Indices of textual parts, which is what the tokenizer consumes.
    pub fn text_parts(&self) -> impl Iterator<Item = &MimePart> {
        self.parts
            .iter()
            .filter(|p| matches!(p.kind, PartKind::Text | PartKind::Html))
    }
}

/// Decode a raw message into its structure. Tolerant of bare-LF input.
pub fn decode(raw: &[u8]) -> Result<ParsedMessage, DecodeError> {
    let text = String::from_utf8_lossy(raw);
    let (head, body) = split_headers(&text)?;

    let headers = parse_headers(head)?;
    let mut msg = ParsedMessage {
        raw_len: raw.len(),
        ..Default::default()
    };

    let content_type = header_value(&headers, "content-type").unwrap_or("text/plain");
    let encoding = header_value(&headers, "content-transfer-encoding").unwrap_or("7bit");

    if let Some(boundary) = boundary_of(content_type) {
        for raw_part in split_multipart(body, &boundary) {
            match decode_part(raw_part) {
                Ok(part) => msg.parts.push(part),
                Err(e) => log::debug!("skipping undecodable part: {e}"),
            }
        }
    } else {
        msg.parts.push(MimePart {
            kind: kind_of(content_type),
            content_type: content_type.to_string(),
            body: decode_body(body, encoding)?,
        });
    }

    msg.subject = header_value(&headers, "subject").map(|s| s.to_string());
    msg.from = header_value(&headers, "from").map(|s| s.to_string());
    msg.message_id = header_value(&headers, "message-id").map(|s| s.to_string());

    for part in &msg.parts {
        for m in URL_RE.find_iter(&part.body) {
            let candidate = m.as_str().trim_end_matches(['.', ',', ';']);
            if let Ok(u) = Url::parse(candidate) {
                msg.urls.push(u);
            }
        }
    }

    msg.headers = headers;
    Ok(msg)
}

fn split_headers(text: &str) -> Result<(&str, &str), DecodeError> {
    if let Some(pos) = text.find("\r\n\r\n") {
        Ok((&text[..pos], &text[pos + 4..]))
    } else if let Some(pos) = text.find("\n\n") {
        Ok((&text[..pos], &text[pos + 2..]))
    } else if !text.contains(':') {
        Err(DecodeError::NoBody)
    } else {
        // Headers only; empty body is legal.
        Ok((text, ""))
    }
}

fn parse_headers(head: &str) -> Result<Vec<Header>, DecodeError> {
    let mut out: Vec<Header> = Vec::new();
    for line in head.lines() {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // Continuation of the previous header.
            match out.last_mut() {
                Some(h) => {
                    h.value.push(' ');
                    h.value.push_str(line.trim());
                }
                None => return Err(DecodeError::BadHeader(line.to_string())),
            }
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| DecodeError::BadHeader(line.to_string()))?;
        out.push(Header {
            name: name.trim().to_string(),
            value: value.trim().to_string(),
        });
    }
    Ok(out)
}

fn header_value<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

fn kind_of(content_type: &str) -> PartKind {
    let ct = content_type.to_ascii_lowercase();
    if ct.starts_with("text/html") {
        PartKind::Html
    } else if ct.starts_with("text/") {
        PartKind::Text
    } else {
        PartKind::Other
    }
}

fn boundary_of(content_type: &str) -> Option<String> {
    let ct = content_type.to_ascii_lowercase();
    if !ct.starts_with("multipart/") {
        return None;
    }
    content_type.split(';').find_map(|param| {
        let (k, v) = param.trim().split_once('=')?;
        if k.eq_ignore_ascii_case("boundary") {
            Some(v.trim_matches('"').to_string())
        } else {
            None
        }
    })
}

fn split_multipart<'a>(body: &'a str, boundary: &str) -> Vec<&'a str> {
    let sep = format!("--{boundary}");
    body.split(sep.as_str())
        .skip(1)
        .filter(|chunk| !chunk.trim_start().starts_with("--") && !chunk.trim().is_empty())
        .collect()
}

fn decode_part(raw: &str) -> Result<MimePart, DecodeError> {
    let (head, body) = split_headers(raw.trim_start_matches(['\r', '\n']))?;
    let headers = parse_headers(head)?;
    let content_type = header_value(&headers, "content-type")
        .unwrap_or("text/plain")
        .to_string();
    let encoding = header_value(&headers, "content-transfer-encoding").unwrap_or("7bit");
    Ok(MimePart {
        kind: kind_of(&content_type),
        body: decode_body(body, encoding)?,
        content_type,
    })
}

fn decode_body(body: &str, encoding: &str) -> Result<String, DecodeError> {
    match encoding.to_ascii_lowercase().as_str() {
        "base64" => {
            let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
            let bytes = BASE64
                .decode(compact.as_bytes())
                .map_err(|e| DecodeError::BadEncoding(e.to_string()))?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
        "quoted-printable" => Ok(decode_quoted_printable(body)),
        _ => Ok(body.to_string()),
    }
}

fn decode_quoted_printable(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '=' {
            out.push(c);
            continue;
        }
        let hi = chars.next();
        match hi {
            Some('\r') => {
                chars.next_if_eq(&'\n');
            }
            Some('\n') => {}
            Some(h) => {
                if let (Some(hd), Some(ld)) = (h.to_digit(16), chars.peek().and_then(|l| l.to_digit(16))) {
                    chars.next();
                    out.push((hd * 16 + ld) as u8 as char);
                } else {
                    out.push('=');
                    out.push(h);
                }
            }
            None => out.push('='),
        }
    }
    out
}
