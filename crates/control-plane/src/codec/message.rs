//! Control-channel message codec.
//!
//! A frame payload is UTF-8 text with up to four CRLF-separated sections:
//! a pipe-delimited `meta` line, a SIP start-line, a header block, and a
//! body. Meta token 0 is the message id, token 1 the verb, and the rest
//! are verb-specific arguments.

use std::fmt;

use uuid::Uuid;

use crate::error::{Error, Result};

/// Line separator used throughout the wire protocol
pub const CRLF: &str = "\r\n";

/// Message verbs understood on the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    /// Register interest in a SIP method
    Route,
    /// Present the shared secret (and optionally an app name)
    Authenticate,
    /// Carry a SIP request or response
    Sip,
    /// Hand a network transaction to the proxy core
    Proxy,
    /// Answer to a previously sent message
    Response,
}

impl Verb {
    /// Maps a meta token to a verb
    pub fn from_token(token: &str) -> Option<Verb> {
        match token {
            "route" => Some(Verb::Route),
            "authenticate" => Some(Verb::Authenticate),
            "sip" => Some(Verb::Sip),
            "proxy" => Some(Verb::Proxy),
            "response" => Some(Verb::Response),
            _ => None,
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verb::Route => "route",
            Verb::Authenticate => "authenticate",
            Verb::Sip => "sip",
            Verb::Proxy => "proxy",
            Verb::Response => "response",
        };
        write!(f, "{}", s)
    }
}

/// A parsed control-channel message
///
/// `verb` is kept as the raw token so the session can still answer with a
/// `NO` response carrying the original message id when the verb is unknown.
#[derive(Debug, Clone)]
pub struct ControlMessage {
    /// Message id chosen by the sender (token 0)
    pub msg_id: String,
    /// Raw verb token (token 1, may be empty or unknown)
    pub verb: String,
    /// Verb-specific arguments (tokens 2..)
    pub args: Vec<String>,
    /// SIP start-line, when a SIP message is attached
    pub start_line: String,
    /// Raw SIP header block
    pub headers: String,
    /// SIP body
    pub body: String,
}

impl ControlMessage {
    /// Parses a frame payload
    ///
    /// Fails only when the payload is not valid UTF-8; missing tokens are
    /// left empty for the session to judge.
    pub fn parse(payload: &[u8]) -> Result<ControlMessage> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| Error::Frame("frame payload is not valid UTF-8".to_string()))?;

        let (meta, rest) = split_once_str(text, CRLF);
        let (start_line, rest) = split_once_str(rest, CRLF);
        let (headers, body) = split_once_str(rest, "\r\n\r\n");

        let mut tokens = meta.split('|');
        let msg_id = tokens.next().unwrap_or_default().to_string();
        let verb = tokens.next().unwrap_or_default().to_string();
        let args: Vec<String> = tokens.map(str::to_string).collect();

        Ok(ControlMessage {
            msg_id,
            verb,
            args,
            start_line: start_line.to_string(),
            headers: headers.to_string(),
            body: body.to_string(),
        })
    }

    /// The recognized verb, if any
    pub fn verb(&self) -> Option<Verb> {
        Verb::from_token(&self.verb)
    }
}

fn split_once_str<'a>(text: &'a str, sep: &str) -> (&'a str, &'a str) {
    match text.find(sep) {
        Some(i) => (&text[..i], &text[i + sep.len()..]),
        None => (text, ""),
    }
}

/// Builds a `response` payload answering `client_msg_id`
pub fn format_response(client_msg_id: &str, ok: bool, detail: Option<&str>) -> String {
    let mut msg = format!(
        "{}|response|{}|{}",
        Uuid::new_v4(),
        client_msg_id,
        if ok { "OK" } else { "NO" }
    );
    if let Some(detail) = detail {
        msg.push('|');
        msg.push_str(detail);
    }
    msg
}

/// Builds an `authenticate` payload; returns the minted message id along
/// with the payload so the caller can match the eventual response
pub fn format_authenticate_request(secret: &str) -> (String, String) {
    let msg_id = Uuid::new_v4().to_string();
    let payload = format!("{}|authenticate|{}", msg_id, secret);
    (msg_id, payload)
}

/// Case-insensitive lookup of a header value in a raw header block
pub fn header_value<'a>(headers: &'a str, name: &str) -> Option<&'a str> {
    for line in headers.lines() {
        if let Some((header, value)) = line.split_once(':') {
            if header.trim().eq_ignore_ascii_case(name) {
                return Some(value.trim());
            }
        }
    }
    None
}

/// The method carried in the CSeq header, e.g. `INVITE` from `314159 INVITE`
pub fn cseq_method(headers: &str) -> Option<&str> {
    header_value(headers, "CSeq")?.split_whitespace().nth(1)
}

/// The status code of a response start-line, e.g. 200 from `SIP/2.0 200 OK`
pub fn response_status(start_line: &str) -> Option<u16> {
    start_line
        .strip_prefix("SIP/")?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meta_only() {
        let msg = ControlMessage::parse(b"m1|route|invite").expect("parse");
        assert_eq!(msg.msg_id, "m1");
        assert_eq!(msg.verb(), Some(Verb::Route));
        assert_eq!(msg.args, vec!["invite"]);
        assert!(msg.start_line.is_empty());
        assert!(msg.headers.is_empty());
        assert!(msg.body.is_empty());
    }

    #[test]
    fn test_parse_authenticate_with_app_name() {
        let msg = ControlMessage::parse(b"m2|authenticate|s3cret|voicemail").expect("parse");
        assert_eq!(msg.verb(), Some(Verb::Authenticate));
        assert_eq!(msg.args, vec!["s3cret", "voicemail"]);
    }

    #[test]
    fn test_parse_sip_message_sections() {
        let payload = b"m3|sip||\r\n\
            INVITE sip:bob@example.com SIP/2.0\r\n\
            Call-ID: abc123@host\r\n\
            CSeq: 1 INVITE\r\n\
            \r\n\
            v=0";
        let msg = ControlMessage::parse(payload).expect("parse");
        assert_eq!(msg.verb(), Some(Verb::Sip));
        assert_eq!(msg.args, vec!["", ""]);
        assert_eq!(msg.start_line, "INVITE sip:bob@example.com SIP/2.0");
        assert_eq!(header_value(&msg.headers, "call-id"), Some("abc123@host"));
        assert_eq!(msg.body, "v=0");
    }

    #[test]
    fn test_parse_short_meta_keeps_msg_id() {
        let msg = ControlMessage::parse(b"only-an-id").expect("parse");
        assert_eq!(msg.msg_id, "only-an-id");
        assert!(msg.verb.is_empty());
        assert_eq!(msg.verb(), None);
    }

    #[test]
    fn test_parse_rejects_invalid_utf8() {
        assert!(ControlMessage::parse(&[0x6d, 0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_unknown_verb_token() {
        let msg = ControlMessage::parse(b"m4|bogus|x").expect("parse");
        assert_eq!(msg.verb, "bogus");
        assert_eq!(msg.verb(), None);
    }

    #[test]
    fn test_format_response() {
        let ok = format_response("m5", true, Some("10.0.0.1:5060"));
        let tokens: Vec<&str> = ok.split('|').collect();
        assert_eq!(tokens[1], "response");
        assert_eq!(tokens[2], "m5");
        assert_eq!(tokens[3], "OK");
        assert_eq!(tokens[4], "10.0.0.1:5060");

        let no = format_response("m6", false, Some("incorrect secret"));
        assert!(no.ends_with("|m6|NO|incorrect secret"));

        let bare = format_response("m7", true, None);
        assert!(bare.ends_with("|m7|OK"));
    }

    #[test]
    fn test_cseq_method() {
        let headers = "Via: SIP/2.0/UDP host\r\nCSeq: 42 BYE";
        assert_eq!(cseq_method(headers), Some("BYE"));
        assert_eq!(cseq_method("Via: SIP/2.0/UDP host"), None);
    }

    #[test]
    fn test_response_status() {
        assert_eq!(response_status("SIP/2.0 200 OK"), Some(200));
        assert_eq!(response_status("SIP/2.0 180 Ringing"), Some(180));
        assert_eq!(response_status("INVITE sip:a@b SIP/2.0"), None);
    }
}
