//! Line protocol spoken between the master and its workers.
//!
//! Every connection carries exactly one exchange. A message is a single
//! newline-terminated line: a keyword, optionally followed by a space and a
//! payload. Payloads are trimmed on decode.

use std::fmt;
use std::io::{self, BufRead, Write};

use thiserror::Error;

const WORKER_READY: &str = "WORKER_READY";
const JOB_START: &str = "JOB_START";
const SERVER_DONE: &str = "SERVER_DONE";
const JOB_SUCCEEDED: &str = "JOB_SUCCEEDED";
const JOB_FAILED: &str = "JOB_FAILED";
const JOB_INFO: &str = "JOB_INFO";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Worker asks for a unit.
    WorkerReady,

    /// Master assigns a unit.
    JobStart(String),

    /// Master has nothing left for this phase; the worker should exit.
    ServerDone,

    /// Worker finished a unit.
    JobSucceeded(String),

    /// Worker could not finish a unit. The master re-queues it.
    JobFailed(String),

    /// Free-form progress line, only logged by the master.
    JobInfo(String),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection closed before a message arrived")]
    Closed,

    #[error("unrecognized message type `{0}`")]
    Unrecognized(String),

    #[error("message `{0}` requires a payload")]
    MissingPayload(&'static str),

    #[error("message `{0}` takes no payload")]
    UnexpectedPayload(&'static str),

    #[error("payload contains a line break")]
    MultilinePayload,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Message {
    /// Encode as one protocol line, including the trailing newline.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let line = match self {
            Message::WorkerReady => WORKER_READY.to_string(),
            Message::ServerDone => SERVER_DONE.to_string(),
            Message::JobStart(unit) => with_payload(JOB_START, unit)?,
            Message::JobSucceeded(unit) => with_payload(JOB_SUCCEEDED, unit)?,
            Message::JobFailed(unit) => with_payload(JOB_FAILED, unit)?,
            Message::JobInfo(text) => with_payload(JOB_INFO, text)?,
        };
        Ok(line + "\n")
    }

    /// Decode a single protocol line. Only the line terminator and the one
    /// space after the kind are stripped; the payload is kept byte for byte.
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let line = line.strip_suffix('\r').unwrap_or(line);
        let (kind, payload) = line.split_once(' ').unwrap_or((line, ""));

        match kind {
            WORKER_READY => no_payload(WORKER_READY, payload).map(|_| Message::WorkerReady),
            SERVER_DONE => no_payload(SERVER_DONE, payload).map(|_| Message::ServerDone),
            JOB_START => required(JOB_START, payload).map(Message::JobStart),
            JOB_SUCCEEDED => required(JOB_SUCCEEDED, payload).map(Message::JobSucceeded),
            JOB_FAILED => required(JOB_FAILED, payload).map(Message::JobFailed),
            JOB_INFO => required(JOB_INFO, payload).map(Message::JobInfo),
            "" => Err(ProtocolError::Closed),
            other => Err(ProtocolError::Unrecognized(other.to_string())),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::WorkerReady => write!(f, "{WORKER_READY}"),
            Message::ServerDone => write!(f, "{SERVER_DONE}"),
            Message::JobStart(unit) => write!(f, "{JOB_START} \"{unit}\""),
            Message::JobSucceeded(unit) => write!(f, "{JOB_SUCCEEDED} \"{unit}\""),
            Message::JobFailed(unit) => write!(f, "{JOB_FAILED} \"{unit}\""),
            Message::JobInfo(text) => write!(f, "{JOB_INFO} \"{text}\""),
        }
    }
}

fn with_payload(kind: &'static str, payload: &str) -> Result<String, ProtocolError> {
    if payload.contains(['\n', '\r']) {
        return Err(ProtocolError::MultilinePayload);
    }
    let payload = required(kind, payload)?;
    Ok(format!("{kind} {payload}"))
}

fn required(kind: &'static str, payload: &str) -> Result<String, ProtocolError> {
    if payload.is_empty() {
        Err(ProtocolError::MissingPayload(kind))
    } else {
        Ok(payload.to_string())
    }
}

fn no_payload(kind: &'static str, payload: &str) -> Result<(), ProtocolError> {
    if payload.is_empty() {
        Ok(())
    } else {
        Err(ProtocolError::UnexpectedPayload(kind))
    }
}

/// Read one message from a blocking stream.
pub fn read_message<R: BufRead>(reader: &mut R) -> Result<Message, ProtocolError> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(ProtocolError::Closed);
    }
    Message::decode(&line)
}

/// Write one message to a blocking stream and flush it.
pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<(), ProtocolError> {
    writer.write_all(message.encode()?.as_bytes())?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn decodes_every_message_kind() {
        assert_eq!(Message::decode("WORKER_READY\n").unwrap(), Message::WorkerReady);
        assert_eq!(Message::decode("SERVER_DONE").unwrap(), Message::ServerDone);
        assert_eq!(
            Message::decode("JOB_START /in/00001.input\n").unwrap(),
            Message::JobStart("/in/00001.input".into())
        );
        assert_eq!(
            Message::decode("JOB_SUCCEEDED /tmp/00003\r\n").unwrap(),
            Message::JobSucceeded("/tmp/00003".into())
        );
        assert_eq!(
            Message::decode("JOB_FAILED x").unwrap(),
            Message::JobFailed("x".into())
        );
        assert_eq!(
            Message::decode("JOB_INFO About to process \"a\".").unwrap(),
            Message::JobInfo("About to process \"a\".".into())
        );
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(matches!(
            Message::decode("GIMME_WORK"),
            Err(ProtocolError::Unrecognized(kind)) if kind == "GIMME_WORK"
        ));
        assert!(matches!(
            Message::decode("JOB_START"),
            Err(ProtocolError::MissingPayload("JOB_START"))
        ));
        assert!(matches!(
            Message::decode("WORKER_READY now"),
            Err(ProtocolError::UnexpectedPayload("WORKER_READY"))
        ));
        assert!(matches!(Message::decode("   \n"), Err(ProtocolError::Closed)));
    }

    #[test]
    fn payload_whitespace_survives_the_wire() {
        for unit in ["/in/a ", " /in/b", "/in/two  spaces", "/in/tab\there"] {
            let message = Message::JobStart(unit.to_string());
            let line = message.encode().unwrap();
            assert_eq!(Message::decode(&line).unwrap(), message, "{unit:?}");
        }
    }

    #[test]
    fn refuses_to_encode_payload_with_newline() {
        let message = Message::JobInfo("two\nlines".into());
        assert!(matches!(message.encode(), Err(ProtocolError::MultilinePayload)));
    }

    #[test]
    fn reads_what_was_written() {
        let mut wire = Vec::new();
        write_message(&mut wire, &Message::JobFailed("/in/a.input".into())).unwrap();
        assert_eq!(wire, b"JOB_FAILED /in/a.input\n");

        let mut reader = Cursor::new(wire);
        assert_eq!(
            read_message(&mut reader).unwrap(),
            Message::JobFailed("/in/a.input".into())
        );
        assert!(matches!(read_message(&mut reader), Err(ProtocolError::Closed)));
    }
}
