//! The stanza wire format.

use std::io::{self, BufRead};
use zeroize::Zeroize;

use crate::Error;

pub(crate) const CMD_ADD_RECIPIENT: &str = "add-recipient";
pub(crate) const CMD_ADD_IDENTITY: &str = "add-identity";
pub(crate) const CMD_WRAP_FILE_KEY: &str = "wrap-file-key";
pub(crate) const CMD_DONE: &str = "done";
pub(crate) const RESPONSE_RECIPIENT_STANZA: &str = "recipient-stanza";
pub(crate) const RESPONSE_ERROR: &str = "error";

const STANZA_PREFIX: &[u8] = b"->";

/// Number of encoded characters per full body line.
const COLUMNS_PER_LINE: usize = 64;

/// Number of raw bytes encoded by a full body line.
const BYTES_PER_LINE: usize = COLUMNS_PER_LINE / 4 * 3;

const BASE64_CONFIG: base64::Config = base64::STANDARD_NO_PAD;

/// One protocol frame: a tag naming the command or response, its
/// arguments, and a binary body.
///
/// The tag and every argument are non-empty strings of printable ASCII
/// (bytes 33-126) with no embedded whitespace. Argument order is
/// significant. The body is opaque to the codec.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    pub tag: String,
    pub args: Vec<String>,
    pub body: Vec<u8>,
}

impl Command {
    /// The terminal command that ends a phase.
    pub fn done() -> Self {
        Command {
            tag: CMD_DONE.to_owned(),
            args: vec![],
            body: vec![],
        }
    }

    /// Whether this is the terminal command. Recognized by value: a
    /// command tagged `done` that carries arguments or a body is not
    /// terminal.
    pub fn is_done(&self) -> bool {
        *self == Command::done()
    }

    /// Encodes this command in the wire framing, returning the sink.
    pub fn marshal<W: io::Write>(&self, output: W) -> io::Result<W> {
        let args: Vec<_> = self.args.iter().map(|s| s.as_str()).collect();
        cookie_factory::gen_simple(write::command(&self.tag, &args, &self.body), output)
            .map_err(|e| {
                io::Error::new(
                    io::ErrorKind::Other,
                    format!("failed to write command: {}", e),
                )
            })
    }
}

/// Reads commands off a byte channel, one at a time.
///
/// Transport failures are sticky: once the underlying channel fails (or
/// ends mid-command), the reader is poisoned and every later call returns
/// the stored failure without touching the channel again. Framing
/// failures in a single command do not poison the reader; the caller may
/// keep reading.
pub struct CommandReader<R: BufRead> {
    input: R,
    poisoned: Option<Error>,
}

impl<R: BufRead> CommandReader<R> {
    pub fn new(input: R) -> Self {
        CommandReader {
            input,
            poisoned: None,
        }
    }

    /// Reads the next command off the channel.
    pub fn read_command(&mut self) -> Result<Command, Error> {
        if let Some(e) = &self.poisoned {
            return Err(e.clone());
        }
        let result = self.read_inner();
        if let Err(e) = &result {
            if e.is_transport() {
                self.poisoned = Some(e.clone());
            }
        }
        result
    }

    fn read_inner(&mut self) -> Result<Command, Error> {
        let header = self.read_line()?;
        let mut parts = header.split(|&b| b == b' ');
        if parts.next() != Some(STANZA_PREFIX) {
            return Err(Error::MalformedStanza(
                String::from_utf8_lossy(&header).into_owned(),
            ));
        }
        let mut tokens = Vec::with_capacity(1);
        for part in parts {
            if part.is_empty() || !part.iter().all(|&b| (33..=126).contains(&b)) {
                return Err(Error::InvalidToken(
                    String::from_utf8_lossy(part).into_owned(),
                ));
            }
            tokens.push(part.iter().map(|&b| b as char).collect());
        }

        let mut tokens = tokens.into_iter();
        let tag = match tokens.next() {
            Some(tag) => tag,
            None => {
                return Err(Error::MalformedStanza(
                    String::from_utf8_lossy(&header).into_owned(),
                ))
            }
        };
        let args = tokens.collect();

        let mut body = vec![];
        loop {
            // Body lines may carry key material.
            let mut line = self.read_line()?;
            let mut decoded = decode_body_line(&line)?;
            let len = decoded.len();
            body.extend_from_slice(&decoded);
            line.zeroize();
            decoded.zeroize();
            if len < BYTES_PER_LINE {
                // A body always ends with a short line.
                break;
            }
        }

        Ok(Command { tag, args, body })
    }

    /// Reads one line, without its terminator.
    fn read_line(&mut self) -> Result<Vec<u8>, Error> {
        let mut line = vec![];
        self.input
            .read_until(b'\n', &mut line)
            .map_err(Error::transport)?;
        if line.last() == Some(&b'\n') {
            line.pop();
            Ok(line)
        } else {
            // EOF, or a final line with no terminator; either way the
            // channel cannot be resynchronized.
            Err(Error::transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unexpected end of stream",
            )))
        }
    }
}

fn decode_body_line(line: &[u8]) -> Result<Vec<u8>, Error> {
    // CR and LF are ignored by some base64 decoders, but we don't want
    // any malleability.
    if line.iter().any(|&b| b == b'\r' || b == b'\n') {
        return Err(Error::MalformedBody(
            "unexpected newline character".to_owned(),
        ));
    }
    let decoded = base64::decode_config(line, BASE64_CONFIG)
        .map_err(|e| Error::MalformedBody(e.to_string()))?;
    if decoded.len() > BYTES_PER_LINE {
        return Err(Error::MalformedBody("line too long".to_owned()));
    }
    Ok(decoded)
}

pub(crate) mod write {
    use cookie_factory::{
        combinator::{slice, string},
        SerializeFn, WriteContext,
    };
    use std::io::Write;

    use super::{BASE64_CONFIG, COLUMNS_PER_LINE, STANZA_PREFIX};

    /// Serializes the body framing: unpadded base64 wrapped at
    /// [`COLUMNS_PER_LINE`] characters, always ending in a strictly-short
    /// line so the decoder can find the end without a length prefix.
    fn wrapped_body<'a, W: 'a + Write>(body: &'a [u8]) -> impl SerializeFn<W> + 'a {
        move |mut w: WriteContext<W>| {
            let encoded = base64::encode_config(body, BASE64_CONFIG);
            for line in encoded.as_bytes().chunks(COLUMNS_PER_LINE) {
                w = slice(line)(w)?;
                w = string("\n")(w)?;
            }
            if encoded.len() % COLUMNS_PER_LINE == 0 {
                // The last full line (or an empty body) must be followed
                // by an explicitly empty short line.
                w = string("\n")(w)?;
            }
            Ok(w)
        }
    }

    /// Serializes one command in the wire framing.
    pub(crate) fn command<'a, W: 'a + Write>(
        tag: &'a str,
        args: &'a [&'a str],
        body: &'a [u8],
    ) -> impl SerializeFn<W> + 'a {
        move |mut w: WriteContext<W>| {
            w = slice(STANZA_PREFIX)(w)?;
            w = string(" ")(w)?;
            w = string(tag)(w)?;
            for arg in args {
                w = string(" ")(w)?;
                w = string(arg)(w)?;
            }
            w = string("\n")(w)?;
            wrapped_body(body)(w)
        }
    }
}
