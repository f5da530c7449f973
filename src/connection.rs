//! Connection handler.

use cookie_factory::SerializeFn;
use std::io::{self, BufRead, BufReader, Stdin, Stdout, Write};

use crate::{
    format::{self, write, Command, CommandReader},
    Error,
};

/// A stanza connection to the age client driving this plugin.
///
/// Owns both directions of one session: the command reader (with its
/// sticky transport error) and the response writer.
pub struct Connection<R: BufRead, W: Write> {
    input: CommandReader<R>,
    pub(crate) output: W,
}

impl Connection<BufReader<Stdin>, Stdout> {
    /// Opens a connection over this process's stdin and stdout.
    pub fn from_stdio() -> Self {
        Connection::new(BufReader::new(io::stdin()), io::stdout())
    }
}

impl<R: BufRead, W: Write> Connection<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Connection {
            input: CommandReader::new(input),
            output,
        }
    }

    /// Reads the next command from the client.
    pub fn read_command(&mut self) -> Result<Command, Error> {
        self.input.read_command()
    }

    fn write_reply<'a, F: SerializeFn<&'a mut W>>(&'a mut self, f: F) -> Result<(), Error> {
        cookie_factory::gen_simple(f, &mut self.output)
            .map_err(|e| Error::Transport {
                kind: io::ErrorKind::Other,
                message: format!("failed to write response: {}", e),
            })?
            .flush()
            .map_err(Error::transport)
    }

    /// Sends one wrapped file key back to the client, keyed to the index
    /// of the `wrap-file-key` command it answers.
    pub(crate) fn recipient_stanza(
        &mut self,
        file_index: usize,
        name: &str,
        wrapped: &[u8],
    ) -> Result<(), Error> {
        let index = file_index.to_string();
        let args = [index.as_str(), name];
        self.write_reply(write::command(
            format::RESPONSE_RECIPIENT_STANZA,
            &args,
            wrapped,
        ))
    }

    /// Echoes the terminal command, signalling the end of the responses.
    pub(crate) fn done(&mut self) -> Result<(), Error> {
        self.write_reply(write::command(format::CMD_DONE, &[], &[]))
    }

    /// Reports a plugin failure to the client.
    pub(crate) fn error(&mut self, code: u16, description: &str) -> Result<(), Error> {
        let code = code.to_string();
        let args = [code.as_str()];
        self.write_reply(write::command(
            format::RESPONSE_ERROR,
            &args,
            description.as_bytes(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::Connection;

    #[test]
    fn error_reply_wire_form() {
        let mut conn = Connection::new(&b""[..], vec![]);
        conn.error(1, "boom").unwrap();
        assert_eq!(conn.output, b"-> error 1\nYm9vbQ\n");
    }

    #[test]
    fn recipient_stanza_wire_form() {
        let mut conn = Connection::new(&b""[..], vec![]);
        conn.recipient_stanza(0, "test", &[42; 4]).unwrap();
        assert_eq!(conn.output, b"-> recipient-stanza 0 test\nKioqKg\n");
    }
}
