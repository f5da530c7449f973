//! The phase-one state machines.

use log::{debug, error, warn};
use secrecy::{ExposeSecret, SecretVec};
use std::io::{BufRead, Write};
use std::mem;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{
    connection::Connection,
    format::{Command, CMD_ADD_IDENTITY, CMD_ADD_RECIPIENT, CMD_WRAP_FILE_KEY},
    Error, Plugin, PluginError, PLUGIN_IDENTITY_PREFIX, PLUGIN_RECIPIENT_PREFIX,
};

/// Number of consecutive malformed commands tolerated before a session is
/// aborted.
const FAULT_BUDGET: u32 = 5;

/// Cooperative cancellation handle for a running session.
///
/// Cancellation is polled once per loop iteration, before each decode
/// attempt; a command that has already been decoded is applied in full or
/// not at all.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    /// Requests cancellation of the session holding this token.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// The lifecycle of one protocol session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Accumulating recipients, identities, and file keys.
    Collecting,
    /// The terminal command arrived; wrapped keys are being produced.
    Finalizing,
    /// The session completed successfully.
    Done,
    /// The session ended in a fatal fault or cancellation.
    Aborted,
}

/// The state machines a plugin can be asked to run, named by the
/// `--age-plugin` selector the client starts the plugin with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachineKind {
    RecipientV1,
    IdentityV1,
}

impl MachineKind {
    /// Constructs the named state machine around the given plugin.
    pub fn create<P: Plugin>(self, plugin: P) -> StateMachine<P> {
        StateMachine::new(self, plugin)
    }
}

impl FromStr for MachineKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "recipient-v1" => Ok(MachineKind::RecipientV1),
            "identity-v1" => Ok(MachineKind::IdentityV1),
            _ => Err(Error::UnknownStateMachine(s.to_owned())),
        }
    }
}

fn parse_bech32(s: &str) -> Option<(String, Vec<u8>)> {
    use bech32::FromBase32;

    bech32::decode(s)
        .ok()
        .and_then(|(hrp, data)| Vec::from_base32(&data).ok().map(|d| (hrp, d)))
}

/// Splits a Bech32 recipient into the plugin name carried in its HRP and
/// the payload bytes the plugin parses.
fn parse_recipient(recipient: &str) -> Option<(String, Vec<u8>)> {
    let (hrp, data) = parse_bech32(recipient)?;

    if hrp.starts_with(PLUGIN_RECIPIENT_PREFIX) {
        Some((
            hrp.split_at(PLUGIN_RECIPIENT_PREFIX.len()).1.to_owned(),
            data,
        ))
    } else {
        None
    }
}

fn parse_identity(identity: &str) -> Option<(String, Vec<u8>)> {
    let (hrp, data) = parse_bech32(identity)?;

    if hrp.starts_with(PLUGIN_IDENTITY_PREFIX) && hrp.ends_with('-') {
        let fragment = hrp.split_at(PLUGIN_IDENTITY_PREFIX.len()).1;
        Some((fragment.split_at(fragment.len() - 1).0.to_owned(), data))
    } else {
        None
    }
}

/// One protocol session: the phase-one accumulator plus the plugin that
/// wraps the accumulated file keys.
///
/// A session is single-consumer; it owns exclusive access to one
/// connection for its whole lifetime, and its accumulators have exactly
/// one writer (the collection loop).
pub struct StateMachine<P: Plugin> {
    kind: MachineKind,
    plugin: P,
    phase: Phase,
    recipients: Vec<P::Recipient>,
    identities: Vec<P::Identity>,
    file_keys: Vec<SecretVec<u8>>,
    faults: u32,
}

impl<P: Plugin> StateMachine<P> {
    fn new(kind: MachineKind, plugin: P) -> Self {
        StateMachine {
            kind,
            plugin,
            phase: Phase::Collecting,
            recipients: vec![],
            identities: vec![],
            file_keys: vec![],
            faults: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Runs the session to completion: collects commands until the
    /// terminal command, then wraps and sends back every pending file
    /// key.
    pub fn run<R: BufRead, W: Write>(
        &mut self,
        conn: &mut Connection<R, W>,
        cancel: &CancelToken,
    ) -> Result<(), Error> {
        self.collect(conn, cancel)?;
        self.finalize(conn)
    }

    fn collect<R: BufRead, W: Write>(
        &mut self,
        conn: &mut Connection<R, W>,
        cancel: &CancelToken,
    ) -> Result<(), Error> {
        while self.phase == Phase::Collecting {
            if cancel.is_cancelled() {
                self.phase = Phase::Aborted;
                return Err(Error::Cancelled);
            }

            let command = match conn.read_command() {
                Ok(command) => command,
                Err(e) => {
                    self.faults += 1;
                    warn!(
                        "error reading command ({} of {}): {}",
                        self.faults, FAULT_BUDGET, e
                    );
                    if self.faults >= FAULT_BUDGET {
                        error!("too many malformed commands; aborting");
                        self.phase = Phase::Aborted;
                        return Err(Error::TooManyFaults);
                    }
                    continue;
                }
            };

            if command.is_done() {
                self.phase = Phase::Finalizing;
                break;
            }
            match command.tag.as_str() {
                CMD_ADD_RECIPIENT => self.add_recipient(&command),
                CMD_ADD_IDENTITY => self.add_identity(&command),
                CMD_WRAP_FILE_KEY => self.file_keys.push(SecretVec::new(command.body)),
                // Unrecognized commands are ignored, for forward
                // compatibility.
                _ => debug!("ignoring {:?} command", command.tag),
            }
        }

        Ok(())
    }

    fn add_recipient(&mut self, command: &Command) {
        let encoded = match command.args.first() {
            Some(arg) => arg,
            None => return,
        };
        let (name, payload) = match parse_recipient(encoded) {
            Some(parsed) => parsed,
            None => return,
        };
        if name != self.plugin.name() {
            debug!("ignoring recipient addressed to plugin {:?}", name);
            return;
        }
        match self.plugin.parse_recipient(&payload) {
            Ok(recipient) => self.recipients.push(recipient),
            Err(e) => debug!("discarding malformed recipient: {}", e),
        }
    }

    fn add_identity(&mut self, command: &Command) {
        let encoded = match command.args.first() {
            Some(arg) => arg,
            None => return,
        };
        let (name, payload) = match parse_identity(encoded) {
            Some(parsed) => parsed,
            None => return,
        };
        if name != self.plugin.name() {
            debug!("ignoring identity addressed to plugin {:?}", name);
            return;
        }
        match self.plugin.parse_identity(&payload) {
            Ok(identity) => self.identities.push(identity),
            Err(e) => debug!("discarding malformed identity: {}", e),
        }
    }

    fn finalize<R: BufRead, W: Write>(
        &mut self,
        conn: &mut Connection<R, W>,
    ) -> Result<(), Error> {
        let file_keys = mem::take(&mut self.file_keys);
        for (index, file_key) in file_keys.iter().enumerate() {
            let file_key = file_key.expose_secret();

            if self.kind == MachineKind::RecipientV1 {
                for recipient in &self.recipients {
                    match self.plugin.wrap_to_recipient(recipient, file_key) {
                        Ok(wrapped) => {
                            conn.recipient_stanza(index, self.plugin.name(), &wrapped)?
                        }
                        Err(e) => return self.wrap_failed(conn, e),
                    }
                }
            }
            for identity in &self.identities {
                match self.plugin.wrap_to_identity(identity, file_key) {
                    Ok(wrapped) => conn.recipient_stanza(index, self.plugin.name(), &wrapped)?,
                    Err(e) => return self.wrap_failed(conn, e),
                }
            }
        }

        conn.done()?;
        self.phase = Phase::Done;
        Ok(())
    }

    fn wrap_failed<R: BufRead, W: Write>(
        &mut self,
        conn: &mut Connection<R, W>,
        e: P::Error,
    ) -> Result<(), Error> {
        error!("failed to wrap file key: {}", e);
        self.phase = Phase::Aborted;
        conn.error(e.code(), &e.to_string())?;
        Err(Error::Plugin {
            code: e.code(),
            message: e.to_string(),
        })
    }
}
