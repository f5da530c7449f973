//! Plugin-side implementation of the age plugin protocol.
//!
//! age plugins are identified by an arbitrary string `NAME`. Recipient
//! addresses for a particular plugin are encoded using Bech32 with the HRP
//! "age1NAME", and key material is encoded using Bech32 with the HRP
//! "AGE-PLUGIN-NAME-".
//!
//! The IPC protocol is based around an age stanza (the same format used in
//! the age file header), exchanged over the plugin's stdin and stdout:
//! - The tag field is used for command and response types.
//! - The arguments array is used for command-specific metadata.
//! - The body contains data associated with the command, if any.
//!
//! ## Wire format
//!
//! ```text
//! "->" (" " token)+ "\n"
//! (base64-line "\n")*   -- zero or more full 64-character lines
//! base64-line "\n"      -- exactly one short line, possibly empty
//! ```
//!
//! Tokens are non-empty strings of printable ASCII (bytes 33-126)
//! separated by single spaces. Bodies are unpadded standard base64, 64
//! encoded characters (48 raw bytes) per full line; the final line is
//! always strictly shorter than 64 characters, which is how a decoder
//! finds the end of the body without a length field.
//!
//! ## State machines
//!
//! The client starts the plugin with an `--age-plugin=STATE_MACHINE` flag
//! naming one of two state machines, `recipient-v1` or `identity-v1`. In
//! phase one the client sends commands and the plugin only reads:
//!
//! - `add-recipient RECIPIENT\n\n` - a recipient that file keys should be
//!   wrapped to.
//! - `add-identity IDENTITY\n\n` - an identity that file keys should be
//!   wrapped to.
//! - `wrap-file-key\nBase64(FILE_KEY)\n\n` - a file key to wrap.
//! - `done\n\n` - ends phase one.
//!
//! Recipients or identities addressed to a different plugin, and commands
//! the plugin does not recognize, are ignored. Malformed commands are
//! tolerated up to a fixed budget of five, after which the session
//! aborts.
//!
//! On `done` the plugin wraps each file key to each recipient and
//! identity it collected, and replies:
//!
//! - `recipient-stanza FILE_INDEX NAME\nBase64(WRAPPED)\n\n` - one per
//!   (file key, recipient-or-identity) pair.
//! - `error CODE\nBase64(MESSAGE)\n\n` - if wrapping failed.
//! - `done\n\n` - ends the responses.
//!
//! ## Example interaction
//!
//! - `A`: age implementation
//! - `P`: plugin
//!
//! ```text
//! A --> P | add-recipient age1test1qvejq0qpqt
//!         |
//! A --> P | wrap-file-key
//!         | Base64(FILE_KEY)
//!         |
//! A --> P | done
//!         |
//! A <-- P | recipient-stanza 0 test
//!         | Base64(WRAPPED_KEY)
//!         |
//! A <-- P | done
//!         |
//! ```

use std::fmt;

mod connection;
mod error;
mod format;
mod machine;

pub use connection::Connection;
pub use error::Error;
pub use format::{Command, CommandReader};
pub use machine::{CancelToken, MachineKind, Phase, StateMachine};

/// HRP prefix for recipients addressed to a plugin ("age1NAME").
pub const PLUGIN_RECIPIENT_PREFIX: &str = "age1";

/// HRP prefix for plugin key material ("age-plugin-NAME-").
pub const PLUGIN_IDENTITY_PREFIX: &str = "age-plugin-";

/// The key-wrapping capability a plugin exposes to the state machines.
///
/// The state machines never touch cryptography themselves; they route
/// parsed bytes into this trait and frame whatever comes back.
pub trait Plugin {
    /// A parsed recipient this plugin can wrap file keys to.
    type Recipient;

    /// A parsed identity this plugin holds key material for.
    type Identity;

    type Error: PluginError;

    /// The plugin name, as carried in recipient and identity HRPs.
    /// Recipients and identities addressed to a different name are never
    /// handed to this plugin.
    fn name(&self) -> &str;

    /// Parses the payload of a recipient addressed to this plugin.
    fn parse_recipient(&mut self, bytes: &[u8]) -> Result<Self::Recipient, Self::Error>;

    /// Parses the payload of an identity addressed to this plugin.
    fn parse_identity(&mut self, bytes: &[u8]) -> Result<Self::Identity, Self::Error>;

    /// Wraps a file key to a recipient, returning the ciphertext.
    fn wrap_to_recipient(
        &mut self,
        recipient: &Self::Recipient,
        file_key: &[u8],
    ) -> Result<Vec<u8>, Self::Error>;

    /// Wraps a file key to an identity, returning the ciphertext.
    fn wrap_to_identity(
        &mut self,
        identity: &Self::Identity,
        file_key: &[u8],
    ) -> Result<Vec<u8>, Self::Error>;
}

/// Errors that a plugin reports to the client.
pub trait PluginError: fmt::Display {
    /// The protocol error code identifying this failure.
    fn code(&self) -> u16;
}

/// Runs the state machine named by the `--age-plugin` selector over this
/// process's stdin and stdout.
///
/// An unrecognized selector is reported as [`Error::UnknownStateMachine`];
/// the caller should print a diagnostic and exit non-zero, never fall
/// back to a default machine.
pub fn run_state_machine<P: Plugin>(selector: &str, plugin: P) -> Result<(), Error> {
    let kind: MachineKind = selector.parse()?;
    let mut conn = Connection::from_stdio();
    kind.create(plugin).run(&mut conn, &CancelToken::new())
}

/// Prints a newly generated identity, and the recipient corresponding to
/// it, in the encodings the protocol expects.
pub fn print_new_identity(plugin_name: &str, identity: &[u8], recipient: &[u8]) {
    use bech32::ToBase32;

    println!(
        "# recipient: {}",
        bech32::encode(
            &format!("{}{}", PLUGIN_RECIPIENT_PREFIX, plugin_name),
            recipient.to_base32(),
        )
        .expect("HRP is valid")
    );
    println!(
        "{}",
        bech32::encode(
            &format!("{}{}-", PLUGIN_IDENTITY_PREFIX, plugin_name),
            identity.to_base32(),
        )
        .expect("HRP is valid")
        .to_uppercase()
    );
}
