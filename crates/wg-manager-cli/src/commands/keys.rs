//! Key utilities: `genkey`, `pubkey`, `genpsk`.

use std::io::{BufRead, Write};

use wg_manager::{PresharedKey, PrivateKey};

use crate::error::CliError;
use crate::output::{KeyOutput, OutputFormat};

/// Which key to print.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCommand {
    /// A fresh private key.
    Generate,
    /// The public key of a private key read from input.
    Public,
    /// A fresh preshared key.
    Preshared,
}

impl KeyCommand {
    /// Execute the key command. Only [`KeyCommand::Public`] reads `input`.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not a valid private key or output
    /// fails.
    pub fn execute<R: BufRead, W: Write>(
        self,
        input: &mut R,
        writer: &mut W,
        format: &OutputFormat,
    ) -> Result<(), CliError> {
        let key = match self {
            Self::Generate => PrivateKey::generate().to_base64(),
            Self::Preshared => PresharedKey::generate().to_base64(),
            Self::Public => {
                let mut line = String::new();
                input.read_line(&mut line)?;
                PrivateKey::from_base64(line.trim())?.public_key().to_base64()
            }
        };
        format.write(writer, &KeyOutput { key })
    }
}
