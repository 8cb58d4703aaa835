use std::fmt::Display;
use std::fmt::Formatter;

use peerpool_common::impl_error_from;
use peerpool_wire::address::AddrParseError;
use peerpool_wire::WireError;

#[derive(Debug)]
pub enum CliError {
    /// Something went wrong talking to the network
    Wire(WireError),
    /// Couldn't read the config file
    Io(std::io::Error),
    /// The config file isn't valid toml, or has unknown types
    TomlParsing(toml::de::Error),
    /// A peer given with `--connect` or in the config file isn't an address
    InvalidPeer(String, AddrParseError),
}

impl Display for CliError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Wire(e) => write!(f, "Network error: {e}"),
            CliError::Io(e) => write!(f, "I/O error: {e}"),
            CliError::TomlParsing(e) => write!(f, "Error deserializing toml file: {e}"),
            CliError::InvalidPeer(peer, e) => write!(f, "Invalid peer address {peer}: {e}"),
        }
    }
}

impl std::error::Error for CliError {}

impl_error_from!(CliError, WireError, Wire);
impl_error_from!(CliError, std::io::Error, Io);
impl_error_from!(CliError, toml::de::Error, TomlParsing);
