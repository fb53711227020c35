//! Overlay tunnel encapsulation type.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Overlay tunnel encapsulation used between agents.
///
/// The string forms match the wire values carried in FDB messages and the
/// prefixes used for tunnel port names (`gre-0a010001`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TunnelType {
    Gre,
    Vxlan,
}

impl TunnelType {
    /// Returns the wire/port-name form of the tunnel type.
    pub const fn as_str(&self) -> &'static str {
        match self {
            TunnelType::Gre => "gre",
            TunnelType::Vxlan => "vxlan",
        }
    }
}

impl fmt::Display for TunnelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TunnelType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gre" => Ok(TunnelType::Gre),
            "vxlan" => Ok(TunnelType::Vxlan),
            _ => Err(ParseError::InvalidTunnelType(s.to_string())),
        }
    }
}

impl TryFrom<String> for TunnelType {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TunnelType> for String {
    fn from(t: TunnelType) -> String {
        t.as_str().to_string()
    }
}
