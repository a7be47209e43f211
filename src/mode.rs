//! Address presentation modes
//!
//! An account with several addresses can surface them either as one
//! mailbox namespace or as one namespace per address.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How an account's addresses are presented to the local protocol
/// layer.
///
/// # Examples
///
/// ```
/// use protonmail_bridge::AddressMode;
///
/// let mode: AddressMode = "split".parse().unwrap();
/// assert_eq!(mode, AddressMode::Split);
/// assert_eq!(AddressMode::default(), AddressMode::Combined);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressMode {
    /// All addresses share a single namespace.
    #[default]
    Combined,
    /// Every address gets its own namespace.
    Split,
}

impl AddressMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Combined => "combined",
            Self::Split => "split",
        }
    }
}

impl fmt::Display for AddressMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AddressMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("combined") {
            Ok(Self::Combined)
        } else if s.eq_ignore_ascii_case("split") {
            Ok(Self::Split)
        } else {
            Err(Error::Config(format!("Unknown address mode: {s}")))
        }
    }
}
