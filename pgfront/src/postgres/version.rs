//! Protocol version policy.
//!
//! Which wire format to speak is a pure function of the configured preference and of
//! the downgrade events observed while connecting.
use std::{fmt, str::FromStr};

/// Server block size, older servers limit a query to a multiple of it.
pub const BLCKSZ: usize = 8192;

/// Generation of the frontend/backend wire protocol.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub enum Generation {
    /// Servers 6.2 and older, reversed integer byte order and no authentication exchange.
    #[cfg_attr(feature = "serde", serde(rename = "6.2"))]
    Legacy62,
    /// Protocol 1.0, authentication exchange without `ReadyForQuery`.
    #[cfg_attr(feature = "serde", serde(rename = "6.3"))]
    Legacy63,
    /// Protocol 2.0, servers 6.4 and later.
    #[default]
    #[cfg_attr(feature = "serde", serde(rename = "6.4"))]
    Modern,
}

/// Integer byte order on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ByteOrder {
    /// Most significant byte first.
    #[default]
    Network,
    /// Least significant byte first, as spoken by 6.2 servers.
    Reversed,
}

/// Layout of the very first packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartupLayout {
    /// `authtype` followed by 6.2 sized string fields.
    Legacy,
    /// Protocol version followed by the newer string fields.
    Versioned {
        /// `major << 16 | minor`
        protocol: u32,
    },
}

impl Generation {
    /// The newest generation this crate speaks.
    pub const LATEST: Generation = Generation::Modern;

    /// The generation to retry with when the server reject this one.
    ///
    /// Returns `None` for the oldest generation, which bound the retries.
    pub fn downgrade(self) -> Option<Generation> {
        match self {
            Self::Modern => Some(Self::Legacy63),
            Self::Legacy63 => Some(Self::Legacy62),
            Self::Legacy62 => None,
        }
    }

    /// Integer byte order after the startup packet.
    pub fn byte_order(self) -> ByteOrder {
        match self {
            Self::Legacy62 => ByteOrder::Reversed,
            _ => ByteOrder::Network,
        }
    }

    pub fn startup_layout(self) -> StartupLayout {
        match self {
            Self::Legacy62 => StartupLayout::Legacy,
            Self::Legacy63 => StartupLayout::Versioned { protocol: 1 << 16 },
            Self::Modern => StartupLayout::Versioned { protocol: 2 << 16 },
        }
    }

    /// Whether the server run an authentication exchange after startup.
    pub fn authenticates(self) -> bool {
        !matches!(self, Self::Legacy62)
    }

    /// Whether the server terminate each response with `ReadyForQuery`.
    pub fn has_ready_for_query(self) -> bool {
        matches!(self, Self::Modern)
    }

    /// Server version assumed until the real one is known.
    pub fn nominal_version(self) -> ServerVersion {
        match self {
            Self::Legacy62 => ServerVersion::new(6, 2),
            Self::Legacy63 => ServerVersion::new(6, 3),
            Self::Modern => ServerVersion::new(6, 4),
        }
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Legacy62 => "6.2",
            Self::Legacy63 => "6.3",
            Self::Modern => "6.4",
        })
    }
}

impl FromStr for Generation {
    type Err = UnknownGeneration;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "6.2" => Ok(Self::Legacy62),
            "6.3" => Ok(Self::Legacy63),
            "6.4" | "" | "latest" => Ok(Self::Modern),
            _ => Err(UnknownGeneration),
        }
    }
}

/// Error when parsing protocol generation.
#[derive(Debug)]
pub struct UnknownGeneration;

impl std::error::Error for UnknownGeneration { }

impl fmt::Display for UnknownGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("unknown protocol, expected one of `6.2`, `6.3` or `6.4`")
    }
}

/// `major.minor` version of the connected server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerVersion {
    pub major: u16,
    pub minor: u16,
}

impl ServerVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// `self >= major.minor`
    pub fn at_least(self, major: u16, minor: u16) -> bool {
        self >= Self::new(major, minor)
    }

    /// Extract version from `version()` output, e.g. `PostgreSQL 7.4.1 on i686-pc-linux-gnu`.
    ///
    /// The first word is skipped, the `major.minor` pair is read from the second one.
    /// Returns `0.0` when the text does not look like that.
    pub fn parse(text: &str) -> ServerVersion {
        fn number(s: &str) -> Option<(u16, &str)> {
            let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
            Some((s[..end].parse().ok()?, &s[end..]))
        }

        let parse = || {
            let rest = text.trim_start();
            let (_, rest) = rest.split_once(char::is_whitespace)?;
            let (major, rest) = number(rest.trim_start())?;
            let (minor, _) = number(rest.strip_prefix('.')?)?;
            Some(ServerVersion::new(major, minor))
        };

        parse().unwrap_or_default()
    }

    /// Longest query text the server accepts, `0` means unlimited.
    pub fn max_query_len(self) -> usize {
        if self.at_least(7, 0) {
            0
        } else if self.at_least(6, 5) {
            2 * BLCKSZ
        } else {
            BLCKSZ
        }
    }

    /// `ROLLBACK TO SAVEPOINT` exists since 8.0.
    pub fn has_savepoints(self) -> bool {
        self.at_least(8, 0)
    }

    /// Schemas exists since 7.3.
    pub fn has_schemas(self) -> bool {
        self.at_least(7, 3)
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn downgrade_is_bounded() {
        let mut generation = Generation::LATEST;
        let mut retries = 0;
        while let Some(older) = generation.downgrade() {
            generation = older;
            retries += 1;
        }
        assert_eq!(generation, Generation::Legacy62);
        assert_eq!(retries, 2);
    }

    #[test]
    fn wire_shape() {
        assert_eq!(Generation::Legacy62.byte_order(), ByteOrder::Reversed);
        assert_eq!(Generation::Legacy63.byte_order(), ByteOrder::Network);
        assert_eq!(Generation::Legacy62.startup_layout(), StartupLayout::Legacy);
        assert_eq!(
            Generation::Modern.startup_layout(),
            StartupLayout::Versioned { protocol: 0x0002_0000 }
        );
        assert!(!Generation::Legacy62.authenticates());
        assert!(!Generation::Legacy63.has_ready_for_query());
        assert!(Generation::Modern.has_ready_for_query());
    }

    #[test]
    fn parse_generation() {
        assert_eq!("6.2".parse::<Generation>().unwrap(), Generation::Legacy62);
        assert_eq!("latest".parse::<Generation>().unwrap(), Generation::Modern);
        assert!("7.0".parse::<Generation>().is_err());
    }

    #[test]
    fn parse_version() {
        assert_eq!(ServerVersion::parse("PostgreSQL 7.4.1 on i686-pc-linux-gnu"), ServerVersion::new(7, 4));
        assert_eq!(ServerVersion::parse("PostgreSQL 10.23, compiled by gcc"), ServerVersion::new(10, 23));
        assert_eq!(ServerVersion::parse("PostgreSQL"), ServerVersion::new(0, 0));
        assert_eq!(ServerVersion::parse("PostgreSQL devel"), ServerVersion::new(0, 0));
        assert_eq!(ServerVersion::parse(""), ServerVersion::default());
    }

    #[test]
    fn max_query_len() {
        assert_eq!(ServerVersion::new(7, 1).max_query_len(), 0);
        assert_eq!(ServerVersion::new(6, 5).max_query_len(), 16384);
        assert_eq!(ServerVersion::new(6, 4).max_query_len(), 8192);
    }
}
