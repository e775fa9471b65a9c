use std::{fmt, str::FromStr};

use anyhow::{Context as _, Error};
use macaddr::MacAddr6;

/// Hardware address of the monitored sensor.
///
/// Parsing accepts any letter case; the address is always rendered in
/// uppercase, colon-separated form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceIdentity(MacAddr6);

impl DeviceIdentity {
    pub fn address(&self) -> MacAddr6 {
        self.0
    }
}

impl FromStr for DeviceIdentity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let address = s
            .trim()
            .parse::<MacAddr6>()
            .with_context(|| format!("invalid hardware address: {s}"))?;

        Ok(Self(address))
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0.as_bytes();
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl From<MacAddr6> for DeviceIdentity {
    fn from(address: MacAddr6) -> Self {
        Self(address)
    }
}
