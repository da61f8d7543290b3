use crate::error::{MatrixError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Input (source) identifier, 1-based as printed on the amplifier
pub type InputIndex = u16;

/// Output (zone) identifier, 1-based as printed on the amplifier
pub type OutputIndex = u16;

/// Highest volume level the amplifier accepts
pub const MAX_VOLUME: u8 = 100;

const DEFAULT_PORT: u16 = 80;

/// An amplifier input channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub index: InputIndex,
    pub label: String,
    pub enabled: bool,
}

/// An amplifier output channel driving one set of speakers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub index: OutputIndex,
    pub label: String,
    pub enabled: bool,

    /// Volume 0-100, `None` when the device has not reported one.
    /// `Some(0)` is a real, silent level.
    pub volume: Option<u8>,

    pub muted: bool,

    /// Input currently routed to this output, `None` when unassigned
    pub input_channel: Option<InputIndex>,

    /// Local grouping state, not reported by the device
    #[serde(default)]
    pub group: GroupState,
}

impl Zone {
    /// Volume as a fraction in 0.0..=1.0, or `None` when unknown
    pub fn volume_level(&self) -> Option<f32> {
        self.volume.map(|v| f32::from(v) / f32::from(MAX_VOLUME))
    }

    /// Current value of one attribute
    pub fn value(&self, field: ZoneField) -> ZoneValue {
        match field {
            ZoneField::Label => ZoneValue::Label(self.label.clone()),
            ZoneField::Enabled => ZoneValue::Enabled(self.enabled),
            ZoneField::Volume => ZoneValue::Volume(self.volume),
            ZoneField::Muted => ZoneValue::Muted(self.muted),
            ZoneField::InputChannel => ZoneValue::InputChannel(self.input_channel),
            ZoneField::Group => ZoneValue::Group(self.group.clone()),
        }
    }

    /// Replace one attribute, returning the previous value if it changed
    pub(crate) fn set(&mut self, value: ZoneValue) -> Option<ZoneValue> {
        let old = self.value(value.field());
        if old == value {
            return None;
        }
        match value {
            ZoneValue::Label(label) => self.label = label,
            ZoneValue::Enabled(enabled) => self.enabled = enabled,
            ZoneValue::Volume(volume) => self.volume = volume,
            ZoneValue::Muted(muted) => self.muted = muted,
            ZoneValue::InputChannel(input) => self.input_channel = input,
            ZoneValue::Group(group) => self.group = group,
        }
        Some(old)
    }
}

/// Grouping of outputs under a master output
///
/// Commands sent to a master are repeated on each of its members.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupState {
    #[default]
    Ungrouped,
    /// Member of the group led by the given master
    Member(OutputIndex),
    /// Master of the given members (the master itself is not listed)
    Master(BTreeSet<OutputIndex>),
}

impl GroupState {
    /// Members to fan commands out to, empty unless this is a master
    pub fn members(&self) -> Vec<OutputIndex> {
        match self {
            GroupState::Master(members) => members.iter().copied().collect(),
            _ => Vec::new(),
        }
    }
}

/// Attribute of a zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ZoneField {
    Label,
    Enabled,
    Volume,
    Muted,
    InputChannel,
    Group,
}

/// Value of one zone attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZoneValue {
    Label(String),
    Enabled(bool),
    Volume(Option<u8>),
    Muted(bool),
    InputChannel(Option<InputIndex>),
    Group(GroupState),
}

impl ZoneValue {
    pub fn field(&self) -> ZoneField {
        match self {
            ZoneValue::Label(_) => ZoneField::Label,
            ZoneValue::Enabled(_) => ZoneField::Enabled,
            ZoneValue::Volume(_) => ZoneField::Volume,
            ZoneValue::Muted(_) => ZoneField::Muted,
            ZoneValue::InputChannel(_) => ZoneField::InputChannel,
            ZoneValue::Group(_) => ZoneField::Group,
        }
    }
}

/// Saved routing/volume/mute of one zone, for later restore
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneSnapshot {
    pub index: OutputIndex,
    pub input_channel: Option<InputIndex>,
    pub volume: Option<u8>,
    pub muted: bool,
}

impl From<&Zone> for ZoneSnapshot {
    fn from(zone: &Zone) -> Self {
        Self {
            index: zone.index,
            input_channel: zone.input_channel,
            volume: zone.volume,
            muted: zone.muted,
        }
    }
}

/// Session link state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// WebSocket address of an amplifier
///
/// Parsed from `host`, `host:port` or a full `ws://` / `wss://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub path: String,
}

impl Endpoint {
    /// URL to open the WebSocket against
    pub fn url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        if self.host.contains(':') {
            format!("{}://[{}]:{}{}", scheme, self.host, self.port, self.path)
        } else {
            format!("{}://{}:{}{}", scheme, self.host, self.port, self.path)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

impl FromStr for Endpoint {
    type Err = MatrixError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (secure, rest) = if let Some(rest) = s.strip_prefix("wss://") {
            (true, rest)
        } else if let Some(rest) = s.strip_prefix("ws://") {
            (false, rest)
        } else {
            (false, s)
        };

        let (authority, path) = match rest.find('/') {
            Some(pos) => (&rest[..pos], rest[pos..].to_string()),
            None => (rest, "/".to_string()),
        };

        let invalid = |what: &str| {
            MatrixError::InvalidArgument(format!("{} in endpoint '{}'", what, s))
        };
        let default_port = if secure { 443 } else { DEFAULT_PORT };

        // IPv6 literals must be bracketed: [::1] or [::1]:8080
        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unclosed '['"))?;
            match after {
                "" => (host, default_port),
                _ => {
                    let port = after.strip_prefix(':').ok_or_else(|| invalid("invalid port"))?;
                    (host, port.parse::<u16>().map_err(|_| invalid("invalid port"))?)
                }
            }
        } else {
            match authority.split_once(':') {
                Some((_, port)) if port.contains(':') => {
                    return Err(invalid("unbracketed IPv6 address"));
                }
                Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid("invalid port"))?),
                None => (authority, default_port),
            }
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            secure,
            path,
        })
    }
}

/// New volume after stepping `current` by `delta`, clamped to 0..=100
pub(crate) fn stepped_volume(current: u8, delta: i32) -> u8 {
    (i32::from(current) + delta).clamp(0, i32::from(MAX_VOLUME)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone() -> Zone {
        Zone {
            index: 1,
            label: "Living Room".to_string(),
            enabled: true,
            volume: Some(40),
            muted: false,
            input_channel: Some(2),
            group: GroupState::Ungrouped,
        }
    }

    #[test]
    fn endpoint_from_bare_host() {
        let endpoint: Endpoint = "192.168.1.50".parse().unwrap();
        assert_eq!(endpoint.url(), "ws://192.168.1.50:80/");
    }

    #[test]
    fn endpoint_from_host_and_port() {
        let endpoint: Endpoint = "matrix.local:8080".parse().unwrap();
        assert_eq!(endpoint.host, "matrix.local");
        assert_eq!(endpoint.port, 8080);
        assert!(!endpoint.secure);
    }

    #[test]
    fn endpoint_from_url_keeps_path() {
        let endpoint: Endpoint = "wss://10.0.0.2:443/ws".parse().unwrap();
        assert!(endpoint.secure);
        assert_eq!(endpoint.path, "/ws");
        assert_eq!(endpoint.url(), "wss://10.0.0.2:443/ws");
    }

    #[test]
    fn endpoint_from_bracketed_ipv6() {
        let endpoint: Endpoint = "[::1]".parse().unwrap();
        assert_eq!(endpoint.host, "::1");
        assert_eq!(endpoint.port, 80);
        assert_eq!(endpoint.url(), "ws://[::1]:80/");

        let endpoint: Endpoint = "ws://[fe80::2]:8080/ws".parse().unwrap();
        assert_eq!(endpoint.host, "fe80::2");
        assert_eq!(endpoint.port, 8080);
        assert_eq!(endpoint.url(), "ws://[fe80::2]:8080/ws");
    }

    #[test]
    fn endpoint_rejects_unbracketed_ipv6() {
        assert!(matches!(
            "::1".parse::<Endpoint>(),
            Err(MatrixError::InvalidArgument(_))
        ));
        assert!("fe80::2:8080".parse::<Endpoint>().is_err());
        assert!("[::1".parse::<Endpoint>().is_err());
        assert!("[::1]8080".parse::<Endpoint>().is_err());
    }

    #[test]
    fn secure_endpoint_defaults_to_443() {
        let endpoint: Endpoint = "wss://matrix.local".parse().unwrap();
        assert_eq!(endpoint.port, 443);
    }

    #[test]
    fn endpoint_rejects_bad_input() {
        assert!("".parse::<Endpoint>().is_err());
        assert!("host:notaport".parse::<Endpoint>().is_err());
    }

    #[test]
    fn volume_level_distinguishes_silent_from_unknown() {
        let mut z = zone();
        z.volume = Some(0);
        assert_eq!(z.volume_level(), Some(0.0));
        z.volume = None;
        assert_eq!(z.volume_level(), None);
        z.volume = Some(50);
        assert_eq!(z.volume_level(), Some(0.5));
    }

    #[test]
    fn set_reports_only_real_changes() {
        let mut z = zone();
        assert_eq!(z.set(ZoneValue::Volume(Some(40))), None);
        assert_eq!(
            z.set(ZoneValue::Volume(Some(45))),
            Some(ZoneValue::Volume(Some(40)))
        );
        assert_eq!(z.volume, Some(45));
    }

    #[test]
    fn stepped_volume_clamps_at_bounds() {
        assert_eq!(stepped_volume(98, 5), 100);
        assert_eq!(stepped_volume(100, -5), 95);
        assert_eq!(stepped_volume(3, -5), 0);
    }
}
