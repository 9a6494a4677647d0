//! Parser for the report printed by `iscsicli SessionList`.
//!
//! The report is a flat run of `Key : value` lines. Sessions start at
//! `Session Id`, devices at `Device Type`, and `Volume Path Names` is
//! followed by one path per line until a blank line or the next field.

use serde::Serialize;

#[derive(Serialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct RemoteSession {
    pub session_id: String,
    pub target_name: String,
    pub connections: u32,
    pub devices: Vec<RemoteDevice>,
}

impl RemoteSession {
    /// Whether the session or one of its devices belongs to `target`.
    /// Windows reports IQNs lower-cased.
    pub fn is_for(&self, target: &str) -> bool {
        self.target_name.eq_ignore_ascii_case(target)
            || self.devices.iter().any(|d| d.is_for(target))
    }
}

#[derive(Serialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct RemoteDevice {
    pub device_type: String,
    pub device_number: Option<u32>,
    /// e.g. `\\.\PhysicalDrive2`
    pub legacy_name: String,
    pub target_name: String,
    pub volume_paths: Vec<String>,
}

impl RemoteDevice {
    pub fn is_for(&self, target: &str) -> bool {
        self.target_name.eq_ignore_ascii_case(target)
    }

    /// Disk index if the legacy name is a raw physical drive.
    pub fn physical_drive(&self) -> Option<u32> {
        const DRIVE: &str = "PhysicalDrive";
        let name = self.legacy_name.strip_prefix(r"\\.\")?;
        let head = name.get(..DRIVE.len())?;
        if !head.eq_ignore_ascii_case(DRIVE) {
            return None;
        }
        name.get(DRIVE.len()..)?.parse::<u32>().ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    SessionId,
    TargetName,
    NumberConnections,
    DeviceType,
    DeviceNumber,
    LegacyDeviceName,
    VolumePathNames,
}

impl Field {
    fn from_key(key: &str) -> Option<Field> {
        let field = match key.to_ascii_lowercase().as_str() {
            "session id" => Field::SessionId,
            "target name" => Field::TargetName,
            "number connections" => Field::NumberConnections,
            "device type" => Field::DeviceType,
            "device number" => Field::DeviceNumber,
            "legacy device name" => Field::LegacyDeviceName,
            "volume path names" => Field::VolumePathNames,
            _ => return None,
        };
        Some(field)
    }
}

fn field(line: &str) -> Option<(Field, &str)> {
    let (key, value) = line.split_once(':')?;
    Some((Field::from_key(key.trim())?, value.trim()))
}

fn device(session: &mut RemoteSession) -> &mut RemoteDevice {
    if session.devices.is_empty() {
        session.devices.push(RemoteDevice::default());
    }
    let last = session.devices.len() - 1;
    &mut session.devices[last]
}

pub fn parse_session_list(text: &str) -> Vec<RemoteSession> {
    let mut sessions: Vec<RemoteSession> = Vec::new();
    let mut in_paths = false;

    for line in text.lines().map(str::trim) {
        if line.is_empty() {
            in_paths = false;
            continue;
        }

        let Some((field, value)) = field(line) else {
            if in_paths {
                if let Some(session) = sessions.last_mut() {
                    device(session).volume_paths.push(line.to_string());
                }
            }
            continue;
        };
        in_paths = false;

        if field == Field::SessionId {
            sessions.push(RemoteSession {
                session_id: value.to_string(),
                ..RemoteSession::default()
            });
            continue;
        }
        // fields before the first session belong to nothing
        let Some(session) = sessions.last_mut() else {
            continue;
        };

        match field {
            Field::SessionId => {}
            Field::TargetName => match session.devices.last_mut() {
                Some(device) => device.target_name = value.to_string(),
                None => session.target_name = value.to_string(),
            },
            Field::NumberConnections => session.connections = value.parse().unwrap_or(0),
            Field::DeviceType => session.devices.push(RemoteDevice {
                device_type: value.to_string(),
                ..RemoteDevice::default()
            }),
            Field::DeviceNumber => device(session).device_number = value.parse().ok(),
            Field::LegacyDeviceName => device(session).legacy_name = value.to_string(),
            Field::VolumePathNames => {
                in_paths = true;
                if !value.is_empty() {
                    device(session).volume_paths.push(value.to_string());
                }
            }
        }
    }

    sessions
}
