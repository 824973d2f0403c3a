//! The per-cycle record merged from every instrument.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered field schema, as written to the log header.
pub const FIELD_NAMES: [&str; 9] = [
    "timestamp",
    "dry_flow",
    "dry_setpoint",
    "wet_flow",
    "wet_setpoint",
    "cell_temp",
    "ambient_temp",
    "dewpoint_temp",
    "relative_humidity",
];

/// One of the eight optional channels of a [`Reading`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Dry air flow (ml/min)
    DryFlow,
    /// Dry air setpoint (ml/min)
    DrySetpoint,
    /// Wet air flow (ml/min)
    WetFlow,
    /// Wet air setpoint (ml/min)
    WetSetpoint,
    /// Sample cell temperature (°C)
    CellTemp,
    /// Ambient temperature (°C)
    AmbientTemp,
    /// Dewpoint temperature (°C)
    DewpointTemp,
    /// Relative humidity (%)
    RelativeHumidity,
}

impl Channel {
    /// Every channel in schema order
    pub const ALL: [Channel; 8] = [
        Channel::DryFlow,
        Channel::DrySetpoint,
        Channel::WetFlow,
        Channel::WetSetpoint,
        Channel::CellTemp,
        Channel::AmbientTemp,
        Channel::DewpointTemp,
        Channel::RelativeHumidity,
    ];

    /// Column name in the field schema
    pub fn field_name(self) -> &'static str {
        match self {
            Channel::DryFlow => "dry_flow",
            Channel::DrySetpoint => "dry_setpoint",
            Channel::WetFlow => "wet_flow",
            Channel::WetSetpoint => "wet_setpoint",
            Channel::CellTemp => "cell_temp",
            Channel::AmbientTemp => "ambient_temp",
            Channel::DewpointTemp => "dewpoint_temp",
            Channel::RelativeHumidity => "relative_humidity",
        }
    }

    /// Channel whose column is called `name`
    pub fn from_field_name(name: &str) -> Option<Channel> {
        Channel::ALL.into_iter().find(|c| c.field_name() == name)
    }

    /// Display unit of the channel's values
    pub fn unit(self) -> &'static str {
        match self {
            Channel::DryFlow | Channel::DrySetpoint | Channel::WetFlow | Channel::WetSetpoint => {
                "ml/min"
            }
            Channel::CellTemp | Channel::AmbientTemp | Channel::DewpointTemp => "°C",
            Channel::RelativeHumidity => "%",
        }
    }

    /// Human-readable series name
    pub fn label(self) -> &'static str {
        match self {
            Channel::DryFlow => "Dry Air Flow",
            Channel::DrySetpoint => "Dry Air Setpoint",
            Channel::WetFlow => "Wet Air Flow",
            Channel::WetSetpoint => "Wet Air Setpoint",
            Channel::CellTemp => "Cell Temperature",
            Channel::AmbientTemp => "Ambient Temperature",
            Channel::DewpointTemp => "Dewpoint",
            Channel::RelativeHumidity => "Relative Humidity",
        }
    }
}

/// Timestamped snapshot of every channel for one sampling cycle.
///
/// Channels whose device was unavailable or failed this cycle are `None`; a
/// value is never carried over from an earlier cycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Cycle start, UTC
    pub timestamp: DateTime<Utc>,
    /// Dry air flow (ml/min)
    pub dry_flow: Option<f64>,
    /// Dry air setpoint (ml/min)
    pub dry_setpoint: Option<f64>,
    /// Wet air flow (ml/min)
    pub wet_flow: Option<f64>,
    /// Wet air setpoint (ml/min)
    pub wet_setpoint: Option<f64>,
    /// Sample cell temperature (°C)
    pub cell_temp: Option<f64>,
    /// Ambient temperature (°C)
    pub ambient_temp: Option<f64>,
    /// Dewpoint temperature (°C)
    pub dewpoint_temp: Option<f64>,
    /// Relative humidity (%)
    pub relative_humidity: Option<f64>,
}

impl Reading {
    /// A reading with every channel absent
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            dry_flow: None,
            dry_setpoint: None,
            wet_flow: None,
            wet_setpoint: None,
            cell_temp: None,
            ambient_temp: None,
            dewpoint_temp: None,
            relative_humidity: None,
        }
    }

    /// Value of `channel`, if it was measured
    pub fn get(&self, channel: Channel) -> Option<f64> {
        match channel {
            Channel::DryFlow => self.dry_flow,
            Channel::DrySetpoint => self.dry_setpoint,
            Channel::WetFlow => self.wet_flow,
            Channel::WetSetpoint => self.wet_setpoint,
            Channel::CellTemp => self.cell_temp,
            Channel::AmbientTemp => self.ambient_temp,
            Channel::DewpointTemp => self.dewpoint_temp,
            Channel::RelativeHumidity => self.relative_humidity,
        }
    }

    pub(crate) fn set(&mut self, channel: Channel, value: Option<f64>) {
        let slot = match channel {
            Channel::DryFlow => &mut self.dry_flow,
            Channel::DrySetpoint => &mut self.dry_setpoint,
            Channel::WetFlow => &mut self.wet_flow,
            Channel::WetSetpoint => &mut self.wet_setpoint,
            Channel::CellTemp => &mut self.cell_temp,
            Channel::AmbientTemp => &mut self.ambient_temp,
            Channel::DewpointTemp => &mut self.dewpoint_temp,
            Channel::RelativeHumidity => &mut self.relative_humidity,
        };
        *slot = value;
    }

    /// Number of channels carrying a value
    pub fn present_count(&self) -> usize {
        Channel::ALL.iter().filter(|c| self.get(**c).is_some()).count()
    }

    /// Text of the column `name`: RFC 3339 for `timestamp`, the value for a
    /// channel, and an empty string for an absent channel or unknown column.
    pub fn field(&self, name: &str) -> String {
        if name == "timestamp" {
            return self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
        }
        Channel::from_field_name(name)
            .and_then(|c| self.get(c))
            .map(|v| v.to_string())
            .unwrap_or_default()
    }
}

struct Value(Option<f64>, usize);

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(v) => write!(f, "{v:.prec$}", prec = self.1),
            None => f.write_str("--"),
        }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Dry Air: {} ml/min (SP: {}) | Wet Air: {} ml/min (SP: {}) | Cell: {} °C | \
             Ambient: {} °C | Dewpoint: {} °C | Humidity: {} %",
            Value(self.dry_flow, 2),
            Value(self.dry_setpoint, 2),
            Value(self.wet_flow, 2),
            Value(self.wet_setpoint, 2),
            Value(self.cell_temp, 2),
            Value(self.ambient_temp, 2),
            Value(self.dewpoint_temp, 2),
            Value(self.relative_humidity, 1),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn stamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 13, 13, 41, 50).unwrap()
    }

    #[test]
    fn test_channels_follow_schema_order() {
        let names: Vec<&str> = Channel::ALL.iter().map(|c| c.field_name()).collect();
        assert_eq!(names, FIELD_NAMES[1..].to_vec());
    }

    #[test]
    fn test_record_leaves_absent_cells_empty() {
        let mut reading = Reading::empty(stamp());
        reading.set(Channel::DryFlow, Some(1.5));
        reading.set(Channel::RelativeHumidity, Some(23.5));
        assert_eq!(
            FIELD_NAMES.iter().map(|f| reading.field(f)).collect::<Vec<_>>(),
            vec!["2025-11-13T13:41:50.000Z", "1.5", "", "", "", "", "", "", "23.5"]
        );
        assert_eq!(reading.present_count(), 2);
        assert_eq!(reading.field("no_such_column"), "");
    }

    #[test]
    fn test_display_marks_absent_channels() {
        let mut reading = Reading::empty(stamp());
        reading.set(Channel::AmbientTemp, Some(24.1));
        let text = reading.to_string();
        assert!(text.contains("Dry Air: -- ml/min (SP: --)"));
        assert!(text.contains("Ambient: 24.10 °C"));
        assert!(text.contains("Humidity: -- %"));
    }
}
