//! Parameter database: PGN → list of SPN descriptors, loaded from CSV
//! with a built-in fallback table so the gateway still decodes the
//! common powertrain/chassis PGNs when no CSV is configured.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::GatewayError;

/// One SPN's position and scaling within a PGN's payload. Immutable once
/// loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterDescriptor {
    pub pgn: u32,
    pub spn: u32,
    pub name: String,
    pub start_byte: usize,
    pub start_bit: u8,
    pub bit_length: u32,
    pub resolution: f64,
    pub offset: f64,
    pub unit: String,
}

#[derive(Debug, Deserialize)]
struct DbRow {
    #[serde(rename = "PGN")]
    pgn: u32,
    #[serde(rename = "SPN")]
    spn: u32,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "StartByte")]
    start_byte: usize,
    #[serde(rename = "StartBit")]
    start_bit: u8,
    #[serde(rename = "BitLength")]
    bit_length: u32,
    #[serde(rename = "Resolution")]
    resolution: f64,
    #[serde(rename = "Offset")]
    offset: f64,
    #[serde(rename = "Unit")]
    unit: String,
}

/// PGN → SPN descriptors, indexed at load time.
#[derive(Debug, Clone, Default)]
pub struct PgnDatabase {
    by_pgn: HashMap<u32, Vec<ParameterDescriptor>>,
}

impl PgnDatabase {
    pub fn load_csv(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let mut reader = csv::Reader::from_path(path.as_ref())
            .map_err(|e| GatewayError::Decode(format!("opening PGN database: {e}")))?;

        let mut by_pgn: HashMap<u32, Vec<ParameterDescriptor>> = HashMap::new();
        for row in reader.deserialize::<DbRow>() {
            let row = row.map_err(|e| GatewayError::Decode(format!("parsing PGN database row: {e}")))?;
            by_pgn.entry(row.pgn).or_default().push(ParameterDescriptor {
                pgn: row.pgn,
                spn: row.spn,
                name: row.name,
                start_byte: row.start_byte,
                start_bit: row.start_bit,
                bit_length: row.bit_length,
                resolution: row.resolution,
                offset: row.offset,
                unit: row.unit,
            });
        }
        Ok(Self { by_pgn })
    }

    /// All known PGNs, used to drive discovery requests.
    pub fn known_pgns(&self) -> impl Iterator<Item = u32> + '_ {
        self.by_pgn.keys().copied()
    }

    pub fn descriptors_for(&self, pgn: u32) -> Option<&[ParameterDescriptor]> {
        self.by_pgn.get(&pgn).map(|v| v.as_slice())
    }

    pub fn contains(&self, pgn: u32) -> bool {
        self.by_pgn.contains_key(&pgn)
    }

    fn insert(&mut self, d: ParameterDescriptor) {
        self.by_pgn.entry(d.pgn).or_default().push(d);
    }

    /// Built-in table covering the polled reference-interval PGNs plus the
    /// decoder's own test vectors (61444 engine speed, 65265 wheel speed),
    /// for when no `--pgn-database` CSV is given.
    pub fn builtin() -> Self {
        let mut db = Self::default();

        // EEC1 — Electronic Engine Controller 1
        db.insert(ParameterDescriptor {
            pgn: 61444,
            spn: 190,
            name: "Engine_Speed".to_string(),
            start_byte: 3,
            start_bit: 0,
            bit_length: 16,
            resolution: 0.125,
            offset: 0.0,
            unit: "rpm".to_string(),
        });

        // CCVS1 — Cruise Control/Vehicle Speed
        db.insert(ParameterDescriptor {
            pgn: 65265,
            spn: 84,
            name: "Wheel-Based_Vehicle_Speed".to_string(),
            start_byte: 1,
            start_bit: 0,
            bit_length: 16,
            resolution: 1.0,
            offset: 0.0,
            unit: "km/h".to_string(),
        });

        // VD — Total Vehicle Distance; name matches the topic suffix the
        // fusion controller's distance arbitration table looks for.
        db.insert(ParameterDescriptor {
            pgn: 65248,
            spn: 244,
            name: "Total_Vehicle_Distance".to_string(),
            start_byte: 0,
            start_bit: 0,
            bit_length: 32,
            resolution: 0.125,
            offset: 0.0,
            unit: "km".to_string(),
        });

        // HR VD — High Resolution Total Vehicle Distance
        db.insert(ParameterDescriptor {
            pgn: 65217,
            spn: 917,
            name: "High_Resolution_Total_Vehicle_Distance".to_string(),
            start_byte: 0,
            start_bit: 0,
            bit_length: 32,
            resolution: 5.0,
            offset: 0.0,
            unit: "m".to_string(),
        });

        // LFE — Fuel Economy
        db.insert(ParameterDescriptor {
            pgn: 65266,
            spn: 183,
            name: "Fuel_Rate".to_string(),
            start_byte: 0,
            start_bit: 0,
            bit_length: 16,
            resolution: 0.05,
            offset: 0.0,
            unit: "L/h".to_string(),
        });

        // Slope Sensor Information
        db.insert(ParameterDescriptor {
            pgn: 65215,
            spn: 918,
            name: "Pitch".to_string(),
            start_byte: 0,
            start_bit: 0,
            bit_length: 16,
            resolution: 1.0 / 32128.0,
            offset: -31.0,
            unit: "deg".to_string(),
        });

        // DD — Dash Display (fuel level)
        db.insert(ParameterDescriptor {
            pgn: 65276,
            spn: 96,
            name: "Fuel_Level".to_string(),
            start_byte: 1,
            start_bit: 0,
            bit_length: 8,
            resolution: 0.4,
            offset: 0.0,
            unit: "%".to_string(),
        });

        // LFC — Fuel Consumption (Liquid)
        db.insert(ParameterDescriptor {
            pgn: 65257,
            spn: 250,
            name: "Fuel_Used".to_string(),
            start_byte: 0,
            start_bit: 0,
            bit_length: 32,
            resolution: 0.5,
            offset: 0.0,
            unit: "L".to_string(),
        });

        db
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_has_engine_speed_descriptor() {
        let db = PgnDatabase::builtin();
        let desc = db.descriptors_for(61444).unwrap();
        assert!(desc.iter().any(|d| d.name == "Engine_Speed"));
    }

    #[test]
    fn unknown_pgn_has_no_descriptors() {
        let db = PgnDatabase::builtin();
        assert!(db.descriptors_for(1).is_none());
    }
}
