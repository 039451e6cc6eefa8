//! Mapping from raw register words to named physical quantities
//!
//! The field names, their register offsets and their scale factors are a
//! fixed contract with downstream consumers, which key on the field name.
//! Two register blocks are read per poll cycle:
//!
//! | Block     | Address  | Words | Fields                                                       |
//! |-----------|----------|-------|--------------------------------------------------------------|
//! | Primary   | `0x3100` | 9     | PV, battery and load voltage / current / power               |
//! | Secondary | `0x3110` | 5     | temperatures, battery capacity, battery and charging status  |

use chrono::{DateTime, Utc};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// First register of the primary (real-time PV / battery / load) block
pub const PRIMARY_BLOCK_ADDRESS: u16 = 0x3100;
/// Words read from the primary block
pub const PRIMARY_BLOCK_LEN: u16 = 9;
/// First register of the secondary (temperature / status) block
pub const SECONDARY_BLOCK_ADDRESS: u16 = 0x3110;
/// Words read from the secondary block
pub const SECONDARY_BLOCK_LEN: u16 = 5;

/// Which register block a field is read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Block {
    Primary,
    Secondary,
}

/// How a raw word becomes a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scale {
    /// Published as the raw integer
    Raw,
    /// Divided by 100
    Hundredths,
}

/// One entry of the field table
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub block: Block,
    pub offset: usize,
    pub scale: Scale,
}

const fn field(name: &'static str, block: Block, offset: usize, scale: Scale) -> FieldSpec {
    FieldSpec {
        name,
        block,
        offset,
        scale,
    }
}

/// Field table in publish order
pub const FIELDS: [FieldSpec; 14] = [
    field("pv_voltage", Block::Primary, 0, Scale::Hundredths),
    field("pv_current", Block::Primary, 1, Scale::Hundredths),
    field("pv_power", Block::Primary, 2, Scale::Raw),
    field("battery_voltage", Block::Primary, 3, Scale::Hundredths),
    field("battery_current", Block::Primary, 4, Scale::Hundredths),
    field("battery_power", Block::Primary, 5, Scale::Raw),
    field("load_voltage", Block::Primary, 6, Scale::Hundredths),
    field("load_current", Block::Primary, 7, Scale::Hundredths),
    field("load_power", Block::Primary, 8, Scale::Raw),
    field("battery_temperature", Block::Secondary, 0, Scale::Hundredths),
    field("controller_temperature", Block::Secondary, 1, Scale::Hundredths),
    field("battery_capacity", Block::Secondary, 2, Scale::Raw),
    field("battery_status", Block::Secondary, 3, Scale::Raw),
    field("charging_status", Block::Secondary, 4, Scale::Raw),
];

#[derive(Debug, Error, PartialEq)]
pub enum MeasurementError {
    #[error("Insufficient data in {block:?} block: need {required} words, got {actual}")]
    InsufficientData {
        block: Block,
        required: usize,
        actual: usize,
    },
}

/// A single decoded value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Integer(u16),
    Decimal(f64),
}

impl Value {
    pub fn as_f64(&self) -> f64 {
        match self {
            Value::Integer(v) => f64::from(*v),
            Value::Decimal(v) => *v,
        }
    }

    /// Text published on the wire
    ///
    /// Decimals always carry a fractional part (`10.0`, `12.5`) so consumers
    /// see a stable numeric type per field.
    pub fn to_payload(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{v}"),
            Value::Decimal(v) if v.fract() == 0.0 => write!(f, "{v:.1}"),
            Value::Decimal(v) => write!(f, "{v}"),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Integer(v) => serializer.serialize_u16(*v),
            Value::Decimal(v) => serializer.serialize_f64(*v),
        }
    }
}

/// One named reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub name: &'static str,
    pub value: Value,
}

/// All readings from one poll cycle
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementSet {
    taken_at: DateTime<Utc>,
    fields: Vec<Measurement>,
}

impl MeasurementSet {
    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.fields
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Measurement> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl Serialize for MeasurementSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len() + 1))?;
        map.serialize_entry("timestamp", &self.taken_at)?;
        for measurement in &self.fields {
            map.serialize_entry(measurement.name, &measurement.value)?;
        }
        map.end()
    }
}

/// Pure decoder over the fixed field table
pub struct MeasurementDecoder;

impl MeasurementDecoder {
    /// Decode both register blocks into a measurement set
    pub fn decode(
        primary: &[u16],
        secondary: &[u16],
    ) -> Result<MeasurementSet, MeasurementError> {
        Self::check_len(Block::Primary, primary, PRIMARY_BLOCK_LEN)?;
        Self::check_len(Block::Secondary, secondary, SECONDARY_BLOCK_LEN)?;

        let fields = FIELDS
            .iter()
            .map(|spec| {
                let raw = match spec.block {
                    Block::Primary => primary[spec.offset],
                    Block::Secondary => secondary[spec.offset],
                };
                Measurement {
                    name: spec.name,
                    value: Self::scale(raw, spec.scale),
                }
            })
            .collect();

        Ok(MeasurementSet {
            taken_at: Utc::now(),
            fields,
        })
    }

    fn check_len(block: Block, words: &[u16], required: u16) -> Result<(), MeasurementError> {
        let required = required as usize;
        if words.len() < required {
            return Err(MeasurementError::InsufficientData {
                block,
                required,
                actual: words.len(),
            });
        }
        Ok(())
    }

    fn scale(raw: u16, scale: Scale) -> Value {
        match scale {
            Scale::Raw => Value::Integer(raw),
            Scale::Hundredths => Value::Decimal(f64::from(raw) / 100.0),
        }
    }

    /// True when every word of both blocks is zero
    pub fn is_all_zero(primary: &[u16], secondary: &[u16]) -> bool {
        primary.iter().chain(secondary).all(|w| *w == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIMARY: [u16; 9] = [1000, 50, 0, 1250, 20, 0, 1200, 30, 0];
    const SECONDARY: [u16; 5] = [2500, 3000, 80, 1, 2];

    #[test]
    fn test_reference_readings() {
        let set = MeasurementDecoder::decode(&PRIMARY, &SECONDARY).unwrap();

        let expected = [
            ("pv_voltage", 10.0),
            ("pv_current", 0.5),
            ("pv_power", 0.0),
            ("battery_voltage", 12.5),
            ("battery_current", 0.2),
            ("battery_power", 0.0),
            ("load_voltage", 12.0),
            ("load_current", 0.3),
            ("load_power", 0.0),
            ("battery_temperature", 25.0),
            ("controller_temperature", 30.0),
            ("battery_capacity", 80.0),
            ("battery_status", 1.0),
            ("charging_status", 2.0),
        ];

        assert_eq!(set.len(), expected.len());
        for (name, value) in expected {
            let actual = set.get(name).unwrap_or_else(|| panic!("missing {name}"));
            assert!(
                (actual.as_f64() - value).abs() < 1e-9,
                "{name}: expected {value}, got {actual}"
            );
        }
    }

    #[test]
    fn test_raw_fields_stay_integers() {
        let set = MeasurementDecoder::decode(&PRIMARY, &SECONDARY).unwrap();
        assert_eq!(set.get("battery_capacity"), Some(Value::Integer(80)));
        assert_eq!(set.get("charging_status"), Some(Value::Integer(2)));
        assert_eq!(set.get("pv_power"), Some(Value::Integer(0)));
    }

    #[test]
    fn test_payload_formatting() {
        let set = MeasurementDecoder::decode(&PRIMARY, &SECONDARY).unwrap();
        assert_eq!(set.get("pv_voltage").unwrap().to_payload(), "10.0");
        assert_eq!(set.get("battery_voltage").unwrap().to_payload(), "12.5");
        assert_eq!(set.get("pv_current").unwrap().to_payload(), "0.5");
        assert_eq!(set.get("battery_capacity").unwrap().to_payload(), "80");
        assert_eq!(Value::Decimal(12.34).to_payload(), "12.34");
    }

    #[test]
    fn test_insufficient_primary_words() {
        let result = MeasurementDecoder::decode(&PRIMARY[..8], &SECONDARY);
        assert_eq!(
            result,
            Err(MeasurementError::InsufficientData {
                block: Block::Primary,
                required: 9,
                actual: 8
            })
        );
    }

    #[test]
    fn test_insufficient_secondary_words() {
        let result = MeasurementDecoder::decode(&PRIMARY, &[]);
        assert!(matches!(
            result,
            Err(MeasurementError::InsufficientData {
                block: Block::Secondary,
                ..
            })
        ));
    }

    #[test]
    fn test_extra_words_are_ignored() {
        let mut primary = PRIMARY.to_vec();
        primary.push(0xFFFF);
        let set = MeasurementDecoder::decode(&primary, &SECONDARY).unwrap();
        assert_eq!(set.len(), FIELDS.len());
    }

    #[test]
    fn test_field_names_are_unique() {
        let mut names: Vec<_> = FIELDS.iter().map(|f| f.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), FIELDS.len());
    }

    #[test]
    fn test_serialize_includes_timestamp_and_fields() {
        let set = MeasurementDecoder::decode(&PRIMARY, &SECONDARY).unwrap();
        let json = serde_json::to_value(&set).unwrap();

        assert!(json.get("timestamp").is_some());
        assert_eq!(json["battery_capacity"], 80);
        assert_eq!(json["battery_voltage"], 12.5);
    }

    #[test]
    fn test_all_zero_detection() {
        assert!(MeasurementDecoder::is_all_zero(&[0; 9], &[0; 5]));
        assert!(!MeasurementDecoder::is_all_zero(&PRIMARY, &SECONDARY));
    }
}
