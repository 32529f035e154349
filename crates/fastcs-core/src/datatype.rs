//! Attribute datatypes and runtime values.
//!
//! A [`DataType`] describes the closed set of value kinds an attribute can
//! hold, together with the constraints and display metadata for that kind.
//! A [`Value`] is the runtime representation passed between attributes,
//! attribute IOs and transports.
//!
//! # Coercion
//!
//! [`DataType::validate`] accepts a value of the exact kind, plus a few lossless
//! coercions:
//!
//! | Target     | Also accepts                                          |
//! |------------|-------------------------------------------------------|
//! | `Float`    | `Int` (widened)                                       |
//! | `Int`      | `Float` with no fractional part                       |
//! | `Bool`     | `Int` 0 or 1                                          |
//! | `Enum`     | `Int` index, `String` member name or wire value       |
//!
//! # Wire Grammar
//!
//! Text exchanged with line-based devices goes through [`DataType::parse_wire`]
//! and [`DataType::format_wire`]. Surrounding whitespace and line terminators
//! are stripped before parsing.
//!
//! ```text
//! Bool      1 | 0 | true | false | on | off   (case-insensitive)  ->  "1" / "0"
//! Int       [+-]digits                                           ->  decimal
//! Float     f64 literal, finite only                             ->  shortest round-trip
//! String    verbatim                                             ->  verbatim
//! Enum      member wire value or member name                     ->  wire value
//! Waveform  JSON array of numbers                                ->  JSON array
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{FastCsError, Result};

// =============================================================================
// DataKind
// =============================================================================

/// Discriminant of a [`DataType`] / [`Value`], used for matching and hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Bool,
    Int,
    Float,
    String,
    Enum,
    Waveform,
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DataKind::Bool => "bool",
            DataKind::Int => "int",
            DataKind::Float => "float",
            DataKind::String => "string",
            DataKind::Enum => "enum",
            DataKind::Waveform => "waveform",
        };
        write!(f, "{label}")
    }
}

// =============================================================================
// Value
// =============================================================================

/// Runtime value of an attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// Index into the members of the attribute's [`EnumSpec`]
    Enum(usize),
    Waveform(Vec<f64>),
}

impl Value {
    /// Kind of this value.
    pub fn kind(&self) -> DataKind {
        match self {
            Value::Bool(_) => DataKind::Bool,
            Value::Int(_) => DataKind::Int,
            Value::Float(_) => DataKind::Float,
            Value::String(_) => DataKind::String,
            Value::Enum(_) => DataKind::Enum,
            Value::Waveform(_) => DataKind::Waveform,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view of `Int` and `Float` values.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_enum_index(&self) -> Option<usize> {
        match self {
            Value::Enum(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_waveform(&self) -> Option<&[f64]> {
        match self {
            Value::Waveform(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "{v}"),
            Value::Enum(v) => write!(f, "#{v}"),
            Value::Waveform(v) => write!(f, "[{} samples]", v.len()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::Waveform(v)
    }
}

// =============================================================================
// Type Specs
// =============================================================================

/// Limits and display metadata shared by numeric datatypes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NumericSpec<T> {
    /// Engineering units
    #[serde(default)]
    pub units: Option<String>,
    /// Inclusive lower limit
    #[serde(default)]
    pub min: Option<T>,
    /// Inclusive upper limit
    #[serde(default)]
    pub max: Option<T>,
    /// Lower alarm threshold (metadata only, never enforced)
    #[serde(default)]
    pub min_alarm: Option<T>,
    /// Upper alarm threshold (metadata only, never enforced)
    #[serde(default)]
    pub max_alarm: Option<T>,
}

impl<T: PartialOrd + Copy + fmt::Display> NumericSpec<T> {
    fn check_limits(&self, value: T) -> Result<()> {
        if let Some(min) = self.min {
            if value < min {
                return Err(FastCsError::Validation(format!(
                    "value {value} is less than minimum {min}"
                )));
            }
        }
        if let Some(max) = self.max {
            if value > max {
                return Err(FastCsError::Validation(format!(
                    "value {value} is greater than maximum {max}"
                )));
            }
        }
        Ok(())
    }
}

/// Float datatype: numeric limits plus display precision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloatSpec {
    /// Limits and units
    #[serde(flatten)]
    pub limits: NumericSpec<f64>,
    /// Decimal places values are rounded to on validation
    #[serde(default = "default_prec")]
    pub prec: u32,
}

fn default_prec() -> u32 {
    2
}

impl Default for FloatSpec {
    fn default() -> Self {
        Self {
            limits: NumericSpec::default(),
            prec: default_prec(),
        }
    }
}

/// A single member of an enum datatype.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumMember {
    /// Display name
    pub name: String,
    /// Representation sent to and received from the device
    pub wire: String,
}

/// Ordered set of enum members. Values refer to members by index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "EnumSpecDef")]
pub struct EnumSpec {
    members: Vec<EnumMember>,
}

/// Unchecked wire shape of [`EnumSpec`].
#[derive(Deserialize)]
struct EnumSpecDef {
    members: Vec<EnumMember>,
}

impl TryFrom<EnumSpecDef> for EnumSpec {
    type Error = FastCsError;

    fn try_from(def: EnumSpecDef) -> Result<Self> {
        Self::new(def.members.into_iter().map(|m| (m.name, m.wire)))
    }
}

impl EnumSpec {
    /// Build from `(name, wire)` pairs. At least one member is required.
    pub fn new<N, W>(members: impl IntoIterator<Item = (N, W)>) -> Result<Self>
    where
        N: Into<String>,
        W: Into<String>,
    {
        let members: Vec<EnumMember> = members
            .into_iter()
            .map(|(name, wire)| EnumMember {
                name: name.into(),
                wire: wire.into(),
            })
            .collect();
        if members.is_empty() {
            return Err(FastCsError::Configuration(
                "enum datatype needs at least one member".into(),
            ));
        }
        Ok(Self { members })
    }

    /// Build from names only; each member's wire value is its name.
    pub fn from_names<N: Into<String>>(names: impl IntoIterator<Item = N>) -> Result<Self> {
        Self::new(names.into_iter().map(|n| {
            let n: String = n.into();
            (n.clone(), n)
        }))
    }

    /// Members in declaration order.
    pub fn members(&self) -> &[EnumMember] {
        &self.members
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|m| m.name.as_str())
    }

    /// Index of the member whose name or wire value equals `label`.
    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.members
            .iter()
            .position(|m| m.wire == label)
            .or_else(|| self.members.iter().position(|m| m.name == label))
    }

    /// Member at `index`.
    pub fn member(&self, index: usize) -> Option<&EnumMember> {
        self.members.get(index)
    }
}

// =============================================================================
// DataType
// =============================================================================

/// Datatype of an attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataType {
    Bool,
    Int(NumericSpec<i64>),
    Float(FloatSpec),
    String {
        /// Maximum length in characters
        #[serde(default)]
        max_len: Option<usize>,
    },
    Enum(EnumSpec),
    Waveform {
        /// Maximum number of samples
        max_len: usize,
    },
}

impl DataType {
    /// Unconstrained integer.
    pub fn int() -> Self {
        DataType::Int(NumericSpec::default())
    }

    /// Unconstrained float with the default precision.
    pub fn float() -> Self {
        DataType::Float(FloatSpec::default())
    }

    /// Unconstrained float rounded to `prec` decimal places.
    pub fn float_with_prec(prec: u32) -> Self {
        DataType::Float(FloatSpec {
            prec,
            ..FloatSpec::default()
        })
    }

    /// Unbounded string.
    pub fn string() -> Self {
        DataType::String { max_len: None }
    }

    /// Kind of value this datatype holds.
    pub fn kind(&self) -> DataKind {
        match self {
            DataType::Bool => DataKind::Bool,
            DataType::Int(_) => DataKind::Int,
            DataType::Float(_) => DataKind::Float,
            DataType::String { .. } => DataKind::String,
            DataType::Enum(_) => DataKind::Enum,
            DataType::Waveform { .. } => DataKind::Waveform,
        }
    }

    /// Value an attribute holds before its first update.
    pub fn initial_value(&self) -> Value {
        match self {
            DataType::Bool => Value::Bool(false),
            DataType::Int(_) => Value::Int(0),
            DataType::Float(_) => Value::Float(0.0),
            DataType::String { .. } => Value::String(String::new()),
            DataType::Enum(_) => Value::Enum(0),
            DataType::Waveform { max_len } => Value::Waveform(vec![0.0; *max_len]),
        }
    }

    /// Coerce and check a value against this datatype.
    pub fn validate(&self, value: Value) -> Result<Value> {
        match (self, value) {
            (DataType::Bool, Value::Bool(v)) => Ok(Value::Bool(v)),
            (DataType::Bool, Value::Int(v @ (0 | 1))) => Ok(Value::Bool(v == 1)),

            (DataType::Int(spec), Value::Int(v)) => {
                spec.check_limits(v)?;
                Ok(Value::Int(v))
            }
            (DataType::Int(spec), Value::Float(v))
                if v.is_finite() && v.fract() == 0.0 && v.abs() < i64::MAX as f64 =>
            {
                let v = v as i64;
                spec.check_limits(v)?;
                Ok(Value::Int(v))
            }

            (DataType::Float(spec), Value::Float(v)) => validate_float(spec, v),
            (DataType::Float(spec), Value::Int(v)) => validate_float(spec, v as f64),

            (DataType::String { max_len }, Value::String(v)) => {
                if let Some(max_len) = max_len {
                    let len = v.chars().count();
                    if len > *max_len {
                        return Err(FastCsError::Validation(format!(
                            "string of length {len} exceeds maximum length {max_len}"
                        )));
                    }
                }
                Ok(Value::String(v))
            }

            (DataType::Enum(spec), Value::Enum(index)) => enum_index(spec, index),
            (DataType::Enum(spec), Value::Int(index)) => match usize::try_from(index) {
                Ok(index) => enum_index(spec, index),
                Err(_) => Err(FastCsError::Validation(format!(
                    "enum index {index} is negative"
                ))),
            },
            (DataType::Enum(spec), Value::String(label)) => spec
                .index_of(&label)
                .map(Value::Enum)
                .ok_or_else(|| {
                    FastCsError::Validation(format!("'{label}' is not a member of the enum"))
                }),

            (DataType::Waveform { max_len }, Value::Waveform(samples)) => {
                if samples.len() > *max_len {
                    return Err(FastCsError::Validation(format!(
                        "waveform of {} samples exceeds maximum length {max_len}",
                        samples.len()
                    )));
                }
                if let Some(index) = samples.iter().position(|s| !s.is_finite()) {
                    return Err(FastCsError::Validation(format!(
                        "waveform sample {index} ({}) is not finite",
                        samples[index]
                    )));
                }
                Ok(Value::Waveform(samples))
            }

            (dtype, value) => Err(FastCsError::Validation(format!(
                "cannot convert {} value {value} to {}",
                value.kind(),
                dtype.kind()
            ))),
        }
    }

    /// Parse device text into a validated value.
    ///
    /// Both unparseable text and values the datatype rejects are reported as
    /// [`FastCsError::DeviceCommunication`], since the device produced them.
    pub fn parse_wire(&self, text: &str) -> Result<Value> {
        let trimmed = text.trim();
        let parsed = match self {
            DataType::Bool => match trimmed.to_ascii_lowercase().as_str() {
                "1" | "true" | "on" => Value::Bool(true),
                "0" | "false" | "off" => Value::Bool(false),
                _ => return Err(FastCsError::malformed(text, DataKind::Bool)),
            },
            DataType::Int(_) => trimmed
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| FastCsError::malformed(text, DataKind::Int))?,
            DataType::Float(_) => match trimmed.parse::<f64>() {
                Ok(v) if v.is_finite() => Value::Float(v),
                _ => return Err(FastCsError::malformed(text, DataKind::Float)),
            },
            DataType::String { .. } => {
                Value::String(text.trim_end_matches(['\r', '\n']).to_string())
            }
            DataType::Enum(spec) => spec
                .index_of(trimmed)
                .map(Value::Enum)
                .ok_or_else(|| FastCsError::malformed(text, DataKind::Enum))?,
            DataType::Waveform { .. } => serde_json::from_str::<Vec<f64>>(trimmed)
                .map(Value::Waveform)
                .map_err(|_| FastCsError::malformed(text, "JSON array of numbers"))?,
        };

        self.validate(parsed).map_err(|e| match e {
            FastCsError::Validation(msg) => {
                FastCsError::DeviceCommunication(format!("device value rejected: {msg}"))
            }
            other => other,
        })
    }

    /// Render a value as device text.
    pub fn format_wire(&self, value: &Value) -> Result<String> {
        let value = self.validate(value.clone())?;
        let text = match (self, value) {
            (_, Value::Bool(v)) => if v { "1" } else { "0" }.to_string(),
            (_, Value::Int(v)) => v.to_string(),
            (_, Value::Float(v)) => v.to_string(),
            (_, Value::String(v)) => v,
            (DataType::Enum(spec), Value::Enum(index)) => spec
                .member(index)
                .map(|m| m.wire.clone())
                .ok_or_else(|| FastCsError::Validation(format!("enum index {index} out of range")))?,
            (_, Value::Enum(index)) => index.to_string(),
            (_, Value::Waveform(samples)) => serde_json::to_string(&samples)
                .map_err(|e| FastCsError::Validation(e.to_string()))?,
        };
        Ok(text)
    }

    /// Units of numeric datatypes.
    pub fn units(&self) -> Option<&str> {
        match self {
            DataType::Int(spec) => spec.units.as_deref(),
            DataType::Float(spec) => spec.limits.units.as_deref(),
            _ => None,
        }
    }
}

fn validate_float(spec: &FloatSpec, value: f64) -> Result<Value> {
    if !value.is_finite() {
        return Err(FastCsError::Validation(format!(
            "float value {value} is not finite"
        )));
    }
    spec.limits.check_limits(value)?;
    Ok(Value::Float(round_to(value, spec.prec)))
}

fn round_to(value: f64, prec: u32) -> f64 {
    // Beyond 15 decimal places f64 has nothing left to round.
    if prec >= 15 {
        return value;
    }
    let factor = 10f64.powi(prec as i32);
    let scaled = value * factor;
    // Too large to carry a fractional part.
    if !scaled.is_finite() {
        return value;
    }
    scaled.round() / factor
}

fn enum_index(spec: &EnumSpec, index: usize) -> Result<Value> {
    if index < spec.members().len() {
        Ok(Value::Enum(index))
    } else {
        Err(FastCsError::Validation(format!(
            "enum index {index} out of range for {} members",
            spec.members().len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn on_off() -> DataType {
        DataType::Enum(EnumSpec::new([("Off", "0"), ("On", "1")]).unwrap())
    }

    #[test]
    fn initial_values() {
        assert_eq!(DataType::Bool.initial_value(), Value::Bool(false));
        assert_eq!(DataType::int().initial_value(), Value::Int(0));
        assert_eq!(DataType::float().initial_value(), Value::Float(0.0));
        assert_eq!(DataType::string().initial_value(), Value::String(String::new()));
        assert_eq!(on_off().initial_value(), Value::Enum(0));
        assert_eq!(
            DataType::Waveform { max_len: 3 }.initial_value(),
            Value::Waveform(vec![0.0; 3])
        );
    }

    #[test]
    fn float_parses_device_text_and_rounds() {
        let dtype = DataType::float();
        assert_eq!(dtype.parse_wire("23.50\r\n").unwrap(), Value::Float(23.5));
        assert_eq!(dtype.parse_wire("1.23456").unwrap(), Value::Float(1.23));

        let precise = DataType::float_with_prec(3);
        assert_eq!(precise.parse_wire("1.23456").unwrap(), Value::Float(1.235));
    }

    #[test]
    fn malformed_text_is_device_error() {
        let err = DataType::float().parse_wire("twenty\r\n").unwrap_err();
        assert!(matches!(err, FastCsError::DeviceCommunication(_)));

        let err = DataType::float().parse_wire("NaN").unwrap_err();
        assert!(matches!(err, FastCsError::DeviceCommunication(_)));

        let err = DataType::int().parse_wire("1.5").unwrap_err();
        assert!(matches!(err, FastCsError::DeviceCommunication(_)));
    }

    #[test]
    fn out_of_range_device_value_is_device_error() {
        let dtype = DataType::Int(NumericSpec {
            max: Some(10),
            ..Default::default()
        });
        let err = dtype.parse_wire("11").unwrap_err();
        assert!(matches!(err, FastCsError::DeviceCommunication(_)));
    }

    #[test]
    fn numeric_limits_are_enforced() {
        let dtype = DataType::Float(FloatSpec {
            limits: NumericSpec {
                min: Some(0.0),
                max: Some(100.0),
                ..Default::default()
            },
            prec: 2,
        });
        assert!(dtype.validate(Value::Float(50.0)).is_ok());
        assert!(matches!(
            dtype.validate(Value::Float(-1.0)),
            Err(FastCsError::Validation(_))
        ));
        assert!(matches!(
            dtype.validate(Value::Float(100.5)),
            Err(FastCsError::Validation(_))
        ));
    }

    #[test]
    fn coercions() {
        assert_eq!(DataType::float().validate(Value::Int(3)).unwrap(), Value::Float(3.0));
        assert_eq!(DataType::int().validate(Value::Float(4.0)).unwrap(), Value::Int(4));
        assert!(DataType::int().validate(Value::Float(4.5)).is_err());
        assert_eq!(DataType::Bool.validate(Value::Int(1)).unwrap(), Value::Bool(true));
        assert!(DataType::Bool.validate(Value::Int(2)).is_err());
        assert!(DataType::string().validate(Value::Int(2)).is_err());
    }

    #[test]
    fn bool_grammar() {
        for text in ["1", "true", "ON", "True\r\n"] {
            assert_eq!(DataType::Bool.parse_wire(text).unwrap(), Value::Bool(true));
        }
        for text in ["0", "false", "off"] {
            assert_eq!(DataType::Bool.parse_wire(text).unwrap(), Value::Bool(false));
        }
        assert!(DataType::Bool.parse_wire("yes").is_err());
        assert_eq!(DataType::Bool.format_wire(&Value::Bool(true)).unwrap(), "1");
    }

    #[test]
    fn enum_by_wire_value_or_name() {
        let dtype = on_off();
        assert_eq!(dtype.parse_wire("1\r\n").unwrap(), Value::Enum(1));
        assert_eq!(dtype.parse_wire("Off").unwrap(), Value::Enum(0));
        assert_eq!(dtype.validate(Value::from("On")).unwrap(), Value::Enum(1));
        assert_eq!(dtype.format_wire(&Value::Enum(1)).unwrap(), "1");
        assert!(dtype.validate(Value::Enum(2)).is_err());
        assert!(dtype.parse_wire("2").is_err());
    }

    #[test]
    fn enum_requires_members() {
        let empty: [(&str, &str); 0] = [];
        assert!(matches!(
            EnumSpec::new(empty),
            Err(FastCsError::Configuration(_))
        ));
    }

    #[test]
    fn deserialized_enum_requires_members() {
        assert!(serde_json::from_str::<EnumSpec>(r#"{"members":[]}"#).is_err());
        let err = serde_json::from_value::<DataType>(serde_json::json!({
            "kind": "enum",
            "members": []
        }))
        .unwrap_err();
        assert!(err.to_string().contains("at least one member"), "{err}");

        let json = serde_json::to_value(on_off()).unwrap();
        assert_eq!(serde_json::from_value::<DataType>(json).unwrap(), on_off());
    }

    #[test]
    fn huge_floats_stay_finite() {
        for value in [1e307, -1e307, f64::MAX] {
            assert_eq!(
                DataType::float().validate(Value::Float(value)).unwrap(),
                Value::Float(value)
            );
        }
        assert_eq!(
            DataType::float_with_prec(14).validate(Value::Float(1e300)).unwrap(),
            Value::Float(1e300)
        );
    }

    #[test]
    fn string_length_limit() {
        let dtype = DataType::String { max_len: Some(3) };
        assert!(dtype.validate(Value::from("abc")).is_ok());
        assert!(dtype.validate(Value::from("abcd")).is_err());
        assert_eq!(
            DataType::string().parse_wire("  padded text\r\n").unwrap(),
            Value::from("  padded text")
        );
    }

    #[test]
    fn waveform_json_grammar() {
        let dtype = DataType::Waveform { max_len: 4 };
        assert_eq!(
            dtype.parse_wire("[1.5, 2, 3.25]\r\n").unwrap(),
            Value::Waveform(vec![1.5, 2.0, 3.25])
        );
        assert!(dtype.parse_wire("[1, 2, 3, 4, 5]").is_err());
        assert!(dtype.parse_wire("1,2,3").is_err());
        for bad in [f64::NAN, f64::INFINITY] {
            assert!(matches!(
                dtype.validate(Value::Waveform(vec![1.0, bad])),
                Err(FastCsError::Validation(_))
            ));
        }
        assert_eq!(
            dtype.format_wire(&Value::Waveform(vec![1.0, 0.5])).unwrap(),
            "[1.0,0.5]"
        );
    }

    #[test]
    fn format_float_shortest() {
        assert_eq!(DataType::float().format_wire(&Value::Float(1.5)).unwrap(), "1.5");
        assert_eq!(DataType::float().format_wire(&Value::Int(2)).unwrap(), "2");
        assert!(DataType::int().format_wire(&Value::from("x")).is_err());
    }

    #[test]
    fn datatype_serializes_with_kind_tag() {
        let json = serde_json::to_value(DataType::int()).unwrap();
        assert_eq!(json["kind"], "int");
        let back: DataType = serde_json::from_value(json).unwrap();
        assert_eq!(back, DataType::int());
    }
}
