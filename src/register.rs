use serde::{Serialize, Serializer};

// RegisterValue {{{
/// A register value as reported by the controller.
///
/// The device sends everything as text; values are coerced to the narrowest
/// type that parses. A value containing a decimal point is read as floating
/// point, anything else is tried as an integer, and whatever fails both stays
/// as the raw string.
#[derive(Clone, Debug, PartialEq)]
pub enum RegisterValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl RegisterValue {
    pub fn coerce(raw: &str) -> Self {
        let trimmed = raw.trim();

        if trimmed.contains('.') {
            if let Ok(f) = trimmed.parse::<f64>() {
                return Self::Float(f);
            }
        } else if let Ok(i) = trimmed.parse::<i64>() {
            return Self::Int(i);
        }

        Self::Text(raw.to_string())
    }

    /// Numeric reading of the value. NaN and infinities count as not numeric.
    pub fn as_f64(&self) -> Option<f64> {
        let v = match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Text(s) => s.trim().replace(',', ".").parse().ok(),
        };
        v.filter(|v| v.is_finite())
    }
}

impl std::fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(s) => write!(f, "{}", s),
        }
    }
}

impl Serialize for RegisterValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Int(i) => serializer.serialize_i64(*i),
            Self::Float(f) => serializer.serialize_f64(*f),
            Self::Text(s) => serializer.serialize_str(s),
        }
    }
} // }}}

// Register {{{
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Register {
    pub tag_id: String,
    pub value: RegisterValue,
    pub description: Option<String>,
    pub min_value: Option<RegisterValue>,
    pub max_value: Option<RegisterValue>,
}

impl Register {
    /// Builds a register from raw attribute text. Returns `None` when the tag
    /// id or the value is missing, which drops the element.
    pub fn from_raw(
        tag_id: Option<&str>,
        value: Option<&str>,
        min_value: Option<&str>,
        max_value: Option<&str>,
        description: Option<String>,
    ) -> Option<Self> {
        let tag_id = tag_id.filter(|t| !t.is_empty())?;
        let value = value.filter(|v| !v.trim().is_empty())?;

        Some(Self {
            tag_id: tag_id.to_string(),
            value: RegisterValue::coerce(value),
            description,
            min_value: coerce_optional(min_value),
            max_value: coerce_optional(max_value),
        })
    }
}

fn coerce_optional(raw: Option<&str>) -> Option<RegisterValue> {
    raw.filter(|v| !v.trim().is_empty()).map(RegisterValue::coerce)
} // }}}

// WriteAck {{{
pub const WRITE_STATUS_OK: &str = "ok";

/// Acknowledgement for one written tag.
///
/// `value` is not sent back by the device; the client fills it in from the
/// pair it wrote so that a successful ack can be applied to the cache.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WriteAck {
    pub write_id: String,
    pub tag_id: String,
    pub status: String,
    pub value: Option<String>,
}

impl WriteAck {
    pub fn from_raw(write_id: Option<&str>, tag_id: Option<&str>, status: Option<&str>) -> Option<Self> {
        Some(Self {
            write_id: write_id?.to_string(),
            tag_id: tag_id.filter(|t| !t.is_empty())?.to_string(),
            status: status?.to_string(),
            value: None,
        })
    }

    pub fn is_ok(&self) -> bool {
        self.status == WRITE_STATUS_OK
    }
} // }}}
