//! Process variable values and metadata.
//!
//! A [`PvValue`] is a typed array (element count >= 1) of one of the six
//! classic PV element types. Backends deliver values in the type the engine
//! requests; [`PvValue::convert`] covers the numeric/string conversions.

use crate::consts::MAX_STRING_SIZE;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::time::SystemTime;

/// Fixed-capacity string element.
pub type PvString = heapless::String<MAX_STRING_SIZE>;

/// Build a [`PvString`], truncating at capacity on a character boundary.
pub fn pv_string(s: &str) -> PvString {
    let mut out = PvString::new();
    for c in s.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

/// Element type of a process variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PvType {
    /// 8-bit signed integer.
    Char,
    /// 16-bit signed integer.
    Short,
    /// 32-bit signed integer.
    Long,
    /// 32-bit float.
    Float,
    /// 64-bit float.
    Double,
    /// Fixed-size string.
    String,
}

impl PvType {
    /// Size of one element in bytes.
    pub const fn element_size(&self) -> usize {
        match self {
            PvType::Char => 1,
            PvType::Short => 2,
            PvType::Long | PvType::Float => 4,
            PvType::Double => 8,
            PvType::String => MAX_STRING_SIZE,
        }
    }

    /// Type name as shown in reports.
    pub const fn as_str(&self) -> &'static str {
        match self {
            PvType::Char => "char",
            PvType::Short => "short",
            PvType::Long => "long",
            PvType::Float => "float",
            PvType::Double => "double",
            PvType::String => "string",
        }
    }
}

impl fmt::Display for PvType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed array value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum PvValue {
    Char(Vec<i8>),
    Short(Vec<i16>),
    Long(Vec<i32>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    String(Vec<PvString>),
}

impl PvValue {
    /// Zero-initialized value of `count` elements (at least one).
    pub fn zeroed(ty: PvType, count: usize) -> Self {
        let n = count.max(1);
        match ty {
            PvType::Char => PvValue::Char(vec![0; n]),
            PvType::Short => PvValue::Short(vec![0; n]),
            PvType::Long => PvValue::Long(vec![0; n]),
            PvType::Float => PvValue::Float(vec![0.0; n]),
            PvType::Double => PvValue::Double(vec![0.0; n]),
            PvType::String => PvValue::String(vec![PvString::new(); n]),
        }
    }

    /// Value of type `ty` built from numbers; numeric targets saturate.
    pub fn from_f64s(ty: PvType, values: &[f64]) -> Self {
        let src: &[f64] = if values.is_empty() { &[0.0] } else { values };
        match ty {
            PvType::Char => PvValue::Char(src.iter().map(|v| *v as i8).collect()),
            PvType::Short => PvValue::Short(src.iter().map(|v| *v as i16).collect()),
            PvType::Long => PvValue::Long(src.iter().map(|v| *v as i32).collect()),
            PvType::Float => PvValue::Float(src.iter().map(|v| *v as f32).collect()),
            PvType::Double => PvValue::Double(src.to_vec()),
            PvType::String => PvValue::String(
                src.iter().map(|v| pv_string(&v.to_string())).collect(),
            ),
        }
    }

    /// Single-element double.
    pub fn double(value: f64) -> Self {
        PvValue::Double(vec![value])
    }

    /// Single-element string.
    pub fn string(value: &str) -> Self {
        PvValue::String(vec![pv_string(value)])
    }

    /// Element type.
    pub fn pv_type(&self) -> PvType {
        match self {
            PvValue::Char(_) => PvType::Char,
            PvValue::Short(_) => PvType::Short,
            PvValue::Long(_) => PvType::Long,
            PvValue::Float(_) => PvType::Float,
            PvValue::Double(_) => PvType::Double,
            PvValue::String(_) => PvType::String,
        }
    }

    /// Element count.
    pub fn len(&self) -> usize {
        match self {
            PvValue::Char(v) => v.len(),
            PvValue::Short(v) => v.len(),
            PvValue::Long(v) => v.len(),
            PvValue::Float(v) => v.len(),
            PvValue::Double(v) => v.len(),
            PvValue::String(v) => v.len(),
        }
    }

    /// True if the value holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element `index` as a number. Strings that don't parse read as 0.0.
    pub fn get_f64(&self, index: usize) -> Option<f64> {
        match self {
            PvValue::Char(v) => v.get(index).map(|x| f64::from(*x)),
            PvValue::Short(v) => v.get(index).map(|x| f64::from(*x)),
            PvValue::Long(v) => v.get(index).map(|x| f64::from(*x)),
            PvValue::Float(v) => v.get(index).map(|x| f64::from(*x)),
            PvValue::Double(v) => v.get(index).copied(),
            PvValue::String(v) => v
                .get(index)
                .map(|s| s.trim().parse::<f64>().unwrap_or(0.0)),
        }
    }

    /// First element as a number (0.0 for an empty value).
    pub fn as_f64(&self) -> f64 {
        self.get_f64(0).unwrap_or(0.0)
    }

    /// Element `index` as text.
    pub fn get_string(&self, index: usize) -> Option<String> {
        match self {
            PvValue::String(v) => v.get(index).map(|s| s.as_str().to_string()),
            _ => self.get_f64(index).map(|x| x.to_string()),
        }
    }

    /// Overwrite element `index` with a number, converted to the element type.
    /// Returns false if `index` is out of range.
    pub fn set_f64(&mut self, index: usize, value: f64) -> bool {
        match self {
            PvValue::Char(v) => v.get_mut(index).map(|x| *x = value as i8).is_some(),
            PvValue::Short(v) => v.get_mut(index).map(|x| *x = value as i16).is_some(),
            PvValue::Long(v) => v.get_mut(index).map(|x| *x = value as i32).is_some(),
            PvValue::Float(v) => v.get_mut(index).map(|x| *x = value as f32).is_some(),
            PvValue::Double(v) => v.get_mut(index).map(|x| *x = value).is_some(),
            PvValue::String(v) => v
                .get_mut(index)
                .map(|x| *x = pv_string(&value.to_string()))
                .is_some(),
        }
    }

    fn to_f64_vec(&self) -> Vec<f64> {
        (0..self.len()).filter_map(|i| self.get_f64(i)).collect()
    }

    /// Same elements converted to type `ty`.
    pub fn convert(&self, ty: PvType) -> PvValue {
        if ty == self.pv_type() {
            return self.clone();
        }
        match (self, ty) {
            (_, PvType::String) => PvValue::String(
                (0..self.len())
                    .filter_map(|i| self.get_string(i))
                    .map(|s| pv_string(&s))
                    .collect(),
            ),
            _ => PvValue::from_f64s(ty, &self.to_f64_vec()),
        }
    }

    /// The first `count` elements (at least one is kept).
    pub fn truncated(&self, count: usize) -> PvValue {
        let n = count.clamp(1, self.len().max(1));
        match self {
            PvValue::Char(v) => PvValue::Char(v[..n.min(v.len())].to_vec()),
            PvValue::Short(v) => PvValue::Short(v[..n.min(v.len())].to_vec()),
            PvValue::Long(v) => PvValue::Long(v[..n.min(v.len())].to_vec()),
            PvValue::Float(v) => PvValue::Float(v[..n.min(v.len())].to_vec()),
            PvValue::Double(v) => PvValue::Double(v[..n.min(v.len())].to_vec()),
            PvValue::String(v) => PvValue::String(v[..n.min(v.len())].to_vec()),
        }
    }

    /// Copy the first `count` elements of `src` into `self`, converting the
    /// element type if needed. Elements beyond `count` keep their value.
    pub fn copy_prefix_from(&mut self, src: &PvValue, count: usize) {
        let src: Cow<'_, PvValue> = if src.pv_type() == self.pv_type() {
            Cow::Borrowed(src)
        } else {
            Cow::Owned(src.convert(self.pv_type()))
        };
        let n = count.min(self.len()).min(src.len());
        match (self, src.as_ref()) {
            (PvValue::Char(d), PvValue::Char(s)) => d[..n].copy_from_slice(&s[..n]),
            (PvValue::Short(d), PvValue::Short(s)) => d[..n].copy_from_slice(&s[..n]),
            (PvValue::Long(d), PvValue::Long(s)) => d[..n].copy_from_slice(&s[..n]),
            (PvValue::Float(d), PvValue::Float(s)) => d[..n].copy_from_slice(&s[..n]),
            (PvValue::Double(d), PvValue::Double(s)) => d[..n].copy_from_slice(&s[..n]),
            (PvValue::String(d), PvValue::String(s)) => d[..n].clone_from_slice(&s[..n]),
            // convert() always yields the destination type
            _ => {}
        }
    }
}

impl fmt::Display for PvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.len() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match self {
                PvValue::String(v) => write!(f, "\"{}\"", v[i])?,
                _ => write!(f, "{}", self.get_f64(i).unwrap_or(0.0))?,
            }
        }
        Ok(())
    }
}

/// Request status / alarm condition of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PvStatus {
    /// No error.
    #[default]
    Ok,
    /// Generic failure.
    Error,
    /// Channel not connected.
    Disconnected,
    /// Completion did not arrive in time.
    Timeout,
    /// Alarm: read failure.
    Read,
    /// Alarm: write failure.
    Write,
    /// Alarm: above high-high limit.
    HiHi,
    /// Alarm: above high limit.
    High,
    /// Alarm: below low-low limit.
    LoLo,
    /// Alarm: below low limit.
    Low,
    /// Alarm: state alarm.
    State,
    /// Alarm: communication failure.
    Comm,
    /// Alarm: undefined value.
    Udf,
}

impl PvStatus {
    /// True for [`PvStatus::Ok`].
    pub fn is_ok(&self) -> bool {
        *self == PvStatus::Ok
    }
}

impl fmt::Display for PvStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PvStatus::Ok => "OK",
            PvStatus::Error => "ERROR",
            PvStatus::Disconnected => "DISCONN",
            PvStatus::Timeout => "TIMEOUT",
            PvStatus::Read => "READ",
            PvStatus::Write => "WRITE",
            PvStatus::HiHi => "HIHI",
            PvStatus::High => "HIGH",
            PvStatus::LoLo => "LOLO",
            PvStatus::Low => "LOW",
            PvStatus::State => "STATE",
            PvStatus::Comm => "COMM",
            PvStatus::Udf => "UDF",
        };
        f.write_str(s)
    }
}

/// Alarm severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PvSeverity {
    /// No alarm.
    #[default]
    None,
    Minor,
    Major,
    Invalid,
}

impl fmt::Display for PvSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PvSeverity::None => "NONE",
            PvSeverity::Minor => "MINOR",
            PvSeverity::Major => "MAJOR",
            PvSeverity::Invalid => "INVALID",
        };
        f.write_str(s)
    }
}

/// Metadata accompanying a channel value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PvMeta {
    /// Source time stamp of the value.
    pub timestamp: SystemTime,
    /// Request status or alarm condition.
    pub status: PvStatus,
    /// Alarm severity.
    pub severity: PvSeverity,
    /// Error text; present only when severity is not `None` or a request failed.
    pub message: Option<String>,
}

impl Default for PvMeta {
    fn default() -> Self {
        Self {
            timestamp: SystemTime::UNIX_EPOCH,
            status: PvStatus::Ok,
            severity: PvSeverity::None,
            message: None,
        }
    }
}

impl PvMeta {
    /// Record a request failure, keeping the time stamp.
    pub fn set_failure(&mut self, status: PvStatus, severity: PvSeverity, message: &str) {
        self.status = status;
        self.severity = severity;
        self.message = Some(message.to_string());
    }
}
