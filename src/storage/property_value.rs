use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::PropertyValueError;

/// Temporal kinds carried by [`PropertyValue::TemporalData`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TemporalKind {
    Date,
    LocalTime,
    LocalDateTime,
    Duration,
}

/// Point on one of the temporal axes, stored as microseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TemporalData {
    pub kind: TemporalKind,
    pub microseconds: i64,
}

impl TemporalData {
    pub const fn new(kind: TemporalKind, microseconds: i64) -> Self {
        Self { kind, microseconds }
    }
}

/// Leaf datum stored on vertices and edges.
///
/// Equality is deep and unifies the numeric kinds (`2 == 2.0`); ordering is
/// total, sorting disparate kinds by their type tag with `Int` and `Double`
/// sharing a single numeric slot.
#[derive(Clone, Debug, Default)]
pub enum PropertyValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    List(Vec<PropertyValue>),
    Map(BTreeMap<String, PropertyValue>),
    TemporalData(TemporalData),
}

/// Discriminant of a [`PropertyValue`], ordered the way disparate kinds
/// compare.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PropertyValueType {
    Null,
    Bool,
    Int,
    Double,
    String,
    List,
    Map,
    TemporalData,
}

impl fmt::Display for PropertyValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PropertyValueType::Null => "null",
            PropertyValueType::Bool => "bool",
            PropertyValueType::Int => "int",
            PropertyValueType::Double => "double",
            PropertyValueType::String => "string",
            PropertyValueType::List => "list",
            PropertyValueType::Map => "map",
            PropertyValueType::TemporalData => "temporal data",
        };
        write!(f, "{name}")
    }
}

impl PropertyValue {
    pub fn value_type(&self) -> PropertyValueType {
        match self {
            PropertyValue::Null => PropertyValueType::Null,
            PropertyValue::Bool(_) => PropertyValueType::Bool,
            PropertyValue::Int(_) => PropertyValueType::Int,
            PropertyValue::Double(_) => PropertyValueType::Double,
            PropertyValue::String(_) => PropertyValueType::String,
            PropertyValue::List(_) => PropertyValueType::List,
            PropertyValue::Map(_) => PropertyValueType::Map,
            PropertyValue::TemporalData(_) => PropertyValueType::TemporalData,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, PropertyValue::Null)
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, PropertyValue::Bool(_))
    }

    pub fn is_int(&self) -> bool {
        matches!(self, PropertyValue::Int(_))
    }

    pub fn is_double(&self) -> bool {
        matches!(self, PropertyValue::Double(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(self, PropertyValue::String(_))
    }

    pub fn is_list(&self) -> bool {
        matches!(self, PropertyValue::List(_))
    }

    pub fn is_map(&self) -> bool {
        matches!(self, PropertyValue::Map(_))
    }

    pub fn is_temporal_data(&self) -> bool {
        matches!(self, PropertyValue::TemporalData(_))
    }

    pub fn value_bool(&self) -> Result<bool, PropertyValueError> {
        match self {
            PropertyValue::Bool(value) => Ok(*value),
            _ => Err(PropertyValueError::WrongType),
        }
    }

    pub fn value_int(&self) -> Result<i64, PropertyValueError> {
        match self {
            PropertyValue::Int(value) => Ok(*value),
            _ => Err(PropertyValueError::WrongType),
        }
    }

    pub fn value_double(&self) -> Result<f64, PropertyValueError> {
        match self {
            PropertyValue::Double(value) => Ok(*value),
            _ => Err(PropertyValueError::WrongType),
        }
    }

    pub fn value_string(&self) -> Result<&str, PropertyValueError> {
        match self {
            PropertyValue::String(value) => Ok(value),
            _ => Err(PropertyValueError::WrongType),
        }
    }

    pub fn value_list(&self) -> Result<&[PropertyValue], PropertyValueError> {
        match self {
            PropertyValue::List(value) => Ok(value),
            _ => Err(PropertyValueError::WrongType),
        }
    }

    pub fn value_map(&self) -> Result<&BTreeMap<String, PropertyValue>, PropertyValueError> {
        match self {
            PropertyValue::Map(value) => Ok(value),
            _ => Err(PropertyValueError::WrongType),
        }
    }

    pub fn value_temporal_data(&self) -> Result<TemporalData, PropertyValueError> {
        match self {
            PropertyValue::TemporalData(value) => Ok(*value),
            _ => Err(PropertyValueError::WrongType),
        }
    }

    /// Consumes the value, leaving `Null` behind.
    pub fn take(&mut self) -> PropertyValue {
        std::mem::take(self)
    }

    fn type_rank(&self) -> u8 {
        match self {
            PropertyValue::Null => 0,
            PropertyValue::Bool(_) => 1,
            // Int and Double share a slot so cross-numeric comparison works.
            PropertyValue::Int(_) | PropertyValue::Double(_) => 2,
            PropertyValue::String(_) => 3,
            PropertyValue::List(_) => 4,
            PropertyValue::Map(_) => 5,
            PropertyValue::TemporalData(_) => 6,
        }
    }

    /// Total comparison used for both `PartialEq` and `PartialOrd`.
    pub fn total_cmp(&self, other: &PropertyValue) -> Ordering {
        let rank = self.type_rank().cmp(&other.type_rank());
        if rank != Ordering::Equal {
            return rank;
        }
        match (self, other) {
            (PropertyValue::Null, PropertyValue::Null) => Ordering::Equal,
            (PropertyValue::Bool(a), PropertyValue::Bool(b)) => a.cmp(b),
            (PropertyValue::Int(a), PropertyValue::Int(b)) => a.cmp(b),
            (PropertyValue::Int(a), PropertyValue::Double(b)) => (*a as f64).total_cmp(b),
            (PropertyValue::Double(a), PropertyValue::Int(b)) => a.total_cmp(&(*b as f64)),
            (PropertyValue::Double(a), PropertyValue::Double(b)) => a.total_cmp(b),
            (PropertyValue::String(a), PropertyValue::String(b)) => a.cmp(b),
            (PropertyValue::List(a), PropertyValue::List(b)) => {
                for (left, right) in a.iter().zip(b.iter()) {
                    let ordering = left.total_cmp(right);
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                a.len().cmp(&b.len())
            }
            (PropertyValue::Map(a), PropertyValue::Map(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    let key_ordering = ka.cmp(kb);
                    if key_ordering != Ordering::Equal {
                        return key_ordering;
                    }
                    let value_ordering = va.total_cmp(vb);
                    if value_ordering != Ordering::Equal {
                        return value_ordering;
                    }
                }
                a.len().cmp(&b.len())
            }
            (PropertyValue::TemporalData(a), PropertyValue::TemporalData(b)) => a.cmp(b),
            _ => unreachable!("ranks already matched"),
        }
    }
}

impl PartialEq for PropertyValue {
    fn eq(&self, other: &Self) -> bool {
        self.total_cmp(other) == Ordering::Equal
    }
}

impl PartialOrd for PropertyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.total_cmp(other))
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Null => write!(f, "null"),
            PropertyValue::Bool(value) => write!(f, "{value}"),
            PropertyValue::Int(value) => write!(f, "{value}"),
            PropertyValue::Double(value) => write!(f, "{value}"),
            PropertyValue::String(value) => write!(f, "{value}"),
            PropertyValue::List(values) => {
                write!(f, "[")?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{value}")?;
                }
                write!(f, "]")
            }
            PropertyValue::Map(entries) => {
                write!(f, "{{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                write!(f, "}}")
            }
            PropertyValue::TemporalData(data) => {
                write!(f, "{:?}({})", data.kind, data.microseconds)
            }
        }
    }
}
