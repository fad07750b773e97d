//! CA DBR types: the payloads of channel reads.
//!
//! CA defines thirty-five [DBR] kinds, made of seven basic array types and five
//! categories of attached metadata. A [`DbrType`] pairs the two and maps to the
//! `u16` the protocol carries (`category * 7 + basic`).
//!
//! Values are held in [`DbrValue`], one variant per basic type. All numeric types in
//! CA are signed:
//! - [`DbrValue::Char`] ([`Vec<i8>`])
//! - [`DbrValue::Int`] ([`Vec<i16>`]), which CA also calls `SHORT`
//! - [`DbrValue::Long`] ([`Vec<i32>`])
//! - [`DbrValue::Float`] ([`Vec<f32>`])
//! - [`DbrValue::Double`] ([`Vec<f64>`])
//! - [`DbrValue::Enum`] ([`u16`]), an index into the record's state strings
//! - [`DbrValue::String`], fixed 40-byte strings on the wire
//!
//! Only the `Basic`, `Status` and `Time` categories can be decoded into a [`Dbr`];
//! the frontend reads `Time`.
//!
//! [DBR]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types

use std::{
    io::{self, Cursor},
    num::NonZeroUsize,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use nom::{
    IResult, Parser,
    multi::count,
    number::complete::{be_f32, be_f64, be_i8, be_i16, be_i32, be_u16, be_u32},
};
use num::NumCast;

use crate::messages::ErrorCondition;

/// Seconds between the Unix epoch and the EPICS epoch (1990-01-01)
const EPICS_EPOCH_OFFSET: u64 = 631152000;
/// Fixed on-wire length of a DBR_STRING element
const MAX_STRING_SIZE: usize = 40;

#[derive(Clone, Debug, PartialEq)]
pub enum DbrValue {
    Enum(u16),
    String(Vec<String>),
    Char(Vec<i8>),
    Int(Vec<i16>),
    Long(Vec<i32>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}

fn cast_each<T: Copy + NumCast, U: NumCast>(values: &[T]) -> Result<Vec<U>, ErrorCondition> {
    values
        .iter()
        .map(|&v| <U as NumCast>::from(v).ok_or(ErrorCondition::NoConvert))
        .collect()
}

fn stringify<T: ToString>(values: &[T]) -> Vec<String> {
    values.iter().map(T::to_string).collect()
}

fn encode_be<T: Copy, const N: usize>(values: &[T], elements: usize, to_be: fn(T) -> [u8; N]) -> Vec<u8> {
    values.iter().take(elements).flat_map(|&v| to_be(v)).collect()
}

/// Nul-padded, truncated at a character boundary so a terminator always fits
fn fixed_length_string(value: &str) -> [u8; MAX_STRING_SIZE] {
    let mut end = value.len().min(MAX_STRING_SIZE - 1);
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = [0u8; MAX_STRING_SIZE];
    out[..end].copy_from_slice(&value.as_bytes()[..end]);
    out
}

impl DbrValue {
    pub fn get_count(&self) -> usize {
        match self {
            DbrValue::Enum(_) => 1,
            DbrValue::String(v) => v.len(),
            DbrValue::Char(v) => v.len(),
            DbrValue::Int(v) => v.len(),
            DbrValue::Long(v) => v.len(),
            DbrValue::Float(v) => v.len(),
            DbrValue::Double(v) => v.len(),
        }
    }

    pub fn get_type(&self) -> DbrBasicType {
        match self {
            DbrValue::Enum(_) => DbrBasicType::Enum,
            DbrValue::String(_) => DbrBasicType::String,
            DbrValue::Char(_) => DbrBasicType::Char,
            DbrValue::Int(_) => DbrBasicType::Int,
            DbrValue::Long(_) => DbrBasicType::Long,
            DbrValue::Float(_) => DbrBasicType::Float,
            DbrValue::Double(_) => DbrBasicType::Double,
        }
    }

    /// Every element as a number of type `U`
    ///
    /// Values that do not fit fail with [`ErrorCondition::NoConvert`], except that
    /// doubles narrowed to floats saturate to infinity. Strings are parsed, as
    /// epics-base does for e.g. `caget -d FLOAT`.
    fn cast_numbers<U: NumCast>(&self) -> Result<Vec<U>, ErrorCondition> {
        match self {
            DbrValue::Enum(index) => cast_each(&[*index]),
            DbrValue::Char(v) => cast_each(v),
            DbrValue::Int(v) => cast_each(v),
            DbrValue::Long(v) => cast_each(v),
            DbrValue::Float(v) => cast_each(v),
            DbrValue::Double(v) => cast_each(v),
            DbrValue::String(v) => v
                .iter()
                .map(|s| {
                    s.trim()
                        .parse::<f64>()
                        .ok()
                        .and_then(<U as NumCast>::from)
                        .ok_or(ErrorCondition::NoConvert)
                })
                .collect(),
        }
    }

    fn to_strings(&self) -> Result<Vec<String>, ErrorCondition> {
        Ok(match self {
            DbrValue::String(v) => v.clone(),
            // A CHAR array holds one nul-terminated string
            DbrValue::Char(v) => vec![
                String::from_utf8(v.iter().take_while(|&&c| c != 0).map(|&c| c as u8).collect())
                    .map_err(|_| ErrorCondition::NoConvert)?,
            ],
            DbrValue::Enum(index) => vec![index.to_string()],
            DbrValue::Int(v) => stringify(v),
            DbrValue::Long(v) => stringify(v),
            DbrValue::Float(v) => stringify(v),
            DbrValue::Double(v) => stringify(v),
        })
    }

    /// Convert to a different basic type. Nothing converts to `ENUM`.
    pub fn convert_to(&self, basic_type: DbrBasicType) -> Result<DbrValue, ErrorCondition> {
        if basic_type == self.get_type() {
            return Ok(self.clone());
        }
        Ok(match basic_type {
            DbrBasicType::Char => DbrValue::Char(self.cast_numbers()?),
            DbrBasicType::Int => DbrValue::Int(self.cast_numbers()?),
            DbrBasicType::Long => DbrValue::Long(self.cast_numbers()?),
            DbrBasicType::Float => DbrValue::Float(self.cast_numbers()?),
            DbrBasicType::Double => DbrValue::Double(self.cast_numbers()?),
            DbrBasicType::String => DbrValue::String(self.to_strings()?),
            DbrBasicType::Enum => return Err(ErrorCondition::NoConvert),
        })
    }

    /// Big-endian encoding of up to `max_elems` elements (all if `None`)
    ///
    /// Returns the number of elements encoded along with the bytes.
    pub fn to_bytes(&self, max_elems: Option<NonZeroUsize>) -> (usize, Vec<u8>) {
        let elements = max_elems.map_or(self.get_count(), |max| {
            max.get().min(self.get_count())
        });
        let data = match self {
            DbrValue::Enum(index) => index.to_be_bytes().to_vec(),
            DbrValue::String(v) => v
                .iter()
                .take(elements)
                .flat_map(|s| fixed_length_string(s))
                .collect(),
            DbrValue::Char(v) => encode_be(v, elements, i8::to_be_bytes),
            DbrValue::Int(v) => encode_be(v, elements, i16::to_be_bytes),
            DbrValue::Long(v) => encode_be(v, elements, i32::to_be_bytes),
            DbrValue::Float(v) => encode_be(v, elements, f32::to_be_bytes),
            DbrValue::Double(v) => encode_be(v, elements, f64::to_be_bytes),
        };
        (elements, data)
    }

    /// Read `elements` values of a basic type from the front of `data`
    pub fn decode(
        basic_type: DbrBasicType,
        elements: usize,
        data: &[u8],
    ) -> Result<DbrValue, DbrError> {
        Ok(match basic_type {
            DbrBasicType::Enum => DbrValue::Enum(parse_value(be_u16, data)?),
            DbrBasicType::Char => DbrValue::Char(parse_value(count(be_i8, elements), data)?),
            DbrBasicType::Int => DbrValue::Int(parse_value(count(be_i16, elements), data)?),
            DbrBasicType::Long => DbrValue::Long(parse_value(count(be_i32, elements), data)?),
            DbrBasicType::Float => DbrValue::Float(parse_value(count(be_f32, elements), data)?),
            DbrBasicType::Double => {
                DbrValue::Double(parse_value(count(be_f64, elements), data)?)
            }
            DbrBasicType::String => {
                let raw = data
                    .get(..elements * MAX_STRING_SIZE)
                    .ok_or(DbrError::Malformed)?;
                DbrValue::String(
                    raw.chunks(MAX_STRING_SIZE)
                        .map(|chunk| {
                            let end = chunk.iter().position(|&c| c == 0).unwrap_or(chunk.len());
                            String::from_utf8_lossy(&chunk[..end]).into_owned()
                        })
                        .collect(),
                )
            }
        })
    }
}

/// `From<Vec<T>>`, `From<T>`, and converting `TryFrom<&DbrValue>` for one variant
macro_rules! dbr_value_conversions {
    ($($variant:ident => $typ:ty),* $(,)?) => {$(
        impl From<Vec<$typ>> for DbrValue {
            fn from(value: Vec<$typ>) -> Self {
                DbrValue::$variant(value)
            }
        }
        impl From<$typ> for DbrValue {
            fn from(value: $typ) -> Self {
                DbrValue::$variant(vec![value])
            }
        }
        impl TryFrom<&DbrValue> for Vec<$typ> {
            type Error = ErrorCondition;
            fn try_from(value: &DbrValue) -> Result<Self, Self::Error> {
                match value.convert_to(DbrBasicType::$variant)? {
                    DbrValue::$variant(v) => Ok(v),
                    _ => Err(ErrorCondition::NoConvert),
                }
            }
        }
        /// The first element, converted
        impl TryFrom<&DbrValue> for $typ {
            type Error = ErrorCondition;
            fn try_from(value: &DbrValue) -> Result<Self, Self::Error> {
                Vec::<$typ>::try_from(value)?
                    .into_iter()
                    .next()
                    .ok_or(ErrorCondition::BadCount)
            }
        }
    )*};
}
dbr_value_conversions!(
    Char => i8,
    Int => i16,
    Long => i32,
    Float => f32,
    Double => f64,
    String => String,
);

/// Basic DBR data types, independent of category
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DbrBasicType {
    String = 0,
    Int = 1,
    Float = 2,
    Enum = 3,
    Char = 4,
    Long = 5,
    Double = 6,
}

impl TryFrom<u16> for DbrBasicType {
    type Error = ();
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::String,
            1 => Self::Int,
            2 => Self::Float,
            3 => Self::Enum,
            4 => Self::Char,
            5 => Self::Long,
            6 => Self::Double,
            _ => return Err(()),
        })
    }
}

/// Metadata carried alongside the value
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DbrCategory {
    Basic = 0,
    Status = 1,
    Time = 2,
    Graphics = 3,
    Control = 4,
}

impl TryFrom<u16> for DbrCategory {
    type Error = ();
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Basic,
            1 => Self::Status,
            2 => Self::Time,
            3 => Self::Graphics,
            4 => Self::Control,
            _ => return Err(()),
        })
    }
}

/// One `DBR_<category>_<type>` combination
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DbrType {
    pub basic_type: DbrBasicType,
    pub category: DbrCategory,
}

pub const DBR_TIME_FLOAT: DbrType = DbrType {
    basic_type: DbrBasicType::Float,
    category: DbrCategory::Time,
};

impl TryFrom<u16> for DbrType {
    type Error = ();
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(Self {
            basic_type: (value % 7).try_into()?,
            category: (value / 7).try_into()?,
        })
    }
}

impl From<DbrType> for u16 {
    fn from(value: DbrType) -> Self {
        value.category as u16 * 7 + value.basic_type as u16
    }
}

impl DbrType {
    pub fn new(basic_type: DbrBasicType, category: DbrCategory) -> Self {
        Self {
            basic_type,
            category,
        }
    }

    /// Bytes of padding between the metadata and the value
    ///
    /// See <https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types>
    pub fn get_metadata_padding(&self) -> usize {
        match (self.category, self.basic_type) {
            (DbrCategory::Status, DbrBasicType::Char) => 1,
            (DbrCategory::Status, DbrBasicType::Double) => 4,
            (DbrCategory::Time, DbrBasicType::Int | DbrBasicType::Enum) => 2,
            (DbrCategory::Time, DbrBasicType::Char) => 3,
            (DbrCategory::Time, DbrBasicType::Double) => 4,
            _ => 0,
        }
    }
}

/// Alarm status of the record
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Status {
    pub status: i16,
    pub severity: i16,
}

impl Status {
    /// EPICS alarm severity name
    pub fn severity_name(&self) -> &'static str {
        match self.severity {
            0 => "NO_ALARM",
            1 => "MINOR",
            2 => "MAJOR",
            3 => "INVALID",
            _ => "UNKNOWN",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DbrError {
    #[error("DBR category {0:?} is not supported")]
    UnsupportedCategory(DbrCategory),
    #[error("DBR payload was too short or malformed")]
    Malformed,
}

impl From<nom::Err<nom::error::Error<&[u8]>>> for DbrError {
    fn from(_: nom::Err<nom::error::Error<&[u8]>>) -> Self {
        DbrError::Malformed
    }
}

fn parse_value<'a, P>(mut parser: P, data: &'a [u8]) -> Result<P::Output, DbrError>
where
    P: Parser<&'a [u8], Error = nom::error::Error<&'a [u8]>>,
{
    Ok(parser.parse(data)?.1)
}

fn alarm_status(input: &[u8]) -> IResult<&[u8], Status> {
    let (input, (status, severity)) = (be_i16, be_i16).parse(input)?;
    Ok((input, Status { status, severity }))
}

fn epics_timestamp(input: &[u8]) -> IResult<&[u8], SystemTime> {
    let (input, (secs, nanos)) = (be_u32, be_u32).parse(input)?;
    Ok((
        input,
        UNIX_EPOCH + Duration::new(secs as u64 + EPICS_EPOCH_OFFSET, nanos),
    ))
}

/// A value with the metadata of its category
#[derive(Clone, Debug, PartialEq)]
pub enum Dbr {
    Basic(DbrValue),
    Status {
        status: Status,
        value: DbrValue,
    },
    Time {
        status: Status,
        timestamp: SystemTime,
        value: DbrValue,
    },
}

impl Dbr {
    pub fn take_value(self) -> DbrValue {
        match self {
            Dbr::Basic(value) | Dbr::Status { value, .. } | Dbr::Time { value, .. } => value,
        }
    }
    pub fn value(&self) -> &DbrValue {
        match self {
            Dbr::Basic(value) | Dbr::Status { value, .. } | Dbr::Time { value, .. } => value,
        }
    }
    pub fn status(&self) -> Option<Status> {
        match self {
            Dbr::Basic(_) => None,
            Dbr::Status { status, .. } | Dbr::Time { status, .. } => Some(*status),
        }
    }
    pub fn timestamp(&self) -> Option<SystemTime> {
        match self {
            Dbr::Time { timestamp, .. } => Some(*timestamp),
            _ => None,
        }
    }
    pub fn data_type(&self) -> DbrType {
        let category = match self {
            Dbr::Basic(_) => DbrCategory::Basic,
            Dbr::Status { .. } => DbrCategory::Status,
            Dbr::Time { .. } => DbrCategory::Time,
        };
        DbrType::new(self.value().get_type(), category)
    }

    /// Decode a read reply payload
    pub fn from_bytes(data_type: DbrType, elements: usize, data: &[u8]) -> Result<Dbr, DbrError> {
        let (input, status, timestamp) = match data_type.category {
            DbrCategory::Basic => (data, None, None),
            DbrCategory::Status => {
                let (input, status) = alarm_status(data)?;
                (input, Some(status), None)
            }
            DbrCategory::Time => {
                let (input, status) = alarm_status(data)?;
                let (input, timestamp) = epics_timestamp(input)?;
                (input, Some(status), Some(timestamp))
            }
            other => return Err(DbrError::UnsupportedCategory(other)),
        };
        let input = input
            .get(data_type.get_metadata_padding()..)
            .ok_or(DbrError::Malformed)?;
        let value = DbrValue::decode(data_type.basic_type, elements, input)?;

        Ok(match (status, timestamp) {
            (Some(status), Some(timestamp)) => Dbr::Time {
                status,
                timestamp,
                value,
            },
            (Some(status), None) => Dbr::Status { status, value },
            _ => Dbr::Basic(value),
        })
    }

    pub fn to_bytes(&self, max_elems: Option<NonZeroUsize>) -> (usize, Vec<u8>) {
        let mut buffer = Cursor::new(Vec::new());
        let elements = self.write_be(&mut buffer, max_elems).unwrap_or(0);
        (elements, buffer.into_inner())
    }

    /// Write metadata and up to `max_elems` elements, returning the count written
    pub fn write_be<W: io::Write>(
        &self,
        writer: &mut W,
        max_elems: Option<NonZeroUsize>,
    ) -> io::Result<usize> {
        let (elements, data) = self.value().to_bytes(max_elems);
        if let Some(status) = self.status() {
            writer.write_all(&status.status.to_be_bytes())?;
            writer.write_all(&status.severity.to_be_bytes())?;
        }
        if let Dbr::Time { timestamp, .. } = self {
            let since_unix = timestamp.duration_since(UNIX_EPOCH).unwrap_or_default();
            let secs = since_unix.as_secs().saturating_sub(EPICS_EPOCH_OFFSET) as u32;
            writer.write_all(&secs.to_be_bytes())?;
            writer.write_all(&since_unix.subsec_nanos().to_be_bytes())?;
        }
        writer.write_all(&vec![0u8; self.data_type().get_metadata_padding()])?;
        writer.write_all(&data)?;
        Ok(elements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_conversions() {
        let v: DbrValue = vec![500i32].into();
        assert!(v.convert_to(DbrBasicType::Int).is_ok());
        assert_eq!(
            v.convert_to(DbrBasicType::Char),
            Err(ErrorCondition::NoConvert)
        );
        assert_eq!(v.to_bytes(None).1, vec![0x00, 0x00, 0x01, 0xF4]);
        assert_eq!(
            v.convert_to(DbrBasicType::Int).unwrap().to_bytes(None).1,
            vec![0x01, 0xF4]
        );

        // Floats truncate to integers
        let v: DbrValue = vec![500.23f32, 12.7f32].into();
        assert_eq!(v.to_bytes(NonZeroUsize::new(1)), (1, 500.23f32.to_be_bytes().to_vec()));
        assert_eq!(v.to_bytes(NonZeroUsize::new(5)).0, 2);
        assert_eq!(
            v.convert_to(DbrBasicType::Int).unwrap(),
            DbrValue::Int(vec![500, 12])
        );
        assert_eq!(
            DbrValue::Enum(2).convert_to(DbrBasicType::String).unwrap(),
            DbrValue::String(vec!["2".to_owned()])
        );
        assert!(v.convert_to(DbrBasicType::Enum).is_err());
    }

    #[test]
    fn extract_float() {
        assert_eq!(f32::try_from(&DbrValue::Double(vec![2.5, 3.0])), Ok(2.5f32));
        assert_eq!(f32::try_from(&DbrValue::Long(vec![-7])), Ok(-7.0f32));
        assert_eq!(f32::try_from(&DbrValue::Enum(3)), Ok(3.0f32));
        assert_eq!(
            f32::try_from(&DbrValue::String(vec![" 1.25".to_string()])),
            Ok(1.25f32)
        );
        assert_eq!(
            f32::try_from(&DbrValue::String(vec!["open".to_string()])),
            Err(ErrorCondition::NoConvert)
        );
        assert_eq!(
            f32::try_from(&DbrValue::Float(Vec::new())),
            Err(ErrorCondition::BadCount)
        );
        assert_eq!(
            f32::try_from(&DbrValue::Double(vec![1e300])),
            Ok(f32::INFINITY)
        );
    }

    #[test]
    fn strings_are_fixed_length() {
        let long = "é".repeat(30);
        let (count, bytes) = DbrValue::String(vec!["ok".to_owned(), long]).to_bytes(None);
        assert_eq!(count, 2);
        assert_eq!(bytes.len(), 2 * MAX_STRING_SIZE);
        assert_eq!(&bytes[..3], b"ok\0");
        // Two-byte characters stop short of splitting one
        assert_eq!(bytes[MAX_STRING_SIZE + 38..], [0, 0]);
        let decoded = DbrValue::decode(DbrBasicType::String, 2, &bytes).unwrap();
        assert_eq!(
            decoded,
            DbrValue::String(vec!["ok".to_owned(), "é".repeat(19)])
        );
    }

    #[test]
    fn encode_time_dbr() {
        let example_packet = [
            0x0, 0x0, 0x0, 0x0, 0x42, 0x32, 0x19, 0x99, 0x0, 0x0, 0x0, 0x0, 0x0, 0x0, 0x0, 0x2a,
        ];
        let dbr = Dbr::Time {
            status: Status::default(),
            timestamp: UNIX_EPOCH + Duration::from_secs(1741731609),
            value: vec![42i32].into(),
        };
        assert_eq!(dbr.to_bytes(None), (1, example_packet.to_vec()));
    }

    #[test]
    fn decode_time_float() {
        let timestamp = UNIX_EPOCH + Duration::new(1741731609, 500);
        let dbr = Dbr::Time {
            status: Status {
                status: 3,
                severity: 1,
            },
            timestamp,
            value: vec![4.75f32].into(),
        };
        let (count, bytes) = dbr.to_bytes(None);
        let decoded = Dbr::from_bytes(DBR_TIME_FLOAT, count, &bytes).unwrap();
        assert_eq!(decoded, dbr);
        assert_eq!(decoded.status().unwrap().severity_name(), "MINOR");

        // Doubles carry four bytes of padding after the timestamp
        let dbr = Dbr::Time {
            status: Status::default(),
            timestamp,
            value: vec![1.0f64, 2.0].into(),
        };
        let (count, bytes) = dbr.to_bytes(None);
        assert_eq!(bytes.len(), 12 + 4 + 16);
        let time_double = DbrType::new(DbrBasicType::Double, DbrCategory::Time);
        let decoded = Dbr::from_bytes(time_double, count, &bytes).unwrap();
        assert_eq!(decoded.value(), &DbrValue::Double(vec![1.0, 2.0]));
    }

    #[test]
    fn decode_rejects_short_payloads() {
        let float = DbrType::new(DbrBasicType::Float, DbrCategory::Basic);
        assert!(Dbr::from_bytes(float, 2, &[0x40, 0x00, 0x00, 0x00]).is_err());
        assert!(Dbr::from_bytes(DBR_TIME_FLOAT, 1, &[0x00, 0x00]).is_err());
        let graphics = DbrType::new(DbrBasicType::Float, DbrCategory::Graphics);
        assert!(matches!(
            Dbr::from_bytes(graphics, 1, &[0u8; 64]),
            Err(DbrError::UnsupportedCategory(DbrCategory::Graphics))
        ));
    }

    #[test]
    fn type_codes() {
        assert_eq!(<u16 as From<DbrType>>::from(DBR_TIME_FLOAT), 16);
        assert_eq!(DbrType::try_from(16u16), Ok(DBR_TIME_FLOAT));
        assert_eq!(
            DbrType::try_from(20u16),
            Ok(DbrType::new(DbrBasicType::Double, DbrCategory::Time))
        );
        assert_eq!(DbrType::try_from(35u16), Err(()));
    }
}
