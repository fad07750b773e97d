//! MIDAS events and data banks
//!
//! An event is a 16-byte [`EventHeader`] followed by a bank header and a list of
//! banks. Every integer is little-endian, and every bank's data is padded out to
//! a multiple of 8 bytes. Three bank layouts exist, selected by flags in the bank
//! header:
//!
//! | Layout   | Flags                          | Bank header                           |
//! |----------|--------------------------------|---------------------------------------|
//! | 16-bit   | `BANK_FORMAT_VERSION`          | name `[u8; 4]`, type u16, size u16    |
//! | 32-bit   | `.. \| BANK_FORMAT_32BIT`       | name `[u8; 4]`, type u32, size u32    |
//! | 32-bit A | `.. \| BANK_FORMAT_64BIT_ALIGNED` | as 32-bit, plus a reserved u32      |
//!
//! [`BankBuilder`] follows the `bk_init`, `bk_create`, `bk_close`, `bk_size`
//! sequence of the MIDAS C API.

use nom::{
    IResult, Parser,
    bytes::complete::take,
    number::complete::{le_u16, le_u32},
};
use thiserror::Error;

use super::odb::Tid;

pub const BANK_FORMAT_VERSION: u32 = 1;
pub const BANK_FORMAT_32BIT: u32 = 1 << 4;
pub const BANK_FORMAT_64BIT_ALIGNED: u32 = 1 << 5;

/// Event ID of the begin-of-run record in a data file
pub const EVENTID_BOR: u16 = 0x8000;
/// Event ID of the end-of-run record in a data file
pub const EVENTID_EOR: u16 = 0x8001;
/// Trigger mask of run records, "MI"
pub const MIDAS_MAGIC: u16 = 0x494D;

const EVENT_HEADER_SIZE: usize = 16;
const BANK_HEADER_SIZE: usize = 8;

#[derive(Error, Debug, PartialEq)]
pub enum BankError {
    #[error("Bank name {0:?} is not four ASCII characters")]
    InvalidName(String),
    #[error("A bank is already open")]
    BankOpen,
    #[error("No bank is open")]
    NoBankOpen,
    #[error("Bank {name} holds {tid}, cannot write {size}-byte elements")]
    TypeMismatch { name: String, tid: Tid, size: usize },
    #[error("Bank data of {0} bytes does not fit a 16-bit bank")]
    TooLarge(usize),
    #[error("Unknown bank type {0}")]
    UnknownType(u32),
    #[error("Truncated or malformed bank data")]
    Truncated,
}

impl From<nom::Err<nom::error::Error<&[u8]>>> for BankError {
    fn from(_: nom::Err<nom::error::Error<&[u8]>>) -> Self {
        BankError::Truncated
    }
}

fn padded(size: usize) -> usize {
    size.div_ceil(8) * 8
}

/// Fixed header preceding every MIDAS event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    pub event_id: u16,
    pub trigger_mask: u16,
    pub serial_number: u32,
    /// Seconds since the Unix epoch
    pub time_stamp: u32,
    /// Bytes following this header
    pub data_size: u32,
}

impl EventHeader {
    pub fn to_bytes(&self) -> [u8; EVENT_HEADER_SIZE] {
        let mut out = [0u8; EVENT_HEADER_SIZE];
        out[0..2].copy_from_slice(&self.event_id.to_le_bytes());
        out[2..4].copy_from_slice(&self.trigger_mask.to_le_bytes());
        out[4..8].copy_from_slice(&self.serial_number.to_le_bytes());
        out[8..12].copy_from_slice(&self.time_stamp.to_le_bytes());
        out[12..16].copy_from_slice(&self.data_size.to_le_bytes());
        out
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (event_id, trigger_mask, serial_number, time_stamp, data_size)) =
            (le_u16, le_u16, le_u32, le_u32, le_u32).parse(input)?;
        Ok((
            input,
            EventHeader {
                event_id,
                trigger_mask,
                serial_number,
                time_stamp,
                data_size,
            },
        ))
    }
}

/// A complete event, header and data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub header: EventHeader,
    pub data: Vec<u8>,
}

impl Event {
    pub fn new(
        event_id: u16,
        trigger_mask: u16,
        serial_number: u32,
        time_stamp: u32,
        data: Vec<u8>,
    ) -> Self {
        Event {
            header: EventHeader {
                event_id,
                trigger_mask,
                serial_number,
                time_stamp,
                data_size: data.len() as u32,
            },
            data,
        }
    }

    /// Total size on the wire, including the header
    pub fn total_size(&self) -> usize {
        EVENT_HEADER_SIZE + self.data.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_size());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    /// Parse one event from the front of a buffer, returning the remainder
    pub fn parse(input: &[u8]) -> Result<(&[u8], Event), BankError> {
        let (input, header) = EventHeader::parse(input)?;
        let (input, data) = take(header.data_size as usize).parse(input)?;
        Ok((
            input,
            Event {
                header,
                data: data.to_vec(),
            },
        ))
    }

    /// Walk the banks in this event's data
    pub fn banks(&self) -> Result<Vec<Bank<'_>>, BankError> {
        parse_banks(&self.data)
    }

    pub fn is_run_record(&self) -> bool {
        matches!(self.header.event_id, EVENTID_BOR | EVENTID_EOR)
    }
}

/// Values that can be written into a bank
pub trait BankValue: Copy {
    const TID: Tid;
    fn write_le(&self, out: &mut Vec<u8>);
}

macro_rules! impl_bank_value {
    ($typ:ty, $tid:expr) => {
        impl BankValue for $typ {
            const TID: Tid = $tid;
            fn write_le(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
        }
    };
}
impl_bank_value!(u8, Tid::Byte);
impl_bank_value!(i8, Tid::SByte);
impl_bank_value!(u16, Tid::Word);
impl_bank_value!(i16, Tid::Short);
impl_bank_value!(u32, Tid::DWord);
impl_bank_value!(i32, Tid::Int);
impl_bank_value!(f32, Tid::Float);
impl_bank_value!(f64, Tid::Double);
impl_bank_value!(i64, Tid::Int64);
impl_bank_value!(u64, Tid::UInt64);

#[derive(Debug)]
struct OpenBank {
    name: String,
    tid: Tid,
    /// Offset of the bank header within the event data
    start: usize,
}

/// Incrementally composes the data section of an event
#[derive(Debug)]
pub struct BankBuilder {
    buffer: Vec<u8>,
    flags: u32,
    open: Option<OpenBank>,
}

impl Default for BankBuilder {
    fn default() -> Self {
        Self::with_flags(BANK_FORMAT_VERSION)
    }
}

impl BankBuilder {
    /// Start an event with 16-bit bank headers (`bk_init`)
    pub fn new() -> Self {
        Self::default()
    }
    fn with_flags(flags: u32) -> Self {
        let mut buffer = Vec::with_capacity(256);
        buffer.extend_from_slice(&0u32.to_le_bytes());
        buffer.extend_from_slice(&flags.to_le_bytes());
        BankBuilder {
            buffer,
            flags,
            open: None,
        }
    }

    fn bank_header_size(&self) -> usize {
        if self.flags & BANK_FORMAT_64BIT_ALIGNED != 0 {
            16
        } else if self.flags & BANK_FORMAT_32BIT != 0 {
            12
        } else {
            8
        }
    }

    /// Open a new bank (`bk_create`)
    pub fn create(&mut self, name: &str, tid: Tid) -> Result<(), BankError> {
        if self.open.is_some() {
            return Err(BankError::BankOpen);
        }
        if name.len() != 4 || !name.bytes().all(|c| c.is_ascii_graphic()) {
            return Err(BankError::InvalidName(name.to_owned()));
        }
        let start = self.buffer.len();
        self.buffer.resize(start + self.bank_header_size(), 0);
        self.buffer[start..start + 4].copy_from_slice(name.as_bytes());
        self.open = Some(OpenBank {
            name: name.to_owned(),
            tid,
            start,
        });
        Ok(())
    }

    /// Append values to the open bank
    pub fn write<T: BankValue>(&mut self, values: &[T]) -> Result<(), BankError> {
        let Some(open) = &self.open else {
            return Err(BankError::NoBankOpen);
        };
        if open.tid.size() != T::TID.size() {
            return Err(BankError::TypeMismatch {
                name: open.name.clone(),
                tid: open.tid,
                size: T::TID.size(),
            });
        }
        for value in values {
            value.write_le(&mut self.buffer);
        }
        Ok(())
    }

    /// Finish the open bank (`bk_close`), returning its unpadded data size
    pub fn close(&mut self) -> Result<usize, BankError> {
        let open = self.open.take().ok_or(BankError::NoBankOpen)?;
        let header_size = self.bank_header_size();
        let data_size = self.buffer.len() - open.start - header_size;
        let tid = open.tid as u32;
        let header = &mut self.buffer[open.start + 4..open.start + header_size];
        if header_size == 8 {
            let size = u16::try_from(data_size).map_err(|_| BankError::TooLarge(data_size))?;
            header[0..2].copy_from_slice(&(tid as u16).to_le_bytes());
            header[2..4].copy_from_slice(&size.to_le_bytes());
        } else {
            header[0..4].copy_from_slice(&tid.to_le_bytes());
            header[4..8].copy_from_slice(&(data_size as u32).to_le_bytes());
        }
        let end = open.start + header_size + padded(data_size);
        self.buffer.resize(end, 0);
        let total = (self.buffer.len() - BANK_HEADER_SIZE) as u32;
        self.buffer[0..4].copy_from_slice(&total.to_le_bytes());
        Ok(data_size)
    }

    /// Bytes of event data so far, bank header included (`bk_size`)
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    /// Consume the builder, returning the event data
    pub fn finish(self) -> Result<Vec<u8>, BankError> {
        if self.open.is_some() {
            return Err(BankError::BankOpen);
        }
        Ok(self.buffer)
    }
}

/// A bank found in event data
#[derive(Debug, Clone, PartialEq)]
pub struct Bank<'a> {
    pub name: String,
    pub tid: Tid,
    pub data: &'a [u8],
}

impl Bank<'_> {
    /// Interpret the data as `TID_FLOAT` values
    pub fn as_f32(&self) -> Option<Vec<f32>> {
        if self.tid != Tid::Float {
            return None;
        }
        Some(
            self.data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }
}

fn parse_bank(flags: u32) -> impl for<'a> Fn(&'a [u8]) -> IResult<&'a [u8], (&'a [u8], u32, usize)> {
    move |input| {
        let (input, name) = take(4usize).parse(input)?;
        if flags & BANK_FORMAT_32BIT != 0 {
            let (input, (tid, size)) = (le_u32, le_u32).parse(input)?;
            let (input, _) = if flags & BANK_FORMAT_64BIT_ALIGNED != 0 {
                le_u32(input)?
            } else {
                (input, 0)
            };
            Ok((input, (name, tid, size as usize)))
        } else {
            let (input, (tid, size)) = (le_u16, le_u16).parse(input)?;
            Ok((input, (name, tid as u32, size as usize)))
        }
    }
}

/// Walk all banks in the data section of an event
pub fn parse_banks(data: &[u8]) -> Result<Vec<Bank<'_>>, BankError> {
    let (rest, (total, flags)) = (le_u32, le_u32).parse(data)?;
    let (_, mut body) = take(total as usize).parse(rest)?;
    let mut banks = Vec::new();
    while !body.is_empty() {
        let (rest, (name, tid, size)) = parse_bank(flags)(body)?;
        let (_, bank_data) = take(size).parse(rest)?;
        // The final bank's padding may be absent
        let (rest, _) = take(padded(size).min(rest.len())).parse(rest)?;
        banks.push(Bank {
            name: String::from_utf8_lossy(name).into_owned(),
            tid: Tid::try_from(tid).map_err(BankError::UnknownType)?,
            data: bank_data,
        });
        body = rest;
    }
    Ok(banks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_bank_layout() {
        let mut bank = BankBuilder::new();
        bank.create("E000", Tid::Float).unwrap();
        bank.write(&[1.0f32, 2.0, 3.0]).unwrap();
        assert_eq!(bank.close().unwrap(), 12);
        // 8 bank header + 8 bank descriptor + 12 data padded to 16
        assert_eq!(bank.size(), 32);
        let data = bank.finish().unwrap();
        assert_eq!(&data[0..4], &24u32.to_le_bytes());
        assert_eq!(&data[4..8], &BANK_FORMAT_VERSION.to_le_bytes());
        assert_eq!(&data[8..12], b"E000");
        assert_eq!(&data[12..14], &9u16.to_le_bytes());
        assert_eq!(&data[14..16], &12u16.to_le_bytes());
        assert_eq!(&data[16..20], &1.0f32.to_le_bytes());
        assert_eq!(&data[28..32], &[0u8; 4]);

        let banks = parse_banks(&data).unwrap();
        assert_eq!(banks.len(), 1);
        assert_eq!(banks[0].name, "E000");
        assert_eq!(banks[0].as_f32().unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn empty_bank() {
        let mut bank = BankBuilder::new();
        bank.create("E000", Tid::Float).unwrap();
        assert_eq!(bank.close().unwrap(), 0);
        assert_eq!(bank.size(), 16);
        let data = bank.finish().unwrap();
        assert_eq!(parse_banks(&data).unwrap()[0].data.len(), 0);
    }

    #[test]
    fn multiple_32bit_banks() {
        // As written by bk_init32 and bk_init32a
        let formats = [
            BANK_FORMAT_VERSION | BANK_FORMAT_32BIT,
            BANK_FORMAT_VERSION | BANK_FORMAT_32BIT | BANK_FORMAT_64BIT_ALIGNED,
        ];
        for mut bank in formats.map(BankBuilder::with_flags) {
            bank.create("ADC0", Tid::Short).unwrap();
            bank.write(&[1i16, -2, 3]).unwrap();
            bank.close().unwrap();
            bank.create("TDC0", Tid::Double).unwrap();
            bank.write(&[0.5f64]).unwrap();
            bank.close().unwrap();
            let data = bank.finish().unwrap();
            assert_eq!(data.len() % 8, 0);
            let banks = parse_banks(&data).unwrap();
            assert_eq!(banks.len(), 2);
            assert_eq!(banks[0].tid, Tid::Short);
            assert_eq!(banks[0].data, &[1, 0, 0xFE, 0xFF, 3, 0]);
            assert_eq!(banks[1].name, "TDC0");
            assert_eq!(banks[1].data, &0.5f64.to_le_bytes());
        }
    }

    #[test]
    fn builder_misuse() {
        let mut bank = BankBuilder::new();
        assert_eq!(bank.close(), Err(BankError::NoBankOpen));
        assert!(matches!(
            bank.create("TOOLONG", Tid::Float),
            Err(BankError::InvalidName(_))
        ));
        bank.create("E000", Tid::Float).unwrap();
        assert_eq!(bank.create("E001", Tid::Float), Err(BankError::BankOpen));
        assert!(matches!(
            bank.write(&[1.0f64]),
            Err(BankError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn truncated_data_is_rejected() {
        let mut bank = BankBuilder::new();
        bank.create("E000", Tid::Float).unwrap();
        bank.write(&[1.0f32; 4]).unwrap();
        bank.close().unwrap();
        let data = bank.finish().unwrap();
        for cut in [3, 12, data.len() - 4] {
            assert_eq!(parse_banks(&data[..cut]), Err(BankError::Truncated));
        }
    }

    #[test]
    fn event_framing() {
        let mut bank = BankBuilder::new();
        bank.create("E000", Tid::Float).unwrap();
        bank.write(&[4.25f32]).unwrap();
        bank.close().unwrap();
        let event = Event::new(21, 0, 7, 1_700_000_000, bank.finish().unwrap());
        let bytes = event.to_bytes();
        assert_eq!(&bytes[0..2], &21u16.to_le_bytes());
        assert_eq!(&bytes[4..8], &7u32.to_le_bytes());
        assert_eq!(bytes.len(), event.total_size());

        let (rest, parsed) = Event::parse(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, event);
        assert_eq!(parsed.banks().unwrap()[0].as_f32().unwrap(), vec![4.25]);
    }
}
