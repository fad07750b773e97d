//! Mapping and serialization of the CA messages used by the client.
//!
//! Every CA message is a 16-byte big-endian header, optionally extended to 24
//! bytes for large payloads, followed by a payload padded to a multiple of 8
//! bytes. Many commands share an ID between the request and the reply while
//! giving the header fields different meanings, so parsing needs to know which
//! side of the conversation the bytes came from:
//!
//! - [`Message::parse_client_message`] parses messages a *client* receives.
//! - [`Message::parse_server_message`] parses messages a *server* receives.

use std::{
    io::{self, Cursor, Write},
    net::Ipv4Addr,
};

use bytes::{Buf, BytesMut};
use nom::{
    IResult, Parser,
    bytes::complete::take,
    number::complete::{be_u16, be_u32},
};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Decoder;

use crate::dbr::{Dbr, DbrBasicType, DbrType};

/// The CA minor protocol version we speak
pub const EPICS_VERSION: u16 = 13;
/// Oldest server minor version we will hold a circuit open with
const MINIMUM_COMPATIBLE_VERSION: u16 = 11;
/// Refuse to buffer payloads larger than this
const MAX_PAYLOAD_SIZE: usize = 0x0100_0000;

pub const CA_PROTO_VERSION: u16 = 0;
pub const CA_PROTO_SEARCH: u16 = 6;
pub const CA_PROTO_ERROR: u16 = 11;
pub const CA_PROTO_READ_NOTIFY: u16 = 15;
pub const CA_PROTO_CREATE_CHAN: u16 = 18;
pub const CA_PROTO_CLIENT_NAME: u16 = 20;
pub const CA_PROTO_HOST_NAME: u16 = 21;
pub const CA_PROTO_ACCESS_RIGHTS: u16 = 22;
pub const CA_PROTO_ECHO: u16 = 23;
pub const CA_PROTO_CREATE_CH_FAIL: u16 = 26;
pub const CA_PROTO_SERVER_DISCONN: u16 = 27;

/// Search flags asking for, or not asking for, a reply on failure
const DO_REPLY: u16 = 10;
const DONT_REPLY: u16 = 5;

/// A message with a fixed command ID, read from and written as a [`RawMessage`]
pub trait CAMessage: TryFrom<RawMessage, Error = MessageError> {
    const COMMAND: u16;

    fn to_raw(&self) -> RawMessage;

    /// Parse a single message, which must be of this type
    fn parse(input: &[u8]) -> Result<(&[u8], Self), MessageError> {
        let (rest, raw) = RawMessage::parse(input)?;
        raw.expect_id(Self::COMMAND)?;
        Ok((rest, Self::try_from(raw)?))
    }

    fn as_bytes(&self) -> Vec<u8> {
        self.to_raw().as_bytes()
    }
}

/// A message header and payload, before interpretation of the fields
#[derive(Default, Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub command: u16,
    pub field_1_data_type: u16,
    pub field_2_data_count: u32,
    pub field_3_parameter_1: u32,
    pub field_4_parameter_2: u32,
    pub payload: Vec<u8>,
}

impl RawMessage {
    /// Parse only the header, returning the declared payload size alongside
    fn parse_header(input: &[u8]) -> IResult<&[u8], (RawMessage, usize)> {
        let (input, (command, size, data_type, count, parameter_1, parameter_2)) =
            (be_u16, be_u16, be_u16, be_u16, be_u32, be_u32).parse(input)?;
        let mut header = RawMessage {
            command,
            field_1_data_type: data_type,
            field_2_data_count: count as u32,
            field_3_parameter_1: parameter_1,
            field_4_parameter_2: parameter_2,
            payload: Vec::new(),
        };
        if size != 0xFFFF {
            return Ok((input, (header, size as usize)));
        }
        // Extended header, with 32-bit size and count after the usual fields
        let (input, (size, count)) = (be_u32, be_u32).parse(input)?;
        header.field_2_data_count = count;
        Ok((input, (header, size as usize)))
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], RawMessage> {
        let (input, (mut message, payload_size)) = RawMessage::parse_header(input)?;
        let (input, payload) = take(payload_size).parse(input)?;
        message.payload = payload.to_vec();
        Ok((input, message))
    }

    /// Work out how many bytes the next full message in a buffer needs
    ///
    /// Returns None if there is not enough data to read the header yet.
    fn framed_length(input: &[u8]) -> Option<usize> {
        let short_size = u16::from_be_bytes([*input.get(2)?, *input.get(3)?]);
        if input.len() < 16 {
            None
        } else if short_size != 0xFFFF {
            Some(16 + short_size as usize)
        } else {
            let extended = input.get(16..24)?;
            let size = u32::from_be_bytes([extended[0], extended[1], extended[2], extended[3]]);
            Some(24 + size as usize)
        }
    }

    fn payload_as_string(&self) -> String {
        nul_terminated(&self.payload)
    }

    fn expect_id(&self, id: u16) -> Result<(), MessageError> {
        if self.command == id {
            Ok(())
        } else {
            Err(MessageError::IncorrectCommandId(self.command, id))
        }
    }

    /// The data type field, as a DBR type
    fn data_type<T: TryFrom<u16>>(&self) -> Result<T, MessageError> {
        T::try_from(self.field_1_data_type).map_err(|_| {
            MessageError::InvalidField("data_type".to_owned(), self.field_1_data_type.to_string())
        })
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let padded_size = self.payload.len().div_ceil(8) * 8;
        let extended = padded_size >= 0xFFFF || self.field_2_data_count > 0xFFFF;

        writer.write_all(&self.command.to_be_bytes())?;
        let short_size = if extended { 0xFFFF } else { padded_size as u16 };
        writer.write_all(&short_size.to_be_bytes())?;
        writer.write_all(&self.field_1_data_type.to_be_bytes())?;
        let short_count = if extended { 0 } else { self.field_2_data_count as u16 };
        writer.write_all(&short_count.to_be_bytes())?;
        writer.write_all(&self.field_3_parameter_1.to_be_bytes())?;
        writer.write_all(&self.field_4_parameter_2.to_be_bytes())?;
        if extended {
            writer.write_all(&(padded_size as u32).to_be_bytes())?;
            writer.write_all(&self.field_2_data_count.to_be_bytes())?;
        }
        writer.write_all(&self.payload)?;
        writer.write_all(&vec![0; padded_size - self.payload.len()])
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        // Writing to a Vec cannot fail
        let _ = self.write(&mut buffer);
        buffer.into_inner()
    }
}

/// Text up to the first nul, or the whole buffer
fn nul_terminated(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&c| c == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Nul-terminate a string and pad it out to the next 8-byte boundary
fn pad_string(string: &str) -> Vec<u8> {
    let mut bytes = string.as_bytes().to_vec();
    let padded_len = (bytes.len() + 1).div_ceil(8) * 8;
    bytes.resize(padded_len, 0);
    bytes
}

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
    #[error("Malformed message")]
    ParsingError(#[from] nom::Err<nom::error::Error<Vec<u8>>>),
    #[error("Unknown command ID: {0}")]
    UnknownCommandId(u16),
    #[error("Message command ID {0} does not match expected {1}")]
    IncorrectCommandId(u16, u16),
    #[error("Invalid message field: {0} == {1}")]
    InvalidField(String, String),
    #[error("Message payload of {0} bytes is too large")]
    TooLarge(usize),
}

impl From<nom::Err<nom::error::Error<&[u8]>>> for MessageError {
    fn from(err: nom::Err<nom::error::Error<&[u8]>>) -> Self {
        MessageError::ParsingError(err.to_owned())
    }
}

/// Every CA message that this crate knows how to read or write
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Version(Version),
    Search(Search),
    SearchResponse(SearchResponse),
    CreateChannel(CreateChannel),
    CreateChannelResponse(CreateChannelResponse),
    CreateChannelFailure(CreateChannelFailure),
    AccessRights(AccessRights),
    ClientName(ClientName),
    HostName(HostName),
    ReadNotify(ReadNotify),
    ReadNotifyResponse(ReadNotifyResponse),
    ServerDisconnect(ServerDisconnect),
    ECAError(ECAError),
    Echo,
}

macro_rules! message_variants {
    ($($variant:ident),*) => {
        $(
            impl From<$variant> for Message {
                fn from(value: $variant) -> Self {
                    Message::$variant(value)
                }
            }
        )*

        impl Message {
            fn to_raw(&self) -> RawMessage {
                match self {
                    $(Message::$variant(msg) => msg.to_raw(),)*
                    Message::Echo => Echo.to_raw(),
                }
            }
        }
    };
}
message_variants!(
    Version,
    Search,
    SearchResponse,
    CreateChannel,
    CreateChannelResponse,
    CreateChannelFailure,
    AccessRights,
    ClientName,
    HostName,
    ReadNotify,
    ReadNotifyResponse,
    ServerDisconnect,
    ECAError
);

impl Message {
    /// Interpret a raw message that was sent to a client, by a server
    pub fn from_client_raw(message: RawMessage) -> Result<Self, MessageError> {
        Ok(match message.command {
            CA_PROTO_VERSION => Self::Version(message.try_into()?),
            CA_PROTO_SEARCH => Self::SearchResponse(message.try_into()?),
            CA_PROTO_ERROR => Self::ECAError(message.try_into()?),
            CA_PROTO_READ_NOTIFY => Self::ReadNotifyResponse(message.try_into()?),
            CA_PROTO_CREATE_CHAN => Self::CreateChannelResponse(message.try_into()?),
            CA_PROTO_ACCESS_RIGHTS => Self::AccessRights(message.try_into()?),
            CA_PROTO_ECHO => Self::Echo,
            CA_PROTO_CREATE_CH_FAIL => Self::CreateChannelFailure(message.try_into()?),
            CA_PROTO_SERVER_DISCONN => Self::ServerDisconnect(message.try_into()?),
            unknown => Err(MessageError::UnknownCommandId(unknown))?,
        })
    }

    /// Interpret a raw message that was sent to a server, by a client
    pub fn from_server_raw(message: RawMessage) -> Result<Self, MessageError> {
        Ok(match message.command {
            CA_PROTO_VERSION => Self::Version(message.try_into()?),
            CA_PROTO_SEARCH => Self::Search(message.try_into()?),
            CA_PROTO_READ_NOTIFY => Self::ReadNotify(message.try_into()?),
            CA_PROTO_CREATE_CHAN => Self::CreateChannel(message.try_into()?),
            CA_PROTO_CLIENT_NAME => Self::ClientName(message.try_into()?),
            CA_PROTO_HOST_NAME => Self::HostName(message.try_into()?),
            CA_PROTO_ECHO => Self::Echo,
            unknown => Err(MessageError::UnknownCommandId(unknown))?,
        })
    }

    pub fn parse_client_message(input: &[u8]) -> Result<(&[u8], Self), MessageError> {
        let (input, raw) = RawMessage::parse(input)?;
        Ok((input, Self::from_client_raw(raw)?))
    }

    pub fn parse_server_message(input: &[u8]) -> Result<(&[u8], Self), MessageError> {
        let (input, raw) = RawMessage::parse(input)?;
        Ok((input, Self::from_server_raw(raw)?))
    }

    /// Parse every message in a datagram sent to a client
    pub fn parse_many_client_messages(input: &[u8]) -> Result<Vec<Self>, MessageError> {
        parse_all(input, Self::parse_client_message)
    }

    /// Parse every message in a datagram sent to a server
    pub fn parse_many_server_messages(input: &[u8]) -> Result<Vec<Self>, MessageError> {
        parse_all(input, Self::parse_server_message)
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        self.to_raw().as_bytes()
    }

    /// Serialize a batch of messages and send them in a single write
    pub async fn write_all_messages<W: AsyncWrite + Unpin>(
        messages: &[Message],
        writer: &mut W,
    ) -> io::Result<()> {
        let buffer: Vec<u8> = messages.iter().flat_map(|m| m.as_bytes()).collect();
        writer.write_all(&buffer).await?;
        writer.flush().await
    }
}

fn parse_all(
    mut input: &[u8],
    parse_one: fn(&[u8]) -> Result<(&[u8], Message), MessageError>,
) -> Result<Vec<Message>, MessageError> {
    let mut messages = Vec::new();
    while !input.is_empty() {
        let (rest, message) = parse_one(input)?;
        messages.push(message);
        input = rest;
    }
    Ok(messages)
}

/// Split the next complete raw message off the front of a stream buffer
fn decode_raw(src: &mut BytesMut) -> Result<Option<RawMessage>, MessageError> {
    let Some(length) = RawMessage::framed_length(src) else {
        return Ok(None);
    };
    if length > MAX_PAYLOAD_SIZE {
        return Err(MessageError::TooLarge(length));
    }
    if src.len() < length {
        src.reserve(length - src.len());
        return Ok(None);
    }
    let (_, raw) = RawMessage::parse(&src[..length])?;
    src.advance(length);
    Ok(Some(raw))
}

/// Frames a TCP byte stream into messages sent to a client
#[derive(Default, Debug)]
pub struct ClientMessageDecoder;

impl Decoder for ClientMessageDecoder {
    type Item = Message;
    type Error = MessageError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_raw(src)?.map(Message::from_client_raw).transpose()
    }
}

/// Frames a TCP byte stream into messages sent to a server
#[derive(Default, Debug)]
pub struct ServerMessageDecoder;

impl Decoder for ServerMessageDecoder {
    type Item = Message;
    type Error = MessageError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_raw(src)?.map(Message::from_server_raw).transpose()
    }
}

/// Message CA_PROTO_VERSION.
///
/// First message on every new circuit, in both directions, and at the front
/// of every search datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct Version {
    pub priority: u16,
    pub protocol_version: u16,
}

impl Default for Version {
    fn default() -> Self {
        Version {
            priority: 0,
            protocol_version: EPICS_VERSION,
        }
    }
}

impl Version {
    /// Can we keep a circuit open with a peer announcing this version?
    pub fn is_compatible(&self) -> bool {
        self.protocol_version >= MINIMUM_COMPATIBLE_VERSION
    }
}

impl TryFrom<RawMessage> for Version {
    type Error = MessageError;
    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        Ok(Version {
            priority: raw.field_1_data_type,
            protocol_version: raw.field_2_data_count as u16,
        })
    }
}

impl CAMessage for Version {
    const COMMAND: u16 = CA_PROTO_VERSION;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Self::COMMAND,
            field_1_data_type: self.priority,
            field_2_data_count: self.protocol_version as u32,
            ..Default::default()
        }
    }
}

/// Message CA_PROTO_SEARCH, as sent by a client looking for a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Search {
    pub search_id: u32,
    pub channel_name: String,
    /// Whether servers should reply even when they don't host the channel
    pub should_reply: bool,
    pub protocol_version: u16,
}

impl Default for Search {
    fn default() -> Self {
        Search {
            search_id: 0,
            channel_name: String::new(),
            should_reply: false,
            protocol_version: EPICS_VERSION,
        }
    }
}

impl Search {
    /// The reply a server hosting the channel would send. The protocol version
    /// is only carried in replies sent over UDP.
    pub fn respond(
        &self,
        server_ip: Option<Ipv4Addr>,
        port_number: u16,
        is_udp: bool,
    ) -> SearchResponse {
        SearchResponse {
            port_number,
            server_ip,
            search_id: self.search_id,
            protocol_version: is_udp.then_some(EPICS_VERSION),
        }
    }
}

impl TryFrom<RawMessage> for Search {
    type Error = MessageError;
    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        Ok(Search {
            should_reply: raw.field_1_data_type == DO_REPLY,
            protocol_version: raw.field_2_data_count as u16,
            search_id: raw.field_3_parameter_1,
            channel_name: raw.payload_as_string(),
        })
    }
}

impl CAMessage for Search {
    const COMMAND: u16 = CA_PROTO_SEARCH;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Self::COMMAND,
            field_1_data_type: if self.should_reply { DO_REPLY } else { DONT_REPLY },
            field_2_data_count: self.protocol_version as u32,
            field_3_parameter_1: self.search_id,
            field_4_parameter_2: self.search_id,
            payload: pad_string(&self.channel_name),
        }
    }
}

/// Message CA_PROTO_SEARCH, as sent by a server hosting the channel.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResponse {
    pub port_number: u16,
    pub search_id: u32,
    /// Server to connect to, if different from the message sender
    pub server_ip: Option<Ipv4Addr>,
    pub protocol_version: Option<u16>,
}

impl TryFrom<RawMessage> for SearchResponse {
    type Error = MessageError;
    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        Ok(SearchResponse {
            port_number: raw.field_1_data_type,
            server_ip: match raw.field_3_parameter_1 {
                0 | u32::MAX => None,
                ip => Some(Ipv4Addr::from(ip)),
            },
            search_id: raw.field_4_parameter_2,
            protocol_version: raw
                .payload
                .get(..2)
                .map(|v| u16::from_be_bytes([v[0], v[1]])),
        })
    }
}

impl CAMessage for SearchResponse {
    const COMMAND: u16 = CA_PROTO_SEARCH;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Self::COMMAND,
            field_1_data_type: self.port_number,
            field_3_parameter_1: self.server_ip.map_or(u32::MAX, Ipv4Addr::to_bits),
            field_4_parameter_2: self.search_id,
            payload: self
                .protocol_version
                .map(|v| v.to_be_bytes().to_vec())
                .unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Message CA_PROTO_CREATE_CHAN, as sent by a client opening a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateChannel {
    pub client_id: u32,
    pub protocol_version: u32,
    pub channel_name: String,
}

impl Default for CreateChannel {
    fn default() -> Self {
        CreateChannel {
            client_id: 0,
            protocol_version: EPICS_VERSION as u32,
            channel_name: String::new(),
        }
    }
}

impl CreateChannel {
    pub fn respond(
        &self,
        data_type: DbrBasicType,
        data_count: u32,
        server_id: u32,
    ) -> CreateChannelResponse {
        CreateChannelResponse {
            data_type,
            data_count,
            client_id: self.client_id,
            server_id,
        }
    }
}

impl TryFrom<RawMessage> for CreateChannel {
    type Error = MessageError;
    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        Ok(CreateChannel {
            client_id: raw.field_3_parameter_1,
            protocol_version: raw.field_4_parameter_2,
            channel_name: raw.payload_as_string(),
        })
    }
}

impl CAMessage for CreateChannel {
    const COMMAND: u16 = CA_PROTO_CREATE_CHAN;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Self::COMMAND,
            field_3_parameter_1: self.client_id,
            field_4_parameter_2: self.protocol_version,
            payload: pad_string(&self.channel_name),
            ..Default::default()
        }
    }
}

/// Message CA_PROTO_CREATE_CHAN, as sent by a server once the channel exists.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateChannelResponse {
    /// Native type of the channel
    pub data_type: DbrBasicType,
    /// Native element count of the channel
    pub data_count: u32,
    pub client_id: u32,
    pub server_id: u32,
}

impl TryFrom<RawMessage> for CreateChannelResponse {
    type Error = MessageError;
    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        Ok(CreateChannelResponse {
            data_type: raw.data_type()?,
            data_count: raw.field_2_data_count,
            client_id: raw.field_3_parameter_1,
            server_id: raw.field_4_parameter_2,
        })
    }
}

impl CAMessage for CreateChannelResponse {
    const COMMAND: u16 = CA_PROTO_CREATE_CHAN;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Self::COMMAND,
            field_1_data_type: self.data_type as u16,
            field_2_data_count: self.data_count,
            field_3_parameter_1: self.client_id,
            field_4_parameter_2: self.server_id,
            ..Default::default()
        }
    }
}

/// Message CA_PROTO_CREATE_CH_FAIL.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateChannelFailure {
    pub client_id: u32,
}

impl TryFrom<RawMessage> for CreateChannelFailure {
    type Error = MessageError;
    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        Ok(CreateChannelFailure {
            client_id: raw.field_3_parameter_1,
        })
    }
}

impl CAMessage for CreateChannelFailure {
    const COMMAND: u16 = CA_PROTO_CREATE_CH_FAIL;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Self::COMMAND,
            field_3_parameter_1: self.client_id,
            ..Default::default()
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum Access {
    #[default]
    None = 0,
    Read = 1,
    Write = 2,
    ReadWrite = 3,
}

impl Access {
    pub fn can_read(&self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }
}

impl TryFrom<u32> for Access {
    type Error = MessageError;
    fn try_from(value: u32) -> Result<Self, Self::Error> {
        [Access::None, Access::Read, Access::Write, Access::ReadWrite]
            .into_iter()
            .find(|a| *a as u32 == value)
            .ok_or_else(|| MessageError::InvalidField("access_rights".to_owned(), value.to_string()))
    }
}

impl std::fmt::Display for Access {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Access::None => "NoAccess",
            Access::Read => "Read",
            Access::Write => "Write",
            Access::ReadWrite => "ReadWrite",
        })
    }
}

/// Message CA_PROTO_ACCESS_RIGHTS.
///
/// Sent by the server after channel creation, and whenever the rights change.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessRights {
    pub client_id: u32,
    pub access_rights: Access,
}

impl TryFrom<RawMessage> for AccessRights {
    type Error = MessageError;
    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        Ok(AccessRights {
            client_id: raw.field_3_parameter_1,
            access_rights: raw.field_4_parameter_2.try_into()?,
        })
    }
}

impl CAMessage for AccessRights {
    const COMMAND: u16 = CA_PROTO_ACCESS_RIGHTS;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Self::COMMAND,
            field_3_parameter_1: self.client_id,
            field_4_parameter_2: self.access_rights as u32,
            ..Default::default()
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Echo;

impl TryFrom<RawMessage> for Echo {
    type Error = MessageError;
    fn try_from(_: RawMessage) -> Result<Self, Self::Error> {
        Ok(Echo)
    }
}

impl CAMessage for Echo {
    const COMMAND: u16 = CA_PROTO_ECHO;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Self::COMMAND,
            ..Default::default()
        }
    }
}

/// Message CA_PROTO_CLIENT_NAME, the user name of the client process.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientName {
    pub name: String,
}

impl ClientName {
    pub fn new(name: &str) -> Self {
        ClientName {
            name: name.to_owned(),
        }
    }
}

impl TryFrom<RawMessage> for ClientName {
    type Error = MessageError;
    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        Ok(ClientName {
            name: raw.payload_as_string(),
        })
    }
}

impl CAMessage for ClientName {
    const COMMAND: u16 = CA_PROTO_CLIENT_NAME;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Self::COMMAND,
            payload: pad_string(&self.name),
            ..Default::default()
        }
    }
}

/// Message CA_PROTO_HOST_NAME, the host the client runs on.
#[derive(Debug, Clone, PartialEq)]
pub struct HostName {
    pub name: String,
}

impl HostName {
    pub fn new(name: &str) -> Self {
        HostName {
            name: name.to_owned(),
        }
    }
}

impl TryFrom<RawMessage> for HostName {
    type Error = MessageError;
    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        Ok(HostName {
            name: raw.payload_as_string(),
        })
    }
}

impl CAMessage for HostName {
    const COMMAND: u16 = CA_PROTO_HOST_NAME;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Self::COMMAND,
            payload: pad_string(&self.name),
            ..Default::default()
        }
    }
}

/// Message CA_PROTO_READ_NOTIFY, as sent by a client reading a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadNotify {
    pub data_type: DbrType,
    /// Number of elements to read, 0 meaning "the native count"
    pub data_count: u32,
    pub server_id: u32,
    pub client_ioid: u32,
}

impl ReadNotify {
    /// Build the successful reply carrying a value
    pub fn respond(&self, dbr: &Dbr) -> ReadNotifyResponse {
        let (data_count, data) = dbr.to_bytes(None);
        ReadNotifyResponse {
            data_type: self.data_type,
            data_count: data_count as u32,
            status_code: ErrorCondition::Normal.code(),
            client_ioid: self.client_ioid,
            data,
        }
    }
}

impl TryFrom<RawMessage> for ReadNotify {
    type Error = MessageError;
    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        Ok(ReadNotify {
            data_type: raw.data_type()?,
            data_count: raw.field_2_data_count,
            server_id: raw.field_3_parameter_1,
            client_ioid: raw.field_4_parameter_2,
        })
    }
}

impl CAMessage for ReadNotify {
    const COMMAND: u16 = CA_PROTO_READ_NOTIFY;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Self::COMMAND,
            field_1_data_type: self.data_type.into(),
            field_2_data_count: self.data_count,
            field_3_parameter_1: self.server_id,
            field_4_parameter_2: self.client_ioid,
            ..Default::default()
        }
    }
}

/// Message CA_PROTO_READ_NOTIFY, as sent by a server answering a read.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadNotifyResponse {
    pub data_type: DbrType,
    pub data_count: u32,
    /// ECA status code of the read
    pub status_code: u32,
    pub client_ioid: u32,
    pub data: Vec<u8>,
}

impl ReadNotifyResponse {
    pub fn is_success(&self) -> bool {
        self.status_code == ErrorCondition::Normal.code()
    }
}

impl TryFrom<RawMessage> for ReadNotifyResponse {
    type Error = MessageError;
    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        Ok(ReadNotifyResponse {
            data_type: raw.data_type()?,
            data_count: raw.field_2_data_count,
            status_code: raw.field_3_parameter_1,
            client_ioid: raw.field_4_parameter_2,
            data: raw.payload,
        })
    }
}

impl CAMessage for ReadNotifyResponse {
    const COMMAND: u16 = CA_PROTO_READ_NOTIFY;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Self::COMMAND,
            field_1_data_type: self.data_type.into(),
            field_2_data_count: self.data_count,
            field_3_parameter_1: self.status_code,
            field_4_parameter_2: self.client_ioid,
            payload: self.data.clone(),
        }
    }
}

/// Message CA_PROTO_SERVER_DISCONN, the server dropping a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDisconnect {
    pub client_id: u32,
}

impl TryFrom<RawMessage> for ServerDisconnect {
    type Error = MessageError;
    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        Ok(ServerDisconnect {
            client_id: raw.field_3_parameter_1,
        })
    }
}

impl CAMessage for ServerDisconnect {
    const COMMAND: u16 = CA_PROTO_SERVER_DISCONN;
    fn to_raw(&self) -> RawMessage {
        RawMessage {
            command: Self::COMMAND,
            field_3_parameter_1: self.client_id,
            ..Default::default()
        }
    }
}

/// Message CA_PROTO_ERROR.
///
/// Sent by the server when a request failed. Carries the header of the
/// request that caused the error, and a human readable message.
#[derive(Debug, Clone, PartialEq)]
pub struct ECAError {
    pub client_id: u32,
    /// Raw ECA status code
    pub status_code: u32,
    /// Header of the failed request, without payload
    pub original_request: RawMessage,
    pub error_message: String,
}

impl ECAError {
    pub fn condition(&self) -> Option<ErrorCondition> {
        ErrorCondition::from_code(self.status_code)
    }
}

impl TryFrom<RawMessage> for ECAError {
    type Error = MessageError;
    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        let (text, (original_request, _)) = RawMessage::parse_header(&raw.payload)?;
        Ok(ECAError {
            client_id: raw.field_3_parameter_1,
            status_code: raw.field_4_parameter_2,
            original_request,
            error_message: nul_terminated(text),
        })
    }
}

impl CAMessage for ECAError {
    const COMMAND: u16 = CA_PROTO_ERROR;
    fn to_raw(&self) -> RawMessage {
        let mut payload = self.original_request.as_bytes();
        payload.extend(self.error_message.as_bytes());
        payload.push(0);
        RawMessage {
            command: Self::COMMAND,
            field_3_parameter_1: self.client_id,
            field_4_parameter_2: self.status_code,
            payload,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Warning = 0,
    Success = 1,
    Error = 2,
    Info = 3,
    Severe = 4,
}

macro_rules! error_conditions {
    ($($name:ident = $number:literal, $severity:ident, $text:literal;)*) => {
        /// CA status conditions, numbered by their ECA message number
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum ErrorCondition {
            $($name = $number,)*
        }

        impl ErrorCondition {
            pub fn severity(&self) -> ErrorSeverity {
                match self {
                    $(Self::$name => ErrorSeverity::$severity,)*
                }
            }

            /// Look up the condition for a full ECA status code
            pub fn from_code(code: u32) -> Option<Self> {
                match code >> 3 {
                    $($number => Some(Self::$name),)*
                    _ => None,
                }
            }

            pub fn description(&self) -> &'static str {
                match self {
                    $(Self::$name => $text,)*
                }
            }
        }
    };
}

error_conditions! {
    Normal = 0, Success, "Normal successful completion";
    AllocMem = 6, Warning, "Unable to allocate additional dynamic memory";
    TooLarge = 9, Warning, "The requested data transfer is greater than available memory or EPICS_CA_MAX_ARRAY_BYTES";
    Timeout = 10, Warning, "User specified timeout on IO operation expired";
    BadType = 14, Error, "The data type specified is invalid";
    Internal = 17, Severe, "Channel Access Internal Failure";
    DblClFail = 18, Warning, "The requested local DB operation failed";
    GetFail = 19, Warning, "Channel read request failed";
    PutFail = 20, Warning, "Channel write request failed";
    BadCount = 22, Warning, "Invalid element count requested";
    BadStr = 23, Error, "Invalid string";
    Disconn = 24, Warning, "Virtual circuit disconnect";
    EvDisallow = 26, Error, "Request inappropriate within subscription (monitor) update callback";
    BadMonId = 30, Error, "Bad event subscription (monitor) identifier";
    BadMask = 41, Error, "Invalid event selection mask";
    IoDone = 42, Info, "IO operations have completed";
    IoInProgress = 43, Info, "IO operations are in progress";
    BadSyncGrp = 44, Error, "Invalid synchronous group identifier";
    PutCbInProg = 45, Error, "Put callback timed out";
    NoRdAccess = 46, Warning, "Read access denied";
    NoWtAccess = 47, Warning, "Write access denied";
    Anachronism = 48, Error, "Requested feature is no longer supported";
    NoSearchAddr = 49, Warning, "Empty PV search address list";
    NoConvert = 50, Warning, "No reasonable data conversion between client and server types";
    BadChId = 51, Error, "Invalid channel identifier";
    BadFuncPtr = 52, Error, "Invalid function pointer";
    IsAttached = 53, Warning, "Thread is already attached to a client context";
    UnavailInServ = 54, Warning, "Not supported by attached service";
    ChanDestroy = 55, Warning, "User destroyed channel";
    BadPriority = 56, Error, "Invalid channel priority";
    NotThreaded = 57, Error, "Preemptive callback not enabled - additional threads may not join context";
    Array16kClient = 58, Warning, "Client's protocol revision does not support transfers exceeding 16k bytes";
    ConnSeqTmo = 59, Warning, "Virtual circuit connection sequence aborted";
    UnrespTmo = 60, Warning, "Virtual circuit unresponsive";
}

impl ErrorCondition {
    /// The full ECA status code, combining message number and severity
    pub fn code(&self) -> u32 {
        ((*self as u32) << 3) | self.severity() as u32
    }
}

impl std::fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

impl std::error::Error for ErrorCondition {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbr::{DbrBasicType, DbrCategory};

    #[test]
    fn parse_version() {
        let raw = b"\x00\x00\x00\x00\x00\x01\x00\x0d\x00\x00\x00\x00\x00\x00\x00\x00";
        let (_, ver) = Version::parse(raw).unwrap();
        assert_eq!(ver.priority, 1);
        assert!(ver.is_compatible());
        assert_eq!(ver.as_bytes(), raw);
    }

    #[test]
    fn parse_search() {
        let raw = b"\x00\x06\x00\x08\x00\x0a\x00\x0d\x00\x00\x00\x02\x00\x00\x00\x02BL:TEMP\x00";
        let (rest, search) = Search::parse(raw).unwrap();
        assert!(rest.is_empty());
        assert_eq!(search.channel_name, "BL:TEMP");
        assert!(search.should_reply);
        assert_eq!(search.search_id, 2);
        // A version message is not a search
        let raw = b"\x00\x00\x00\x00\x00\x00\x00\x0d\x00\x00\x00\x00\x00\x00\x00\x00";
        assert!(matches!(
            Search::parse(raw),
            Err(MessageError::IncorrectCommandId(CA_PROTO_VERSION, CA_PROTO_SEARCH))
        ));

        let mut datagram = Version::default().as_bytes();
        datagram.extend(
            Search {
                search_id: 1,
                channel_name: "some".to_string(),
                ..Default::default()
            }
            .as_bytes(),
        );
        let messages = Message::parse_many_server_messages(&datagram).unwrap();
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0], Message::Version(_)));
        let Message::Search(search) = &messages[1] else {
            panic!("Second message was not a search");
        };
        assert_eq!(search.channel_name, "some");
        assert!(!search.should_reply);
    }

    #[test]
    fn search_payload_is_padded() {
        let search = Search {
            search_id: 7,
            channel_name: "EIGHTCHR".to_string(),
            ..Default::default()
        };
        let bytes = search.as_bytes();
        // 8 characters plus the terminator needs two blocks
        assert_eq!(bytes.len(), 16 + 16);
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), 16);
        let (_, back) = Search::parse(&bytes).unwrap();
        assert_eq!(back.channel_name, "EIGHTCHR");
        assert_eq!(back.search_id, 7);
    }

    #[test]
    fn search_response_uses_sender_when_no_ip() {
        let search = Search {
            search_id: 3,
            channel_name: "PV".to_string(),
            ..Default::default()
        };
        let response = search.respond(None, 5064, true);
        let messages = Message::parse_many_client_messages(&response.as_bytes()).unwrap();
        let [Message::SearchResponse(parsed)] = messages.as_slice() else {
            panic!("Expected a single search response, got {messages:?}");
        };
        assert_eq!(parsed.server_ip, None);
        assert_eq!(parsed.port_number, 5064);
        assert_eq!(parsed.search_id, 3);
        assert_eq!(parsed.protocol_version, Some(EPICS_VERSION));
    }

    #[test]
    fn large_header() {
        let raw = RawMessage {
            command: CA_PROTO_READ_NOTIFY,
            field_1_data_type: 2,
            field_2_data_count: 0x10000,
            field_3_parameter_1: 1,
            field_4_parameter_2: 99,
            payload: vec![1u8; 12],
        };
        let bytes = raw.as_bytes();
        assert_eq!(bytes.len(), 24 + 16);
        assert_eq!(&bytes[2..4], &[0xFF, 0xFF]);
        assert_eq!(RawMessage::framed_length(&bytes), Some(40));
        assert_eq!(RawMessage::framed_length(&bytes[..20]), None);
        let (rest, parsed) = RawMessage::parse(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed.field_2_data_count, 0x10000);
        assert_eq!(parsed.field_4_parameter_2, 99);
        assert_eq!(&parsed.payload[..12], &[1u8; 12]);
    }

    #[test]
    fn decoder_waits_for_whole_message() {
        let response = CreateChannel {
            client_id: 4,
            channel_name: "A:B".to_string(),
            ..Default::default()
        }
        .respond(DbrBasicType::Double, 1, 77);
        let bytes = response.as_bytes();
        let mut decoder = ClientMessageDecoder;
        let mut buffer = BytesMut::from(&bytes[..10]);
        assert!(decoder.decode(&mut buffer).unwrap().is_none());
        buffer.extend_from_slice(&bytes[10..]);
        buffer.extend_from_slice(&Echo.as_bytes());
        let Some(Message::CreateChannelResponse(msg)) = decoder.decode(&mut buffer).unwrap() else {
            panic!("Expected a create channel response");
        };
        assert_eq!(msg.client_id, 4);
        assert_eq!(msg.server_id, 77);
        assert_eq!(msg.data_type, DbrBasicType::Double);
        assert!(matches!(
            decoder.decode(&mut buffer).unwrap(),
            Some(Message::Echo)
        ));
        assert!(buffer.is_empty());
    }

    #[test]
    fn read_notify_and_reply() {
        let request = ReadNotify {
            data_type: DbrType {
                basic_type: DbrBasicType::Float,
                category: DbrCategory::Time,
            },
            data_count: 1,
            server_id: 12,
            client_ioid: 4242,
        };
        let messages = Message::parse_many_server_messages(&request.as_bytes()).unwrap();
        assert_eq!(messages, vec![Message::ReadNotify(request.clone())]);

        let dbr = Dbr::Basic(vec![1.5f32].into());
        let response = request.respond(&dbr);
        assert!(response.is_success());
        let (_, Message::ReadNotifyResponse(parsed)) =
            Message::parse_client_message(&response.as_bytes()).unwrap()
        else {
            panic!("Expected read response");
        };
        assert_eq!(parsed.client_ioid, 4242);
        assert_eq!(parsed.data_count, 1);
        assert_eq!(&parsed.data[..4], &1.5f32.to_be_bytes());
    }

    #[test]
    fn bad_access_rights_are_rejected() {
        let raw = RawMessage {
            command: CA_PROTO_ACCESS_RIGHTS,
            field_3_parameter_1: 1,
            field_4_parameter_2: 9,
            ..Default::default()
        };
        assert!(matches!(
            Message::parse_client_message(&raw.as_bytes()),
            Err(MessageError::InvalidField(..))
        ));
    }

    #[test]
    fn error_message_carries_original_request() {
        let original = RawMessage {
            command: CA_PROTO_READ_NOTIFY,
            field_3_parameter_1: 5,
            field_4_parameter_2: 9,
            ..Default::default()
        };
        let error = ECAError {
            client_id: 5,
            status_code: ErrorCondition::GetFail.code(),
            original_request: original.clone(),
            error_message: "read failed".to_string(),
        };
        let (_, Message::ECAError(parsed)) =
            Message::parse_client_message(&error.as_bytes()).unwrap()
        else {
            panic!("Expected error message");
        };
        assert_eq!(parsed.original_request, original);
        assert_eq!(parsed.error_message, "read failed");
        assert_eq!(parsed.condition(), Some(ErrorCondition::GetFail));
    }

    #[test]
    fn eca_codes() {
        assert_eq!(ErrorCondition::Normal.code(), 1);
        assert_eq!(ErrorCondition::Timeout.code(), 80);
        assert_eq!(ErrorCondition::BadType.severity(), ErrorSeverity::Error);
        assert_eq!(
            ErrorCondition::from_code(ErrorCondition::BadChId.code()),
            Some(ErrorCondition::BadChId)
        );
        assert_eq!(ErrorCondition::from_code(0xFFFF_0000), None);
        assert_eq!(
            ErrorCondition::NoRdAccess.to_string(),
            "Read access denied"
        );
    }
}
