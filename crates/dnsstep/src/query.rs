//! DNS query construction and response classification.

use std::str::FromStr;

use rand::Rng;
use trust_dns_resolver::proto::{
    error::ProtoError,
    op::{Message, MessageType, OpCode, Query, ResponseCode},
    rr::{Name, RecordType},
    serialize::binary::BinEncodable,
};

/// Builds an encoded query message for one question.
///
/// The question class is always `IN`.
pub fn create_query(
    hostname: &str,
    record_type: RecordType,
    id: u16,
    recursion_desired: bool,
) -> Result<Vec<u8>, QueryError> {
    let name = Name::from_ascii(hostname).map_err(|_| QueryError::BadName)?;
    let mut message = Message::new();

    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(recursion_desired)
        .add_query(Query::query(name, record_type));

    Ok(message.to_bytes()?)
}

/// Reads the query ID from an encoded message.
pub fn message_id(message: &[u8]) -> Option<u16> {
    match message {
        [high, low, ..] => Some(u16::from_be_bytes([*high, *low])),
        _ => None,
    }
}

/// Generates a random query ID.
pub fn random_id() -> u16 {
    rand::thread_rng().gen()
}

/// Parses a record type given as a mnemonic (`AAAA`) or a number (`28`).
pub fn parse_record_type(record_type: &str) -> Result<RecordType, QueryError> {
    if let Ok(value) = record_type.parse::<u16>() {
        return Ok(RecordType::from(value));
    }

    RecordType::from_str(&record_type.to_ascii_uppercase())
        .map_err(|_| QueryError::BadRecordType(record_type.to_string()))
}

/// Decodes a response and maps negative response codes to errors.
pub fn classify_response(response: &[u8]) -> Result<Message, QueryError> {
    let message = Message::from_vec(response).map_err(|_| QueryError::BadResponse)?;

    if message.message_type() != MessageType::Response {
        return Err(QueryError::BadResponse);
    }

    match message.response_code() {
        ResponseCode::NoError => Ok(message),
        ResponseCode::NXDomain => Err(QueryError::NoName),
        response_code => Err(QueryError::Negative(response_code.to_str())),
    }
}

/// Query failures delivered to query callbacks.
#[derive(thiserror::Error, Debug)]
pub enum QueryError {
    /// Non-existent domain.
    #[error("non-existent domain")]
    NoName,

    /// Other negative response.
    #[error("negative response: {0}")]
    Negative(&'static str),

    /// The response could not be decoded.
    #[error("malformed response")]
    BadResponse,

    /// The hostname is not a valid domain name.
    #[error("invalid hostname")]
    BadName,

    /// The encoded query is too short to carry a message ID.
    #[error("malformed query")]
    BadQuery,

    /// The record type is not recognized.
    #[error("unknown record type {0}")]
    BadRecordType(String),

    /// No response was received within the allowed attempts.
    #[error("query timed out")]
    Timeout,

    /// The query was cancelled before completion.
    #[error("query cancelled")]
    Cancelled,

    /// The channel was dropped before the query completed.
    #[error("channel destroyed")]
    Destroyed,

    /// Standard IO error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Message encoding error.
    #[error(transparent)]
    Encode(#[from] ProtoError),
}
