//! Wire-image builders for datagrams, commands, and logical messages.
//!
//! The meter is passive and never transmits, but building byte-exact wire
//! images is how the transport and classifier are tested and how capture
//! fixtures are synthesized. Layouts here are the single source of truth
//! shared with the parsing side.

use crate::photon::protocol16::{encode_params, encode_value, ParamMap, Value};

use super::message::{MessageKind, SIGNATURE};
use super::transport::{CMD_FRAGMENT, CMD_RELIABLE, CMD_UNRELIABLE};

/// Wrap commands into a datagram: peer id, crc flag, command count.
pub fn datagram(commands: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&1u16.to_be_bytes());
    out.push(0); // crc disabled
    out.push(commands.len() as u8);
    for command in commands {
        out.extend_from_slice(command);
    }
    out
}

pub fn reliable_command(channel: u8, seq: i32, body: &[u8]) -> Vec<u8> {
    command(CMD_RELIABLE, channel, seq, body)
}

pub fn unreliable_command(channel: u8, body: &[u8]) -> Vec<u8> {
    command(CMD_UNRELIABLE, channel, 0, body)
}

fn command(command_type: u8, channel: u8, seq: i32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(command_type);
    out.push(channel);
    out.push(0); // flags
    out.push(0); // reserved
    out.extend_from_slice(&((12 + body.len()) as i32).to_be_bytes());
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// Split a message into `n` fragment commands in ascending fragment order.
pub fn fragment_commands(channel: u8, sequence: i32, message: &[u8], n: usize) -> Vec<Vec<u8>> {
    let n = n.max(1);
    let chunk = message.len().div_ceil(n);
    let mut out = Vec::with_capacity(n);
    for number in 0..n {
        let start = number * chunk;
        let end = (start + chunk).min(message.len());
        out.push(fragment_command_raw(
            channel,
            sequence,
            n as i32,
            number as i32,
            message.len() as i32,
            start as i32,
            &message[start..end],
        ));
    }
    out
}

pub fn fragment_command_raw(
    channel: u8,
    sequence: i32,
    fragment_count: i32,
    fragment_number: i32,
    total_length: i32,
    fragment_offset: i32,
    bytes: &[u8],
) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&sequence.to_be_bytes());
    body.extend_from_slice(&fragment_count.to_be_bytes());
    body.extend_from_slice(&fragment_number.to_be_bytes());
    body.extend_from_slice(&total_length.to_be_bytes());
    body.extend_from_slice(&fragment_offset.to_be_bytes());
    body.extend_from_slice(bytes);
    command(CMD_FRAGMENT, channel, sequence, &body)
}

/// Build a logical message body: signature, kind, code, payload dictionary.
pub fn message_body(kind: MessageKind, code: u8, params: &ParamMap) -> Vec<u8> {
    let mut out = vec![SIGNATURE, kind.wire_type()];
    out.push(code);
    if kind == MessageKind::Response {
        out.extend_from_slice(&0i16.to_be_bytes());
        encode_value(&Value::Str(String::new()), &mut out).expect("empty debug string encodes");
    }
    encode_params(params, &mut out).expect("fixture params encode");
    out
}

/// Response body with explicit return code and debug text.
pub fn response_body(code: u8, return_code: i16, debug: &str, params: &ParamMap) -> Vec<u8> {
    let mut out = vec![SIGNATURE, MessageKind::Response.wire_type()];
    out.push(code);
    out.extend_from_slice(&return_code.to_be_bytes());
    encode_value(&Value::Str(debug.to_string()), &mut out).expect("debug string encodes");
    encode_params(params, &mut out).expect("fixture params encode");
    out
}
