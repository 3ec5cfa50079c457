/**
 * ============================================================================
 * FRAME DECODER MODULE
 * ============================================================================
 *
 * PURPOSE: Extract the game message from one raw transport frame
 *
 * WIRE FORMAT:
 * Outer layer (Engine.IO): segments joined by ASCII 0x1E, each segment is
 *   <kind digit><body>
 * Inner layer (Socket.IO): a Message body is
 *   2[/namespace,][ack id digits]["event_name", payload, ...]
 *
 * Only the first Message segment that parses as an EVENT packet is used.
 * A frame never carries more than one relevant event.
 *
 * ============================================================================
 */

use crate::relay::error::ParseError;
use crate::relay::types::{ApplicationMessage, EventEnvelope, PacketKind, SubPacket};
use serde_json::Value;

/// Engine.IO record separator between packets of one payload
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Socket.IO EVENT packet type
pub const EVENT_PACKET_TYPE: u32 = 2;

/**
 * Split a raw frame into sub-packets
 * Empty segments are skipped; calling again restarts from the beginning
 */
pub fn decode(raw_frame: &str) -> impl Iterator<Item = SubPacket<'_>> {
    raw_frame
        .split(RECORD_SEPARATOR)
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            let mut chars = segment.chars();
            // Non-empty segment always has a first char
            let type_char = chars.next().unwrap_or('\0');
            SubPacket {
                kind: PacketKind::from_char(type_char),
                body: chars.as_str(),
            }
        })
}

/**
 * Parse one Message body as a Socket.IO EVENT packet
 */
pub fn parse_event_packet(body: &str) -> Result<EventEnvelope, ParseError> {
    let mut chars = body.chars();
    let type_char = chars.next().ok_or(ParseError::Empty)?;
    let packet_type = type_char
        .to_digit(10)
        .filter(|t| *t == EVENT_PACKET_TYPE)
        .ok_or(ParseError::NotEvent(type_char))?;
    let mut rest = chars.as_str();

    let mut namespace = None;
    if rest.starts_with('/') {
        let end = rest.find(',').ok_or(ParseError::UnterminatedNamespace)?;
        namespace = Some(rest[..end].to_string());
        rest = &rest[end + 1..];
    }

    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    // An ack id too long for u64 is still skipped, just not recorded
    let ack_id = if digits > 0 { rest[..digits].parse::<u64>().ok() } else { None };
    rest = &rest[digits..];

    let data: Value =
        serde_json::from_str(rest).map_err(|e| ParseError::InvalidJson(e.to_string()))?;
    let mut elements = match data {
        Value::Array(elements) if elements.len() >= 2 => elements.into_iter(),
        _ => return Err(ParseError::NotEventArray),
    };

    let event_name = match elements.next() {
        Some(Value::String(name)) => name,
        Some(other) => other.to_string(),
        None => return Err(ParseError::NotEventArray),
    };
    let payload = elements.next().ok_or(ParseError::NotEventArray)?;

    Ok(EventEnvelope {
        packet_type,
        namespace,
        ack_id,
        event_name,
        payload,
    })
}

/**
 * Return the payload of the first EVENT packet in the frame
 * Later events in the same frame are ignored
 */
pub fn decode_event_payload(raw_frame: &str) -> Option<Value> {
    for packet in decode(raw_frame) {
        if packet.kind != PacketKind::Message || packet.body.is_empty() {
            continue;
        }
        match parse_event_packet(packet.body) {
            Ok(envelope) => {
                log::debug!(
                    "Decoded event '{}' (namespace: {:?}, ack: {:?})",
                    envelope.event_name,
                    envelope.namespace,
                    envelope.ack_id
                );
                return Some(envelope.payload);
            }
            Err(e) => {
                log::trace!("Skipping message packet: {}", e);
            }
        }
    }
    None
}

/**
 * Decode the application message embedded in a raw frame
 * Returns None when there is no event or its payload is not a game message
 */
pub fn decode_application_message(raw_frame: &str) -> Option<ApplicationMessage> {
    let payload = decode_event_payload(raw_frame)?;
    match serde_json::from_value::<ApplicationMessage>(payload) {
        Ok(message) => Some(message),
        Err(e) => {
            log::debug!("Event payload is not an application message: {}", e);
            None
        }
    }
}
