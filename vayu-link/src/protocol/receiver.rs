//! Message receivers
//!
//! A receiver owns one accumulation buffer and turns the bytes of a single
//! connection into decoded messages:
//!
//! ```text
//! set_new_datagram(bytes)
//! loop parse_message():
//!     MessageParsed(msg) -> deliver, continue
//!     BadCrc             -> candidate dropped, continue
//!     NoneAvailable      -> wait for more bytes
//! ```
//!
//! [`FixedReceiver`] decodes the compiled message set; the runtime-schema
//! variant lives in [`super::dynamic_receiver`].

use super::frame::{FrameReader, FrameVersion, RawFrame, ReadOutcome};
use super::schema::SchemaRegistry;
use crate::core::types::{DecodedMessage, MessagePayload};
use mavlink::common::MavMessage;
use mavlink::{MavlinkVersion, Message};
use std::sync::Arc;

/// Outcome of one [`MessageReceiver::parse_message`] call
#[derive(Debug)]
pub enum ParseResult {
    MessageParsed(Box<DecodedMessage>),
    /// Checksum/signature invalid or message not decodable; dropped
    BadCrc,
    /// Buffer holds no complete frame
    NoneAvailable,
}

/// Receive counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    pub parsed: u64,
    pub dropped: u64,
}

/// Common interface of both decoding strategies
pub trait MessageReceiver: Send {
    /// Queue bytes just read from the link
    fn set_new_datagram(&mut self, bytes: &[u8]);

    /// Decode the next message from the accumulated bytes
    fn parse_message(&mut self) -> ParseResult;

    fn stats(&self) -> ReceiverStats;

    /// Drain every complete message currently available
    fn drain(&mut self) -> Vec<DecodedMessage> {
        let mut messages = Vec::new();
        loop {
            match self.parse_message() {
                ParseResult::MessageParsed(msg) => messages.push(*msg),
                ParseResult::BadCrc => continue,
                ParseResult::NoneAvailable => break,
            }
        }
        messages
    }
}

/// CRC extra for ids of the compiled message set
pub fn fixed_crc_extra(id: u32) -> Option<u8> {
    MavMessage::default_message_from_id(id)
        .ok()
        .map(|_| MavMessage::extra_crc(id))
}

/// Decoder for the compiled (`mavlink::common`) message set
pub struct FixedReceiver {
    reader: FrameReader,
    /// Used only to locate target ids in the payload
    registry: Option<Arc<SchemaRegistry>>,
    stats: ReceiverStats,
}

impl FixedReceiver {
    pub fn new(registry: Option<Arc<SchemaRegistry>>) -> Self {
        Self {
            reader: FrameReader::new(),
            registry,
            stats: ReceiverStats::default(),
        }
    }

    /// Bytes waiting in the accumulation buffer
    pub fn buffered(&self) -> usize {
        self.reader.buffered()
    }

    fn decode(&self, frame: RawFrame) -> Option<DecodedMessage> {
        let version = match frame.version {
            FrameVersion::V1 => MavlinkVersion::V1,
            FrameVersion::V2 => MavlinkVersion::V2,
        };
        let message = match MavMessage::parse(version, frame.message_id, frame.payload()) {
            Ok(message) => message,
            Err(e) => {
                log::debug!("Failed to decode message id {}: {:?}", frame.message_id, e);
                return None;
            }
        };

        let (target_system_id, target_component_id) = self
            .registry
            .as_ref()
            .and_then(|registry| registry.message(frame.message_id))
            .map(|def| def.target_ids(frame.payload()))
            .unwrap_or((0, 0));

        Some(DecodedMessage {
            connection_id: 0,
            message_id: frame.message_id,
            message_name: message.message_name().to_string(),
            system_id: frame.system_id,
            component_id: frame.component_id,
            sequence: frame.sequence,
            target_system_id,
            target_component_id,
            payload: MessagePayload::Typed(Box::new(message)),
            raw_frame: frame.bytes,
        })
    }
}

impl MessageReceiver for FixedReceiver {
    fn set_new_datagram(&mut self, bytes: &[u8]) {
        self.reader.push(bytes);
    }

    fn parse_message(&mut self) -> ParseResult {
        match self.reader.next_frame(fixed_crc_extra) {
            ReadOutcome::Frame(frame) => match self.decode(frame) {
                Some(message) => {
                    self.stats.parsed += 1;
                    ParseResult::MessageParsed(Box::new(message))
                }
                None => {
                    self.stats.dropped += 1;
                    ParseResult::BadCrc
                }
            },
            ReadOutcome::Dropped => {
                self.stats.dropped += 1;
                ParseResult::BadCrc
            }
            ReadOutcome::Empty => ParseResult::NoneAvailable,
        }
    }

    fn stats(&self) -> ReceiverStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mavlink::MavHeader;
    use mavlink::common::{
        COMMAND_LONG_DATA, HEARTBEAT_DATA, MISSION_REQUEST_INT_DATA, MavAutopilot, MavCmd,
        MavMissionType, MavModeFlag, MavState, MavType,
    };
    use std::io::Cursor;

    fn frame(msg: &MavMessage, sequence: u8) -> Vec<u8> {
        let header = MavHeader {
            system_id: 1,
            component_id: 1,
            sequence,
        };
        let mut buf = Cursor::new(Vec::new());
        mavlink::write_v2_msg(&mut buf, header, msg).unwrap();
        buf.into_inner()
    }

    fn heartbeat() -> MavMessage {
        MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode: 0,
            mavtype: MavType::MAV_TYPE_FIXED_WING,
            autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
            base_mode: MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED,
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        })
    }

    #[test]
    fn test_garbage_then_frame_yields_one_message() {
        let valid = frame(&heartbeat(), 3);

        let mut clean = FixedReceiver::new(None);
        clean.set_new_datagram(&valid);
        let expected = clean.drain();
        assert_eq!(expected.len(), 1);

        let mut noisy = FixedReceiver::new(None);
        noisy.set_new_datagram(&[0x00, 0x42, 0x10, 0x99]);
        noisy.set_new_datagram(&valid);
        let got = noisy.drain();

        assert_eq!(got, expected);
        assert_eq!(noisy.buffered(), 0);
        assert_eq!(got[0].typed(), Some(&heartbeat()));
        assert_eq!(got[0].message_name, "HEARTBEAT");
        assert_eq!(got[0].sequence, 3);
    }

    #[test]
    fn test_byte_by_byte_delivery() {
        let bytes = frame(&heartbeat(), 0);
        let mut receiver = FixedReceiver::new(None);

        let (last, head) = bytes.split_last().unwrap();
        for b in head {
            receiver.set_new_datagram(&[*b]);
            assert!(matches!(receiver.parse_message(), ParseResult::NoneAvailable));
        }
        receiver.set_new_datagram(&[*last]);
        assert!(matches!(receiver.parse_message(), ParseResult::MessageParsed(_)));
    }

    #[test]
    fn test_corrupt_frame_is_counted_and_dropped() {
        let mut bytes = frame(&heartbeat(), 0);
        bytes[12] ^= 0x55;

        let mut receiver = FixedReceiver::new(None);
        receiver.set_new_datagram(&bytes);
        assert!(matches!(receiver.parse_message(), ParseResult::BadCrc));
        assert_eq!(receiver.stats().dropped, 1);
        assert_eq!(receiver.stats().parsed, 0);
    }

    #[test]
    fn test_target_ids_from_registry() {
        let registry = Arc::new(SchemaRegistry::with_builtin().unwrap());
        let command = MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
            target_system: 7,
            target_component: 190,
            command: MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            confirmation: 0,
            param1: 1.0,
            param2: 0.0,
            param3: 0.0,
            param4: 0.0,
            param5: 0.0,
            param6: 0.0,
            param7: 0.0,
        });

        let mut receiver = FixedReceiver::new(Some(registry));
        receiver.set_new_datagram(&frame(&command, 0));
        receiver.set_new_datagram(&frame(&heartbeat(), 1));
        let messages = receiver.drain();

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].target_system_id, 7);
        assert_eq!(messages[0].target_component_id, 190);
        assert_eq!(messages[1].target_system_id, 0);
    }

    #[test]
    fn test_mission_request_keeps_targets_and_extensions() {
        let registry = Arc::new(SchemaRegistry::with_builtin().unwrap());
        let request = MavMessage::MISSION_REQUEST_INT(MISSION_REQUEST_INT_DATA {
            seq: 4,
            target_system: 245,
            target_component: 190,
            mission_type: MavMissionType::MAV_MISSION_TYPE_FENCE,
        });

        let mut receiver = FixedReceiver::new(Some(registry));
        receiver.set_new_datagram(&frame(&request, 0));
        let messages = receiver.drain();

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_name, "MISSION_REQUEST_INT");
        assert_eq!(messages[0].target_system_id, 245);
        assert_eq!(messages[0].target_component_id, 190);
        assert_eq!(messages[0].typed(), Some(&request));
    }
}
