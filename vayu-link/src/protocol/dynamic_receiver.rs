//! Runtime-schema receiver
//!
//! Same accumulation discipline as [`FixedReceiver`](super::receiver::FixedReceiver),
//! but message layouts come from the shared [`SchemaRegistry`], so vendor
//! messages loaded at runtime decode into field maps.

use super::frame::{FrameReader, ReadOutcome};
use super::receiver::{MessageReceiver, ParseResult, ReceiverStats};
use super::schema::{MessageDef, SchemaRegistry};
use crate::core::types::{DecodedMessage, MessagePayload};
use std::cell::RefCell;
use std::sync::Arc;

pub struct DynamicReceiver {
    reader: FrameReader,
    registry: Arc<SchemaRegistry>,
    stats: ReceiverStats,
}

impl DynamicReceiver {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self {
            reader: FrameReader::new(),
            registry,
            stats: ReceiverStats::default(),
        }
    }

    pub fn buffered(&self) -> usize {
        self.reader.buffered()
    }
}

impl MessageReceiver for DynamicReceiver {
    fn set_new_datagram(&mut self, bytes: &[u8]) {
        self.reader.push(bytes);
    }

    fn parse_message(&mut self) -> ParseResult {
        let registry = &self.registry;
        // The definition that validated the checksum is the one that decodes,
        // even if a schema load replaces the id meanwhile.
        let checked: RefCell<Option<Arc<MessageDef>>> = RefCell::new(None);
        let outcome = self.reader.next_frame(|id| {
            let def = registry.message(id);
            let crc_extra = def.as_ref().map(|def| def.crc_extra);
            *checked.borrow_mut() = def;
            crc_extra
        });
        let frame = match outcome {
            ReadOutcome::Frame(frame) => frame,
            ReadOutcome::Dropped => {
                self.stats.dropped += 1;
                return ParseResult::BadCrc;
            }
            ReadOutcome::Empty => return ParseResult::NoneAvailable,
        };

        let Some(def) = checked
            .into_inner()
            .filter(|def| def.id == frame.message_id)
        else {
            self.stats.dropped += 1;
            return ParseResult::BadCrc;
        };

        let (target_system_id, target_component_id) = def.target_ids(frame.payload());
        let fields = def.decode(frame.payload());
        self.stats.parsed += 1;

        ParseResult::MessageParsed(Box::new(DecodedMessage {
            connection_id: 0,
            message_id: frame.message_id,
            message_name: def.name.clone(),
            system_id: frame.system_id,
            component_id: frame.component_id,
            sequence: frame.sequence,
            target_system_id,
            target_component_id,
            payload: MessagePayload::Fields(fields),
            raw_frame: frame.bytes,
        }))
    }

    fn stats(&self) -> ReceiverStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FieldValue;
    use crate::protocol::frame::build_v2_frame;
    use mavlink::MavHeader;
    use mavlink::common::{
        ATTITUDE_DATA, GPS_RAW_INT_DATA, GpsFixType, MavMessage, MavSeverity, STATUSTEXT_DATA,
    };
    use std::io::Cursor;

    fn frame(msg: &MavMessage) -> Vec<u8> {
        let header = MavHeader {
            system_id: 1,
            component_id: 1,
            sequence: 0,
        };
        let mut buf = Cursor::new(Vec::new());
        mavlink::write_v2_msg(&mut buf, header, msg).unwrap();
        buf.into_inner()
    }

    fn builtin() -> Arc<SchemaRegistry> {
        Arc::new(SchemaRegistry::with_builtin().unwrap())
    }

    #[test]
    fn test_decodes_reference_frame() {
        let msg = MavMessage::ATTITUDE(ATTITUDE_DATA {
            time_boot_ms: 5000,
            roll: 0.5,
            pitch: f32::NAN,
            yaw: -1.25,
            rollspeed: 0.0,
            pitchspeed: 0.0,
            yawspeed: 0.0,
        });

        let mut receiver = DynamicReceiver::new(builtin());
        receiver.set_new_datagram(&[0x11, 0x22]);
        receiver.set_new_datagram(&frame(&msg));
        let messages = receiver.drain();

        assert_eq!(messages.len(), 1);
        let attitude = &messages[0];
        assert_eq!(attitude.message_name, "ATTITUDE");
        assert_eq!(attitude.field("time_boot_ms"), Some(&FieldValue::UInt(5000)));
        assert_eq!(attitude.field("roll"), Some(&FieldValue::Float(0.5)));
        assert_eq!(attitude.field("pitch"), Some(&FieldValue::Null));
        // Truncated trailing zeros restored
        assert_eq!(attitude.field("yawspeed"), Some(&FieldValue::Float(0.0)));
        assert_eq!(receiver.buffered(), 0);

        let json = attitude.to_json().unwrap();
        assert!(json.starts_with(r#"{"message_id":30,"message_name":"ATTITUDE","time_boot_ms":5000"#));
        assert!(json.contains(r#""pitch":null"#));
    }

    #[test]
    fn test_statustext_renders_string() {
        let mut text = [0u8; 50];
        text[..5].copy_from_slice(b"Armed");
        let msg = MavMessage::STATUSTEXT(STATUSTEXT_DATA {
            severity: MavSeverity::MAV_SEVERITY_INFO,
            text: text.into(),
            id: 0,
            chunk_seq: 0,
        });

        let mut receiver = DynamicReceiver::new(builtin());
        receiver.set_new_datagram(&frame(&msg));
        let messages = receiver.drain();
        assert_eq!(messages[0].field("text"), Some(&FieldValue::Text("Armed".to_string())));
        assert_eq!(messages[0].field("severity"), Some(&FieldValue::UInt(6)));
    }

    #[test]
    fn test_unknown_message_until_schema_loaded() {
        let registry = builtin();
        let mut receiver = DynamicReceiver::new(Arc::clone(&registry));

        let xml = r#"<mavlink><messages>
            <message id="50001" name="VENDOR_PING">
              <field type="uint32_t" name="counter"/>
              <field type="uint8_t" name="target_system"/>
            </message>
          </messages></mavlink>"#;

        // Build with the CRC extra the definition will have.
        let scratch = SchemaRegistry::new();
        scratch.load_xml(xml).unwrap();
        let extra = scratch.crc_extra(50001).unwrap();
        let bytes = build_v2_frame(0, 9, 1, 50001, extra, &[7, 0, 0, 0, 42]);

        receiver.set_new_datagram(&bytes);
        assert!(receiver.drain().is_empty());
        assert!(receiver.stats().dropped >= 1);

        registry.load_xml(xml).unwrap();
        let mut receiver = DynamicReceiver::new(registry);
        receiver.set_new_datagram(&bytes);
        let messages = receiver.drain();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_name, "VENDOR_PING");
        assert_eq!(messages[0].field("counter"), Some(&FieldValue::UInt(7)));
        assert_eq!(messages[0].target_system_id, 42);
        assert_eq!(messages[0].system_id, 9);
    }

    #[test]
    fn test_decodes_common_message_with_extensions() {
        let msg = MavMessage::GPS_RAW_INT(GPS_RAW_INT_DATA {
            lat: 473_977_420,
            lon: 85_455_940,
            fix_type: GpsFixType::GPS_FIX_TYPE_3D_FIX,
            satellites_visible: 11,
            yaw: 36_000,
            ..Default::default()
        });

        let mut receiver = DynamicReceiver::new(builtin());
        receiver.set_new_datagram(&frame(&msg));
        let messages = receiver.drain();

        assert_eq!(messages.len(), 1);
        assert_eq!(receiver.stats().dropped, 0);
        let gps = &messages[0];
        assert_eq!(gps.message_name, "GPS_RAW_INT");
        assert_eq!(gps.field("lat"), Some(&FieldValue::Int(473_977_420)));
        assert_eq!(gps.field("fix_type"), Some(&FieldValue::UInt(3)));
        assert_eq!(gps.field("satellites_visible"), Some(&FieldValue::UInt(11)));
        assert_eq!(gps.field("yaw"), Some(&FieldValue::UInt(36_000)));
    }

    #[test]
    fn test_redefined_message_does_not_decode_old_frames() {
        let registry = Arc::new(SchemaRegistry::new());
        let old_xml = r#"<message id="50002" name="VENDOR_LEVEL">
              <field type="uint16_t" name="level"/>
            </message>"#;
        let new_xml = r#"<message id="50002" name="VENDOR_LEVEL">
              <field type="uint8_t" name="channel"/>
              <field type="uint8_t" name="level"/>
            </message>"#;

        registry.load_xml(old_xml).unwrap();
        let old_extra = registry.crc_extra(50002).unwrap();
        let old_frame = build_v2_frame(0, 1, 1, 50002, old_extra, &[0x34, 0x12]);

        let mut receiver = DynamicReceiver::new(Arc::clone(&registry));
        receiver.set_new_datagram(&old_frame);
        let messages = receiver.drain();
        assert_eq!(messages[0].field("level"), Some(&FieldValue::UInt(0x1234)));

        registry.load_xml(new_xml).unwrap();
        let new_extra = registry.crc_extra(50002).unwrap();
        assert_ne!(new_extra, old_extra);
        let new_frame = build_v2_frame(1, 1, 1, 50002, new_extra, &[2, 9]);

        // Frames built for the old layout fail the checksum instead of being
        // decoded with the new one.
        receiver.set_new_datagram(&old_frame);
        receiver.set_new_datagram(&new_frame);
        let messages = receiver.drain();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sequence, 1);
        assert_eq!(messages[0].field("channel"), Some(&FieldValue::UInt(2)));
        assert_eq!(messages[0].field("level"), Some(&FieldValue::UInt(9)));
    }
}
