//! Virtual connection driven by the application (`raw://`)
//!
//! Bytes the application received over its own transport go in through
//! [`RawConnection::receive`]. Frames sent on this connection are handed to
//! the [`RawSender`] instead of a socket.

use super::{Connection, ConnectionCore};
use crate::connection_url::ConnectionDescriptor;
use crate::error::ConnectionError;
use std::sync::Arc;

/// Destination of frames sent over a raw connection
pub type RawSender = Arc<dyn Fn(&[u8]) + Send + Sync>;

pub struct RawConnection {
    core: ConnectionCore,
    descriptor: ConnectionDescriptor,
    sender: Option<RawSender>,
}

impl RawConnection {
    pub fn new(core: ConnectionCore, descriptor: ConnectionDescriptor, sender: Option<RawSender>) -> Self {
        Self {
            core,
            descriptor,
            sender,
        }
    }

    /// Feed bytes received outside the SDK; decoded on the caller's thread
    pub fn receive(&self, bytes: &[u8]) {
        self.core.process_bytes(bytes);
    }
}

impl Connection for RawConnection {
    fn core(&self) -> &ConnectionCore {
        &self.core
    }

    fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    fn start(&self) -> Result<(), ConnectionError> {
        Ok(())
    }

    fn stop(&self) -> Result<(), ConnectionError> {
        Ok(())
    }

    fn send_raw_bytes(&self, bytes: &[u8]) -> Result<(), String> {
        match &self.sender {
            Some(sender) => {
                sender(bytes);
                Ok(())
            }
            None => Err("raw connection has no sender".to_string()),
        }
    }

    fn as_raw(&self) -> Option<&RawConnection> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionContext, ForwardingOption, MessageSink};
    use crate::core::types::DecodedMessage;
    use crate::protocol::SchemaRegistry;
    use crate::protocol::frame::build_v2_frame;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Names(Mutex<Vec<String>>);

    impl MessageSink for Names {
        fn on_message(&self, message: DecodedMessage) {
            self.0.lock().push(message.message_name);
        }
    }

    #[test]
    fn test_send_goes_to_sender_and_receive_decodes() {
        let sink = Arc::new(Names::default());
        let dyn_sink: Arc<dyn MessageSink> = sink.clone();
        let mut context = ConnectionContext::new(
            Arc::downgrade(&dyn_sink),
            Arc::new(SchemaRegistry::with_builtin().unwrap()),
        );
        context.dynamic_decoding = false;

        let sent = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&sent);
        let sender: RawSender = Arc::new(move |bytes: &[u8]| captured.lock().push(bytes.to_vec()));

        let core = ConnectionCore::new(1, &context, ForwardingOption::ForwardingOff);
        let raw = RawConnection::new(core, ConnectionDescriptor::Raw, Some(sender));
        raw.start().unwrap();

        raw.send_raw_bytes(&[1, 2, 3]).unwrap();
        assert_eq!(*sent.lock(), vec![vec![1, 2, 3]]);

        // PARAM_REQUEST_LIST, crc_extra 159
        raw.receive(&build_v2_frame(0, 1, 1, 21, 159, &[1, 1]));
        assert_eq!(*sink.0.lock(), vec!["PARAM_REQUEST_LIST".to_string()]);
        assert!(raw.has_system_id(1));
    }
}
