// Packet inspection hook for the connection. The default does nothing.

use crate::ber::{hex_preview, Class, Packet};
use crate::error::{result_code_text, LdapError};
use crate::ldap_protocol::{
    op_name, APP_BIND_RESPONSE, APP_EXTENDED_RESPONSE, APP_INTERMEDIATE_RESPONSE, APP_SEARCH_RESULT_ENTRY,
    APP_SEARCH_RESULT_REFERENCE,
};
use tracing::debug;

/// Sees every outbound envelope and every inbound message of a connection.
pub trait PacketObserver: Send + Sync {
    /// Called with the full envelope before it is written.
    fn on_send(&self, _message_id: i32, _packet: &Packet) {}

    /// Called after an inbound frame decoded successfully.
    fn on_receive(&self, _message_id: i32, _packet: &Packet) {}

    /// Called with the raw bytes of a frame that failed to decode.
    fn on_decode_error(&self, _frame: &[u8], _error: &LdapError) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl PacketObserver for NoopObserver {}

/// Dumps packet trees at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl PacketObserver for TracingObserver {
    fn on_send(&self, message_id: i32, packet: &Packet) {
        debug!("Sending message {}:\n{}", message_id, packet);
    }

    fn on_receive(&self, message_id: i32, packet: &Packet) {
        let mut annotated = packet.clone();
        describe_response(&mut annotated);
        debug!("Received message {}:\n{}", message_id, annotated);
    }

    fn on_decode_error(&self, frame: &[u8], error: &LdapError) {
        debug!("Undecodable frame ({} bytes): {}: {}", frame.len(), error, hex_preview(frame));
    }
}

fn set_description(packet: &mut Packet, index: usize, description: &str) {
    if let Some(child) = packet.children.get_mut(index) {
        child.description = description.to_string();
    }
}

/// Fill in descriptions of a decoded response so its tree dump is readable.
pub fn describe_response(message: &mut Packet) {
    message.description = "LDAP Response".to_string();
    set_description(message, 0, "Message ID");
    if let Some(controls) = message.children.get_mut(2) {
        controls.description = "Controls".to_string();
        for control in controls.children.iter_mut() {
            control.description = "Control".to_string();
            set_description(control, 0, "Control Type");
        }
    }
    let Some(op) = message.children.get_mut(1) else {
        return;
    };
    if op.class != Class::Application {
        return;
    }
    op.description = op_name(op.tag).to_string();
    match op.tag {
        APP_SEARCH_RESULT_ENTRY => {
            set_description(op, 0, "Object Name");
            if let Some(attrs) = op.children.get_mut(1) {
                attrs.description = "Attributes".to_string();
                for attr in attrs.children.iter_mut() {
                    attr.description = "Attribute".to_string();
                    set_description(attr, 0, "Type");
                    set_description(attr, 1, "Values");
                }
            }
        }
        APP_SEARCH_RESULT_REFERENCE => {
            for uri in op.children.iter_mut() {
                uri.description = "URI".to_string();
            }
        }
        APP_INTERMEDIATE_RESPONSE => {
            for child in op.children.iter_mut() {
                child.description = match child.tag {
                    0 => "Response Name".to_string(),
                    _ => "Response Value".to_string(),
                };
            }
        }
        _ if op.is_constructed() && op.children.len() >= 3 => {
            let code = op.children[0].as_integer().ok();
            op.children[0].description = match code {
                Some(code) if code >= 0 => format!("Result Code ({})", result_code_text(code as u32)),
                _ => "Result Code".to_string(),
            };
            set_description(op, 1, "Matched DN");
            set_description(op, 2, "Diagnostic Message");
            let op_tag = op.tag;
            for child in op.children.iter_mut().skip(3) {
                if child.class != Class::Context {
                    continue;
                }
                child.description = match (op_tag, child.tag) {
                    (_, 3) => "Referral",
                    (APP_BIND_RESPONSE, 7) => "Server SASL Credentials",
                    (APP_EXTENDED_RESPONSE, 10) => "Response Name",
                    (APP_EXTENDED_RESPONSE, 11) => "Response Value",
                    _ => continue,
                }
                .to_string();
            }
        }
        _ => {}
    }
}
