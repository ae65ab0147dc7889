//! Filter chain.
//!
//! Filters are named module instances owned by a service; each client
//! session gets its own filter-session objects which see every query and
//! every reply. Filters cannot fail across the component boundary: each
//! hook returns an action, never panics.

use std::collections::HashMap;
use std::sync::Arc;

use bitflags::bitflags;
use bytes::{Bytes, BytesMut};
use tracing::info;

use crate::protocol::{get_lenenc_int, get_lenenc_str, put_lenenc_str, ErrPacket, Packet};

bitflags! {
    /// Routing capabilities; a service's set is the union of its router's
    /// and every filter's
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Capabilities: u64 {
        /// A query packet must reach the router contiguous in memory
        const CONTIGUOUS_INPUT = 1;
        const CONTIGUOUS_OUTPUT = 1 << 1;
        const TRANSACTION_TRACKING = 1 << 2;
        const REQUEST_TRACKING = 1 << 3;
        const PACKET_OUTPUT = 1 << 4;
        const RUNTIME_CONFIG = 1 << 5;
    }
}

/// What a filter decided about a query
pub enum FilterAction {
    /// Pass the (possibly rewritten) packet down the chain
    Continue(Packet),
    /// Short-circuit with an error to the client
    Block(ErrPacket),
}

/// Per-session filter instance
pub trait FilterSession: Send + Sync {
    /// Called for every client packet on its way to the router
    fn route_query(&mut self, packet: Packet) -> FilterAction {
        FilterAction::Continue(packet)
    }

    /// Called for every reply packet on its way to the client
    fn client_reply(&mut self, packet: Packet) -> Packet {
        packet
    }
}

/// A filter module instance, shared by all sessions of a service
pub trait Filter: Send + Sync {
    fn name(&self) -> &str;
    fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }
    fn new_session(&self) -> Box<dyn FilterSession>;
    /// Masking filters comparing string arguments against field names
    /// force the classifier cache off
    fn disables_classifier_cache(&self) -> bool {
        false
    }
}

/// Named filter definition from config or the runtime plane
#[derive(Debug, Clone)]
pub struct FilterDef {
    pub name: String,
    pub module: String,
    pub parameters: HashMap<String, String>,
}

/// Instantiate a filter module
pub fn build_filter(def: &FilterDef) -> Result<Arc<dyn Filter>, String> {
    match def.module.as_str() {
        "qlafilter" => Ok(Arc::new(QueryLogFilter {
            name: def.name.clone(),
        })),
        "masking" => {
            let columns: Vec<String> = def
                .parameters
                .get("columns")
                .map(|v| v.split(',').map(|c| c.trim().to_string()).collect())
                .unwrap_or_default();
            let treat_string_arg_as_field = def
                .parameters
                .get("treat_string_arg_as_field")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false);
            Ok(Arc::new(MaskingFilter {
                name: def.name.clone(),
                columns,
                treat_string_arg_as_field,
            }))
        }
        other => Err(format!("Unknown filter module '{}'", other)),
    }
}

/// Logs every routed query
pub struct QueryLogFilter {
    name: String,
}

impl Filter for QueryLogFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::CONTIGUOUS_INPUT
    }

    fn new_session(&self) -> Box<dyn FilterSession> {
        Box::new(QueryLogSession {
            filter_name: self.name.clone(),
        })
    }
}

struct QueryLogSession {
    filter_name: String,
}

impl FilterSession for QueryLogSession {
    fn route_query(&mut self, packet: Packet) -> FilterAction {
        if packet.first_byte() == Some(0x03) {
            let sql = String::from_utf8_lossy(&packet.payload[1..]);
            info!(filter = %self.filter_name, sql = %sql, "query");
        }
        FilterAction::Continue(packet)
    }
}

/// Replaces the values of configured columns in result rows with asterisks
pub struct MaskingFilter {
    name: String,
    columns: Vec<String>,
    treat_string_arg_as_field: bool,
}

impl Filter for MaskingFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::CONTIGUOUS_INPUT | Capabilities::CONTIGUOUS_OUTPUT
    }

    fn new_session(&self) -> Box<dyn FilterSession> {
        Box::new(MaskingSession {
            columns: self.columns.clone(),
            reply_state: MaskReplyState::Start,
            field_count: 0,
            fields_seen: 0,
            masked_indices: Vec::new(),
        })
    }

    fn disables_classifier_cache(&self) -> bool {
        self.treat_string_arg_as_field
    }
}

enum MaskReplyState {
    Start,
    Fields,
    Rows,
}

struct MaskingSession {
    columns: Vec<String>,
    reply_state: MaskReplyState,
    field_count: u64,
    fields_seen: u64,
    masked_indices: Vec<usize>,
}

impl FilterSession for MaskingSession {
    fn route_query(&mut self, packet: Packet) -> FilterAction {
        // A new command restarts reply tracking
        self.reply_state = MaskReplyState::Start;
        self.fields_seen = 0;
        self.masked_indices.clear();
        FilterAction::Continue(packet)
    }

    fn client_reply(&mut self, packet: Packet) -> Packet {
        match self.reply_state {
            MaskReplyState::Start => {
                match packet.first_byte() {
                    Some(0x00) | Some(0xFF) | Some(0xFE) | Some(0xFB) | None => {}
                    Some(_) => {
                        if let Some((count, _)) = get_lenenc_int(&packet.payload) {
                            self.field_count = count;
                            self.fields_seen = 0;
                            self.reply_state = MaskReplyState::Fields;
                        }
                    }
                }
                packet
            }
            MaskReplyState::Fields => {
                if packet.first_byte() == Some(0xFE) && packet.payload.len() < 9 {
                    self.reply_state = MaskReplyState::Rows;
                    return packet;
                }
                if let Some(name) = column_name(&packet.payload) {
                    if self.columns.iter().any(|c| c.eq_ignore_ascii_case(&name)) {
                        self.masked_indices.push(self.fields_seen as usize);
                    }
                }
                self.fields_seen += 1;
                if self.fields_seen == self.field_count {
                    self.reply_state = MaskReplyState::Rows;
                }
                packet
            }
            MaskReplyState::Rows => {
                if packet.first_byte() == Some(0xFE) && packet.payload.len() < 9 {
                    self.reply_state = MaskReplyState::Start;
                    return packet;
                }
                if self.masked_indices.is_empty() {
                    return packet;
                }
                mask_row(&packet, &self.masked_indices, self.field_count as usize)
            }
        }
    }
}

/// Column display name: the fifth length-encoded string in a definition
fn column_name(payload: &[u8]) -> Option<String> {
    let mut rest = payload;
    for i in 0..5 {
        let (s, n) = get_lenenc_str(rest)?;
        if i == 4 {
            return Some(s);
        }
        rest = &rest[n..];
    }
    None
}

fn mask_row(packet: &Packet, masked: &[usize], columns: usize) -> Packet {
    let mut out = BytesMut::new();
    let mut rest: &[u8] = &packet.payload;

    for idx in 0..columns {
        if rest.first() == Some(&0xFB) {
            out.extend_from_slice(&[0xFB]);
            rest = &rest[1..];
            continue;
        }
        match get_lenenc_str(rest) {
            Some((value, n)) => {
                if masked.contains(&idx) {
                    put_lenenc_str(&mut out, &"*".repeat(value.chars().count()));
                } else {
                    out.extend_from_slice(&rest[..n]);
                }
                rest = &rest[n..];
            }
            None => {
                out.extend_from_slice(rest);
                break;
            }
        }
    }

    Packet::new(packet.sequence_id, Bytes::from(out.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field_packet(name: &str) -> Packet {
        let mut buf = BytesMut::new();
        for s in ["def", "db", "t", "t", name, name] {
            put_lenenc_str(&mut buf, s);
        }
        Packet::new(2, buf.freeze())
    }

    fn row_packet(values: &[&str]) -> Packet {
        let mut buf = BytesMut::new();
        for v in values {
            put_lenenc_str(&mut buf, v);
        }
        Packet::new(5, buf.freeze())
    }

    fn eof() -> Packet {
        Packet::new(4, vec![0xFEu8, 0, 0, 2, 0])
    }

    fn masking_session(columns: &[&str]) -> Box<dyn FilterSession> {
        let def = FilterDef {
            name: "mask".to_string(),
            module: "masking".to_string(),
            parameters: HashMap::from([(
                "columns".to_string(),
                columns.join(","),
            )]),
        };
        build_filter(&def).unwrap().new_session()
    }

    #[test]
    fn test_masking_replaces_configured_column() {
        let mut session = masking_session(&["ssn"]);

        // resultset: 2 columns (name, ssn), one row
        session.client_reply(Packet::new(1, vec![2u8]));
        session.client_reply(field_packet("name"));
        session.client_reply(field_packet("ssn"));
        session.client_reply(eof());

        let masked = session.client_reply(row_packet(&["alice", "123-45-6789"]));
        let (first, n) = get_lenenc_str(&masked.payload).unwrap();
        assert_eq!(first, "alice");
        let (second, _) = get_lenenc_str(&masked.payload[n..]).unwrap();
        assert_eq!(second, "***********");
    }

    #[test]
    fn test_masking_leaves_other_columns() {
        let mut session = masking_session(&["secret"]);
        session.client_reply(Packet::new(1, vec![1u8]));
        session.client_reply(field_packet("plain"));
        session.client_reply(eof());

        let row = row_packet(&["visible"]);
        let out = session.client_reply(row.clone());
        assert_eq!(out.payload, row.payload);
    }

    #[test]
    fn test_masking_passes_ok_packets() {
        let mut session = masking_session(&["ssn"]);
        let ok = Packet::new(1, vec![0x00u8, 0, 0, 2, 0, 0, 0]);
        let out = session.client_reply(ok.clone());
        assert_eq!(out.payload, ok.payload);
    }

    #[test]
    fn test_query_log_filter_passthrough() {
        let def = FilterDef {
            name: "log".to_string(),
            module: "qlafilter".to_string(),
            parameters: HashMap::new(),
        };
        let filter = build_filter(&def).unwrap();
        let mut session = filter.new_session();

        let packet = Packet::query("SELECT 1");
        match session.route_query(packet.clone()) {
            FilterAction::Continue(p) => assert_eq!(p.payload, packet.payload),
            FilterAction::Block(_) => panic!("should not block"),
        }
    }

    #[test]
    fn test_unknown_module_rejected() {
        let def = FilterDef {
            name: "x".to_string(),
            module: "no_such_module".to_string(),
            parameters: HashMap::new(),
        };
        assert!(build_filter(&def).is_err());
    }

    #[test]
    fn test_cache_disable_flag() {
        let def = FilterDef {
            name: "mask".to_string(),
            module: "masking".to_string(),
            parameters: HashMap::from([
                ("columns".to_string(), "a".to_string()),
                ("treat_string_arg_as_field".to_string(), "true".to_string()),
            ]),
        };
        let filter = build_filter(&def).unwrap();
        assert!(filter.disables_classifier_cache());
    }
}
