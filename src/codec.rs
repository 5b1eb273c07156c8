use crate::prelude::*;
use crate::error::{DeviceResult, Error};
use crate::register::{Register, WriteAck};

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use std::collections::HashMap;

/// Tag id -> human readable description, used to annotate parsed registers.
pub type ParamMap = HashMap<String, String>;

const REGISTER_ELEMENT: &[u8] = b"reg";

/// Decodes a `getregister.cgi` response. Elements without a tag id or value
/// are skipped; a document that cannot be parsed is an error.
pub fn parse_registers(xml: &str, params: &ParamMap) -> DeviceResult<Vec<Register>> {
    let mut registers = Vec::new();

    for_each_register(xml, |attrs| {
        let tag_id = attrs.get("tid").map(String::as_str);
        let description = tag_id.and_then(|t| params.get(t)).cloned();

        match Register::from_raw(
            tag_id,
            attrs.get("v").map(String::as_str),
            attrs.get("min").map(String::as_str),
            attrs.get("max").map(String::as_str),
            description,
        ) {
            Some(register) => registers.push(register),
            None => trace!("skipping incomplete register element {:?}", attrs),
        }
    })?;

    Ok(registers)
}

/// Decodes a `getregister.cgi` response into (tag id, raw value text) pairs
/// without coercion, for values whose exact spelling matters.
pub fn parse_raw_values(xml: &str) -> DeviceResult<Vec<(String, String)>> {
    let mut values = Vec::new();

    for_each_register(xml, |attrs| {
        if let (Some(tag_id), Some(value)) = (attrs.get("tid"), attrs.get("v")) {
            if !tag_id.is_empty() {
                values.push((tag_id.clone(), value.clone()));
            }
        }
    })?;

    Ok(values)
}

/// Decodes a `setregister.cgi` response into one ack per complete element.
pub fn parse_write_acks(xml: &str) -> DeviceResult<Vec<WriteAck>> {
    let mut acks = Vec::new();

    for_each_register(xml, |attrs| {
        match WriteAck::from_raw(
            attrs.get("vid").map(String::as_str),
            attrs.get("tid").map(String::as_str),
            attrs.get("status").map(String::as_str),
        ) {
            Some(ack) => acks.push(ack),
            None => trace!("skipping incomplete write ack element {:?}", attrs),
        }
    })?;

    Ok(acks)
}

fn for_each_register<F>(xml: &str, mut f: F) -> DeviceResult<()>
where
    F: FnMut(&HashMap<String, String>),
{
    let mut reader = Reader::from_str(xml);
    let mut seen_root = false;
    let mut depth = 0usize;

    loop {
        let event = reader.read_event().map_err(|e| {
            Error::Protocol(format!("at position {}: {}", reader.buffer_position(), e))
        })?;

        match &event {
            Event::Start(e) | Event::Empty(e) => {
                if depth == 0 {
                    if seen_root {
                        return Err(Error::Protocol(format!(
                            "second root element at position {}",
                            reader.buffer_position()
                        )));
                    }
                    seen_root = true;
                }
                if e.name().as_ref() == REGISTER_ELEMENT {
                    f(&attributes(e)?);
                }
                if matches!(event, Event::Start(_)) {
                    depth += 1;
                }
            }
            Event::End(_) => depth = depth.saturating_sub(1),
            Event::Eof => break,
            _ => {}
        }
    }

    if !seen_root {
        return Err(Error::Protocol("document has no root element".to_string()));
    }
    if depth != 0 {
        return Err(Error::Protocol(format!(
            "document truncated with {} element(s) still open",
            depth
        )));
    }

    Ok(())
}

fn attributes(element: &BytesStart) -> DeviceResult<HashMap<String, String>> {
    let mut r = HashMap::new();

    for attr in element.attributes() {
        let attr = attr.map_err(|e| Error::Protocol(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| Error::Protocol(e.to_string()))?;
        r.insert(key, value.into_owned());
    }

    Ok(r)
}
