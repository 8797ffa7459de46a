//! Parser for the meter's instantaneous register XML
//!
//! The payload is a flat list of `<r>` elements. Each carries the register
//! name in `n`, an optional register type in `rt`, the instantaneous power
//! in `<i>` (watts, negative for consumption), and the lifetime register
//! value in `<v>` (watt-seconds). Registers appear in arbitrary order and
//! unknown registers are kept; the one hard requirement is a `rt="total"`
//! usage register for the whole house.

use crate::{FetchError, FetchResult, MeterSample, RegisterValue};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;
use watt_core::Timestamp;

const WS_PER_KWH: f64 = 3_600_000.0;

#[derive(Clone, Copy, PartialEq)]
enum Field {
    None,
    Inst,
    Value,
}

struct PendingRegister {
    name: String,
    is_total: bool,
}

/// Parse one instantaneous payload, stamping the sample with `ts`.
pub fn parse_instantaneous(body: &str, ts: Timestamp) -> FetchResult<MeterSample> {
    let mut reader = Reader::from_str(body);

    let mut registers = HashMap::new();
    let mut total_usage_w: Option<f64> = None;

    let mut current: Option<PendingRegister> = None;
    let mut field = Field::None;
    let mut inst: Option<f64> = None;
    let mut value_ws: Option<f64> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"r" => {
                    let name = attr(&e, b"n")?.unwrap_or_default();
                    let rt = attr(&e, b"rt")?;
                    current = Some(PendingRegister {
                        name,
                        is_total: rt.as_deref() == Some("total"),
                    });
                    inst = None;
                    value_ws = None;
                }
                b"i" if current.is_some() => field = Field::Inst,
                b"v" if current.is_some() => field = Field::Value,
                _ => {}
            },
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| FetchError::MalformedPayload(format!("xml text: {e}")))?;
                match field {
                    Field::Inst => inst = text.trim().parse::<f64>().ok(),
                    Field::Value => value_ws = text.trim().parse::<f64>().ok(),
                    Field::None => {}
                }
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"i" | b"v" => field = Field::None,
                b"r" => {
                    if let (Some(reg), Some(watts)) = (current.take(), inst) {
                        if reg.is_total {
                            if reg.name.contains("Usage") {
                                total_usage_w = Some(watts);
                            }
                        } else if !reg.name.contains("Total Power") {
                            registers.insert(
                                reg.name,
                                RegisterValue {
                                    watts: watts.abs(),
                                    cumulative_kwh: value_ws.map(|v| (v / WS_PER_KWH).abs()),
                                },
                            );
                        }
                    }
                    current = None;
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(FetchError::MalformedPayload(format!("xml: {e}"))),
        }
    }

    let total_usage_w = total_usage_w.ok_or_else(|| {
        FetchError::MalformedPayload("payload has no total usage register".to_string())
    })?;

    Ok(MeterSample {
        ts,
        total_usage_w,
        registers,
    })
}

fn attr(e: &BytesStart<'_>, key: &[u8]) -> FetchResult<Option<String>> {
    match e.try_get_attribute(key) {
        Ok(Some(a)) => {
            let value = a
                .unescape_value()
                .map_err(|err| FetchError::MalformedPayload(format!("xml attr: {err}")))?;
            Ok(Some(value.into_owned()))
        }
        Ok(None) => Ok(None),
        Err(err) => Err(FetchError::MalformedPayload(format!("xml attr: {err}"))),
    }
}
