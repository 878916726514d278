//! Decoding of the tag-report payload uploaded by the reader: EPC length,
//! EPC bytes, the 16-bit PC word with its bit fields, the antenna id and a
//! tail of optional tagged parameters.

use byteorder::{BigEndian, ByteOrder};
use hashbrown::HashMap;
use serde_json::{json, Map, Value};

use crate::constants;
use crate::util;

#[derive(Debug, Clone, PartialEq)]
pub enum TagParam {
    Byte(u8),
    Bytes(Vec<u8>),
    Time(f64),
}

/// One decoded tag record. On a parse failure `decode_error` is set and the
/// fields parsed up to that point are left in place.
#[derive(Debug, Clone, Default)]
pub struct TagData {
    pub epc: Vec<u8>,
    pub pc_value: u16,
    pub ant_id: u8,
    pub params: HashMap<u8, TagParam>,
    pub epc_len: u8,
    pub umi: u8,
    pub xpc_indicator: u8,
    pub num_sys_id_toggle: u8,
    pub rfu: u8,
    pub decode_error: bool,
    pub decode_error_text: String,
}

impl TagData {
    /// Decode the data bytes of an EPC upload frame. The input still starts
    /// with the 2-byte length prefix kept by the frame decoder.
    pub fn decode(data: &[u8]) -> TagData {
        let mut tag = TagData::default();
        let mut index = 2usize;

        if index + 2 > data.len() {
            return tag.fail("truncated EPC length");
        }
        let epc_len = BigEndian::read_u16(&data[index..index + 2]) as usize;
        index += 2;

        if index + epc_len > data.len() {
            return tag.fail("truncated EPC code");
        }
        tag.epc = data[index..index + epc_len].to_vec();
        index += epc_len;

        if index + 2 > data.len() {
            return tag.fail("truncated PC value");
        }
        tag.pc_value = BigEndian::read_u16(&data[index..index + 2]);
        let pc_high = data[index];
        tag.num_sys_id_toggle = pc_high & 0x01;
        tag.xpc_indicator = (pc_high >> 1) & 0x01;
        tag.umi = (pc_high >> 2) & 0x01;
        tag.epc_len = (pc_high >> 3) & 0x1F;
        tag.rfu = data[index + 1];
        index += 2;

        if index + 1 > data.len() {
            return tag.fail("truncated antenna id");
        }
        tag.ant_id = data[index];
        index += 1;

        while index < data.len() {
            let param_id = data[index];
            index += 1;
            match param_id {
                constants::TAG_RSSI | constants::TAG_DATA_READ_RESULT | constants::TAG_SUB_ANT => {
                    if index + 1 > data.len() {
                        return tag.fail("truncated one-byte parameter");
                    }
                    tag.params.insert(param_id, TagParam::Byte(data[index]));
                    index += 1;
                }
                constants::TAG_TID
                | constants::TAG_USER_AREA
                | constants::TAG_RETENTION_AREA
                | constants::TAG_ADDITIONAL_DATA => {
                    if index + 2 > data.len() {
                        return tag.fail("truncated parameter length");
                    }
                    let length = BigEndian::read_u16(&data[index..index + 2]) as usize;
                    index += 2;
                    if index + length > data.len() {
                        return tag.fail("truncated variable-length parameter");
                    }
                    tag.params
                        .insert(param_id, TagParam::Bytes(data[index..index + length].to_vec()));
                    index += length;
                }
                constants::TAG_TIME => {
                    if index + 8 > data.len() {
                        return tag.fail("truncated UTC time parameter");
                    }
                    let seconds = BigEndian::read_u32(&data[index..index + 4]) as f64;
                    let microseconds = BigEndian::read_u32(&data[index + 4..index + 8]) as f64;
                    tag.params
                        .insert(param_id, TagParam::Time(seconds + microseconds / 1_000_000.0));
                    index += 8;
                }
                constants::TAG_SERIES_NUM => {
                    if index + 4 > data.len() {
                        return tag.fail("truncated series number");
                    }
                    tag.params
                        .insert(param_id, TagParam::Bytes(data[index..index + 4].to_vec()));
                    index += 4;
                }
                _ => {
                    return tag.fail("reserved or unknown tag parameter id");
                }
            }
        }
        tag
    }

    fn fail(mut self, reason: &str) -> TagData {
        self.decode_error = true;
        self.decode_error_text = reason.to_string();
        self
    }

    /// Render the record the way the web API presents tag data.
    pub fn encode_json(&self) -> Value {
        let mut params = Map::new();
        for (&param_id, value) in &self.params {
            let label = constants::tag_param_label(param_id)
                .unwrap_or("UNKNOWN")
                .to_string();
            let rendered = match value {
                TagParam::Byte(v) if param_id == constants::TAG_DATA_READ_RESULT => {
                    json!(constants::read_result_text(*v))
                }
                TagParam::Byte(v) => json!(v),
                TagParam::Bytes(bytes) => json!(util::hex_string(bytes)),
                TagParam::Time(seconds) => json!(seconds),
            };
            params.insert(label, rendered);
        }
        json!({
            "EPC_code": util::hex_string(&self.epc),
            "ant_id": self.ant_id,
            "params": Value::Object(params),
            "decode_error": self.decode_error,
            "EPC_len": (self.epc_len as u32) * 16,
            "UMI": self.umi,
            "XPC_indicator": self.xpc_indicator,
            "num_sys_id_toggle": self.num_sys_id_toggle,
            "RFU": format!("0x{:02X}", self.rfu),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload_payload(epc: &[u8], pc: u16, antenna: u8, tail: &[u8]) -> Vec<u8> {
        let mut data = vec![0u8, 0u8]; // placeholder for the frame length prefix
        data.extend_from_slice(&(epc.len() as u16).to_be_bytes());
        data.extend_from_slice(epc);
        data.extend_from_slice(&pc.to_be_bytes());
        data.push(antenna);
        data.extend_from_slice(tail);
        let declared = (data.len() - 2) as u16;
        data[..2].copy_from_slice(&declared.to_be_bytes());
        data
    }

    #[test]
    fn test_decode_basic_record() {
        let payload = upload_payload(&[0xE2, 0x80, 0x11], 0x3000, 1, &[]);
        let tag = TagData::decode(&payload);
        assert!(!tag.decode_error);
        assert_eq!(tag.epc, vec![0xE2, 0x80, 0x11]);
        assert_eq!(tag.pc_value, 0x3000);
        assert_eq!(tag.ant_id, 1);
        // 0x30 = EPC length 6 words, all flag bits clear.
        assert_eq!(tag.epc_len, 6);
        assert_eq!(tag.umi, 0);
        assert_eq!(tag.xpc_indicator, 0);
        assert_eq!(tag.num_sys_id_toggle, 0);
        assert_eq!(tag.rfu, 0);
        assert!(tag.params.is_empty());
    }

    #[test]
    fn test_decode_pc_bit_fields() {
        // High byte 0x3D: length 7, UMI 1, XPC 0, toggle 1.
        let payload = upload_payload(&[0x01], 0x3D42, 2, &[]);
        let tag = TagData::decode(&payload);
        assert_eq!(tag.epc_len, 7);
        assert_eq!(tag.umi, 1);
        assert_eq!(tag.xpc_indicator, 0);
        assert_eq!(tag.num_sys_id_toggle, 1);
        assert_eq!(tag.rfu, 0x42);
    }

    #[test]
    fn test_decode_optional_params() {
        let mut tail = Vec::new();
        tail.extend_from_slice(&[constants::TAG_RSSI, 0xC5]);
        tail.extend_from_slice(&[constants::TAG_DATA_READ_RESULT, 0x00]);
        tail.extend_from_slice(&[constants::TAG_TID, 0x00, 0x02, 0xBE, 0xEF]);
        tail.extend_from_slice(&[constants::TAG_SERIES_NUM, 0xAA, 0xBB, 0xCC, 0xDD]);
        tail.extend_from_slice(&[constants::TAG_TIME, 0x00, 0x00, 0x00, 0x0A, 0x00, 0x07, 0xA1, 0x20]);
        let payload = upload_payload(&[0xE2], 0x0800, 3, &tail);

        let tag = TagData::decode(&payload);
        assert!(!tag.decode_error, "{}", tag.decode_error_text);
        assert_eq!(tag.params.get(&constants::TAG_RSSI), Some(&TagParam::Byte(0xC5)));
        assert_eq!(
            tag.params.get(&constants::TAG_TID),
            Some(&TagParam::Bytes(vec![0xBE, 0xEF]))
        );
        assert_eq!(
            tag.params.get(&constants::TAG_SERIES_NUM),
            Some(&TagParam::Bytes(vec![0xAA, 0xBB, 0xCC, 0xDD]))
        );
        // 10 seconds and 500000 microseconds.
        assert_eq!(tag.params.get(&constants::TAG_TIME), Some(&TagParam::Time(10.5)));
    }

    #[test]
    fn test_decode_unknown_param_flags_error() {
        let payload = upload_payload(&[0xE2], 0x0800, 1, &[0x0D, 0x01]);
        let tag = TagData::decode(&payload);
        assert!(tag.decode_error);
        // Fields parsed before the failure stay available.
        assert_eq!(tag.epc, vec![0xE2]);
        assert_eq!(tag.ant_id, 1);
    }

    #[test]
    fn test_decode_truncated_input() {
        let payload = upload_payload(&[0xE2, 0x80], 0x1000, 1, &[]);
        let tag = TagData::decode(&payload[..5]);
        assert!(tag.decode_error);
    }

    #[test]
    fn test_encode_json() {
        let mut tail = Vec::new();
        tail.extend_from_slice(&[constants::TAG_DATA_READ_RESULT, 0x00]);
        tail.extend_from_slice(&[constants::TAG_SERIES_NUM, 0x00, 0x00, 0x00, 0x07]);
        let payload = upload_payload(&[0xE2, 0x80, 0x11], 0x3000, 4, &tail);

        let rendered = TagData::decode(&payload).encode_json();
        assert_eq!(rendered["EPC_code"], "E28011");
        assert_eq!(rendered["EPC_len"], 96);
        assert_eq!(rendered["ant_id"], 4);
        assert_eq!(rendered["decode_error"], false);
        assert_eq!(rendered["RFU"], "0x00");
        assert_eq!(rendered["params"]["DATA_READ_RESULT"], "Read successful");
        assert_eq!(rendered["params"]["SERIES_NUM"], "00000007");
    }
}
