//! Template-driven packing and unpacking of command payloads.
//!
//! Every command has a JSON template file named after its message id label
//! (`OP_STOP.json`, `MAN_QUERY_INFO.json`, ...). A template carries two
//! sides: `snd` describes the payload the user sends, `rcv` the payload the
//! reader answers with. Each side lists its parameters in a `tmpl` string of
//! `[key]` placeholders plus a `prms` map with the wire attributes of every
//! key. Parameters with `pid = "M"` are mandatory and appear bare on the
//! wire; any other pid is optional and is prefixed with its 1-byte tag.
//! Variable-length parameters carry a 2-byte big-endian length, mandatory
//! and optional alike.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};
use hashbrown::HashMap;
use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::constants;
use crate::util;

#[derive(Debug, Clone, PartialEq)]
pub enum TemplateError {
    Io(String),
    BadJson(String),
    BadTemplate(String),
    UnknownMid(String),
    UnknownMsid(String),
    MissingMandatory(String),
    BadPid(String),
    UnknownOptionalPid(u8),
    BadValue(String),
    Truncated(String),
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TemplateError::Io(text) => write!(f, "template io error: {}", text),
            TemplateError::BadJson(text) => write!(f, "bad template JSON: {}", text),
            TemplateError::BadTemplate(text) => write!(f, "bad template: {}", text),
            TemplateError::UnknownMid(text) => write!(f, "unknown message id: {}", text),
            TemplateError::UnknownMsid(text) => write!(f, "no template loaded for {}", text),
            TemplateError::MissingMandatory(key) => {
                write!(f, "mandatory parameter '{}' not supplied", key)
            }
            TemplateError::BadPid(text) => write!(f, "bad parameter id: {}", text),
            TemplateError::UnknownOptionalPid(pid) => {
                write!(f, "optional parameter id 0x{:02X} not in template", pid)
            }
            TemplateError::BadValue(text) => write!(f, "bad parameter value: {}", text),
            TemplateError::Truncated(key) => {
                write!(f, "payload exhausted while reading parameter '{}'", key)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamType {
    U8,
    U16,
    U32,
}

impl ParamType {
    pub fn width(self) -> usize {
        match self {
            ParamType::U8 => 1,
            ParamType::U16 => 2,
            ParamType::U32 => 4,
        }
    }
}

/// A parameter value is polymorphic on the JSON side: a non-negative
/// integer serialized big-endian at the type width, a hex string decoded to
/// raw bytes, or (as unpack output only) a list of integers. `-1` is the
/// template placeholder for a value the caller must fill in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Hex(String),
    Words(Vec<u64>),
}

impl Default for ParamValue {
    fn default() -> Self {
        ParamValue::Int(-1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub pid: String,
    #[serde(rename = "type")]
    pub ptype: ParamType,
    #[serde(rename = "is-fixed-len")]
    pub is_fixed_len: bool,
    pub len: usize,
    #[serde(default)]
    pub val: ParamValue,
}

impl ParamSpec {
    fn is_mandatory(&self) -> bool {
        self.pid == "M"
    }

    fn pid_byte(&self) -> Result<u8, TemplateError> {
        let value = u8::from_str_radix(&self.pid, 16)
            .map_err(|_| TemplateError::BadPid(self.pid.clone()))?;
        if value == 0 {
            return Err(TemplateError::BadPid(self.pid.clone()));
        }
        Ok(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSide {
    pub msid: String,
    pub mtyp: String,
    pub init: String,
    pub tmpl: String,
    pub prms: HashMap<String, ParamSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub snd: TemplateSide,
    pub rcv: TemplateSide,
}

/// Placeholder keys in their order of appearance in a `tmpl` string.
pub fn template_keys(tmpl: &str) -> Result<Vec<&str>, TemplateError> {
    let mut keys = Vec::new();
    let mut rest = tmpl;
    while let Some(open) = rest.find('[') {
        let tail = &rest[open + 1..];
        let close = tail
            .find(']')
            .ok_or_else(|| TemplateError::BadTemplate("unbalanced [ in tmpl".to_string()))?;
        let key = &tail[..close];
        if key.is_empty() {
            return Err(TemplateError::BadTemplate("empty [] placeholder".to_string()));
        }
        if !key.is_ascii() || key.chars().any(|c| c.is_ascii_whitespace() || c == '[') {
            return Err(TemplateError::BadTemplate(format!(
                "placeholder '{}' must be ASCII without blanks",
                key
            )));
        }
        keys.push(key);
        rest = &tail[close + 1..];
    }
    Ok(keys)
}

fn encode_value(spec: &ParamSpec, value: &ParamValue, key: &str) -> Result<Vec<u8>, TemplateError> {
    match value {
        ParamValue::Int(raw) => {
            if *raw < 0 {
                return Err(TemplateError::MissingMandatory(key.to_string()));
            }
            let width = spec.ptype.width();
            if width < 8 && (*raw as u64) >> (width * 8) != 0 {
                return Err(TemplateError::BadValue(format!(
                    "{} does not fit {:?} for '{}'",
                    raw, spec.ptype, key
                )));
            }
            let be = (*raw as u64).to_be_bytes();
            Ok(be[8 - width..].to_vec())
        }
        ParamValue::Hex(text) => {
            let bytes = util::parse_hex(text).ok_or_else(|| {
                TemplateError::BadValue(format!("'{}' is not a hex string for '{}'", text, key))
            })?;
            if spec.is_fixed_len && bytes.len() != spec.len {
                return Err(TemplateError::BadValue(format!(
                    "hex value for '{}' is {} bytes, template wants {}",
                    key,
                    bytes.len(),
                    spec.len
                )));
            }
            Ok(bytes)
        }
        ParamValue::Words(_) => Err(TemplateError::BadValue(format!(
            "integer list not packable for '{}'",
            key
        ))),
    }
}

/// Serialize caller-supplied parameter values against a `snd` template side.
/// Optional keys absent from `caller` are dropped; a mandatory key absent
/// or left at the `-1` placeholder fails the whole request.
pub fn pack(
    side: &TemplateSide,
    caller: &HashMap<String, ParamValue>,
) -> Result<Vec<u8>, TemplateError> {
    let keys = template_keys(&side.tmpl)?;
    for (index, key) in keys.iter().enumerate() {
        if keys[..index].contains(key) {
            return Err(TemplateError::BadTemplate(format!(
                "placeholder '{}' appears more than once",
                key
            )));
        }
    }

    let mut out = Vec::new();
    for key in &keys {
        let spec = side.prms.get(*key).ok_or_else(|| {
            TemplateError::BadTemplate(format!("no prms entry for placeholder '{}'", key))
        })?;
        let value = match caller.get(*key) {
            Some(value) => value,
            None if spec.is_mandatory() => {
                return Err(TemplateError::MissingMandatory((*key).to_string()));
            }
            None => continue,
        };
        if spec.is_fixed_len && spec.len == 0 {
            return Err(TemplateError::BadTemplate(format!(
                "fixed-length parameter '{}' with zero len",
                key
            )));
        }
        let value_bytes = encode_value(spec, value, key)?;
        if !spec.is_mandatory() {
            out.push(spec.pid_byte()?);
        }
        if !spec.is_fixed_len {
            out.extend_from_slice(&(value_bytes.len() as u16).to_be_bytes());
        }
        out.extend_from_slice(&value_bytes);
    }
    Ok(out)
}

fn decode_value(spec: &ParamSpec, raw: &[u8]) -> Value {
    if spec.is_fixed_len && raw.len() <= 4 {
        let mut value = 0u64;
        for &byte in raw {
            value = (value << 8) | byte as u64;
        }
        json!(value)
    } else if spec.is_fixed_len || spec.ptype == ParamType::U8 {
        json!(util::hex_string(raw))
    } else {
        let width = spec.ptype.width();
        let words: Vec<u64> = raw
            .chunks_exact(width)
            .map(|chunk| match width {
                2 => BigEndian::read_u16(chunk) as u64,
                _ => BigEndian::read_u32(chunk) as u64,
            })
            .collect();
        json!(words)
    }
}

/// Registry of command templates loaded from a directory. Only files whose
/// stem is a known message id label and whose extension is `.json` are
/// picked up.
pub struct TemplateStore {
    dir: PathBuf,
    templates: HashMap<String, CommandTemplate>,
}

impl TemplateStore {
    pub fn load(dir: &Path) -> Result<TemplateStore, TemplateError> {
        let mut store = TemplateStore {
            dir: dir.to_path_buf(),
            templates: HashMap::new(),
        };
        store.reload()?;
        Ok(store)
    }

    /// Rescan the directory, replacing the in-memory registry.
    pub fn reload(&mut self) -> Result<usize, TemplateError> {
        let mut fresh = HashMap::new();
        let entries = fs::read_dir(&self.dir)
            .map_err(|err| TemplateError::Io(format!("{}: {}", self.dir.display(), err)))?;
        for entry in entries {
            let entry = entry.map_err(|err| TemplateError::Io(err.to_string()))?;
            let path = entry.path();
            let stem = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem,
                None => continue,
            };
            if path.extension().and_then(|e| e.to_str()) != Some("json")
                || !constants::is_known_mid(stem)
            {
                continue;
            }
            let file = fs::File::open(&path)
                .map_err(|err| TemplateError::Io(format!("{}: {}", path.display(), err)))?;
            let template: CommandTemplate = serde_json::from_reader(file)
                .map_err(|err| TemplateError::BadJson(format!("{}: {}", path.display(), err)))?;
            fresh.insert(stem.to_string(), template);
        }
        self.templates = fresh;
        Ok(self.templates.len())
    }

    pub fn get(&self, msid: &str) -> Option<&CommandTemplate> {
        self.templates.get(msid)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Loaded message id labels, sorted.
    pub fn known(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.templates.keys().cloned().collect();
        labels.sort();
        labels
    }

    /// Unpack a received payload against the `rcv` side of the template the
    /// frame's (mid, type, init) triple resolves to. The cursor starts past
    /// the 2-byte length prefix and may finish before the template does;
    /// truncation inside a parameter and unknown optional pids are errors.
    pub fn unpack(
        &self,
        message_id: u8,
        message_type: u8,
        init_by_reader: u8,
        data: &[u8],
    ) -> Result<Value, TemplateError> {
        let msid = constants::mid_label(message_type, init_by_reader, message_id)
            .ok_or_else(|| {
                TemplateError::UnknownMid(format!(
                    "mid 0x{:02X} type {} init {}",
                    message_id, message_type, init_by_reader
                ))
            })?;
        let template = self
            .get(msid)
            .ok_or_else(|| TemplateError::UnknownMsid(msid.to_string()))?;
        let side = &template.rcv;
        let keys = template_keys(&side.tmpl)?;

        let mut prms_out = Map::new();
        let mut index = 2usize;
        for key in &keys {
            let slot_spec = side.prms.get(*key).ok_or_else(|| {
                TemplateError::BadTemplate(format!("no prms entry for placeholder '{}'", key))
            })?;
            let spec = if slot_spec.is_mandatory() {
                slot_spec
            } else {
                // An optional parameter announces itself with its pid byte;
                // resolve the matching spec across the whole template side.
                let pid = *data
                    .get(index)
                    .ok_or_else(|| TemplateError::Truncated((*key).to_string()))?;
                index += 1;
                keys.iter()
                    .filter_map(|candidate| side.prms.get(*candidate))
                    .find(|candidate| !candidate.is_mandatory() && candidate.pid_byte() == Ok(pid))
                    .ok_or(TemplateError::UnknownOptionalPid(pid))?
            };

            let length = if spec.is_fixed_len {
                spec.len
            } else {
                if index + 2 > data.len() {
                    return Err(TemplateError::Truncated((*key).to_string()));
                }
                let length = BigEndian::read_u16(&data[index..index + 2]) as usize;
                index += 2;
                length
            };
            if index + length > data.len() {
                return Err(TemplateError::Truncated((*key).to_string()));
            }
            let raw = &data[index..index + length];
            index += length;

            let mut spec_json = serde_json::to_value(spec)
                .map_err(|err| TemplateError::BadTemplate(err.to_string()))?;
            spec_json["val"] = decode_value(spec, raw);
            prms_out.insert((*key).to_string(), spec_json);

            if index == data.len() {
                break;
            }
        }

        Ok(json!({
            "msid": msid,
            "mtyp": constants::message_type_label(message_type).unwrap_or("TYPE_ERR_WARN"),
            "init": constants::init_label(init_by_reader),
            "prms": Value::Object(prms_out),
        }))
    }
}
