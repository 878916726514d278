//! The reader session engine: one single-threaded loop owning the TCP
//! session, the send buffers, the in-flight request queues, the tag buffer
//! and the file-bus endpoints.
//!
//! Each connected tick runs the same pipeline: receive raw bytes,
//! reassemble and decode frames, answer the reader's protocol-obligated
//! confirmations out of a priority buffer, turn queued web requests into
//! command frames, flush, expire overdue requests, match replies back to
//! their originators and serve status requests. Priority replies always hit
//! the wire before standard traffic, reply matching is FIFO over the
//! in-flight queue, and web requests are ordered by the timestamp embedded
//! in their bus filenames.

use std::net::TcpListener;
use std::path::Path;
use std::thread;
use std::time::Duration;

use hashbrown::HashMap;
use serde_json::{json, Value};

use clouproto::constants;
use clouproto::fme::{FileMessageExchange, FmeError, ReceivedMessage};
use clouproto::frame::{self, Frame};
use clouproto::logging::{self, Logger};
use clouproto::stream::RawStream;
use clouproto::tagdata::{TagData, TagParam};
use clouproto::template::{self, ParamValue, TemplateError, TemplateStore};
use clouproto::time::{self, Timezone};
use clouproto::util;

use crate::config::{Config, ConfigError, ReaderConfig, ReaderMode};
use crate::ntp::{self, NtpError, OffsetLog};
use crate::transport::{self, Link, LinkError};

pub const MSG_CLU: &str = "CLU";
pub const MSG_STS: &str = "STS";

#[derive(Debug)]
pub enum EngineError {
    Config(ConfigError),
    Template(TemplateError),
    Bus(FmeError),
    Clock(NtpError),
    Io(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            EngineError::Config(err) => write!(f, "{}", err),
            EngineError::Template(err) => write!(f, "{}", err),
            EngineError::Bus(err) => write!(f, "{}", err),
            EngineError::Clock(err) => write!(f, "{}", err),
            EngineError::Io(text) => write!(f, "{}", text),
        }
    }
}

impl From<ConfigError> for EngineError {
    fn from(err: ConfigError) -> Self {
        EngineError::Config(err)
    }
}

impl From<TemplateError> for EngineError {
    fn from(err: TemplateError) -> Self {
        EngineError::Template(err)
    }
}

impl From<FmeError> for EngineError {
    fn from(err: FmeError) -> Self {
        EngineError::Bus(err)
    }
}

#[derive(Debug, Default)]
pub struct SessionState {
    pub connected: bool,
    pub shutdown_requested: bool,
}

#[derive(Debug)]
pub struct Timers {
    pub process_up_since: f64,
    pub reader_last_act_time: Option<f64>,
    pub reader_connected_since: Option<f64>,
    pub reader_disconnected_since: Option<f64>,
    pub last_clock_check: Option<f64>,
}

/// A web request that produced a command frame. It sits in `queue_to_send`
/// until its bytes are flushed, then in `queue_sent` until a reply frame
/// matches or `reply-from-reader-timeout` expires.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub web_req_id: String,
    pub query_content: Value,
    pub originator: String,
    pub msid: String,
    pub sent_at: Option<f64>,
}

#[derive(Debug, Clone)]
struct DecodedFrame {
    frame: Frame,
    recv_time: f64,
}

pub struct Engine {
    rid: String,
    config: Config,
    reader: ReaderConfig,
    tz: Timezone,
    log: Logger,
    templates: TemplateStore,
    bus: FileMessageExchange,
    stream: RawStream,
    session: SessionState,
    timers: Timers,
    ntp_log: OffsetLog,
    priority_out: Vec<u8>,
    standard_out: Vec<u8>,
    queue_to_send: Vec<PendingRequest>,
    queue_sent: Vec<PendingRequest>,
    inbound: Vec<DecodedFrame>,
    tag_buf: Vec<Value>,
    tag_match: Vec<Value>,
}

impl Engine {
    /// `initial_offset` is the NTP offset measured by the startup gate; it
    /// seeds the offset log.
    pub fn new(
        rid: &str,
        config: Config,
        tz: Timezone,
        log: Logger,
        initial_offset: f64,
    ) -> Result<Engine, EngineError> {
        let reader = config.reader_settings(rid)?.clone();
        let templates = TemplateStore::load(Path::new(&config.cmds_dir))?;
        let bus_dir = Path::new(&config.clou_run).join(rid);
        std::fs::create_dir_all(&bus_dir)
            .map_err(|err| EngineError::Io(format!("{}: {}", bus_dir.display(), err)))?;
        let bus = FileMessageExchange::new(rid, &bus_dir, &[MSG_CLU, MSG_STS])?;
        let stream = RawStream::new(reader.parse_limit, constants::RS485_NOT_USED);

        let now = time::timestamp();
        let mut ntp_log = OffsetLog::new();
        ntp_log.push(initial_offset);

        logging::info!(log, "engine created";
                       "context" => "new",
                       "rid" => rid,
                       "templates" => templates.len(),
                       "mode" => ?reader.reader_mode);

        Ok(Engine {
            rid: rid.to_string(),
            config,
            reader,
            tz,
            log,
            templates,
            bus,
            stream,
            session: SessionState::default(),
            timers: Timers {
                process_up_since: now,
                reader_last_act_time: None,
                reader_connected_since: None,
                reader_disconnected_since: None,
                last_clock_check: Some(now),
            },
            ntp_log,
            priority_out: Vec::new(),
            standard_out: Vec::new(),
            queue_to_send: Vec::new(),
            queue_sent: Vec::new(),
            inbound: Vec::new(),
            tag_buf: Vec::new(),
            tag_match: Vec::new(),
        })
    }

    /// Connection lifecycle: establish a session, run ticks while it lasts,
    /// reconnect on loss, exit when a shutdown request has been served.
    pub fn run(&mut self) -> Result<(), EngineError> {
        let sock_timeout = Duration::from_secs_f64(self.reader.sock_timeout.max(0.01));
        let listener = match self.reader.reader_mode {
            ReaderMode::Client => Some(
                transport::bind_listener(&self.reader.host, self.reader.port).map_err(|err| {
                    EngineError::Io(format!(
                        "can not listen on {}:{}: {}",
                        self.reader.host, self.reader.port, err
                    ))
                })?,
            ),
            ReaderMode::Server => None,
        };
        if listener.is_some() {
            logging::info!(self.log, "listening for the reader";
                           "context" => "run",
                           "host" => &self.reader.host,
                           "port" => self.reader.port);
        } else {
            logging::info!(self.log, "dialing the reader";
                           "context" => "run",
                           "host" => &self.reader.host,
                           "port" => self.reader.port);
        }

        while !self.session.shutdown_requested {
            match self.establish(&listener, sock_timeout) {
                Some(mut link) => {
                    self.on_connected(&link);
                    while self.session.connected && !self.session.shutdown_requested {
                        self.tick(&mut link);
                    }
                    link.close();
                    self.on_disconnected();
                }
                None => self.check_clock(),
            }
        }

        logging::info!(self.log, "engine stopped"; "context" => "run");
        Ok(())
    }

    fn establish(&mut self, listener: &Option<TcpListener>, sock_timeout: Duration) -> Option<Link> {
        match listener {
            Some(listener) => match transport::try_accept(listener, sock_timeout) {
                Ok(link) => Some(link),
                Err(LinkError::Wait) => {
                    thread::sleep(sock_timeout);
                    None
                }
                Err(LinkError::Fatal(kind)) => {
                    logging::warn!(self.log, "accept failed"; "context" => "establish", "kind" => ?kind);
                    thread::sleep(sock_timeout);
                    None
                }
            },
            None => match transport::dial(&self.reader.host, self.reader.port, sock_timeout) {
                Ok(link) => Some(link),
                Err(LinkError::Wait) => None,
                Err(LinkError::Fatal(kind)) => {
                    logging::warn!(self.log, "dial failed"; "context" => "establish", "kind" => ?kind);
                    thread::sleep(sock_timeout);
                    None
                }
            },
        }
    }

    fn on_connected(&mut self, link: &Link) {
        let now = time::timestamp();
        self.session.connected = true;
        self.timers.reader_connected_since = Some(now);
        self.timers.reader_disconnected_since = None;
        self.timers.reader_last_act_time = Some(now);
        logging::info!(self.log, "reader connected";
                       "context" => "session",
                       "peer" => link.peer_label());
    }

    fn on_disconnected(&mut self) {
        let now = time::timestamp();
        self.session.connected = false;
        self.timers.reader_connected_since = None;
        self.timers.reader_disconnected_since = Some(now);
        self.stream.clear();
        self.priority_out.clear();
        self.standard_out.clear();
        self.inbound.clear();
        // Requests that never reached the wire will not be answered; the
        // ones already sent keep aging in queue_sent until they expire.
        self.queue_to_send.clear();
        logging::info!(self.log, "reader disconnected"; "context" => "session");
    }

    fn drop_session(&mut self) {
        self.session.connected = false;
    }

    /// One iteration of the connected main loop.
    fn tick(&mut self, link: &mut Link) {
        let mut chunk = [0u8; transport::RECV_CHUNK];
        match link.recv(&mut chunk) {
            Ok(count) => {
                self.timers.reader_last_act_time = Some(time::timestamp());
                self.ingest(&chunk[..count]);
            }
            Err(LinkError::Wait) => {}
            Err(LinkError::Fatal(kind)) => {
                logging::warn!(self.log, "receive failed"; "context" => "tick", "kind" => ?kind);
                self.drop_session();
                return;
            }
        }

        if !self.priority_out.is_empty() {
            if let Err(LinkError::Fatal(kind)) = link.flush(&mut self.priority_out) {
                logging::warn!(self.log, "priority send failed"; "context" => "tick", "kind" => ?kind);
                self.drop_session();
                return;
            }
        }

        self.pump_clu();

        if !self.standard_out.is_empty() {
            match link.flush(&mut self.standard_out) {
                Ok(_) => self.mark_sent(),
                Err(LinkError::Wait) => {}
                Err(LinkError::Fatal(kind)) => {
                    logging::warn!(self.log, "send failed"; "context" => "tick", "kind" => ?kind);
                    self.drop_session();
                    return;
                }
            }
        }

        self.expire_inflight();
        self.match_replies();
        self.handle_sts();
        self.check_liveness();
        self.check_clock();
    }

    /// Feed raw bytes through the reassembler and decode every complete
    /// frame, answering confirmations and tag uploads on the spot.
    fn ingest(&mut self, chunk: &[u8]) {
        self.stream.push_chunk(chunk);
        self.stream.unpack();
        for unknown in self.stream.take_unknowns() {
            logging::warn!(self.log, "unknown bytes between frames";
                           "context" => "ingest",
                           "bytes" => util::hex_dump(&unknown));
        }
        let now = time::timestamp();
        for raw in self.stream.take_frames() {
            match Frame::decode(&raw) {
                Ok(frame) => {
                    let tag_upload = frame.init_by_reader == constants::INIT_BY_READER
                        && frame.message_type == constants::TYPE_CONF_OPERATE
                        && frame.message_id == constants::OP_READER_EPC_DATA_UPLOAD;
                    if !tag_upload || self.reader.log_tag_frames {
                        logging::debug!(self.log, "frame received";
                                        "context" => "ingest",
                                        "mid" => constants::mid_label(frame.message_type, frame.init_by_reader, frame.message_id).unwrap_or("UNKNOWN_MID"),
                                        "type" => constants::message_type_label(frame.message_type).unwrap_or("?"),
                                        "init" => constants::init_label(frame.init_by_reader),
                                        "rs485" => constants::rs485_label(frame.rs485_mark),
                                        "data" => util::hex_dump(&frame.data_bytes));
                    }
                    if self.auto_reply(&frame) {
                        continue;
                    }
                    self.inbound.push(DecodedFrame { frame, recv_time: now });
                }
                Err(err) => {
                    logging::warn!(self.log, "frame rejected";
                                   "context" => "ingest",
                                   "code" => err.code(),
                                   "reason" => %err);
                }
            }
        }
    }

    /// Protocol-obligated immediate replies. These frames never surface to
    /// the request/reply matching; the answers go to the priority buffer.
    fn auto_reply(&mut self, frame: &Frame) -> bool {
        if frame.init_by_reader == constants::INIT_BY_READER
            && frame.message_type == constants::TYPE_CONF_MANAGE
            && frame.message_id == constants::MAN_READER_CONN_CONFIRM
        {
            // The ping carries exactly 4 echo bytes behind the length
            // prefix; anything else is out of schema and dropped.
            if frame.data_bytes.len() == 6 && frame.data_bytes[..2] == [0x00, 0x04] {
                let reply = Frame::new(
                    constants::MAN_CONN_CONFIRM,
                    constants::TYPE_CONF_MANAGE,
                    constants::INIT_BY_USER,
                    frame.data_bytes[2..6].to_vec(),
                );
                self.priority_out.extend(reply.encode(true));
                logging::debug!(self.log, "connection confirm answered"; "context" => "auto_reply");
            }
            return true;
        }

        if frame.init_by_reader == constants::INIT_BY_READER
            && frame.message_type == constants::TYPE_CONF_OPERATE
            && frame.message_id == constants::OP_READER_EPC_DATA_UPLOAD
        {
            let tag = TagData::decode(&frame.data_bytes);
            if tag.decode_error {
                logging::warn!(self.log, "tag data decode failed";
                               "context" => "auto_reply",
                               "reason" => &tag.decode_error_text);
            } else if let Some(TagParam::Bytes(series)) = tag.params.get(&constants::TAG_SERIES_NUM)
            {
                let reply = Frame::new(
                    constants::MAN_TAG_DATA_RESPONSE,
                    constants::TYPE_CONF_MANAGE,
                    constants::INIT_BY_USER,
                    series.clone(),
                );
                self.priority_out.extend(reply.encode(true));
            }
            if self.reader.log_tag_frames {
                self.log_tag(&tag);
            }
            self.store_tag(&tag);
            return true;
        }

        false
    }

    fn log_tag(&self, tag: &TagData) {
        logging::debug!(self.log, "tag read";
                        "context" => "tag",
                        "epc" => util::hex_string(&tag.epc),
                        "epc_len_bits" => (tag.epc_len as u32) * 16,
                        "umi" => tag.umi,
                        "xpc" => tag.xpc_indicator,
                        "toggle" => tag.num_sys_id_toggle,
                        "rfu" => format!("0x{:02X}", tag.rfu),
                        "antenna" => tag.ant_id,
                        "rssi" => match tag.params.get(&constants::TAG_RSSI) {
                            Some(TagParam::Byte(v)) => Some(*v),
                            _ => None,
                        },
                        "read_result" => match tag.params.get(&constants::TAG_DATA_READ_RESULT) {
                            Some(TagParam::Byte(v)) => Some(constants::read_result_text(*v)),
                            _ => None,
                        },
                        "scan_time" => match tag.params.get(&constants::TAG_TIME) {
                            Some(TagParam::Time(t)) => Some(self.tz.format(*t)),
                            _ => None,
                        },
                        "series" => match tag.params.get(&constants::TAG_SERIES_NUM) {
                            Some(TagParam::Bytes(b)) => Some(util::hex_string(b)),
                            _ => None,
                        });
    }

    /// Deduplicated insertion: the record is appended unless its stripped
    /// form (configured parameters erased) is already present.
    fn store_tag(&mut self, tag: &TagData) {
        let record = tag.encode_json();
        let mut stripped = record.clone();
        if let Some(params) = stripped.get_mut("params").and_then(Value::as_object_mut) {
            for label in &self.config.tag_param_duplicate_exclude {
                params.remove(label);
            }
        }
        if !self.tag_match.contains(&stripped) {
            self.tag_match.push(stripped);
            self.tag_buf.push(record);
        }
    }

    /// Turn accumulated CLU bus messages into command frames, oldest first
    /// by the timestamp embedded in their filenames.
    fn pump_clu(&mut self) {
        if let Err(err) = self.bus.receive("*", MSG_CLU, true, None) {
            logging::warn!(self.log, "bus receive failed"; "context" => "pump_clu", "error" => %err);
            return;
        }
        let mut messages = self.bus.take_all();
        messages.sort_by(|a, b| {
            a.timestamp
                .partial_cmp(&b.timestamp)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for message in messages {
            self.build_request(message);
        }
    }

    /// Build one command frame from one web request. Any defect in the
    /// request drops it with a log line; the originating worker observes
    /// its own timeout.
    fn build_request(&mut self, message: ReceivedMessage) {
        let web_req_id = match message.data.get("web-req-id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                logging::warn!(self.log, "request without web-req-id dropped"; "context" => "request");
                return;
            }
        };
        let query = message
            .data
            .get("query-content")
            .cloned()
            .unwrap_or(Value::Null);
        let msid = match query.get("msid").and_then(Value::as_str) {
            Some(msid) => msid.to_string(),
            None => {
                logging::warn!(self.log, "request without msid dropped";
                               "context" => "request",
                               "web_req_id" => &web_req_id);
                return;
            }
        };
        let snd = match self.templates.get(&msid) {
            Some(template) => template.snd.clone(),
            None => {
                logging::warn!(self.log, "no template for request";
                               "context" => "request",
                               "web_req_id" => &web_req_id,
                               "msid" => &msid);
                return;
            }
        };

        let mut caller: HashMap<String, ParamValue> = HashMap::new();
        if let Some(prms) = query.get("prms").and_then(Value::as_object) {
            for (key, entry) in prms {
                let raw = match entry.get("val") {
                    Some(value) => value.clone(),
                    None => {
                        logging::warn!(self.log, "request parameter without val dropped";
                                       "context" => "request",
                                       "web_req_id" => &web_req_id,
                                       "key" => key.as_str());
                        return;
                    }
                };
                match serde_json::from_value::<ParamValue>(raw) {
                    Ok(value) => {
                        caller.insert(key.clone(), value);
                    }
                    Err(err) => {
                        logging::warn!(self.log, "request parameter not packable";
                                       "context" => "request",
                                       "web_req_id" => &web_req_id,
                                       "key" => key.as_str(),
                                       "error" => %err);
                        return;
                    }
                }
            }
        }

        let payload = match template::pack(&snd, &caller) {
            Ok(payload) => payload,
            Err(err) => {
                logging::warn!(self.log, "request dropped";
                               "context" => "request",
                               "web_req_id" => &web_req_id,
                               "msid" => &msid,
                               "error" => %err);
                return;
            }
        };

        let triple = constants::message_type_by_label(&snd.mtyp)
            .and_then(|message_type| {
                constants::init_by_label(&snd.init).map(|init| (message_type, init))
            })
            .and_then(|(message_type, init)| {
                constants::mid_value(message_type, init, &snd.msid)
                    .map(|mid| (mid, message_type, init))
            });
        let (mid, message_type, init) = match triple {
            Some(triple) => triple,
            None => {
                logging::warn!(self.log, "template labels do not resolve";
                               "context" => "request",
                               "msid" => &msid);
                return;
            }
        };

        let command = Frame::new(mid, message_type, init, payload);
        self.standard_out.extend(command.encode(true));
        logging::debug!(self.log, "command queued";
                        "context" => "request",
                        "web_req_id" => &web_req_id,
                        "msid" => &msid,
                        "from" => &message.from);
        self.queue_to_send.push(PendingRequest {
            web_req_id,
            query_content: query,
            originator: message.from,
            msid,
            sent_at: None,
        });
    }

    /// The standard buffer reached the wire: everything queued is now
    /// in flight and starts its reply timeout.
    fn mark_sent(&mut self) {
        if self.queue_to_send.is_empty() {
            return;
        }
        let now = time::timestamp();
        for mut pending in self.queue_to_send.drain(..) {
            pending.sent_at = Some(now);
            self.queue_sent.push(pending);
        }
    }

    /// Overdue in-flight requests are dropped without an answer; their
    /// workers give up on their own timeout.
    fn expire_inflight(&mut self) {
        let now = time::timestamp();
        let timeout = self.config.reply_from_reader_timeout;
        let log = &self.log;
        self.queue_sent.retain(|pending| {
            let expired = pending
                .sent_at
                .map_or(false, |sent| now - sent > timeout);
            if expired {
                logging::debug!(log, "request expired without reply";
                                "context" => "expire",
                                "web_req_id" => &pending.web_req_id,
                                "msid" => &pending.msid);
            }
            !expired
        });
    }

    /// Match decoded frames against the in-flight queue, oldest request
    /// first. Unmatched frames are logged and discarded.
    fn match_replies(&mut self) {
        if self.inbound.is_empty() {
            return;
        }
        let mut frames = std::mem::take(&mut self.inbound);
        frames.sort_by(|a, b| {
            a.recv_time
                .partial_cmp(&b.recv_time)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for decoded in frames {
            self.match_one(decoded.frame);
        }
    }

    fn match_one(&mut self, frame: Frame) {
        let triple = if frame.message_type == constants::TYPE_ERR_WARN
            && frame.message_id == constants::ERR_MID
        {
            // The error report names the offending request through the
            // control word parameter.
            match self.error_frame_triple(&frame) {
                Some(triple) => triple,
                None => {
                    logging::warn!(self.log, "undecodable error frame";
                                   "context" => "match",
                                   "data" => util::hex_dump(&frame.data_bytes));
                    return;
                }
            }
        } else {
            (frame.message_id, frame.message_type, frame.init_by_reader)
        };

        let mut matched = None;
        for (index, pending) in self.queue_sent.iter().enumerate() {
            if self.template_rcv_triple(&pending.msid) == Some(triple) {
                matched = Some(index);
                break;
            }
        }

        match matched {
            Some(index) => {
                let pending = self.queue_sent.remove(index);
                self.deliver_reply(pending, &frame);
            }
            None => {
                // The reader confirms our own connection confirm with an
                // empty frame; that one dies here silently.
                if frame.message_type == constants::TYPE_CONF_MANAGE
                    && frame.message_id == constants::MAN_CONN_CONFIRM
                    && frame.init_by_reader == constants::INIT_BY_USER
                {
                    return;
                }
                logging::warn!(self.log, "unmatched frame discarded";
                               "context" => "match",
                               "mid" => constants::mid_label(frame.message_type, frame.init_by_reader, frame.message_id).unwrap_or("UNKNOWN_MID"),
                               "data" => util::hex_dump(&frame.data_bytes));
            }
        }
    }

    fn error_frame_triple(&self, frame: &Frame) -> Option<(u8, u8, u8)> {
        let unpacked = self
            .templates
            .unpack(
                frame.message_id,
                frame.message_type,
                frame.init_by_reader,
                &frame.data_bytes,
            )
            .ok()?;
        let word = unpacked.get("prms")?.get("ctrlword")?.get("val")?.as_u64()?;
        let bytes = [(word >> 8) as u8, (word & 0xFF) as u8];
        let control = frame::decode_control_word(&bytes).ok()?;
        Some((
            control.message_id,
            control.message_type,
            control.init_by_reader,
        ))
    }

    fn template_rcv_triple(&self, msid: &str) -> Option<(u8, u8, u8)> {
        let rcv = &self.templates.get(msid)?.rcv;
        let message_type = constants::message_type_by_label(&rcv.mtyp)?;
        let init = constants::init_by_label(&rcv.init)?;
        let mid = constants::mid_value(message_type, init, &rcv.msid)?;
        Some((mid, message_type, init))
    }

    fn deliver_reply(&mut self, pending: PendingRequest, frame: &Frame) {
        let reply_content = match self.templates.unpack(
            frame.message_id,
            frame.message_type,
            frame.init_by_reader,
            &frame.data_bytes,
        ) {
            Ok(content) => content,
            Err(err) => {
                logging::warn!(self.log, "reply unpack failed";
                               "context" => "match",
                               "web_req_id" => &pending.web_req_id,
                               "msid" => &pending.msid,
                               "error" => %err);
                return;
            }
        };
        let message = json!({
            "web-req-id": pending.web_req_id,
            "reply-content": reply_content,
        });
        if let Err(err) = self.bus.send(&pending.originator, MSG_CLU, &message) {
            logging::warn!(self.log, "reply delivery failed";
                           "context" => "match",
                           "to" => &pending.originator,
                           "error" => %err);
        }
    }

    /// Serve accumulated STS requests, oldest first.
    fn handle_sts(&mut self) {
        if let Err(err) = self.bus.receive("*", MSG_STS, true, None) {
            logging::warn!(self.log, "bus receive failed"; "context" => "sts", "error" => %err);
            return;
        }
        let mut messages = self.bus.take_all();
        messages.sort_by(|a, b| {
            a.timestamp
                .partial_cmp(&b.timestamp)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for message in messages {
            let web_req_id = match message.data.get("web-req-id").and_then(Value::as_str) {
                Some(id) => id.to_string(),
                None => {
                    logging::warn!(self.log, "status request without web-req-id"; "context" => "sts");
                    continue;
                }
            };
            let method = message
                .data
                .get("query-content")
                .and_then(|content| content.get("api-method"))
                .and_then(Value::as_str)
                .unwrap_or("");
            logging::debug!(self.log, "status request";
                            "context" => "sts",
                            "method" => method,
                            "from" => &message.from);
            let reply_content = self.serve_status_method(method);
            let reply = json!({
                "web-req-id": web_req_id,
                "reply-content": reply_content,
            });
            if let Err(err) = self.bus.send(&message.from, MSG_STS, &reply) {
                logging::warn!(self.log, "status reply delivery failed";
                               "context" => "sts",
                               "to" => &message.from,
                               "error" => %err);
            }
        }
    }

    fn serve_status_method(&mut self, method: &str) -> Value {
        match method {
            "update" => match self.templates.reload() {
                Ok(count) => json!({
                    "is-ok": true,
                    "result": format!("templates reloaded, {} commands known", count),
                }),
                Err(err) => json!({
                    "is-ok": false,
                    "result": format!("template reload failed: {}", err),
                }),
            },
            "shutdown" => {
                self.session.shutdown_requested = true;
                json!({"is-ok": true, "result": "shutdown scheduled"})
            }
            "getstatus" => json!({"is-ok": true, "result": self.status_snapshot()}),
            "cleandata" => {
                let erased = self.tag_buf.len();
                self.tag_buf.clear();
                self.tag_match.clear();
                json!({
                    "is-ok": true,
                    "result": format!("tag buffer erased {} records", erased),
                })
            }
            "getdatacount" => json!({"is-ok": true, "result": self.tag_buf.len()}),
            "getdata" => json!({"is-ok": true, "result": Value::Array(self.tag_buf.clone())}),
            other => json!({
                "is-ok": false,
                "result": format!("unknown api-method '{}'", other),
            }),
        }
    }

    pub fn status_snapshot(&self) -> Value {
        let stamp =
            |moment: Option<f64>| -> Value {
                match moment {
                    Some(moment) => Value::String(self.tz.format(moment)),
                    None => Value::Null,
                }
            };
        json!({
            "rid": self.rid,
            "connected": self.session.connected,
            "shutdown-requested": self.session.shutdown_requested,
            "process-up-since": stamp(Some(self.timers.process_up_since)),
            "reader-last-act-time": stamp(self.timers.reader_last_act_time),
            "reader-connected-since": stamp(self.timers.reader_connected_since),
            "reader-disconnected-since": stamp(self.timers.reader_disconnected_since),
            "last-clock-check": stamp(self.timers.last_clock_check),
            "ntp-offset-avg": self.ntp_log.average(),
            "ntp-offset-max": self.ntp_log.max(),
            "queue-to-send": self.queue_to_send.len(),
            "queue-sent": self.queue_sent.len(),
            "tag-records": self.tag_buf.len(),
            "timezone": self.tz.label(),
            "reader-config": self.reader,
            "reply-from-reader-timeout": self.config.reply_from_reader_timeout,
            "reader-no-life-timeout": self.config.reader_no_life_timeout,
            "tag-param-duplicate-exclude": self.config.tag_param_duplicate_exclude,
            "known-mids": self.templates.known(),
        })
    }

    /// A reader that stays silent past `reader-no-life-timeout` is assumed
    /// gone; the session is torn down so the lifecycle can rebuild it.
    fn check_liveness(&mut self) {
        if let Some(last_act) = self.timers.reader_last_act_time {
            if time::timestamp() - last_act > self.config.reader_no_life_timeout {
                logging::warn!(self.log, "no life from reader, forcing disconnect";
                               "context" => "liveness",
                               "timeout" => self.config.reader_no_life_timeout);
                self.drop_session();
            }
        }
    }

    fn check_clock(&mut self) {
        let now = time::timestamp();
        let due = self
            .timers
            .last_clock_check
            .map_or(true, |last| now - last >= self.reader.ntp_check_interval);
        if !due {
            return;
        }
        self.timers.last_clock_check = Some(now);
        if self.config.ntp_service_url.is_empty() {
            return;
        }
        let timeout = Duration::from_secs_f64(self.reader.sock_timeout.max(1.0));
        match ntp::query(&self.config.ntp_service_url, timeout) {
            Ok(offset) => {
                self.ntp_log.push(offset);
                if offset.abs() > self.config.max_server_time_offset {
                    logging::warn!(self.log, "server clock drift above limit";
                                   "context" => "clock",
                                   "offset" => offset,
                                   "limit" => self.config.max_server_time_offset);
                } else {
                    logging::debug!(self.log, "clock checked"; "context" => "clock", "offset" => offset);
                }
            }
            Err(err) => {
                logging::warn!(self.log, "clock check failed"; "context" => "clock", "error" => %err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    struct TestBed {
        engine: Engine,
        worker: FileMessageExchange,
        _root: tempfile::TempDir,
    }

    fn stop_template() -> Value {
        json!({
            "snd": {
                "msid": "OP_STOP", "mtyp": "TYPE_CONF_OPERATE", "init": "INIT_BY_USER",
                "tmpl": "", "prms": {}
            },
            "rcv": {
                "msid": "OP_STOP", "mtyp": "TYPE_CONF_OPERATE", "init": "INIT_BY_USER",
                "tmpl": "[result]",
                "prms": {
                    "result": {"pid": "M", "type": "U8", "is-fixed-len": true, "len": 1, "val": -1}
                }
            }
        })
    }

    fn power_template() -> Value {
        json!({
            "snd": {
                "msid": "OP_CONF_POWER", "mtyp": "TYPE_CONF_OPERATE", "init": "INIT_BY_USER",
                "tmpl": "[power]",
                "prms": {
                    "power": {"pid": "M", "type": "U8", "is-fixed-len": true, "len": 1, "val": -1}
                }
            },
            "rcv": {
                "msid": "OP_CONF_POWER", "mtyp": "TYPE_CONF_OPERATE", "init": "INIT_BY_USER",
                "tmpl": "[result]",
                "prms": {
                    "result": {"pid": "M", "type": "U8", "is-fixed-len": true, "len": 1, "val": -1}
                }
            }
        })
    }

    fn error_template() -> Value {
        json!({
            "snd": {
                "msid": "ERR_MID", "mtyp": "TYPE_ERR_WARN", "init": "INIT_BY_READER",
                "tmpl": "", "prms": {}
            },
            "rcv": {
                "msid": "ERR_MID", "mtyp": "TYPE_ERR_WARN", "init": "INIT_BY_READER",
                "tmpl": "[ctrlword][errtype]",
                "prms": {
                    "ctrlword": {"pid": "M", "type": "U16", "is-fixed-len": true, "len": 2, "val": -1},
                    "errtype": {"pid": "M", "type": "U8", "is-fixed-len": true, "len": 1, "val": -1}
                }
            }
        })
    }

    fn testbed() -> TestBed {
        let root = tempfile::tempdir().unwrap();
        let cmds_dir = root.path().join("cmds");
        let run_dir = root.path().join("run");
        fs::create_dir_all(&cmds_dir).unwrap();
        fs::create_dir_all(&run_dir).unwrap();
        for (msid, body) in [
            ("OP_STOP", stop_template()),
            ("OP_CONF_POWER", power_template()),
            ("ERR_MID", error_template()),
        ]
        .iter()
        {
            fs::write(
                cmds_dir.join(format!("{}.json", msid)),
                serde_json::to_string(body).unwrap(),
            )
            .unwrap();
        }

        let rid = "test_rdr";
        let mut readers = HashMap::new();
        readers.insert(
            rid.to_string(),
            ReaderConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                reader_mode: ReaderMode::Server,
                sock_timeout: 0.05,
                parse_limit: 50,
                ntp_check_interval: 3600.0,
                log_tag_frames: true,
            },
        );
        let config = Config {
            log_dir: root.path().to_str().unwrap().to_string(),
            cmds_dir: cmds_dir.to_str().unwrap().to_string(),
            clou_run: run_dir.to_str().unwrap().to_string(),
            readers_list: vec![rid.to_string()],
            reply_from_reader_timeout: 2.0,
            delay_between_reads: 0.05,
            ntp_service_url: String::new(),
            max_server_time_offset: 1.0,
            reader_no_life_timeout: 30.0,
            tag_param_duplicate_exclude: vec!["SERIES_NUM".to_string(), "TIME".to_string()],
            readers,
        };

        let engine = Engine::new(
            rid,
            config,
            Timezone::utc(),
            logging::discard(),
            0.01,
        )
        .unwrap();
        let bus_dir: PathBuf = run_dir.join(rid);
        let worker = FileMessageExchange::new("w1", &bus_dir, &[MSG_CLU, MSG_STS]).unwrap();
        TestBed {
            engine,
            worker,
            _root: root,
        }
    }

    fn ping_frame(echo: &[u8; 4]) -> Vec<u8> {
        Frame::new(
            constants::MAN_READER_CONN_CONFIRM,
            constants::TYPE_CONF_MANAGE,
            constants::INIT_BY_READER,
            echo.to_vec(),
        )
        .encode(true)
    }

    fn tag_upload_frame(epc: &[u8], series: Option<&[u8; 4]>, scan_time: Option<u32>) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&(epc.len() as u16).to_be_bytes());
        data.extend_from_slice(epc);
        data.extend_from_slice(&[0x30, 0x00]); // PC value
        data.push(0x01); // antenna
        if let Some(series) = series {
            data.push(constants::TAG_SERIES_NUM);
            data.extend_from_slice(series);
        }
        if let Some(seconds) = scan_time {
            data.push(constants::TAG_TIME);
            data.extend_from_slice(&seconds.to_be_bytes());
            data.extend_from_slice(&0u32.to_be_bytes());
        }
        Frame::new(
            constants::OP_READER_EPC_DATA_UPLOAD,
            constants::TYPE_CONF_OPERATE,
            constants::INIT_BY_READER,
            data,
        )
        .encode(true)
    }

    #[test]
    fn test_ping_answered_from_priority_buffer() {
        let mut bed = testbed();
        bed.engine.ingest(&ping_frame(&[0x00, 0x11, 0x22, 0x33]));

        let expected = Frame::new(
            constants::MAN_CONN_CONFIRM,
            constants::TYPE_CONF_MANAGE,
            constants::INIT_BY_USER,
            vec![0x00, 0x11, 0x22, 0x33],
        )
        .encode(true);
        assert_eq!(bed.engine.priority_out, expected);
        // The ping never becomes a pending request or an inbound frame.
        assert!(bed.engine.queue_to_send.is_empty());
        assert!(bed.engine.inbound.is_empty());
    }

    #[test]
    fn test_out_of_schema_ping_ignored() {
        let mut bed = testbed();
        // 5 echo bytes instead of 4: consumed but not answered.
        let odd = Frame::new(
            constants::MAN_READER_CONN_CONFIRM,
            constants::TYPE_CONF_MANAGE,
            constants::INIT_BY_READER,
            vec![1, 2, 3, 4, 5],
        )
        .encode(true);
        bed.engine.ingest(&odd);
        assert!(bed.engine.priority_out.is_empty());
        assert!(bed.engine.inbound.is_empty());
    }

    #[test]
    fn test_tag_upload_acked_and_buffered() {
        let mut bed = testbed();
        bed.engine
            .ingest(&tag_upload_frame(&[0xE2, 0x80, 0x11], Some(&[0xAA, 0xBB, 0xCC, 0xDD]), None));

        let expected = Frame::new(
            constants::MAN_TAG_DATA_RESPONSE,
            constants::TYPE_CONF_MANAGE,
            constants::INIT_BY_USER,
            vec![0xAA, 0xBB, 0xCC, 0xDD],
        )
        .encode(true);
        assert_eq!(bed.engine.priority_out, expected);
        assert_eq!(bed.engine.tag_buf.len(), 1);
        assert_eq!(bed.engine.tag_buf[0]["EPC_code"], "E28011");
    }

    #[test]
    fn test_tag_upload_without_series_not_acked() {
        let mut bed = testbed();
        bed.engine.ingest(&tag_upload_frame(&[0xE2], None, None));
        assert!(bed.engine.priority_out.is_empty());
        assert_eq!(bed.engine.tag_buf.len(), 1);
    }

    #[test]
    fn test_tag_dedup_on_stripped_fields() {
        let mut bed = testbed();
        // Same EPC and antenna, different sequence number and scan time.
        bed.engine
            .ingest(&tag_upload_frame(&[0xE2, 0x80], Some(&[0, 0, 0, 1]), Some(100)));
        bed.engine
            .ingest(&tag_upload_frame(&[0xE2, 0x80], Some(&[0, 0, 0, 2]), Some(101)));
        assert_eq!(bed.engine.tag_buf.len(), 1);

        // A different EPC is a new record.
        bed.engine
            .ingest(&tag_upload_frame(&[0xE2, 0x81], Some(&[0, 0, 0, 3]), Some(102)));
        assert_eq!(bed.engine.tag_buf.len(), 2);
    }

    fn send_query(bed: &TestBed, web_req_id: &str, msid: &str, prms: Value) {
        bed.worker
            .send(
                "test_rdr",
                MSG_CLU,
                &json!({
                    "web-req-id": web_req_id,
                    "query-content": {"msid": msid, "prms": prms},
                }),
            )
            .unwrap();
    }

    #[test]
    fn test_query_reply_round_trip() {
        let mut bed = testbed();
        send_query(&bed, "abc", "OP_STOP", json!({}));

        bed.engine.pump_clu();
        assert_eq!(bed.engine.queue_to_send.len(), 1);
        let expected = Frame::new(0xFF, constants::TYPE_CONF_OPERATE, constants::INIT_BY_USER, vec![])
            .encode(true);
        assert_eq!(bed.engine.standard_out, expected);

        bed.engine.standard_out.clear();
        bed.engine.mark_sent();
        assert_eq!(bed.engine.queue_sent.len(), 1);

        // The reader confirms the stop.
        let reply = Frame::new(0xFF, constants::TYPE_CONF_OPERATE, constants::INIT_BY_USER, vec![0x00])
            .encode(true);
        bed.engine.ingest(&reply);
        bed.engine.match_replies();
        assert!(bed.engine.queue_sent.is_empty());

        bed.worker.receive("test_rdr", MSG_CLU, true, None).unwrap();
        let delivered = bed.worker.take_all();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].data["web-req-id"], "abc");
        assert_eq!(delivered[0].data["reply-content"]["msid"], "OP_STOP");
        assert_eq!(delivered[0].data["reply-content"]["prms"]["result"]["val"], 0);
    }

    #[test]
    fn test_reply_matching_is_fifo() {
        let mut bed = testbed();
        send_query(&bed, "first", "OP_STOP", json!({}));
        // The embedded filename timestamps decide the order; keep them apart.
        thread::sleep(Duration::from_millis(2));
        send_query(&bed, "second", "OP_STOP", json!({}));

        bed.engine.pump_clu();
        assert_eq!(bed.engine.queue_to_send.len(), 2);
        assert_eq!(bed.engine.queue_to_send[0].web_req_id, "first");
        bed.engine.mark_sent();

        let reply = Frame::new(0xFF, constants::TYPE_CONF_OPERATE, constants::INIT_BY_USER, vec![0x00])
            .encode(true);
        bed.engine.ingest(&reply);
        bed.engine.match_replies();

        // The oldest in-flight request claimed the reply.
        assert_eq!(bed.engine.queue_sent.len(), 1);
        assert_eq!(bed.engine.queue_sent[0].web_req_id, "second");

        bed.worker.receive("test_rdr", MSG_CLU, true, None).unwrap();
        let delivered = bed.worker.take_all();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].data["web-req-id"], "first");
    }

    #[test]
    fn test_mandatory_parameter_missing_drops_request() {
        let mut bed = testbed();
        send_query(&bed, "bad", "OP_CONF_POWER", json!({}));
        bed.engine.pump_clu();
        assert!(bed.engine.queue_to_send.is_empty());
        assert!(bed.engine.standard_out.is_empty());
    }

    #[test]
    fn test_request_with_parameter_packs() {
        let mut bed = testbed();
        send_query(&bed, "pwr", "OP_CONF_POWER", json!({"power": {"val": 20}}));
        bed.engine.pump_clu();
        let expected = Frame::new(0x01, constants::TYPE_CONF_OPERATE, constants::INIT_BY_USER, vec![20])
            .encode(true);
        assert_eq!(bed.engine.standard_out, expected);
    }

    #[test]
    fn test_expired_request_dropped_silently() {
        let mut bed = testbed();
        send_query(&bed, "late", "OP_STOP", json!({}));
        bed.engine.pump_clu();
        bed.engine.mark_sent();
        // Age the request past the reply timeout.
        bed.engine.queue_sent[0].sent_at = Some(time::timestamp() - 10.0);
        bed.engine.expire_inflight();
        assert!(bed.engine.queue_sent.is_empty());

        bed.worker.receive("test_rdr", MSG_CLU, true, None).unwrap();
        assert!(bed.worker.take_all().is_empty());
    }

    #[test]
    fn test_error_frame_matches_by_control_word() {
        let mut bed = testbed();
        send_query(&bed, "err", "OP_STOP", json!({}));
        bed.engine.pump_clu();
        bed.engine.mark_sent();

        // Error frame: the referenced control word is our OP_STOP command
        // (type 2, user initiated, mid 0xFF), error type 4.
        let err_frame = Frame::new(
            constants::ERR_MID,
            constants::TYPE_ERR_WARN,
            constants::INIT_BY_READER,
            vec![0x02, 0xFF, 0x04],
        )
        .encode(true);
        bed.engine.ingest(&err_frame);
        bed.engine.match_replies();
        assert!(bed.engine.queue_sent.is_empty());

        bed.worker.receive("test_rdr", MSG_CLU, true, None).unwrap();
        let delivered = bed.worker.take_all();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].data["web-req-id"], "err");
        assert_eq!(delivered[0].data["reply-content"]["msid"], "ERR_MID");
        assert_eq!(delivered[0].data["reply-content"]["prms"]["errtype"]["val"], 4);
    }

    #[test]
    fn test_own_confirm_echo_suppressed() {
        let mut bed = testbed();
        // Reader's empty confirmation of our MAN_CONN_CONFIRM; no pending
        // request matches it and no warning is due, it just disappears.
        let echo = Frame::new(
            constants::MAN_CONN_CONFIRM,
            constants::TYPE_CONF_MANAGE,
            constants::INIT_BY_USER,
            vec![],
        )
        .encode(true);
        bed.engine.ingest(&echo);
        bed.engine.match_replies();
        assert!(bed.engine.inbound.is_empty());
        assert!(bed.engine.queue_sent.is_empty());
    }

    fn send_status(bed: &TestBed, web_req_id: &str, method: &str) {
        bed.worker
            .send(
                "test_rdr",
                MSG_STS,
                &json!({
                    "web-req-id": web_req_id,
                    "query-content": {"api-method": method},
                }),
            )
            .unwrap();
    }

    fn status_reply(bed: &mut TestBed) -> Value {
        bed.worker.receive("test_rdr", MSG_STS, true, None).unwrap();
        let mut delivered = bed.worker.take_all();
        assert_eq!(delivered.len(), 1);
        delivered.remove(0).data
    }

    #[test]
    fn test_cleandata_and_counts() {
        let mut bed = testbed();
        for index in 0..5u8 {
            bed.engine
                .ingest(&tag_upload_frame(&[0xE2, index], Some(&[0, 0, 0, index]), None));
        }
        assert_eq!(bed.engine.tag_buf.len(), 5);

        send_status(&bed, "c1", "cleandata");
        bed.engine.handle_sts();
        let reply = status_reply(&mut bed);
        assert_eq!(reply["web-req-id"], "c1");
        assert_eq!(reply["reply-content"]["is-ok"], true);
        assert!(reply["reply-content"]["result"]
            .as_str()
            .unwrap()
            .contains("erased 5"));

        send_status(&bed, "c2", "getdatacount");
        bed.engine.handle_sts();
        let reply = status_reply(&mut bed);
        assert_eq!(reply["reply-content"]["result"], 0);
    }

    #[test]
    fn test_getdata_returns_records() {
        let mut bed = testbed();
        bed.engine
            .ingest(&tag_upload_frame(&[0xE2, 0x80, 0x11], Some(&[0, 0, 0, 9]), None));

        send_status(&bed, "d1", "getdata");
        bed.engine.handle_sts();
        let reply = status_reply(&mut bed);
        let records = reply["reply-content"]["result"].as_array().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["EPC_code"], "E28011");
    }

    #[test]
    fn test_getstatus_snapshot() {
        let mut bed = testbed();
        send_status(&bed, "s1", "getstatus");
        bed.engine.handle_sts();
        let reply = status_reply(&mut bed);
        let snapshot = &reply["reply-content"]["result"];
        assert_eq!(snapshot["rid"], "test_rdr");
        assert_eq!(snapshot["connected"], false);
        assert_eq!(snapshot["reader-connected-since"], Value::Null);
        assert_eq!(snapshot["timezone"], "+0000");
        assert_eq!(snapshot["ntp-offset-max"], 0.01);
        assert!(snapshot["known-mids"]
            .as_array()
            .unwrap()
            .iter()
            .any(|label| label == "OP_STOP"));
    }

    #[test]
    fn test_shutdown_scheduled() {
        let mut bed = testbed();
        send_status(&bed, "k1", "shutdown");
        bed.engine.handle_sts();
        assert!(bed.engine.session.shutdown_requested);
        let reply = status_reply(&mut bed);
        assert_eq!(reply["reply-content"]["is-ok"], true);
    }

    #[test]
    fn test_update_reloads_templates() {
        let mut bed = testbed();
        // A new template file appears on disk after startup.
        let cmds_dir = PathBuf::from(bed.engine.config.cmds_dir.clone());
        let mut extra = stop_template();
        extra["snd"]["msid"] = json!("MAN_QUERY_INFO");
        extra["rcv"]["msid"] = json!("MAN_QUERY_INFO");
        fs::write(
            cmds_dir.join("MAN_QUERY_INFO.json"),
            serde_json::to_string(&extra).unwrap(),
        )
        .unwrap();

        send_status(&bed, "u1", "update");
        bed.engine.handle_sts();
        let reply = status_reply(&mut bed);
        assert_eq!(reply["reply-content"]["is-ok"], true);
        assert!(bed.engine.templates.get("MAN_QUERY_INFO").is_some());
    }

    #[test]
    fn test_disconnect_timers() {
        let mut bed = testbed();
        bed.engine.session.connected = true;
        bed.engine.timers.reader_connected_since = Some(time::timestamp());
        bed.engine.on_disconnected();
        assert!(!bed.engine.session.connected);
        assert_eq!(bed.engine.timers.reader_connected_since, None);
        assert!(bed.engine.timers.reader_disconnected_since.is_some());

        let snapshot = bed.engine.status_snapshot();
        assert_eq!(snapshot["reader-connected-since"], Value::Null);
        assert_ne!(snapshot["reader-disconnected-since"], Value::Null);
    }

    #[test]
    fn test_liveness_forces_disconnect() {
        let mut bed = testbed();
        bed.engine.session.connected = true;
        bed.engine.timers.reader_last_act_time = Some(time::timestamp() - 100.0);
        bed.engine.check_liveness();
        assert!(!bed.engine.session.connected);
    }
}
