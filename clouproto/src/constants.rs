//! Constants of the Clou reader protocol: message types, message ids per
//! type and initiation direction, and the decode tables for the various
//! status and error codes carried on the wire.

pub const RS485_USED: u8 = 1;
pub const RS485_NOT_USED: u8 = 0;

pub const INIT_BY_READER: u8 = 1;
pub const INIT_BY_USER: u8 = 0;

pub const TYPE_ERR_WARN: u8 = 0;
pub const TYPE_CONF_MANAGE: u8 = 1;
pub const TYPE_CONF_OPERATE: u8 = 2;
pub const TYPE_LOG: u8 = 3;
pub const TYPE_APP_UPGRADE: u8 = 4;
pub const TYPE_TEST: u8 = 5;

// Reader statuses
pub const STATUS_IDLE: u8 = 0;
pub const STATUS_EXECUTION: u8 = 1;
pub const STATUS_ERROR: u8 = 2;

// MIDs the session engine handles directly
pub const ERR_MID: u8 = 0x00;
pub const MAN_CONN_CONFIRM: u8 = 0x12;
pub const MAN_TAG_DATA_RESPONSE: u8 = 0x1D;
pub const MAN_READER_CONN_CONFIRM: u8 = 0x12;
pub const OP_READER_EPC_DATA_UPLOAD: u8 = 0x00;

// Optional tag data parameter ids
pub const TAG_RSSI: u8 = 0x01;
pub const TAG_DATA_READ_RESULT: u8 = 0x02;
pub const TAG_TID: u8 = 0x03;
pub const TAG_USER_AREA: u8 = 0x04;
pub const TAG_RETENTION_AREA: u8 = 0x05;
pub const TAG_SUB_ANT: u8 = 0x06;
pub const TAG_TIME: u8 = 0x07;
pub const TAG_SERIES_NUM: u8 = 0x08;
pub const TAG_FREQ: u8 = 0x09;
pub const TAG_PHASE: u8 = 0x0A;
pub const TAG_EM_SENSOR_DATA: u8 = 0x0B;
pub const TAG_ADDITIONAL_DATA: u8 = 0x0C;

pub static MID_ERR_READER: &[(u8, &str)] = &[(0x00, "ERR_MID")];

pub static MID_MAN_USER: &[(u8, &str)] = &[
    (0x00, "MAN_QUERY_INFO"),
    (0x01, "MAN_QUERY_BASEBAND"),
    (0x02, "MAN_CONF_RS232"),
    (0x03, "MAN_QUERY_RS232_CONF"),
    (0x04, "MAN_IP_CONF"),
    (0x05, "MAN_QUERY_IP"),
    (0x06, "MAN_QUERY_MAC"),
    (0x07, "MAN_CONF_CLI_SRV_MODE"),
    (0x08, "MAN_QUERY_CLI_SRV_MODE"),
    (0x09, "MAN_CONF_GPO"),
    (0x0A, "MAN_QUERY_GPI_STATUS"),
    (0x0B, "MAN_CONF_GPI_TRIG"),
    (0x0C, "MAN_QUERY_GPI_TRIG"),
    (0x0D, "MAN_CONF_WIEGAND"),
    (0x0E, "MAN_QUERY_WIEGAND"),
    (0x0F, "MAN_RESTART"),
    (0x10, "MAN_CONF_TIME"),
    (0x11, "MAN_QUERY_TIME"),
    (0x12, "MAN_CONN_CONFIRM"),
    (0x13, "MAN_CONF_MAC"),
    (0x14, "MAN_RESTORE_DEFAULT"),
    (0x15, "MAN_CONF_RS485_ADR"),
    (0x16, "MAN_QUERY_RS485_ADR"),
    (0x1D, "MAN_TAG_DATA_RESPONSE"),
    (0x1F, "MAN_BUZZ_CONTROL"),
];

pub static MID_MAN_READER: &[(u8, &str)] = &[
    (0x00, "MAN_READER_TRIG_START_MESS"),
    (0x01, "MAN_READER_TRIG_STOP_MESS"),
    (0x12, "MAN_READER_CONN_CONFIRM"),
];

pub static MID_OP_USER: &[(u8, &str)] = &[
    (0x00, "OP_QUERY_RFID_ABILITY"),
    (0x01, "OP_CONF_POWER"),
    (0x02, "OP_QUERY_POWER"),
    (0x03, "OP_CONF_RF_BAND"),
    (0x04, "OP_QUERY_RF_BAND"),
    (0x05, "OP_CONF_FREQ"),
    (0x06, "OP_QUERY_FREQ"),
    (0x07, "OP_CONF_ANT"),
    (0x08, "OP_QUERY_ANT"),
    (0x09, "OP_CONF_TAG_UPLOAD"),
    (0x0A, "OP_QUERY_TAG_UPLOAD"),
    (0x0B, "OP_CONF_EPC_BASEBAND"),
    (0x0C, "OP_QUERY_EPC_BASEBAND"),
    (0x0D, "OP_CONF_AUTO_IDLE"),
    (0x0E, "OP_QUERY_AUTO_IDLE"),
    (0x10, "OP_READ_EPC_TAG"),
    (0x11, "OP_WRITE_EPC_TAG"),
    (0x12, "OP_LOCK_TAG"),
    (0x13, "OP_KILL_TAG"),
    (0x40, "OP_READ_6B_TAG"),
    (0x41, "OP_WRITE_6B_TAG"),
    (0x42, "OP_LOCK_6B_TAG"),
    (0x43, "OP_QUERY_6B_TAG_LOCKING"),
    (0xFF, "OP_STOP"),
];

pub static MID_OP_READER: &[(u8, &str)] = &[
    (0x00, "OP_READER_EPC_DATA_UPLOAD"),
    (0x01, "OP_READER_EPC_READ_FINISH"),
    (0x02, "OP_READER_6B_DATA_UPLOAD"),
    (0x03, "OP_READER_6B_READ_QUIT"),
];

static TAG_DATA_LABELS: &[(u8, &str)] = &[
    (TAG_RSSI, "RSSI"),
    (TAG_DATA_READ_RESULT, "DATA_READ_RESULT"),
    (TAG_TID, "TID"),
    (TAG_USER_AREA, "USER_AREA"),
    (TAG_RETENTION_AREA, "RETENTION_AREA"),
    (TAG_SUB_ANT, "SUB_ANT"),
    (TAG_TIME, "TIME"),
    (TAG_SERIES_NUM, "SERIES_NUM"),
    (TAG_FREQ, "FREQ"),
    (TAG_PHASE, "PHASE"),
    (TAG_EM_SENSOR_DATA, "EM_SENSOR_DATA"),
    (TAG_ADDITIONAL_DATA, "ADDITIONAL_DATA"),
];

fn mid_table(message_type: u8, init_by_reader: u8) -> Option<&'static [(u8, &'static str)]> {
    match (message_type, init_by_reader) {
        (TYPE_ERR_WARN, INIT_BY_READER) => Some(MID_ERR_READER),
        (TYPE_CONF_MANAGE, INIT_BY_USER) => Some(MID_MAN_USER),
        (TYPE_CONF_MANAGE, INIT_BY_READER) => Some(MID_MAN_READER),
        (TYPE_CONF_OPERATE, INIT_BY_USER) => Some(MID_OP_USER),
        (TYPE_CONF_OPERATE, INIT_BY_READER) => Some(MID_OP_READER),
        _ => None,
    }
}

/// Label of a message id within the given type and direction.
pub fn mid_label(message_type: u8, init_by_reader: u8, mid: u8) -> Option<&'static str> {
    mid_table(message_type, init_by_reader)?
        .iter()
        .find(|(value, _)| *value == mid)
        .map(|(_, label)| *label)
}

/// Message id value of a label within the given type and direction.
pub fn mid_value(message_type: u8, init_by_reader: u8, label: &str) -> Option<u8> {
    mid_table(message_type, init_by_reader)?
        .iter()
        .find(|(_, name)| *name == label)
        .map(|(value, _)| *value)
}

/// Resolve a label to its `(mid, message_type, init_by_reader)` triple.
/// Labels are unique across all tables.
pub fn mid_by_label(label: &str) -> Option<(u8, u8, u8)> {
    let tables = [
        (TYPE_ERR_WARN, INIT_BY_READER, MID_ERR_READER),
        (TYPE_CONF_MANAGE, INIT_BY_USER, MID_MAN_USER),
        (TYPE_CONF_MANAGE, INIT_BY_READER, MID_MAN_READER),
        (TYPE_CONF_OPERATE, INIT_BY_USER, MID_OP_USER),
        (TYPE_CONF_OPERATE, INIT_BY_READER, MID_OP_READER),
    ];
    for (message_type, init, table) in tables.iter() {
        if let Some((value, _)) = table.iter().find(|(_, name)| *name == label) {
            return Some((*value, *message_type, *init));
        }
    }
    None
}

pub fn is_known_mid(label: &str) -> bool {
    mid_by_label(label).is_some()
}

/// Every message id label the protocol defines.
pub fn known_mids() -> Vec<&'static str> {
    MID_MAN_USER
        .iter()
        .chain(MID_MAN_READER.iter())
        .chain(MID_OP_USER.iter())
        .chain(MID_OP_READER.iter())
        .chain(MID_ERR_READER.iter())
        .map(|(_, label)| *label)
        .collect()
}

pub fn message_type_label(message_type: u8) -> Option<&'static str> {
    match message_type {
        TYPE_ERR_WARN => Some("TYPE_ERR_WARN"),
        TYPE_CONF_MANAGE => Some("TYPE_CONF_MANAGE"),
        TYPE_CONF_OPERATE => Some("TYPE_CONF_OPERATE"),
        TYPE_LOG => Some("TYPE_LOG"),
        TYPE_APP_UPGRADE => Some("TYPE_APP_UPGRADE"),
        TYPE_TEST => Some("TYPE_TEST"),
        _ => None,
    }
}

pub fn message_type_by_label(label: &str) -> Option<u8> {
    match label {
        "TYPE_ERR_WARN" => Some(TYPE_ERR_WARN),
        "TYPE_CONF_MANAGE" => Some(TYPE_CONF_MANAGE),
        "TYPE_CONF_OPERATE" => Some(TYPE_CONF_OPERATE),
        "TYPE_LOG" => Some(TYPE_LOG),
        "TYPE_APP_UPGRADE" => Some(TYPE_APP_UPGRADE),
        "TYPE_TEST" => Some(TYPE_TEST),
        _ => None,
    }
}

pub fn init_label(init_by_reader: u8) -> &'static str {
    if init_by_reader == INIT_BY_READER {
        "INIT_BY_READER"
    } else {
        "INIT_BY_USER"
    }
}

pub fn init_by_label(label: &str) -> Option<u8> {
    match label {
        "INIT_BY_READER" => Some(INIT_BY_READER),
        "INIT_BY_USER" => Some(INIT_BY_USER),
        _ => None,
    }
}

pub fn rs485_label(rs485_mark: u8) -> &'static str {
    if rs485_mark == RS485_USED {
        "RS485_USED"
    } else {
        "RS485_NOT_USED"
    }
}

pub fn tag_param_label(id: u8) -> Option<&'static str> {
    TAG_DATA_LABELS
        .iter()
        .find(|(value, _)| *value == id)
        .map(|(_, label)| *label)
}

pub fn tag_param_by_label(label: &str) -> Option<u8> {
    TAG_DATA_LABELS
        .iter()
        .find(|(_, name)| *name == label)
        .map(|(value, _)| *value)
}

/// Error type carried in the payload of an error-warning frame.
pub fn error_type_text(code: u8) -> &'static str {
    match code {
        0 => "0 error type",
        1 => "CRC calibration error",
        2 => "wrong MID",
        3 => "protocol control word other error",
        4 => "current status can not execute the command",
        5 => "command list full",
        6 => "message parameter incomplete",
        7 => "frame length exceed limitation",
        _ => "other error",
    }
}

pub fn reader_status_text(code: u8) -> &'static str {
    match code {
        STATUS_IDLE => "Idle status",
        STATUS_EXECUTION => "Execution status",
        STATUS_ERROR => "Error status",
        _ => "Unknown status",
    }
}

pub fn read_result_text(code: u8) -> &'static str {
    match code {
        0 => "Read successful",
        1 => "Tag no response",
        2 => "CRC error",
        3 => "Data area is locked",
        4 => "Data area overflow",
        5 => "Access password error",
        6 => "Other tag error",
        _ => "Other reader error",
    }
}

pub fn freq_band_text(code: u8) -> &'static str {
    match code {
        0 => "920~925MHz",
        1 => "840~845MHz",
        2 => "840~845MHz & 920~925MHz",
        3 => "FCC: 902~928MHz",
        4 => "ETSI: 866~868MHz",
        5 => "JP: 916.8~920.4MHz",
        6 => "TW: 922.25~927.75MHz",
        7 => "ID: 923.125~925.125MHz",
        8 => "RU: 866.6~867.4MHz",
        _ => "Unknown band",
    }
}

pub fn rfid_protocol_text(code: u8) -> &'static str {
    match code {
        0 => "ISO18000-6C/EPC C1G2",
        1 => "ISO18000-6B",
        2 => "China standard GB/T 29768-2013",
        3 => "China Military GJB 7383.1-2011",
        _ => "Unknown protocol",
    }
}
