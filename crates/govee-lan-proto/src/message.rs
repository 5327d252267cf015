// ── Wire messages ──
//
// One UDP datagram carries one JSON envelope: {"msg":{"cmd":<tag>,"data":{..}}}.
// Outbound commands and inbound responses share the envelope but not the
// payload shapes, so encode and decode are modeled separately.

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

// Message tags shared by both directions.
pub const MSG_SCAN: &str = "scan";
pub const MSG_STATUS: &str = "devStatus";
pub const MSG_TURN: &str = "turn";
pub const MSG_BRIGHTNESS: &str = "brightness";
pub const MSG_COLOR: &str = "colorwc";
pub const MSG_PT_REAL: &str = "ptReal";

/// Sentinel address reported when an announcement omits its `ip` field.
pub const UNKNOWN_IP: &str = "unknown";

// ── Shared payload types ───────────────────────────────────────────

/// An RGB triple as it appears on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Rgb {
    #[serde(default)]
    pub r: u8,
    #[serde(default)]
    pub g: u8,
    #[serde(default)]
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

impl From<(u8, u8, u8)> for Rgb {
    fn from((r, g, b): (u8, u8, u8)) -> Self {
        Self { r, g, b }
    }
}

/// The two mutually exclusive color modes of the `colorwc` command.
///
/// RGB mode zeroes the kelvin field; temperature mode zeroes the RGB
/// fields. The device treats whichever side is non-zero as the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    Rgb(Rgb),
    Kelvin(u32),
}

// ── Outbound requests ──────────────────────────────────────────────

/// An outbound command, one variant per wire tag.
///
/// Scene and segment commands both serialize as `ptReal` carrying an
/// opaque byte blob understood only by the device firmware; the codec
/// hex-encodes it without interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Scan,
    DevStatus,
    Turn { on: bool },
    Brightness { value: u8 },
    Color(ColorMode),
    PtReal { payload: Vec<u8> },
}

impl Request {
    /// The wire tag for this request.
    pub const fn command(&self) -> &'static str {
        match self {
            Self::Scan => MSG_SCAN,
            Self::DevStatus => MSG_STATUS,
            Self::Turn { .. } => MSG_TURN,
            Self::Brightness { .. } => MSG_BRIGHTNESS,
            Self::Color(_) => MSG_COLOR,
            Self::PtReal { .. } => MSG_PT_REAL,
        }
    }

    fn data(&self) -> Value {
        match self {
            Self::Scan => json!({ "account_topic": "reserve" }),
            Self::DevStatus => json!({}),
            Self::Turn { on } => json!({ "value": i32::from(*on) }),
            Self::Brightness { value } => json!({ "value": value }),
            Self::Color(ColorMode::Rgb(rgb)) => json!({
                "color": { "r": rgb.r, "g": rgb.g, "b": rgb.b },
                "colorTemInKelvin": 0,
            }),
            Self::Color(ColorMode::Kelvin(kelvin)) => json!({
                "color": { "r": 0, "g": 0, "b": 0 },
                "colorTemInKelvin": kelvin,
            }),
            Self::PtReal { payload } => json!({ "command": [hex::encode(payload)] }),
        }
    }

    /// Serialize to the UTF-8 JSON envelope sent on the wire.
    pub fn encode(&self) -> Vec<u8> {
        let envelope = json!({ "msg": { "cmd": self.command(), "data": self.data() } });
        // json! output of string keys and scalar values cannot fail to serialize.
        serde_json::to_vec(&envelope).unwrap_or_default()
    }
}

/// Free-function form of [`Request::encode`].
pub fn encode(request: &Request) -> Vec<u8> {
    request.encode()
}

// ── Inbound responses ──────────────────────────────────────────────

/// A device announcing itself in reply to a `scan` broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAnnouncement {
    pub ip: String,
    pub device_id: String,
    pub model: String,
    pub ble_hardware_version: String,
    pub ble_software_version: String,
    pub wifi_hardware_version: String,
    pub wifi_software_version: String,
}

/// A device reporting its live state in reply to a `devStatus` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus {
    pub on: bool,
    pub brightness: u8,
    pub color: Rgb,
    pub color_temperature_kelvin: u32,
}

/// A successfully decoded inbound datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Announcement(DeviceAnnouncement),
    Status(DeviceStatus),
}

#[derive(Deserialize)]
struct Envelope {
    msg: EnvelopeMsg,
}

#[derive(Deserialize)]
struct EnvelopeMsg {
    cmd: String,
    data: Value,
}

/// The `device` field of a scan response has two historical shapes:
/// a bare string holding the device id, or an object carrying
/// `deviceId` and optionally `sku`.
#[derive(Deserialize)]
#[serde(untagged)]
enum DeviceField {
    Id(String),
    Object {
        #[serde(rename = "deviceId")]
        device_id: Option<String>,
        sku: Option<String>,
    },
}

#[derive(Deserialize)]
struct ScanData {
    device: Option<DeviceField>,
    ip: Option<String>,
    #[serde(rename = "deviceId")]
    device_id: Option<String>,
    sku: Option<String>,
    #[serde(rename = "bleVersionHard", default)]
    ble_version_hard: String,
    #[serde(rename = "bleVersionSoft", default)]
    ble_version_soft: String,
    #[serde(rename = "wifiVersionHard", default)]
    wifi_version_hard: String,
    #[serde(rename = "wifiVersionSoft", default)]
    wifi_version_soft: String,
}

#[derive(Deserialize)]
struct StatusData {
    #[serde(rename = "onOff", default)]
    on_off: u8,
    #[serde(default)]
    brightness: u8,
    #[serde(default)]
    color: Rgb,
    #[serde(rename = "colorTemInKelvin", default)]
    color_tem_in_kelvin: u32,
}

/// Decode an inbound datagram.
///
/// Returns `None` for anything that is not a well-formed announcement
/// or status snapshot: invalid UTF-8/JSON, a missing `msg`/`cmd`/`data`
/// field, a scan response with no resolvable device id, or an unknown
/// `cmd` tag (forward compatibility -- newer firmware may emit tags we
/// do not understand). Failures are logged, never raised.
pub fn decode(data: &[u8]) -> Option<Response> {
    let envelope: Envelope = match serde_json::from_slice(data) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(error = %err, "unparseable datagram");
            return None;
        }
    };

    match envelope.msg.cmd.as_str() {
        MSG_SCAN => decode_scan(envelope.msg.data).map(Response::Announcement),
        MSG_STATUS => decode_status(envelope.msg.data).map(Response::Status),
        other => {
            debug!(cmd = other, "ignoring message with unknown cmd tag");
            None
        }
    }
}

fn decode_scan(data: Value) -> Option<DeviceAnnouncement> {
    let scan: ScanData = match serde_json::from_value(data) {
        Ok(scan) => scan,
        Err(err) => {
            warn!(error = %err, "malformed scan response payload");
            return None;
        }
    };

    // Ordered fallback chain across the historical shapes of the
    // `device` field, then the flat top-level fields.
    let (device_id, model) = match scan.device {
        Some(DeviceField::Id(id)) if !id.is_empty() => (Some(id), scan.sku),
        Some(DeviceField::Object { device_id, sku }) => (
            device_id.filter(|id| !id.is_empty()).or(scan.device_id),
            sku.or(scan.sku),
        ),
        _ => (scan.device_id, scan.sku),
    };

    let Some(device_id) = device_id.filter(|id| !id.is_empty()) else {
        warn!("scan response with no resolvable device id, discarding");
        return None;
    };

    Some(DeviceAnnouncement {
        ip: scan.ip.unwrap_or_else(|| UNKNOWN_IP.to_owned()),
        device_id,
        model: model.unwrap_or_default(),
        ble_hardware_version: scan.ble_version_hard,
        ble_software_version: scan.ble_version_soft,
        wifi_hardware_version: scan.wifi_version_hard,
        wifi_software_version: scan.wifi_version_soft,
    })
}

fn decode_status(data: Value) -> Option<DeviceStatus> {
    let status: StatusData = match serde_json::from_value(data) {
        Ok(status) => status,
        Err(err) => {
            warn!(error = %err, "malformed status payload");
            return None;
        }
    };

    Some(DeviceStatus {
        on: status.on_off == 1,
        brightness: status.brightness,
        color: status.color,
        color_temperature_kelvin: status.color_tem_in_kelvin,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn encode_scan_envelope() {
        let bytes = Request::Scan.encode();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["msg"]["cmd"], "scan");
        assert_eq!(value["msg"]["data"]["account_topic"], "reserve");
    }

    #[test]
    fn encode_turn_on_and_off() {
        let on: Value = serde_json::from_slice(&Request::Turn { on: true }.encode()).unwrap();
        assert_eq!(on["msg"]["cmd"], "turn");
        assert_eq!(on["msg"]["data"]["value"], 1);

        let off: Value = serde_json::from_slice(&Request::Turn { on: false }.encode()).unwrap();
        assert_eq!(off["msg"]["data"]["value"], 0);
    }

    #[test]
    fn encode_color_rgb_zeroes_kelvin() {
        let req = Request::Color(ColorMode::Rgb(Rgb::new(10, 20, 30)));
        let value: Value = serde_json::from_slice(&req.encode()).unwrap();
        assert_eq!(value["msg"]["cmd"], "colorwc");
        assert_eq!(value["msg"]["data"]["color"]["r"], 10);
        assert_eq!(value["msg"]["data"]["color"]["g"], 20);
        assert_eq!(value["msg"]["data"]["color"]["b"], 30);
        assert_eq!(value["msg"]["data"]["colorTemInKelvin"], 0);
    }

    #[test]
    fn encode_color_kelvin_zeroes_rgb() {
        let req = Request::Color(ColorMode::Kelvin(4200));
        let value: Value = serde_json::from_slice(&req.encode()).unwrap();
        assert_eq!(value["msg"]["data"]["color"]["r"], 0);
        assert_eq!(value["msg"]["data"]["colorTemInKelvin"], 4200);
    }

    #[test]
    fn encode_pt_real_hex_encodes_payload() {
        let req = Request::PtReal {
            payload: vec![0xAB, 0x01, 0xFF],
        };
        let value: Value = serde_json::from_slice(&req.encode()).unwrap();
        assert_eq!(value["msg"]["cmd"], "ptReal");
        assert_eq!(value["msg"]["data"]["command"][0], "ab01ff");
    }

    #[test]
    fn decode_scan_with_bare_string_device() {
        let raw = br#"{"msg":{"cmd":"scan","data":{
            "device":"1F:80:C5:32:32:36:72:4E",
            "sku":"H6160",
            "ip":"192.168.1.42",
            "bleVersionHard":"3.01.01",
            "wifiVersionSoft":"1.02.11"
        }}}"#;
        let Some(Response::Announcement(ann)) = decode(raw) else {
            panic!("expected announcement");
        };
        assert_eq!(ann.device_id, "1F:80:C5:32:32:36:72:4E");
        assert_eq!(ann.model, "H6160");
        assert_eq!(ann.ip, "192.168.1.42");
        assert_eq!(ann.ble_hardware_version, "3.01.01");
        assert_eq!(ann.ble_software_version, "");
        assert_eq!(ann.wifi_software_version, "1.02.11");
    }

    #[test]
    fn decode_scan_with_object_device() {
        let raw = br#"{"msg":{"cmd":"scan","data":{
            "device":{"deviceId":"AA:BB","sku":"H6163"},
            "sku":"IGNORED",
            "ip":"10.0.0.9"
        }}}"#;
        let Some(Response::Announcement(ann)) = decode(raw) else {
            panic!("expected announcement");
        };
        assert_eq!(ann.device_id, "AA:BB");
        // sku inside the device object wins over the top-level field
        assert_eq!(ann.model, "H6163");
    }

    #[test]
    fn decode_scan_object_device_falls_back_to_top_level() {
        let raw = br#"{"msg":{"cmd":"scan","data":{
            "device":{},
            "deviceId":"CC:DD",
            "sku":"H6199",
            "ip":"10.0.0.2"
        }}}"#;
        let Some(Response::Announcement(ann)) = decode(raw) else {
            panic!("expected announcement");
        };
        assert_eq!(ann.device_id, "CC:DD");
        assert_eq!(ann.model, "H6199");
    }

    #[test]
    fn decode_scan_missing_ip_uses_sentinel() {
        let raw = br#"{"msg":{"cmd":"scan","data":{"device":"AA:BB","sku":"H6160"}}}"#;
        let Some(Response::Announcement(ann)) = decode(raw) else {
            panic!("expected announcement");
        };
        assert_eq!(ann.ip, UNKNOWN_IP);
    }

    #[test]
    fn decode_scan_without_device_id_is_discarded() {
        let raw = br#"{"msg":{"cmd":"scan","data":{"ip":"10.0.0.1","sku":"H6160"}}}"#;
        assert_eq!(decode(raw), None);
    }

    #[test]
    fn decode_status_snapshot() {
        let raw = br#"{"msg":{"cmd":"devStatus","data":{
            "onOff":1,"brightness":74,
            "color":{"r":255,"g":128,"b":0},
            "colorTemInKelvin":0
        }}}"#;
        let Some(Response::Status(status)) = decode(raw) else {
            panic!("expected status");
        };
        assert!(status.on);
        assert_eq!(status.brightness, 74);
        assert_eq!(status.color, Rgb::new(255, 128, 0));
        assert_eq!(status.color_temperature_kelvin, 0);
    }

    #[test]
    fn decode_status_defaults_missing_fields() {
        let raw = br#"{"msg":{"cmd":"devStatus","data":{}}}"#;
        let Some(Response::Status(status)) = decode(raw) else {
            panic!("expected status");
        };
        assert!(!status.on);
        assert_eq!(status.brightness, 0);
        assert_eq!(status.color, Rgb::default());
        assert_eq!(status.color_temperature_kelvin, 0);
    }

    #[test]
    fn decode_missing_msg_or_fields_yields_none() {
        assert_eq!(decode(br#"{"other":{}}"#), None);
        assert_eq!(decode(br#"{"msg":{"cmd":"scan"}}"#), None);
        assert_eq!(decode(br#"{"msg":{"data":{}}}"#), None);
        assert_eq!(decode(b"not json at all"), None);
        assert_eq!(decode(&[0xFF, 0xFE, 0x00]), None);
    }

    #[test]
    fn decode_unknown_cmd_yields_none() {
        assert_eq!(decode(br#"{"msg":{"cmd":"futureThing","data":{}}}"#), None);
    }

    #[test]
    fn brightness_round_trips_through_synthetic_status() {
        for value in 0..=100u8 {
            let raw = format!(
                r#"{{"msg":{{"cmd":"devStatus","data":{{"onOff":1,"brightness":{value},"color":{{"r":0,"g":0,"b":0}},"colorTemInKelvin":0}}}}}}"#
            );
            let Some(Response::Status(status)) = decode(raw.as_bytes()) else {
                panic!("expected status");
            };
            assert_eq!(status.brightness, value);
        }
    }
}
