/// Wire protocol for HiEasy-family DVRs: 36-byte big-endian headers with
/// null-terminated XML bodies on the command channel (port 5050), framed
/// H.264 on the media channel (port 6050).
pub mod client;
pub mod discovery;
pub mod frames;
pub mod wire;

// Header constants (from protocol captures)
pub const CMD_MAGIC: u32 = 0x0501_1154;
pub const MEDIA_MAGIC: u32 = 0x0501_1150;
pub const VERSION: u32 = 0x0000_1001;
pub const HEADER_SIZE: usize = 36;

// XML command IDs (body <Command ID="N">)
pub const ID_USER_LOGIN: u32 = 24;
pub const ID_USER_LOGIN_REPLY: u32 = 25;
pub const ID_LOGIN_GET_FLAG: u32 = 26;
pub const ID_LOGIN_GET_FLAG_REPLY: u32 = 27;
pub const ID_LOGOUT: u32 = 28;
pub const ID_LOGOUT_REPLY: u32 = 29;
pub const ID_GET_CFG: u32 = 30;
pub const ID_GET_CFG_REPLY: u32 = 31;
pub const ID_HEARTBEAT: u32 = 78;
pub const ID_HEARTBEAT_REPLY: u32 = 79;
pub const ID_STREAM_CREATE: u32 = 136;
pub const ID_STREAM_CREATE_REPLY: u32 = 137;
pub const ID_STREAM_START: u32 = 138;
pub const ID_STREAM_START_REPLY: u32 = 139;
pub const ID_STREAM_STOP: u32 = 140;
pub const ID_STREAM_STOP_REPLY: u32 = 141;
pub const ID_STREAM_DESTROY: u32 = 142;
pub const ID_STREAM_DESTROY_REPLY: u32 = 143;

/// Hardware tops out at 4 camera inputs.
pub const MAX_CHANNELS: u8 = 4;

/// Main = HD, Sub = SD. On the wire `RealStreamCreateRequest` carries
/// `Mode` = value + 1 (1 = main, 2 = sub).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamType {
    #[default]
    Main = 0,
    Sub = 1,
}

impl StreamType {
    pub fn wire_mode(self) -> u32 {
        self as u32 + 1
    }

    /// Path suffix on the RTSP server: main streams publish to `ch<N>`,
    /// sub streams to `ch<N>sub`.
    pub fn path_suffix(self) -> &'static str {
        match self {
            StreamType::Main => "",
            StreamType::Sub => "sub",
        }
    }
}

impl std::str::FromStr for StreamType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "0" | "main" => Ok(StreamType::Main),
            "1" | "sub" => Ok(StreamType::Sub),
            _ => Err(format!("Unknown stream type: {s} (expected 0 or 1)")),
        }
    }
}

impl std::fmt::Display for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", *self as u8)
    }
}
