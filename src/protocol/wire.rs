/// Header and XML body codec for the command and media channels.
use byteorder::{BigEndian, ByteOrder};
use quick_xml::events::Event;
use quick_xml::Reader;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::DvrError;
use crate::protocol::{CMD_MAGIC, HEADER_SIZE, MEDIA_MAGIC, VERSION};

/// Cap on command bodies; config dumps run a few KB, nothing legitimate
/// approaches this.
const MAX_BODY_LEN: u32 = 512 * 1024;

/// The 36-byte header: nine big-endian u32 fields. Field 3 is unused on
/// the command channel but carries the payload size on inbound media data
/// frames; field 8 carries the media session on the media handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,
    pub version: u32,
    pub txn: u32,
    pub field3: u32,
    pub body_len: u32,
    pub field5: u32,
    pub field6: u32,
    pub field7: u32,
    pub field8: u32,
}

impl Header {
    pub fn command(txn: u32, body_len: u32) -> Self {
        Header {
            magic: CMD_MAGIC,
            version: VERSION,
            txn,
            field3: 0,
            body_len,
            field5: 3,
            field6: 0,
            field7: 0,
            field8: 0,
        }
    }

    /// The media-channel handshake header. The fixed txn/body_len values
    /// match the vendor client byte-for-byte; the DVR only inspects the
    /// magic and the session id.
    pub fn media_handshake(media_session: u32) -> Self {
        Header {
            magic: MEDIA_MAGIC,
            version: VERSION,
            txn: 4,
            field3: 0,
            body_len: 3,
            field5: 0,
            field6: 0,
            field7: 0,
            field8: media_session,
        }
    }

    pub fn pack(&self) -> [u8; HEADER_SIZE] {
        let fields = [
            self.magic,
            self.version,
            self.txn,
            self.field3,
            self.body_len,
            self.field5,
            self.field6,
            self.field7,
            self.field8,
        ];
        let mut buf = [0u8; HEADER_SIZE];
        for (i, f) in fields.iter().enumerate() {
            BigEndian::write_u32(&mut buf[i * 4..i * 4 + 4], *f);
        }
        buf
    }

    pub fn unpack(buf: &[u8; HEADER_SIZE]) -> Self {
        let f = |i: usize| BigEndian::read_u32(&buf[i * 4..i * 4 + 4]);
        Header {
            magic: f(0),
            version: f(1),
            txn: f(2),
            field3: f(3),
            body_len: f(4),
            field5: f(5),
            field6: f(6),
            field7: f(7),
            field8: f(8),
        }
    }
}

/// One inbound command-channel message. `tag` is the name of the first
/// element inside `<Command>`, which is what callers key replies on.
#[derive(Debug, Clone)]
pub struct Message {
    pub header: Header,
    pub body: String,
    pub tag: String,
}

/// Build a null-terminated XML command body. The trailing NUL is part of
/// the body and counted in the header's body_len.
pub fn make_body(cmd_id: u32, inner: &str) -> Vec<u8> {
    let mut body = format!(
        "<?xml version=\"1.0\" encoding=\"GB2312\" standalone=\"yes\" ?>\n\
         <Command ID=\"{cmd_id}\">\n    {inner}\n</Command>\n"
    )
    .into_bytes();
    body.push(0);
    body
}

/// Full command-channel packet: header + body.
pub fn pack_command(txn: u32, cmd_id: u32, inner: &str) -> Vec<u8> {
    let body = make_body(cmd_id, inner);
    let mut packet = Header::command(txn, body.len() as u32).pack().to_vec();
    packet.extend_from_slice(&body);
    packet
}

/// Read one complete message off a command-channel transport.
/// Returns Ok(None) on a clean close at a message boundary.
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Message>, DvrError> {
    let mut hdr_buf = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut hdr_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(DvrError::Protocol(format!("header read: {e}"))),
    }

    let header = Header::unpack(&hdr_buf);
    if header.magic != CMD_MAGIC {
        return Err(DvrError::Protocol(format!(
            "bad command magic {:#010x}",
            header.magic
        )));
    }
    if header.body_len > MAX_BODY_LEN {
        return Err(DvrError::Protocol(format!(
            "implausible body length {}",
            header.body_len
        )));
    }

    let mut raw = vec![0u8; header.body_len as usize];
    reader
        .read_exact(&mut raw)
        .await
        .map_err(|e| DvrError::Protocol(format!("body read: {e}")))?;

    let body = String::from_utf8_lossy(&raw)
        .trim_end_matches('\0')
        .to_string();
    let tag = body_tag(&body).unwrap_or_default();
    Ok(Some(Message { header, body, tag }))
}

/// Name of the first element inside the `<Command>` envelope.
pub fn body_tag(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = e.name();
                let local = String::from_utf8_lossy(name.as_ref()).into_owned();
                if local != "Command" {
                    return Some(local);
                }
            }
            Ok(Event::Eof) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

/// First occurrence of attribute `name` on any element in `xml`.
pub fn attr(xml: &str, name: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                for a in e.attributes().flatten() {
                    if a.key.as_ref() == name.as_bytes() {
                        return a.unescape_value().ok().map(|v| v.into_owned());
                    }
                }
            }
            Ok(Event::Eof) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}
