//! Data-plane framing: 1-byte type tag, then 4-byte BE length-prefixed fields.
//!
//! Text:       `0 | len | utf-8 bytes`
//! Attachment: `1 | len | ascii mime type | len | payload`

/// Type tag of a Text frame.
pub const TAG_TEXT: u8 = 0;
/// Type tag of an Attachment frame.
pub const TAG_ATTACHMENT: u8 = 1;

pub const TAG_SIZE: usize = 1;
pub const LEN_SIZE: usize = 4;
/// Upper bound on any single length-prefixed field.
pub const MAX_FIELD_LEN: u32 = 64 * 1024 * 1024; // 64 MiB

/// MIME type used when raw bytes are sent without a declared type.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// One self-delimited unit of the data-plane protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Attachment { mime_type: String, payload: Vec<u8> },
}

/// Discriminant of a frame, as carried in the type tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Attachment,
}

impl FrameKind {
    pub fn from_tag(tag: u8) -> Result<Self, FrameDecodeError> {
        match tag {
            TAG_TEXT => Ok(FrameKind::Text),
            TAG_ATTACHMENT => Ok(FrameKind::Attachment),
            other => Err(FrameDecodeError::UnknownTag(other)),
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            FrameKind::Text => TAG_TEXT,
            FrameKind::Attachment => TAG_ATTACHMENT,
        }
    }
}

impl Frame {
    pub fn text(s: impl Into<String>) -> Self {
        Frame::Text(s.into())
    }

    pub fn attachment(mime_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Frame::Attachment {
            mime_type: mime_type.into(),
            payload,
        }
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Text(_) => FrameKind::Text,
            Frame::Attachment { .. } => FrameKind::Attachment,
        }
    }

    /// Payload bytes: UTF-8 text for Text, the binary body for Attachment.
    pub fn payload(&self) -> &[u8] {
        match self {
            Frame::Text(s) => s.as_bytes(),
            Frame::Attachment { payload, .. } => payload,
        }
    }

    pub fn into_payload(self) -> Vec<u8> {
        match self {
            Frame::Text(s) => s.into_bytes(),
            Frame::Attachment { payload, .. } => payload,
        }
    }

    /// Build a Text frame from raw field bytes read off the wire.
    pub fn text_from_wire(bytes: Vec<u8>) -> Result<Self, FrameDecodeError> {
        String::from_utf8(bytes)
            .map(Frame::Text)
            .map_err(|_| FrameDecodeError::InvalidText)
    }

    /// Build an Attachment frame from raw field bytes read off the wire.
    pub fn attachment_from_wire(mime: Vec<u8>, payload: Vec<u8>) -> Result<Self, FrameDecodeError> {
        if !mime.is_ascii() {
            return Err(FrameDecodeError::InvalidMimeType);
        }
        let mime_type = String::from_utf8(mime).map_err(|_| FrameDecodeError::InvalidMimeType)?;
        Ok(Frame::Attachment { mime_type, payload })
    }
}

/// Validate a length prefix read off the wire.
pub fn field_len(prefix: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_be_bytes(prefix);
    if len > MAX_FIELD_LEN {
        return Err(FrameDecodeError::TooLarge(len));
    }
    Ok(len as usize)
}

fn put_field(out: &mut Vec<u8>, field: &[u8]) -> Result<(), FrameEncodeError> {
    let len = u32::try_from(field.len()).map_err(|_| FrameEncodeError::TooLarge(field.len()))?;
    if len > MAX_FIELD_LEN {
        return Err(FrameEncodeError::TooLarge(field.len()));
    }
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(field);
    Ok(())
}

/// Encode a frame into its wire bytes.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, FrameEncodeError> {
    let tag = frame.kind().tag();
    match frame {
        Frame::Text(text) => {
            let mut out = Vec::with_capacity(TAG_SIZE + LEN_SIZE + text.len());
            out.push(tag);
            put_field(&mut out, text.as_bytes())?;
            Ok(out)
        }
        Frame::Attachment { mime_type, payload } => {
            if !mime_type.is_ascii() {
                return Err(FrameEncodeError::InvalidMimeType(mime_type.clone()));
            }
            let mut out =
                Vec::with_capacity(TAG_SIZE + 2 * LEN_SIZE + mime_type.len() + payload.len());
            out.push(tag);
            put_field(&mut out, mime_type.as_bytes())?;
            put_field(&mut out, payload)?;
            Ok(out)
        }
    }
}

/// Error encoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("field of {0} bytes exceeds frame limit")]
    TooLarge(usize),
    #[error("mime type is not ascii: {0:?}")]
    InvalidMimeType(String),
}

/// Locate the length-prefixed field starting at `at`. Returns where its body starts and ends.
fn field_bounds(bytes: &[u8], at: usize) -> Result<(usize, usize), FrameDecodeError> {
    let body = at + LEN_SIZE;
    if bytes.len() < body {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = field_len([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])?;
    if bytes.len() < body + len {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok((body, body + len))
}

/// Read one length-prefixed field starting at `at`. Returns the field and the offset after it.
fn take_field(bytes: &[u8], at: usize) -> Result<(&[u8], usize), FrameDecodeError> {
    let (body, end) = field_bounds(bytes, at)?;
    Ok((&bytes[body..end], end))
}

/// Size of the complete frame at the front of `bytes`, from the tag and length prefixes alone.
/// Field contents are neither copied nor validated.
pub fn frame_len(bytes: &[u8]) -> Result<usize, FrameDecodeError> {
    let tag = *bytes.first().ok_or(FrameDecodeError::NeedMore)?;
    let fields = match FrameKind::from_tag(tag)? {
        FrameKind::Text => 1,
        FrameKind::Attachment => 2,
    };
    let mut at = TAG_SIZE;
    for _ in 0..fields {
        at = field_bounds(bytes, at)?.1;
    }
    Ok(at)
}

/// Decode one frame from the front of `bytes`. Returns the frame and the number of bytes consumed.
/// Never reads past the end of the first frame; returns `NeedMore` on a partial buffer.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), FrameDecodeError> {
    let tag = *bytes.first().ok_or(FrameDecodeError::NeedMore)?;
    match FrameKind::from_tag(tag)? {
        FrameKind::Text => {
            let (text, end) = take_field(bytes, TAG_SIZE)?;
            Ok((Frame::text_from_wire(text.to_vec())?, end))
        }
        FrameKind::Attachment => {
            let (mime, after_mime) = take_field(bytes, TAG_SIZE)?;
            let (payload, end) = take_field(bytes, after_mime)?;
            let frame = Frame::attachment_from_wire(mime.to_vec(), payload.to_vec())?;
            Ok((frame, end))
        }
    }
}

/// Error decoding a frame (need more bytes, or a protocol violation).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("unknown frame type tag {0}")]
    UnknownTag(u8),
    #[error("field length {0} exceeds frame limit")]
    TooLarge(u32),
    #[error("text frame is not valid utf-8")]
    InvalidText,
    #[error("attachment mime type is not ascii")]
    InvalidMimeType,
}

impl FrameDecodeError {
    /// True for errors that can never be fixed by reading more bytes.
    pub fn is_protocol_error(&self) -> bool {
        !matches!(self, FrameDecodeError::NeedMore)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_wire_layout() {
        let bytes = encode_frame(&Frame::text("hello")).unwrap();
        assert_eq!(bytes[0], TAG_TEXT);
        assert_eq!(&bytes[1..5], &5u32.to_be_bytes());
        assert_eq!(&bytes[5..], b"hello");
        let (frame, n) = decode_frame(&bytes).unwrap();
        assert_eq!(n, bytes.len());
        assert_eq!(frame, Frame::text("hello"));
    }

    #[test]
    fn attachment_wire_layout() {
        let payload: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
        let bytes = encode_frame(&Frame::attachment("image/png", payload.clone())).unwrap();
        assert_eq!(bytes[0], TAG_ATTACHMENT);
        assert_eq!(&bytes[1..5], &9u32.to_be_bytes());
        assert_eq!(&bytes[5..14], b"image/png");
        assert_eq!(&bytes[14..18], &1024u32.to_be_bytes());
        assert_eq!(bytes.len(), 18 + 1024);

        let (frame, _) = decode_frame(&bytes).unwrap();
        match frame {
            Frame::Attachment { mime_type, payload: got } => {
                assert_eq!(mime_type, "image/png");
                assert_eq!(got, payload);
            }
            other => panic!("expected Attachment, got {other:?}"),
        }
    }

    #[test]
    fn empty_fields_survive() {
        for frame in [
            Frame::text(""),
            Frame::attachment("", Vec::new()),
            Frame::attachment("text/plain", Vec::new()),
            Frame::attachment("", vec![7]),
        ] {
            let bytes = encode_frame(&frame).unwrap();
            let (decoded, n) = decode_frame(&bytes).unwrap();
            assert_eq!(n, bytes.len());
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn truncated_needs_more() {
        let bytes = encode_frame(&Frame::attachment("image/png", vec![1; 32])).unwrap();
        for cut in 0..bytes.len() {
            assert!(
                matches!(decode_frame(&bytes[..cut]), Err(FrameDecodeError::NeedMore)),
                "cut at {cut} should need more"
            );
        }
    }

    #[test]
    fn back_to_back_frames_do_not_over_read() {
        let a = encode_frame(&Frame::text("first")).unwrap();
        let b = encode_frame(&Frame::attachment("application/x-test", vec![9, 9])).unwrap();
        let mut buf = a.clone();
        buf.extend_from_slice(&b);
        let (f1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, a.len());
        assert_eq!(f1, Frame::text("first"));
        let (f2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, b.len());
        assert!(matches!(f2, Frame::Attachment { .. }));
    }

    #[test]
    fn unknown_tag_is_protocol_error() {
        let err = decode_frame(&[7, 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, FrameDecodeError::UnknownTag(7)));
        assert!(err.is_protocol_error());
    }

    #[test]
    fn oversized_length_rejected() {
        let mut bytes = vec![TAG_TEXT];
        bytes.extend_from_slice(&(MAX_FIELD_LEN + 1).to_be_bytes());
        assert!(matches!(
            decode_frame(&bytes),
            Err(FrameDecodeError::TooLarge(_))
        ));
    }

    #[test]
    fn invalid_utf8_text_rejected() {
        let bytes = [TAG_TEXT, 0, 0, 0, 2, 0xff, 0xfe];
        assert!(matches!(
            decode_frame(&bytes),
            Err(FrameDecodeError::InvalidText)
        ));
    }

    #[test]
    fn non_ascii_mime_rejected_both_ways() {
        assert!(matches!(
            encode_frame(&Frame::attachment("image/pngé", vec![])),
            Err(FrameEncodeError::InvalidMimeType(_))
        ));
        let bytes = [TAG_ATTACHMENT, 0, 0, 0, 1, 0xc3, 0, 0, 0, 0];
        assert!(matches!(
            decode_frame(&bytes),
            Err(FrameDecodeError::InvalidMimeType)
        ));
    }

    #[test]
    fn frame_len_reads_prefixes_only() {
        let first = encode_frame(&Frame::attachment("a/b", vec![7; 5])).unwrap();
        let mut buf = first.clone();
        buf.extend_from_slice(&encode_frame(&Frame::text("next")).unwrap());
        assert_eq!(frame_len(&buf).unwrap(), first.len());
        assert!(matches!(
            frame_len(&first[..first.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
        // A 1 MiB text claim with no body yet needs more bytes; nothing is allocated for it.
        let mut header = vec![TAG_TEXT];
        header.extend_from_slice(&(1u32 << 20).to_be_bytes());
        assert!(matches!(frame_len(&header), Err(FrameDecodeError::NeedMore)));
        // Contents are not checked: invalid UTF-8 still has a length.
        assert_eq!(frame_len(&[TAG_TEXT, 0, 0, 0, 2, 0xff, 0xfe]).unwrap(), 7);
        assert!(matches!(
            frame_len(&[9, 0, 0, 0, 0]),
            Err(FrameDecodeError::UnknownTag(9))
        ));
    }
}
