//! C ABI for linking aware-core as a static library from Android (NDK) or other C/C++ hosts.
//! Exposes the data-plane codec and control-token matching; the host keeps its own sockets.

use std::os::raw::c_int;
use std::slice;

use crate::protocol::ControlMessage;
use crate::wire::{self, encode_frame, Frame, FrameDecodeError, MAX_FIELD_LEN};

/// Largest length a single frame field may declare.
#[no_mangle]
pub extern "C" fn aware_core_max_field_len() -> u32 {
    MAX_FIELD_LEN
}

fn write_out(frame: &Frame, out_buf: *mut u8, out_buf_len: usize) -> c_int {
    let bytes = match encode_frame(frame) {
        Ok(b) => b,
        Err(_) => return -1,
    };
    if bytes.len() > out_buf_len || bytes.len() > c_int::MAX as usize {
        return -1;
    }
    unsafe {
        out_buf.copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
    }
    bytes.len() as c_int
}

/// Encode a Text frame from UTF-8 bytes. Returns bytes written, or -1 on error (bad UTF-8, buffer too small).
#[no_mangle]
pub extern "C" fn aware_core_encode_text(
    text: *const u8,
    text_len: usize,
    out_buf: *mut u8,
    out_buf_len: usize,
) -> c_int {
    if (text.is_null() && text_len > 0) || out_buf.is_null() {
        return -1;
    }
    let raw = if text_len == 0 {
        &[][..]
    } else {
        unsafe { slice::from_raw_parts(text, text_len) }
    };
    let s = match std::str::from_utf8(raw) {
        Ok(s) => s,
        Err(_) => return -1,
    };
    write_out(&Frame::text(s), out_buf, out_buf_len)
}

/// Encode an Attachment frame. Returns bytes written, or -1 on error (non-ASCII mime, buffer too small).
#[no_mangle]
pub extern "C" fn aware_core_encode_attachment(
    mime: *const u8,
    mime_len: usize,
    payload: *const u8,
    payload_len: usize,
    out_buf: *mut u8,
    out_buf_len: usize,
) -> c_int {
    if (mime.is_null() && mime_len > 0) || (payload.is_null() && payload_len > 0) || out_buf.is_null()
    {
        return -1;
    }
    let mime_raw = if mime_len == 0 {
        &[][..]
    } else {
        unsafe { slice::from_raw_parts(mime, mime_len) }
    };
    let mime_type = match std::str::from_utf8(mime_raw) {
        Ok(s) => s,
        Err(_) => return -1,
    };
    let body = if payload_len == 0 {
        Vec::new()
    } else {
        unsafe { slice::from_raw_parts(payload, payload_len) }.to_vec()
    };
    write_out(&Frame::attachment(mime_type, body), out_buf, out_buf_len)
}

/// Size of the complete frame at the front of `bytes`.
/// Returns the size, 0 if more bytes are needed, or -1 on a protocol error.
#[no_mangle]
pub extern "C" fn aware_core_frame_len(bytes: *const u8, len: usize) -> c_int {
    if bytes.is_null() {
        return if len == 0 { 0 } else { -1 };
    }
    let buf = unsafe { slice::from_raw_parts(bytes, len) };
    match wire::frame_len(buf) {
        Ok(consumed) if consumed <= c_int::MAX as usize => consumed as c_int,
        Ok(_) => -1,
        Err(FrameDecodeError::NeedMore) => 0,
        Err(_) => -1,
    }
}

/// Classify a discovery-channel payload: 1 = REQUEST_DATA_CONNECTION, 2 = DATA_CONNECTION_READY, 0 = text.
#[no_mangle]
pub extern "C" fn aware_core_control_kind(bytes: *const u8, len: usize) -> c_int {
    if bytes.is_null() {
        return 0;
    }
    let buf = unsafe { slice::from_raw_parts(bytes, len) };
    match ControlMessage::parse(buf) {
        Some(ControlMessage::RequestDataConnection) => 1,
        Some(ControlMessage::DataConnectionReady) => 2,
        None => 0,
    }
}
