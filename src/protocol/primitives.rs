use bytes::{BufMut, BytesMut};
use integer_encoding::VarInt;

// Hot Rod varints are plain unsigned LEB128, which is what `integer_encoding` produces for
// unsigned types. Signed types would be zigzag encoded and must not be used here.

pub(crate) fn put_vint(buf: &mut BytesMut, value: u32) {
    let mut scratch = [0u8; 5];
    let len = value.encode_var(&mut scratch);
    buf.put_slice(&scratch[..len]);
}

pub(crate) fn put_vlong(buf: &mut BytesMut, value: u64) {
    let mut scratch = [0u8; 10];
    let len = value.encode_var(&mut scratch);
    buf.put_slice(&scratch[..len]);
}

pub(crate) fn put_array(buf: &mut BytesMut, bytes: &[u8]) {
    put_vint(buf, bytes.len() as u32);
    buf.put_slice(bytes);
}

pub(crate) fn put_string(buf: &mut BytesMut, value: &str) {
    put_array(buf, value.as_bytes());
}
