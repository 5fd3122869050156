//! Fixed-width, machine-native byte helpers shared by the codec and the
//! message catalogue.

use byteorder::{ByteOrder, NativeEndian};

/// Append-only writer over a byte vector.
pub(crate) struct Writer<'a> {
    out: &'a mut Vec<u8>,
    start: usize,
}

impl<'a> Writer<'a> {
    pub fn new(out: &'a mut Vec<u8>) -> Self {
        let start = out.len();
        Self { out, start }
    }

    /// Bytes written through this writer so far.
    pub fn written(&self) -> usize {
        self.out.len() - self.start
    }

    pub fn put_u8(&mut self, v: u8) {
        self.out.push(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.out.push(v as u8);
    }

    pub fn put_u16(&mut self, v: u16) {
        let mut buf = [0u8; 2];
        NativeEndian::write_u16(&mut buf, v);
        self.out.extend_from_slice(&buf);
    }

    pub fn put_u32(&mut self, v: u32) {
        let mut buf = [0u8; 4];
        NativeEndian::write_u32(&mut buf, v);
        self.out.extend_from_slice(&buf);
    }

    pub fn put_i32(&mut self, v: i32) {
        let mut buf = [0u8; 4];
        NativeEndian::write_i32(&mut buf, v);
        self.out.extend_from_slice(&buf);
    }

    pub fn put_u64(&mut self, v: u64) {
        let mut buf = [0u8; 8];
        NativeEndian::write_u64(&mut buf, v);
        self.out.extend_from_slice(&buf);
    }

    pub fn put_f32(&mut self, v: f32) {
        let mut buf = [0u8; 4];
        NativeEndian::write_f32(&mut buf, v);
        self.out.extend_from_slice(&buf);
    }

    pub fn put_f64(&mut self, v: f64) {
        let mut buf = [0u8; 8];
        NativeEndian::write_f64(&mut buf, v);
        self.out.extend_from_slice(&buf);
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }

    /// Writes a `u32` length prefix followed by the bytes.
    pub fn put_blob(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.put_bytes(bytes);
    }
}

/// Cursor over a received byte slice. Every getter returns `None` once the
/// input runs out.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn consumed(&self) -> usize {
        self.pos
    }

    pub fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    pub fn get_u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    pub fn get_bool(&mut self) -> Option<bool> {
        self.get_u8().map(|b| b != 0)
    }

    pub fn get_u16(&mut self) -> Option<u16> {
        self.take(2).map(NativeEndian::read_u16)
    }

    pub fn get_u32(&mut self) -> Option<u32> {
        self.take(4).map(NativeEndian::read_u32)
    }

    pub fn get_i32(&mut self) -> Option<i32> {
        self.take(4).map(NativeEndian::read_i32)
    }

    pub fn get_u64(&mut self) -> Option<u64> {
        self.take(8).map(NativeEndian::read_u64)
    }

    pub fn get_f32(&mut self) -> Option<f32> {
        self.take(4).map(NativeEndian::read_f32)
    }

    pub fn get_f64(&mut self) -> Option<f64> {
        self.take(8).map(NativeEndian::read_f64)
    }

    /// Reads a `u32` length prefix and that many bytes.
    pub fn get_blob(&mut self) -> Option<&'a [u8]> {
        let len = self.get_u32()? as usize;
        self.take(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_reader_agree() {
        let mut out = vec![0xAA];
        let mut w = Writer::new(&mut out);
        w.put_u16(513);
        w.put_i32(-7);
        w.put_f64(2.5);
        w.put_blob(b"abc");
        assert_eq!(w.written(), 2 + 4 + 8 + 4 + 3);

        let mut r = Reader::new(&out[1..]);
        assert_eq!(r.get_u16(), Some(513));
        assert_eq!(r.get_i32(), Some(-7));
        assert_eq!(r.get_f64(), Some(2.5));
        assert_eq!(r.get_blob(), Some(&b"abc"[..]));
        assert_eq!(r.remaining(), 0);
        assert_eq!(r.get_u8(), None);
    }

    #[test]
    fn test_reader_short_blob() {
        let mut out = Vec::new();
        Writer::new(&mut out).put_u32(10);
        out.extend_from_slice(b"xy");

        let mut r = Reader::new(&out);
        assert_eq!(r.get_blob(), None);
    }
}
