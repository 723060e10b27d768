//! Fixed-width and length-prefixed byte packing for the session wire formats.

use super::SessionError;

#[derive(Default)]
pub struct Packer {
    buf: Vec<u8>,
}

impl Packer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pack_fixed(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// A `u32` big-endian length followed by the bytes.
    pub fn pack_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

pub struct Unpacker<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Unpacker<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Unpacker { buf, pos: 0 }
    }

    pub fn unpack_fixed(&mut self, len: usize) -> Result<&'a [u8], SessionError> {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.buf.len()).ok_or_else(|| {
            SessionError::Malformed(format!("wanted {len} bytes at offset {}, have {}", self.pos, self.buf.len()))
        })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub fn unpack_array<const N: usize>(&mut self) -> Result<[u8; N], SessionError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.unpack_fixed(N)?);
        Ok(out)
    }

    pub fn unpack_u32(&mut self) -> Result<u32, SessionError> {
        Ok(u32::from_be_bytes(self.unpack_array::<4>()?))
    }

    pub fn unpack_bytes(&mut self) -> Result<&'a [u8], SessionError> {
        let len = self.unpack_u32()? as usize;
        self.unpack_fixed(len)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Everything must have been consumed.
    pub fn done(&self) -> Result<(), SessionError> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(SessionError::Malformed(format!("{} trailing bytes", self.buf.len() - self.pos)))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pack_and_unpack() {
        let mut p = Packer::new();
        p.pack_fixed(b"abcd").pack_bytes(b"hello").pack_bytes(b"");
        let buf = p.finish();
        let mut u = Unpacker::new(&buf);
        assert_eq!(u.unpack_fixed(4).expect("fixed"), b"abcd");
        assert_eq!(u.unpack_bytes().expect("bytes"), b"hello");
        assert!(u.done().is_err());
        assert_eq!(u.unpack_bytes().expect("empty"), b"");
        u.done().expect("fully consumed");
        assert!(u.unpack_fixed(1).is_err());
    }

    #[test]
    fn bogus_length_is_rejected() {
        let buf = [0xff, 0xff, 0xff, 0xff, 1, 2, 3];
        let mut u = Unpacker::new(&buf);
        assert!(matches!(u.unpack_bytes(), Err(SessionError::Malformed(_))));
    }
}
