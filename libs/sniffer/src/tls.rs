//! SNI extraction from a TLS ClientHello, without terminating TLS.

/// Walks a TLS record containing a ClientHello and returns the host_name of
/// the server_name extension, lower-cased.
///
/// Returns `None` for anything that is not a complete, well-formed
/// ClientHello prefix.
pub fn sni(buf: &[u8]) -> Option<String> {
    let mut r = Reader::new(buf);

    // TLSPlaintext: type 0x16 (handshake), version, length.
    if r.u8()? != 0x16 {
        return None;
    }
    r.skip(2)?; // legacy record version
    let record_len = r.u16()? as usize;
    let mut r = Reader::new(r.take(record_len)?);

    // Handshake: type 0x01 (client_hello), 24-bit length.
    if r.u8()? != 0x01 {
        return None;
    }
    let hs_len = r.u24()? as usize;
    let mut r = Reader::new(r.take(hs_len)?);

    r.skip(2)?; // client_version
    r.skip(32)?; // random

    let session_id_len = r.u8()? as usize;
    r.skip(session_id_len)?;

    let cipher_suites_len = r.u16()? as usize;
    r.skip(cipher_suites_len)?;

    let compression_len = r.u8()? as usize;
    r.skip(compression_len)?;

    let extensions_len = r.u16()? as usize;
    let mut r = Reader::new(r.take(extensions_len)?);

    while !r.is_empty() {
        let ext_type = r.u16()?;
        let ext_len = r.u16()? as usize;
        let ext = r.take(ext_len)?;

        if ext_type != 0x0000 {
            continue;
        }

        return server_name(ext);
    }

    None
}

fn server_name(ext: &[u8]) -> Option<String> {
    let mut r = Reader::new(ext);

    let list_len = r.u16()? as usize;
    let mut r = Reader::new(r.take(list_len)?);

    while !r.is_empty() {
        let name_type = r.u8()?;
        let name_len = r.u16()? as usize;
        let name = r.take(name_len)?;

        if name_type != 0x00 {
            continue;
        }

        let host = std::str::from_utf8(name).ok()?;

        return Some(host.to_ascii_lowercase());
    }

    None
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn u8(&mut self) -> Option<u8> {
        let b = *self.buf.get(self.pos)?;
        self.pos += 1;

        Some(b)
    }

    fn u16(&mut self) -> Option<u16> {
        let bytes = self.take(2)?;

        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u24(&mut self) -> Option<u32> {
        let bytes = self.take(3)?;

        Some(u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]))
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.buf.get(self.pos..end)?;
        self.pos = end;

        Some(slice)
    }
}
