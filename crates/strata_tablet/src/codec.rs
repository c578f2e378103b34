//! Byte-level helpers shared by the WAL key, value, and mutation codecs.
//!
//! Everything is big-endian so encoded keys sort byte-wise the same way the
//! decoded keys sort logically.

pub(crate) fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub(crate) fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub(crate) fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

/// Optional byte string: one presence flag, then a length-prefixed payload.
pub(crate) fn put_opt_bytes(out: &mut Vec<u8>, bytes: Option<&[u8]>) {
    match bytes {
        Some(b) => {
            out.push(1);
            put_bytes(out, b);
        }
        None => out.push(0),
    }
}

pub(crate) fn read_u8_at(buf: &[u8], offset: &mut usize) -> anyhow::Result<u8> {
    anyhow::ensure!(*offset < buf.len(), "short u8");
    let v = buf[*offset];
    *offset += 1;
    Ok(v)
}

pub(crate) fn read_u32_at(buf: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    anyhow::ensure!(*offset + 4 <= buf.len(), "short u32");
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(bytes))
}

pub(crate) fn read_u64_at(buf: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    anyhow::ensure!(*offset + 8 <= buf.len(), "short u64");
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(bytes))
}

pub(crate) fn read_bytes_at(buf: &[u8], offset: &mut usize) -> anyhow::Result<Vec<u8>> {
    let len = read_u32_at(buf, offset)? as usize;
    anyhow::ensure!(*offset + len <= buf.len(), "short byte string");
    let bytes = buf[*offset..*offset + len].to_vec();
    *offset += len;
    Ok(bytes)
}

pub(crate) fn read_opt_bytes_at(buf: &[u8], offset: &mut usize) -> anyhow::Result<Option<Vec<u8>>> {
    match read_u8_at(buf, offset)? {
        0 => Ok(None),
        1 => Ok(Some(read_bytes_at(buf, offset)?)),
        flag => anyhow::bail!("bad presence flag {flag}"),
    }
}
