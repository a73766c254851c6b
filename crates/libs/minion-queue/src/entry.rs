use std::io::{self, Read, Write};

use crate::queue::Handle;

pub const ENTRY_MAGIC: [u8; 4] = *b"MQE1";
pub const ENTRY_VERSION: u8 = 1;
/// magic(4) + version(1) + retry_count(1) + reserved(2) + first_queued_at(8)
/// + next_attempt_at(8) + addr_len(4)
pub const ENTRY_HEADER_LEN: usize = 28;

/// Upper bound on the address blob; anything larger means the header bytes
/// are garbage, not a real entry.
const MAX_ADDR_LEN: u32 = 1 << 20;

/// The fixed header prepended to every queue-entry file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    pub retry_count: u8,
    pub first_queued_at: u64,
    pub next_attempt_at: u64,
    pub addr_len: u32,
}

impl EntryHeader {
    pub fn encode(&self) -> [u8; ENTRY_HEADER_LEN] {
        let mut buf = [0u8; ENTRY_HEADER_LEN];
        buf[0..4].copy_from_slice(&ENTRY_MAGIC);
        buf[4] = ENTRY_VERSION;
        buf[5] = self.retry_count;
        // buf[6..8] reserved, zero
        buf[8..16].copy_from_slice(&self.first_queued_at.to_be_bytes());
        buf[16..24].copy_from_slice(&self.next_attempt_at.to_be_bytes());
        buf[24..28].copy_from_slice(&self.addr_len.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; ENTRY_HEADER_LEN]) -> Result<Self, String> {
        if buf[0..4] != ENTRY_MAGIC {
            return Err("bad magic".into());
        }
        if buf[4] != ENTRY_VERSION {
            return Err(format!("unsupported version {}", buf[4]));
        }
        let addr_len = u32::from_be_bytes([buf[24], buf[25], buf[26], buf[27]]);
        if addr_len > MAX_ADDR_LEN {
            return Err(format!("address length {addr_len} out of range"));
        }
        Ok(Self {
            retry_count: buf[5],
            first_queued_at: u64::from_be_bytes(buf[8..16].try_into().map_err(|_| "short header")?),
            next_attempt_at: u64::from_be_bytes(
                buf[16..24].try_into().map_err(|_| "short header")?,
            ),
            addr_len,
        })
    }
}

/// One recoverable unit of work: an address, a payload, and retry state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub handle: Handle,
    pub address: Vec<u8>,
    pub payload: Vec<u8>,
    pub retry_count: u8,
    pub first_queued_at: u64,
    pub next_attempt_at: u64,
}

pub(crate) fn write_entry<W: Write>(
    w: &mut W,
    header: &EntryHeader,
    address: &[u8],
    payload: &[u8],
) -> io::Result<()> {
    debug_assert_eq!(header.addr_len as usize, address.len());
    w.write_all(&header.encode())?;
    w.write_all(address)?;
    w.write_all(payload)?;
    Ok(())
}

pub(crate) fn read_entry<R: Read>(
    r: &mut R,
    handle: Handle,
) -> io::Result<Result<QueueEntry, String>> {
    let mut head = [0u8; ENTRY_HEADER_LEN];
    if let Err(err) = r.read_exact(&mut head) {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Ok(Err("truncated header".into()));
        }
        return Err(err);
    }
    let header = match EntryHeader::decode(&head) {
        Ok(header) => header,
        Err(reason) => return Ok(Err(reason)),
    };
    let mut address = vec![0u8; header.addr_len as usize];
    if let Err(err) = r.read_exact(&mut address) {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Ok(Err("truncated address".into()));
        }
        return Err(err);
    }
    let mut payload = Vec::new();
    r.read_to_end(&mut payload)?;
    Ok(Ok(QueueEntry {
        handle,
        address,
        payload,
        retry_count: header.retry_count,
        first_queued_at: header.first_queued_at,
        next_attempt_at: header.next_attempt_at,
    }))
}
