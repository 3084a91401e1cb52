// On-disk record codec for a single counter: header, value, key echo, checksum.
use sha2::{Digest, Sha256};

use crate::core::error::{Error, ErrorKind};
use crate::core::key::{CounterKey, MAX_KEY_LEN};

const MAGIC: [u8; 4] = *b"TALY";
const VERSION: u32 = 1;
const FIXED_SIZE: usize = 4 + 4 + 8 + 2;
const CHECKSUM_SIZE: usize = 8;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Record {
    pub key: CounterKey,
    pub value: u64,
}

impl Record {
    pub fn new(key: CounterKey, value: u64) -> Self {
        Self { key, value }
    }

    pub fn encode(&self) -> Vec<u8> {
        let key = self.key.as_str().as_bytes();
        let mut buf = Vec::with_capacity(FIXED_SIZE + key.len() + CHECKSUM_SIZE);
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&VERSION.to_le_bytes());
        buf.extend_from_slice(&self.value.to_le_bytes());
        // Canonical keys are at most MAX_KEY_LEN ASCII bytes.
        buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
        buf.extend_from_slice(key);
        let checksum = checksum(&buf);
        buf.extend_from_slice(&checksum);
        buf
    }

    /// Decodes a record and checks that it belongs to `expected`.
    pub fn decode(buf: &[u8], expected: &CounterKey) -> Result<Self, Error> {
        if buf.len() < FIXED_SIZE + CHECKSUM_SIZE {
            return Err(corrupt("record too small", expected));
        }
        if buf[0..4] != MAGIC {
            return Err(corrupt("bad magic", expected));
        }
        let version = u32::from_le_bytes(read_4(buf, 4));
        if version != VERSION {
            return Err(corrupt("unsupported record version", expected));
        }
        let value = u64::from_le_bytes(read_8(buf, 8));
        let key_len = u16::from_le_bytes([buf[16], buf[17]]) as usize;
        if key_len == 0 || key_len > MAX_KEY_LEN {
            return Err(corrupt("invalid key length", expected));
        }
        let body_len = FIXED_SIZE + key_len;
        if buf.len() != body_len + CHECKSUM_SIZE {
            return Err(corrupt("record length mismatch", expected));
        }
        if checksum(&buf[..body_len]) != buf[body_len..] {
            return Err(corrupt("checksum mismatch", expected));
        }
        let key = std::str::from_utf8(&buf[FIXED_SIZE..body_len])
            .ok()
            .and_then(CounterKey::parse)
            .ok_or_else(|| corrupt("invalid key bytes", expected))?;
        if &key != expected {
            return Err(corrupt("record belongs to a different key", expected));
        }
        Ok(Self { key, value })
    }
}

/// Stable file stem for a key; hashing keeps names portable across filesystems.
pub fn file_stem(key: &CounterKey) -> String {
    let digest = Sha256::digest(key.as_str().as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn checksum(bytes: &[u8]) -> [u8; CHECKSUM_SIZE] {
    let digest = Sha256::digest(bytes);
    let mut out = [0u8; CHECKSUM_SIZE];
    out.copy_from_slice(&digest[..CHECKSUM_SIZE]);
    out
}

fn corrupt(message: &str, key: &CounterKey) -> Error {
    Error::new(ErrorKind::Corrupt)
        .with_message(message)
        .with_key(key.as_str())
}

fn read_4(buf: &[u8], offset: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    out
}

fn read_8(buf: &[u8], offset: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    out
}
