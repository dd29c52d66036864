//! Binary entity records
//!
//! Entity data is a plain concatenation of records, each prefixed by a
//! 24-byte little-endian header:
//!
//! ```text
//! [length:8][type_id:8][object_id:8][body:length-24]
//! ```
//!
//! `length` counts the whole record including its header.

use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the entity header in bytes
pub const ENTITY_HEADER_LENGTH: usize = 24;

/// One persisted entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRecord {
    /// Type id, resolved through the type dictionary
    pub type_id: u64,
    /// Object id
    pub object_id: u64,
    /// Raw entity body
    pub body: Bytes,
}

impl EntityRecord {
    /// Create an entity record
    pub fn new(type_id: u64, object_id: u64, body: impl Into<Bytes>) -> Self {
        Self {
            type_id,
            object_id,
            body: body.into(),
        }
    }

    /// Encoded size including the header
    pub fn encoded_len(&self) -> usize {
        ENTITY_HEADER_LENGTH + self.body.len()
    }

    /// Append the encoded record to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u64_le(self.encoded_len() as u64);
        buf.put_u64_le(self.type_id);
        buf.put_u64_le(self.object_id);
        buf.put_slice(&self.body);
    }
}

/// Encode records into one contiguous buffer
pub fn encode_entities(records: &[EntityRecord]) -> Bytes {
    let mut buf = BytesMut::with_capacity(records.iter().map(EntityRecord::encoded_len).sum());
    for record in records {
        record.encode_into(&mut buf);
    }
    buf.freeze()
}

/// Iterates the entity records of a buffer without copying bodies
pub struct EntityIter {
    data: Bytes,
    failed: bool,
}

impl EntityIter {
    /// Iterate over `data`
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            failed: false,
        }
    }
}

impl Iterator for EntityIter {
    type Item = Result<EntityRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.data.is_empty() {
            return None;
        }

        if self.data.len() < ENTITY_HEADER_LENGTH {
            self.failed = true;
            return Some(Err(Error::storage(format!(
                "Incomplete entity header: {} bytes left",
                self.data.len()
            ))));
        }

        let mut header = &self.data[..ENTITY_HEADER_LENGTH];
        let length = header.get_u64_le();
        let type_id = header.get_u64_le();
        let object_id = header.get_u64_le();

        if length < ENTITY_HEADER_LENGTH as u64 || length > self.data.len() as u64 {
            self.failed = true;
            return Some(Err(Error::storage(format!(
                "Entity {} declares length {} but {} bytes are available",
                object_id,
                length,
                self.data.len()
            ))));
        }

        let mut record = self.data.split_to(length as usize);
        record.advance(ENTITY_HEADER_LENGTH);
        Some(Ok(EntityRecord {
            type_id,
            object_id,
            body: record,
        }))
    }
}
