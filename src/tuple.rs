use bytes::Bytes;

/// An opaque tuple payload. The engine never interprets the bytes; decoding
/// against a schema is the executor's job. On disk and in the log the tuple
/// is length-prefixed with a native-endian u32.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Tuple {
    data: Bytes,
}

impl Tuple {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size of the length-prefixed wire form.
    pub fn serialized_size(&self) -> usize {
        4 + self.data.len()
    }

    pub fn serialize_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&(self.data.len() as u32).to_ne_bytes());
        buf[4..4 + self.data.len()].copy_from_slice(&self.data);
    }

    /// Reads a length-prefixed tuple. Returns None if the buffer is too
    /// short to hold the declared length (a torn log tail).
    pub fn deserialize_from(buf: &[u8]) -> Option<Self> {
        if buf.len() < 4 {
            return None;
        }
        let len = u32::from_ne_bytes(buf[0..4].try_into().unwrap()) as usize;
        if buf.len() < 4 + len {
            return None;
        }
        Some(Self {
            data: Bytes::copy_from_slice(&buf[4..4 + len]),
        })
    }
}

impl From<&[u8]> for Tuple {
    fn from(data: &[u8]) -> Self {
        Self {
            data: Bytes::copy_from_slice(data),
        }
    }
}

impl From<Vec<u8>> for Tuple {
    fn from(data: Vec<u8>) -> Self {
        Self { data: data.into() }
    }
}
