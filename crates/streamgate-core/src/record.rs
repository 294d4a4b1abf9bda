use bytes::Bytes;

/// Record header; a `None` value is a null header value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Header {
    pub name: Bytes,
    pub value: Option<Bytes>,
}

impl Header {
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    /// Encoded footprint of the header: lengths plus name and value bytes.
    pub fn size(&self) -> usize {
        8 + self.name.len() + self.value.as_ref().map_or(0, Bytes::len)
    }
}

/// Encoded footprint of a header list, including its count prefix.
pub fn headers_size(headers: &[Header]) -> usize {
    4 + headers.iter().map(Header::size).sum::<usize>()
}
