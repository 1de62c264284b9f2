// rust/batch-core/src/dataset/format.rs

/// Describes how records are framed inside a record file.
pub trait RecordFormat: Send + Sync {
    /// Name of this record format
    fn name(&self) -> &'static str;

    /// Returns the exclusive end of the record starting at `offset`, or
    /// `None` if `data` does not hold the complete record yet.
    fn find_record_end(&self, data: &[u8], offset: usize) -> Option<usize>;

    /// Called once at end of input with the unconsumed tail. Returns how many
    /// bytes form a final record, or `None` if the tail is a truncated record.
    fn finish_record(&self, rest: &[u8]) -> Option<usize> {
        let _ = rest;
        None
    }

    /// Strips framing bytes from a complete record.
    fn payload<'a>(&self, record: &'a [u8]) -> &'a [u8] {
        record
    }
}

/// Records of one fixed byte size with no framing.
#[derive(Debug, Clone)]
pub struct FixedSizeFormat {
    pub record_size: usize,
}

impl FixedSizeFormat {
    pub fn new(record_size: usize) -> Self {
        Self { record_size }
    }
}

impl RecordFormat for FixedSizeFormat {
    fn name(&self) -> &'static str {
        "fixed-size"
    }

    fn find_record_end(&self, data: &[u8], offset: usize) -> Option<usize> {
        if self.record_size == 0 {
            return None;
        }
        let end = offset.checked_add(self.record_size)?;
        (end <= data.len()).then_some(end)
    }
}

/// Newline-terminated records (JSONL, CSV). A final line without a
/// terminator still counts as a record.
#[derive(Debug, Clone, Default)]
pub struct NewlineDelimitedFormat;

impl NewlineDelimitedFormat {
    pub fn new() -> Self {
        Self
    }
}

impl RecordFormat for NewlineDelimitedFormat {
    fn name(&self) -> &'static str {
        "newline-delimited"
    }

    fn find_record_end(&self, data: &[u8], offset: usize) -> Option<usize> {
        data.get(offset..)?
            .iter()
            .position(|&b| b == b'\n')
            .map(|i| offset + i + 1)
    }

    fn finish_record(&self, rest: &[u8]) -> Option<usize> {
        (!rest.is_empty()).then_some(rest.len())
    }

    fn payload<'a>(&self, record: &'a [u8]) -> &'a [u8] {
        let record = record.strip_suffix(b"\n").unwrap_or(record);
        record.strip_suffix(b"\r").unwrap_or(record)
    }
}

/// Records framed by a 4-byte big-endian length prefix.
#[derive(Debug, Clone, Default)]
pub struct LengthPrefixedFormat;

impl LengthPrefixedFormat {
    pub fn new() -> Self {
        Self
    }

    /// Frames `payload` the way this format expects to read it.
    pub fn encode(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + 4);
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }
}

impl RecordFormat for LengthPrefixedFormat {
    fn name(&self) -> &'static str {
        "length-prefixed"
    }

    fn find_record_end(&self, data: &[u8], offset: usize) -> Option<usize> {
        let prefix: [u8; 4] = data.get(offset..offset.checked_add(4)?)?.try_into().ok()?;
        let end = offset + 4 + u32::from_be_bytes(prefix) as usize;
        (end <= data.len()).then_some(end)
    }

    fn payload<'a>(&self, record: &'a [u8]) -> &'a [u8] {
        record.get(4..).unwrap_or_default()
    }
}
