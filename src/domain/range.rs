//! HTTP byte-range handling for artifact delivery.
//!
//! Only single ranges are honored. Anything that cannot be satisfied against the object size is
//! reported as `None` and the caller serves the full object instead.

/// Inclusive byte range within an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered by the range.
    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Resolves a `Range` header value against an object of `size` bytes.
    ///
    /// Accepts `bytes=a-b`, `bytes=a-` and `bytes=-n`. An end past the object is clamped to the
    /// last byte.
    pub fn parse(header: &str, size: u64) -> Option<ByteRange> {
        if size == 0 {
            return None;
        }
        let ranges = header.trim().strip_prefix("bytes=")?.trim();
        if ranges.contains(',') {
            return None;
        }
        let (start, end) = ranges.split_once('-')?;
        let (start, end) = (start.trim(), end.trim());
        let last = size - 1;

        if start.is_empty() {
            let suffix: u64 = end.parse().ok()?;
            if suffix == 0 {
                return None;
            }
            return Some(ByteRange {
                start: size.saturating_sub(suffix),
                end: last,
            });
        }

        let start: u64 = start.parse().ok()?;
        let end: u64 = if end.is_empty() { last } else { end.parse().ok()? };
        if end < start || start > last {
            return None;
        }
        Some(ByteRange {
            start,
            end: end.min(last),
        })
    }

    /// `Content-Range` header value for a response.
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, size)
    }

    /// `Range` header value for an upstream request.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}
