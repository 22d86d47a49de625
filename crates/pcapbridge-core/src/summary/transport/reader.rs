use super::error::TransportError;
use super::layout;

/// Bounds-checked access to an IP payload carrying a UDP or TCP segment.
pub struct SegmentReader<'a> {
    segment: &'a [u8],
}

impl<'a> SegmentReader<'a> {
    pub fn new(segment: &'a [u8]) -> Self {
        Self { segment }
    }

    pub fn require_len(&self, needed: usize) -> Result<(), TransportError> {
        if self.segment.len() < needed {
            return Err(TransportError::TooShort {
                needed,
                actual: self.segment.len(),
            });
        }
        Ok(())
    }

    pub fn udp_payload(&self) -> Result<&'a [u8], TransportError> {
        self.payload_after(layout::UDP_HEADER_LEN)
    }

    /// Payload after the TCP header, including options.
    pub fn tcp_payload(&self) -> Result<&'a [u8], TransportError> {
        self.require_len(layout::TCP_MIN_HEADER_LEN)?;
        let header_len = usize::from(self.segment[layout::TCP_DATA_OFFSET] >> 4) * 4;
        self.payload_after(header_len.max(layout::TCP_MIN_HEADER_LEN))
    }

    fn payload_after(&self, header_len: usize) -> Result<&'a [u8], TransportError> {
        self.require_len(header_len)?;
        self.segment
            .get(header_len..)
            .ok_or(TransportError::TooShort {
                needed: header_len,
                actual: self.segment.len(),
            })
    }
}
