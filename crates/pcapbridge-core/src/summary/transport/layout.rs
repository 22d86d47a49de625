pub const UDP_HEADER_LEN: usize = 8;
pub const TCP_MIN_HEADER_LEN: usize = 20;
/// Offset of the TCP data offset nibble.
pub const TCP_DATA_OFFSET: usize = 12;
