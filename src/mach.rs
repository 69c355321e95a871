// Functions related to encoding.
use byteorder::{BigEndian, ByteOrder};

// InnoDB file page structures use big-endian byte order.
// The most significant byte is at the lowest address.
type E = BigEndian;

pub fn mach_read_from_2(buf: &[u8]) -> u16 {
    E::read_u16(buf)
}

pub fn mach_read_from_4(buf: &[u8]) -> u32 {
    E::read_u32(buf)
}

pub fn mach_read_from_8(buf: &[u8]) -> u64 {
    E::read_u64(buf)
}

pub fn mach_write_to_2(buf: &mut [u8], n: u16) {
    E::write_u16(buf, n)
}

pub fn mach_write_to_4(buf: &mut [u8], n: u32) {
    E::write_u32(buf, n)
}

pub fn mach_write_to_8(buf: &mut [u8], n: u64) {
    E::write_u64(buf, n)
}

/// Read a file list address `{page_no, byte_offset}` (6 bytes on page).
pub fn mach_read_addr(buf: &[u8]) -> (u32, u16) {
    (mach_read_from_4(buf), mach_read_from_2(&buf[4..]))
}

/// Write a file list address `{page_no, byte_offset}` (6 bytes on page).
pub fn mach_write_addr(buf: &mut [u8], page: u32, boffset: u16) {
    mach_write_to_4(buf, page);
    mach_write_to_2(&mut buf[4..], boffset);
}

#[cfg(test)]
mod test {
    #[test]
    fn test_roundtrip() {
        let mut buf = [0u8; 8];
        super::mach_write_to_8(&mut buf, 0x0102030405060708);
        assert_eq!(buf[0], 1);
        assert_eq!(super::mach_read_from_8(&buf), 0x0102030405060708);
        assert_eq!(super::mach_read_from_4(&buf), 0x01020304);
        assert_eq!(super::mach_read_from_2(&buf), 0x0102);
    }

    #[test]
    fn test_addr() {
        let mut buf = [0u8; 6];
        super::mach_write_addr(&mut buf, 7, 38);
        assert_eq!(super::mach_read_addr(&buf), (7, 38));
    }
}
