/// Sums `data` a byte at a time, folding every carry out of bit 7 back into bit 0.
///
/// An empty (or all zero) input sums to zero.
pub fn compute_checksum(data: &[u8]) -> u8 {
    let mut sum = 0u32;
    for &val in data {
        sum += val as u32;
        sum = (sum & 0xff) + (sum >> 8);
    }
    sum as u8
}

/// Checks a block whose last byte is the checksum of everything before it.
pub fn verify_checksum(block: &[u8]) -> bool {
    match block.split_last() {
        Some((&chk, data)) => compute_checksum(data) == chk,
        None => false,
    }
}
