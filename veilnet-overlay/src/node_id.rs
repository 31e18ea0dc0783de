//! XOR-distance metric over 256-bit node identifiers (`spec.md` §3, §4.5).

pub use veilnet_crypto::NodeId;

/// `a XOR b`, byte-wise.
pub fn xor_distance(a: &NodeId, b: &NodeId) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// The highest set bit position of a 256-bit value, counting bit 0 as
/// the most significant bit of byte 0 (so a distance of all zero bytes
/// except the final bit gives position 255). Returns `None` for an
/// all-zero distance (identical ids).
pub fn highest_set_bit(distance: &[u8; 32]) -> Option<usize> {
    for (byte_index, &byte) in distance.iter().enumerate() {
        if byte != 0 {
            let bit_in_byte = byte.leading_zeros() as usize;
            return Some(byte_index * 8 + bit_in_byte);
        }
    }
    None
}

/// The bucket index a peer belongs in relative to `local`, per `spec.md`
/// §4.5: "the highest bit position at which `NodeId(P) XOR NodeId(L)` is
/// set". Identical ids (distance 0) have no bucket; callers must not
/// insert the local node into its own table.
pub fn bucket_index(local: &NodeId, peer: &NodeId) -> Option<usize> {
    highest_set_bit(&xor_distance(local, peer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_ids_have_no_bucket() {
        let id = [0x42u8; 32];
        assert_eq!(bucket_index(&id, &id), None);
    }

    #[test]
    fn differing_only_in_final_bit_is_bucket_255() {
        let local = [0u8; 32];
        let mut peer = [0u8; 32];
        peer[31] = 0x01;
        assert_eq!(bucket_index(&local, &peer), Some(255));
    }

    #[test]
    fn differing_in_top_bit_is_bucket_0() {
        let local = [0u8; 32];
        let mut peer = [0u8; 32];
        peer[0] = 0x80;
        assert_eq!(bucket_index(&local, &peer), Some(0));
    }

    #[test]
    fn bit_five_difference_lands_in_bucket_five() {
        let local = [0u8; 32];
        let mut peer = [0u8; 32];
        peer[0] = 0b0000_0100; // bit index 5 from the top (0-indexed)
        assert_eq!(bucket_index(&local, &peer), Some(5));
    }
}
