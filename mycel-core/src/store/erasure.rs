//! Reed-Solomon over GF(2^8) on equal-size, zero-padded shares.

use reed_solomon_erasure::galois_8::ReedSolomon;

use super::StoreError;

/// Largest total share count GF(2^8) allows.
pub const MAX_TOTAL_SHARES: usize = 256;

fn codec(data: usize, parity: usize) -> Result<ReedSolomon, StoreError> {
    if data == 0 || parity == 0 || data + parity > MAX_TOTAL_SHARES {
        return Err(StoreError::InvalidGroup("share counts out of range"));
    }
    ReedSolomon::new(data, parity).map_err(|e| StoreError::Erasure(format!("{:?}", e)))
}

fn padded(block: &[u8], block_length: usize) -> Vec<u8> {
    let mut shard = block.to_vec();
    shard.resize(block_length, 0);
    shard
}

/// Compute `parity` shares for `data` (each at most `block_length` bytes).
pub fn encode_parity(
    data: &[Vec<u8>],
    parity: usize,
    block_length: usize,
) -> Result<Vec<Vec<u8>>, StoreError> {
    if data.iter().any(|b| b.len() > block_length) {
        return Err(StoreError::InvalidGroup("block longer than block length"));
    }
    let rs = codec(data.len(), parity)?;
    let mut shards: Vec<Vec<u8>> = data.iter().map(|b| padded(b, block_length)).collect();
    shards.extend((0..parity).map(|_| vec![0u8; block_length]));
    rs.encode(&mut shards)
        .map_err(|e| StoreError::Erasure(format!("{:?}", e)))?;
    Ok(shards.split_off(data.len()))
}

/// Reconstruct missing data shares. `shares` holds every share slot (data then parity);
/// present entries may be shorter than `block_length` and are padded.
/// Returns all data shares, still padded.
pub fn reconstruct_data(
    shares: Vec<Option<Vec<u8>>>,
    information_length: usize,
    block_length: usize,
) -> Result<Vec<Vec<u8>>, StoreError> {
    let parity = shares.len().saturating_sub(information_length);
    let present = shares.iter().filter(|s| s.is_some()).count();
    if present < information_length {
        return Err(StoreError::Insufficient {
            present,
            needed: information_length,
        });
    }
    let rs = codec(information_length, parity)?;
    let mut shards: Vec<Option<Vec<u8>>> = shares
        .into_iter()
        .map(|s| s.map(|b| padded(&b, block_length)))
        .collect();
    rs.reconstruct_data(&mut shards)
        .map_err(|e| StoreError::Erasure(format!("{:?}", e)))?;
    shards
        .into_iter()
        .take(information_length)
        .map(|s| s.ok_or(StoreError::Erasure("share left missing".into())))
        .collect()
}

/// Real length of data share `index` in a group whose data totals `length` bytes.
pub fn share_length(index: usize, block_length: usize, length: u64) -> usize {
    let start = (index as u64).saturating_mul(block_length as u64);
    length.saturating_sub(start).min(block_length as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconstructs_lost_data_shares() {
        let data: Vec<Vec<u8>> = (0..8u8).map(|i| vec![i; 16]).collect();
        let parity = encode_parity(&data, 2, 16).unwrap();
        assert_eq!(parity.len(), 2);
        let mut shares: Vec<Option<Vec<u8>>> = data.iter().cloned().map(Some).collect();
        shares.extend(parity.into_iter().map(Some));
        shares[0] = None;
        shares[5] = None;
        let out = reconstruct_data(shares, 8, 16).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn too_few_shares_is_an_error() {
        let data: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i; 8]).collect();
        let parity = encode_parity(&data, 1, 8).unwrap();
        let mut shares: Vec<Option<Vec<u8>>> = data.into_iter().map(Some).collect();
        shares.extend(parity.into_iter().map(Some));
        shares[0] = None;
        shares[1] = None;
        assert!(matches!(
            reconstruct_data(shares, 4, 8),
            Err(StoreError::Insufficient { present: 3, needed: 4 })
        ));
    }

    #[test]
    fn short_final_share_is_padded() {
        let data = vec![vec![1u8; 10], vec![2u8; 3]];
        let parity = encode_parity(&data, 2, 10).unwrap();
        let shares = vec![Some(data[0].clone()), None, Some(parity[0].clone()), None];
        let out = reconstruct_data(shares, 2, 10).unwrap();
        assert_eq!(&out[1][..3], &[2, 2, 2]);
        assert_eq!(share_length(1, 10, 13), 3);
        assert_eq!(share_length(0, 10, 13), 10);
        assert_eq!(share_length(2, 10, 13), 0);
    }
}
