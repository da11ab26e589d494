use crate::{Error, Result};
use bitcoin::block::{Header, Version};
use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::hash_types::TxMerkleNode;
use bitcoin::hashes::Hash;
use bitcoin::merkle_tree::PartialMerkleTree;
use bitcoin::{BlockHash, CompactTarget, Txid};
use std::collections::BTreeMap;
use tracing::debug;

/// Read access to the bitcoin headers known to the sidechain.
pub trait BtcBlockchain {
    fn best_chain_height(&self) -> Result<u32>;
    fn header_at_height(&self, height: u32) -> Result<Option<Header>>;
}

/// Header chain kept in memory. Used by tests and offline tooling.
#[derive(Clone, Debug, Default)]
pub struct MemoryBtcBlockchain {
    headers: BTreeMap<u32, Header>,
}

impl MemoryBtcBlockchain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_header(&mut self, header: Header) -> u32 {
        let height = self.next_height();
        self.headers.insert(height, header);
        height
    }

    /// Appends a block containing `txids` and returns its height and a proof for `target`.
    pub fn mine_block(&mut self, txids: &[Txid], target: &Txid) -> (u32, Vec<u8>) {
        let matches = txids.iter().map(|txid| txid == target).collect::<Vec<_>>();
        let pmt = PartialMerkleTree::from_txids(txids, &matches);
        let mut unused_matches = vec![];
        let mut unused_indexes = vec![];
        let merkle_root = pmt
            .extract_matches(&mut unused_matches, &mut unused_indexes)
            .unwrap_or_else(|_| TxMerkleNode::all_zeros());

        let header = Header {
            version: Version::from_consensus(1),
            prev_blockhash: self
                .headers
                .values()
                .last()
                .map(|h| h.block_hash())
                .unwrap_or_else(BlockHash::all_zeros),
            merkle_root,
            time: self.next_height(),
            bits: CompactTarget::from_consensus(0x207fffff),
            nonce: 0,
        };
        (self.push_header(header), serialize(&pmt))
    }

    pub fn mine_empty_blocks(&mut self, count: u32) {
        for i in 0..count {
            let filler = Txid::hash(&(self.next_height() + i).to_le_bytes());
            self.mine_block(&[filler], &filler);
        }
    }

    fn next_height(&self) -> u32 {
        self.headers.keys().last().map(|h| h + 1).unwrap_or(0)
    }
}

impl BtcBlockchain for MemoryBtcBlockchain {
    fn best_chain_height(&self) -> Result<u32> {
        self.headers
            .keys()
            .last()
            .copied()
            .ok_or(Error::MissingBlockHeader(0))
    }

    fn header_at_height(&self, height: u32) -> Result<Option<Header>> {
        Ok(self.headers.get(&height).copied())
    }
}

/// Checks that `txid` is included in the block at `height` with enough confirmations.
pub(crate) fn validate_registration<B: BtcBlockchain + ?Sized>(
    chain: &B,
    txid: &Txid,
    height: u32,
    pmt: &[u8],
    required_confirmations: u32,
) -> Result<()> {
    let best = chain.best_chain_height()?;
    let confirmations = best.checked_sub(height).map(|d| d + 1).unwrap_or(0);
    if confirmations < required_confirmations {
        return Err(Error::InsufficientConfirmations {
            got: confirmations,
            required: required_confirmations,
        });
    }

    let pmt: PartialMerkleTree = deserialize(pmt).map_err(|_| Error::InvalidMerkleProof)?;
    let mut matches = vec![];
    let mut indexes = vec![];
    let merkle_root = pmt
        .extract_matches(&mut matches, &mut indexes)
        .map_err(|_| Error::InvalidMerkleProof)?;
    if !matches.contains(txid) {
        debug!("Transaction {txid} is not part of the supplied proof");
        return Err(Error::InvalidMerkleProof);
    }

    let header = chain
        .header_at_height(height)?
        .ok_or(Error::MissingBlockHeader(height))?;
    if header.merkle_root != merkle_root {
        return Err(Error::InvalidMerkleProof);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_registration() {
        let mut chain = MemoryBtcBlockchain::new();
        let txids = (0u8..5).map(|i| Txid::hash(&[i])).collect::<Vec<_>>();
        let (height, proof) = chain.mine_block(&txids, &txids[3]);

        assert!(matches!(
            validate_registration(&chain, &txids[3], height, &proof, 3),
            Err(Error::InsufficientConfirmations {
                got: 1,
                required: 3
            })
        ));

        chain.mine_empty_blocks(2);
        validate_registration(&chain, &txids[3], height, &proof, 3).unwrap();

        // proof for another transaction of the same block
        assert!(matches!(
            validate_registration(&chain, &txids[2], height, &proof, 3),
            Err(Error::InvalidMerkleProof)
        ));
        // right proof, wrong block
        assert!(matches!(
            validate_registration(&chain, &txids[3], height + 1, &proof, 1),
            Err(Error::InvalidMerkleProof)
        ));
        assert!(matches!(
            validate_registration(&chain, &txids[3], height, &[0xff, 0x00], 1),
            Err(Error::InvalidMerkleProof)
        ));
        assert!(matches!(
            validate_registration(&chain, &txids[3], height + 10, &proof, 0),
            Err(Error::MissingBlockHeader(_))
        ));
    }
}
