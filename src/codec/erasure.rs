use std::collections::BTreeMap;

use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::error::{Error, Result};

/// Systematic Reed–Solomon over GF(2^8). Data shards keep the plaintext
/// split verbatim; parity shards follow at indices `[D, N)`.
#[derive(Debug, Clone)]
pub struct Erasure {
    data_shards: usize,
    parity_shards: usize,
    rs: Option<ReedSolomon>,
}

impl Erasure {
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        if data_shards == 0 {
            return Err(Error::invalid_parameter("data shards must be positive"));
        }
        if data_shards + parity_shards > 256 {
            return Err(Error::invalid_parameter(format!(
                "{} shards exceed the GF(2^8) limit of 256",
                data_shards + parity_shards
            )));
        }
        let rs = if parity_shards == 0 {
            None
        } else {
            Some(ReedSolomon::new(data_shards, parity_shards).map_err(|e| {
                Error::invalid_parameter(format!("erasure parameters rejected: {}", e))
            })?)
        };
        Ok(Self {
            data_shards,
            parity_shards,
            rs,
        })
    }

    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    pub fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    pub fn shard_size(&self, chunk_size: usize) -> usize {
        chunk_size.div_ceil(self.data_shards)
    }

    /// Splits a padded chunk into `N` shards of `shard_size` bytes.
    pub fn encode(&self, chunk: &[u8], shard_size: usize) -> Result<Vec<Vec<u8>>> {
        let mut shards = vec![vec![0u8; shard_size]; self.total_shards()];
        for (i, shard) in shards.iter_mut().take(self.data_shards).enumerate() {
            let start = (i * shard_size).min(chunk.len());
            let end = ((i + 1) * shard_size).min(chunk.len());
            shard[..end - start].copy_from_slice(&chunk[start..end]);
        }
        if let Some(rs) = &self.rs {
            rs.encode(&mut shards)
                .map_err(|e| Error::internal(format!("erasure encode failed: {}", e)))?;
        }
        Ok(shards)
    }

    /// Rebuilds the data portion of a chunk from any `D` of its shards.
    pub fn reconstruct(&self, available: &BTreeMap<usize, Vec<u8>>) -> Result<Vec<u8>> {
        let present = available
            .keys()
            .filter(|i| **i < self.total_shards())
            .count();
        if present < self.data_shards {
            return Err(Error::consensus_not_reached(format!(
                "insufficient shards: {} of {} required",
                present, self.data_shards
            )));
        }
        let mut shards: Vec<Option<Vec<u8>>> = (0..self.total_shards())
            .map(|i| available.get(&i).cloned())
            .collect();
        if let Some(rs) = &self.rs {
            rs.reconstruct(&mut shards)
                .map_err(|e| Error::corrupted_shards(format!("reconstruction failed: {}", e)))?;
            let full: Vec<Vec<u8>> = shards.iter().flatten().cloned().collect();
            let consistent = rs
                .verify(&full)
                .map_err(|e| Error::corrupted_shards(format!("verification failed: {}", e)))?;
            if !consistent {
                return Err(Error::corrupted_shards(
                    "shards are inconsistent after reconstruction",
                ));
            }
        }
        Ok(shards
            .into_iter()
            .take(self.data_shards)
            .flatten()
            .flatten()
            .collect())
    }
}
