use std::{collections::BTreeMap, io::Read};

use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};

use super::{
    encryption::{ShardCipher, TAG_SIZE},
    erasure::Erasure,
};
use crate::{
    crypto::hash_hex,
    error::{Error, Result},
};

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecParams {
    pub data_shards: usize,
    pub parity_shards: usize,
    pub chunk_size: usize,
}

impl CodecParams {
    pub fn new(data_shards: usize, parity_shards: usize, chunk_size: usize) -> Result<Self> {
        if data_shards == 0 {
            return Err(Error::invalid_parameter("data shards must be positive"));
        }
        if chunk_size == 0 {
            return Err(Error::invalid_parameter("chunk size must be positive"));
        }
        Ok(Self {
            data_shards,
            parity_shards,
            chunk_size,
        })
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Plaintext bytes each shard carries before encryption.
    pub fn shard_size(&self) -> usize {
        self.chunk_size.div_ceil(self.data_shards)
    }

    pub fn stored_shard_size(&self, encrypted: bool) -> usize {
        self.shard_size() + if encrypted { TAG_SIZE } else { 0 }
    }

    /// Number of chunks a file of `actual_size` bytes occupies. An empty file
    /// still occupies one (empty) chunk so that it can be committed.
    pub fn num_chunks(&self, actual_size: u64) -> u64 {
        actual_size.div_ceil(self.chunk_size as u64).max(1)
    }

    pub fn plaintext_len(&self, actual_size: u64, chunk_index: u64) -> usize {
        let start = chunk_index * self.chunk_size as u64;
        actual_size.saturating_sub(start).min(self.chunk_size as u64) as usize
    }
}

/// All `N` shards of one chunk, in roster order.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkGroup {
    pub chunk_index: u64,
    pub shards: Vec<Vec<u8>>,
    pub shard_hashes: Vec<String>,
    pub plaintext_len: usize,
    pub is_final: bool,
}

#[derive(Debug, Clone)]
pub struct Codec {
    params: CodecParams,
    erasure: Erasure,
    cipher: Option<ShardCipher>,
}

impl Codec {
    pub fn new(params: CodecParams, cipher: Option<ShardCipher>) -> Result<Self> {
        let erasure = Erasure::new(params.data_shards, params.parity_shards)?;
        Ok(Self {
            params,
            erasure,
            cipher,
        })
    }

    pub fn params(&self) -> CodecParams {
        self.params
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn encode_chunk(
        &self,
        chunk_index: u64,
        plaintext: &[u8],
        is_final: bool,
    ) -> Result<ChunkGroup> {
        if plaintext.len() > self.params.chunk_size {
            return Err(Error::invalid_parameter(format!(
                "chunk {} holds {} bytes, more than the chunk size {}",
                chunk_index,
                plaintext.len(),
                self.params.chunk_size
            )));
        }
        let shards = self.erasure.encode(plaintext, self.params.shard_size())?;
        let sealed: Vec<(Vec<u8>, String)> = shards
            .into_par_iter()
            .enumerate()
            .map(|(i, shard)| {
                let shard = match &self.cipher {
                    Some(cipher) => cipher.encrypt(chunk_index, i, &shard)?,
                    None => shard,
                };
                let shard_hash = hash_hex(&shard);
                Ok((shard, shard_hash))
            })
            .collect::<Result<Vec<_>>>()?;
        let (shards, shard_hashes) = sealed.into_iter().unzip();
        Ok(ChunkGroup {
            chunk_index,
            shards,
            shard_hashes,
            plaintext_len: plaintext.len(),
            is_final,
        })
    }

    /// Rebuilds the plaintext of one chunk from the shards at hand. Shards
    /// are keyed by roster index and are still sealed when encrypted.
    pub fn decode_chunk(
        &self,
        chunk_index: u64,
        shards: &BTreeMap<usize, Vec<u8>>,
        plaintext_len: usize,
    ) -> Result<Vec<u8>> {
        let opened = match &self.cipher {
            Some(cipher) => shards
                .iter()
                .map(|(i, sealed)| Ok((*i, cipher.decrypt(chunk_index, *i, sealed)?)))
                .collect::<Result<BTreeMap<_, _>>>()?,
            None => shards.clone(),
        };
        let mut plaintext = self.erasure.reconstruct(&opened)?;
        if plaintext.len() < plaintext_len {
            return Err(Error::corrupted_shards(format!(
                "chunk {} decoded to {} bytes, expected {}",
                chunk_index,
                plaintext.len(),
                plaintext_len
            )));
        }
        plaintext.truncate(plaintext_len);
        Ok(plaintext)
    }

    /// Lazily encodes `reader` from `start_chunk` on. `actual_size` is the
    /// full plaintext length; the reader must already be positioned at
    /// `start_chunk * chunk_size`.
    pub fn encode_file<R: Read>(&self, reader: R, actual_size: u64, start_chunk: u64) -> ChunkStream<'_, R> {
        ChunkStream {
            codec: self,
            reader,
            actual_size,
            next_chunk: start_chunk,
            total_chunks: self.params.num_chunks(actual_size),
            buffer: vec![0u8; self.params.chunk_size],
        }
    }
}

pub struct ChunkStream<'a, R> {
    codec: &'a Codec,
    reader: R,
    actual_size: u64,
    next_chunk: u64,
    total_chunks: u64,
    buffer: Vec<u8>,
}

impl<R: Read> ChunkStream<'_, R> {
    pub fn total_chunks(&self) -> u64 {
        self.total_chunks
    }

    fn fill(&mut self, len: usize) -> Result<()> {
        let mut read = 0;
        while read < len {
            match self.reader.read(&mut self.buffer[read..len]) {
                Ok(0) => {
                    return Err(Error::invalid_parameter(format!(
                        "source ended after {} bytes of chunk {}",
                        read, self.next_chunk
                    )));
                }
                Ok(n) => read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl<R: Read> Iterator for ChunkStream<'_, R> {
    type Item = Result<ChunkGroup>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_chunk >= self.total_chunks {
            return None;
        }
        let index = self.next_chunk;
        let len = self.codec.params.plaintext_len(self.actual_size, index);
        if let Err(e) = self.fill(len) {
            self.next_chunk = self.total_chunks;
            return Some(Err(e));
        }
        self.next_chunk += 1;
        let is_final = self.next_chunk == self.total_chunks;
        Some(self.codec.encode_chunk(index, &self.buffer[..len], is_final))
    }
}
