mod chunker;
pub mod encryption;
pub mod erasure;
pub mod merkle;

pub use chunker::{ChunkGroup, ChunkStream, Codec, CodecParams, DEFAULT_CHUNK_SIZE};
pub use encryption::{ShardCipher, derive_shard_key, key_fingerprint};
pub use erasure::Erasure;
pub use merkle::{ColumnHasher, MerkleProof, MerkleTree, ProofStep, merkle_root_hex};
