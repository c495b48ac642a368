//! Pure byte-level half of the sharded file codec.
//!
//! Partitions a serialized payload into content-addressed, size-bounded
//! shards and reassembles them. Compression and content-hashing happen
//! here; the I/O half (writing/fetching shard keys through a `DataStore`,
//! concurrent shard fetch, orphan bookkeeping across saves) lives in
//! `latchkv_engine::shard`, since it needs the backend trait and async
//! retries that this dependency-free crate does not have.

use crate::record::FileRef;

/// Default per-shard size bound: 4 MiB minus the fixed reserve for record
/// metadata stored alongside the shard list.
pub const MAX_CHUNK_SIZE: usize = 4 * 1024 * 1024 - SHARD_RESERVE_BYTES;

/// Reserve subtracted from the raw 4 MiB DataStore value limit to leave
/// room for the record's own metadata fields when a payload is inline.
pub const SHARD_RESERVE_BYTES: usize = 10 * 1024;

/// zstd compression level used for shard bytes. Chosen for speed over ratio,
/// matching this codebase's general bias toward low-latency compression.
pub const COMPRESSION_LEVEL: i32 = 3;

/// The result of compressing and partitioning a serialized payload.
pub struct PartitionedFile {
    /// Content-derived id shared by every shard.
    pub file_id: String,
    /// Compressed shard bytes, in order.
    pub shards: Vec<Vec<u8>>,
}

/// Derives the content-addressed file id for a payload.
///
/// Mixes `key` into the hash so that two different keys whose serialized
/// payloads happen to collide byte-for-byte never share a `fileId` --
/// shard storage has no reference counting, and two live records pointing
/// at the same shard set would make orphan deletion for one record corrupt
/// the other.
#[must_use]
pub fn derive_file_id(key: &str, serialized: &[u8]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(key.as_bytes());
    hasher.update(b"\0");
    hasher.update(serialized);
    hasher.finalize().to_hex()[..32].to_string()
}

/// Splits `serialized` into at most `MAX_CHUNK_SIZE`-sized pieces, each
/// independently zstd-compressed, and assigns a content-derived file id.
///
/// # Errors
///
/// Returns an error if zstd compression fails (out-of-memory; never
/// expected in practice for JSON-derived byte slices).
pub fn partition(key: &str, serialized: &[u8], max_chunk_size: usize) -> anyhow::Result<PartitionedFile> {
    let file_id = derive_file_id(key, serialized);
    let chunk_size = max_chunk_size.max(1);
    let mut shards = Vec::with_capacity(serialized.len().div_ceil(chunk_size).max(1));
    for chunk in serialized.chunks(chunk_size) {
        shards.push(zstd::stream::encode_all(chunk, COMPRESSION_LEVEL)?);
    }
    if shards.is_empty() {
        shards.push(zstd::stream::encode_all(&b""[..], COMPRESSION_LEVEL)?);
    }
    Ok(PartitionedFile { file_id, shards })
}

/// Builds the [`FileRef`] that should be written into the record once the
/// shards themselves have been durably stored.
#[must_use]
pub fn file_ref_for(store_name: &str, file_id: &str, shard_count: usize) -> FileRef {
    FileRef {
        id: file_id.to_string(),
        shards: (0..shard_count)
            .map(|i| crate::record::shard_key(store_name, file_id, i as u32))
            .collect(),
        count: shard_count as u32,
    }
}

/// Decompresses and concatenates shard bytes back into the serialized payload.
///
/// # Errors
///
/// Returns an error if any shard fails to decompress.
pub fn reassemble(compressed_shards: &[Vec<u8>]) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    for shard in compressed_shards {
        out.extend(zstd::stream::decode_all(shard.as_slice())?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_payload_produces_single_shard() {
        let payload = b"{\"coins\":1}";
        let partitioned = partition("p1", payload, MAX_CHUNK_SIZE).unwrap();
        assert_eq!(partitioned.shards.len(), 1);
        let back = reassemble(&partitioned.shards).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn large_payload_splits_into_multiple_shards() {
        let payload = vec![b'x'; 100];
        let partitioned = partition("p1", &payload, 15).unwrap();
        assert_eq!(partitioned.shards.len(), 100_usize.div_ceil(15));
        let back = reassemble(&partitioned.shards).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn file_id_depends_on_both_key_and_bytes() {
        let a = derive_file_id("p1", b"same-bytes");
        let b = derive_file_id("p2", b"same-bytes");
        assert_ne!(a, b, "different keys must not collide on fileId");
    }

    #[test]
    fn file_id_is_stable_for_identical_inputs() {
        let a = derive_file_id("p1", b"payload");
        let b = derive_file_id("p1", b"payload");
        assert_eq!(a, b);
    }

    #[test]
    fn file_ref_for_lists_shard_keys_in_order() {
        let file_ref = file_ref_for("players", "abc", 3);
        assert_eq!(
            file_ref.shards,
            vec!["shards/players/abc-0", "shards/players/abc-1", "shards/players/abc-2"]
        );
        assert_eq!(file_ref.count, 3);
    }
}
