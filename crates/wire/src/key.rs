use std::fmt;

/// A 128-bit key hash. The low 32 bits (the bucket field) select the shard
/// and the index bucket; the remaining 96 bits are the tag that tells apart
/// colliding keys within a bucket.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(u128);

impl Key {
    /// Derive a key from a client-supplied seed.
    pub fn from_seed(seed: u64) -> Self {
        Self(xxhash_rust::xxh3::xxh3_128(&seed.to_le_bytes()))
    }

    pub fn from_raw(raw: u128) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u128 {
        self.0
    }

    /// The bucket field: low-order 32 bits.
    pub fn bucket(self) -> u32 {
        self.0 as u32
    }

    /// The tag: everything above the bucket field.
    pub fn tag(self) -> u128 {
        self.0 >> 32
    }

    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_le_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(u128::from_le_bytes(bytes))
    }

    /// A deterministic value for this key, used to preload stores and to
    /// check read-backs end to end.
    pub fn derived_value(self, len: usize) -> Vec<u8> {
        self.0.to_le_bytes().iter().copied().cycle().take(len).collect()
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({:032x})", self.0)
    }
}

/// The shared key array: every client and every preloading worker derives
/// the identical array from seeds `0..n`.
pub fn keyspace(n: usize) -> Vec<Key> {
    (0..n as u64).map(Key::from_seed).collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bucket_and_tag_partition_the_key() {
        let key = Key::from_raw(0xfeed_face_dead_beef_0123_4567_89ab_cdef);
        assert_eq!(key.bucket(), 0x89ab_cdef);
        assert_eq!(key.tag(), 0xfeed_face_dead_beef_0123_4567);
        assert_eq!((key.tag() << 32) | key.bucket() as u128, key.raw());
    }

    #[test]
    fn seed_derivation_is_stable() {
        let a = Key::from_seed(42);
        let b = Key::from_seed(42);
        assert_eq!(a, b);
        assert_ne!(a, Key::from_seed(43));
    }

    #[test]
    fn byte_round_trip() {
        let key = Key::from_seed(7);
        assert_eq!(Key::from_bytes(key.to_bytes()), key);
    }

    #[test]
    fn keyspace_is_shared_and_distinct() {
        let ks = keyspace(1024);
        assert_eq!(ks, keyspace(1024));

        let mut sorted = ks.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), ks.len());
    }

    #[test]
    fn derived_value_cycles_key_bytes() {
        let key = Key::from_raw(0x0102_0304_0506_0708_090a_0b0c_0d0e_0f10);
        let value = key.derived_value(20);
        assert_eq!(value.len(), 20);
        assert_eq!(&value[..16], &key.to_bytes());
        assert_eq!(&value[16..], &key.to_bytes()[..4]);
    }
}
