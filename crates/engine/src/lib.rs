//! The per-worker key-value engine: a bucket-chained in-memory index over a
//! circular value log. Strictly single-threaded; each worker owns one
//! engine and nothing else touches it.

mod index;
mod log;

use index::Index;
use log::CircularLog;
use wire::{Key, OpKind};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("num_buckets must be a nonzero power of two (got {0})")]
    Buckets(usize),
    #[error("log_capacity must be a nonzero power of two (got {0})")]
    LogCapacity(usize),
    #[error("max_value_len must be in 1..=255 (got {0})")]
    MaxValueLen(usize),
    #[error("log_capacity {capacity} cannot hold two {record}-byte records")]
    LogTooSmall { capacity: usize, record: usize },
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub num_buckets: usize,
    pub log_capacity: usize,
    pub max_value_len: usize,
}

impl EngineConfig {
    fn validate(&self) -> Result<(), Error> {
        if self.num_buckets == 0 || !self.num_buckets.is_power_of_two() {
            return Err(Error::Buckets(self.num_buckets));
        }
        if self.log_capacity == 0 || !self.log_capacity.is_power_of_two() {
            return Err(Error::LogCapacity(self.log_capacity));
        }
        if self.max_value_len == 0 || self.max_value_len > u8::MAX as usize {
            return Err(Error::MaxValueLen(self.max_value_len));
        }
        let record = 1 + self.max_value_len;
        if self.log_capacity < 2 * record {
            return Err(Error::LogTooSmall {
                capacity: self.log_capacity,
                record,
            });
        }
        Ok(())
    }
}

/// The engine's answer to one operation. `Empty` covers both a miss and a
/// PUT acknowledgement; `Rejected` is an oversize PUT, reflected on the
/// wire as the all-ones length sentinel.
#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    Value(Vec<u8>),
    Empty,
    Rejected,
}

/// One operation of a batch. `value` is empty for a GET.
#[derive(Debug)]
pub struct Op<'a> {
    pub kind: OpKind,
    pub key: Key,
    pub value: &'a [u8],
}

#[derive(Debug)]
pub struct Engine {
    index: Index,
    log: CircularLog,
    max_value_len: usize,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            index: Index::new(config.num_buckets),
            log: CircularLog::new(config.log_capacity),
            max_value_len: config.max_value_len,
        })
    }

    /// Look up a key. A miss and a lapsed entry are both a successful
    /// `Empty`; a lapsed index entry is dropped on the way out.
    pub fn get(&mut self, key: Key) -> Reply {
        let (bucket, tag) = (key.bucket(), key.tag());
        let Some(offset) = self.index.lookup(bucket, tag) else {
            return Reply::Empty;
        };
        if !self.log.live(offset) {
            self.index.invalidate(bucket, tag);
            return Reply::Empty;
        }
        Reply::Value(self.log.read(offset))
    }

    /// Store a value. An oversize value is rejected and mutates nothing.
    pub fn put(&mut self, key: Key, value: &[u8]) -> Reply {
        if value.len() > self.max_value_len {
            return Reply::Rejected;
        }
        let offset = self.log.append(value);
        self.index.insert(key.bucket(), key.tag(), offset);
        Reply::Empty
    }

    pub fn execute(&mut self, op: Op<'_>) -> Reply {
        match op.kind {
            OpKind::Get => self.get(op.key),
            OpKind::Put => self.put(op.key, op.value),
        }
    }

    /// Execute a batch, producing one reply per operation in order. The
    /// batch amortizes the caller's completion bookkeeping; there is no
    /// cross-operation atomicity.
    pub fn execute_batch<'a>(&mut self, ops: impl IntoIterator<Item = Op<'a>>) -> Vec<Reply> {
        ops.into_iter().map(|op| self.execute(op)).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn engine(log_capacity: usize) -> Engine {
        Engine::new(EngineConfig {
            num_buckets: 64,
            log_capacity,
            max_value_len: 32,
        })
        .unwrap()
    }

    /// Keys sharing one bucket field but with distinct tags.
    fn colliding_key(tag: u128) -> Key {
        Key::from_raw((tag << 32) | 5)
    }

    #[test]
    fn put_then_get_round_trips() {
        let mut engine = engine(1 << 12);
        let key = Key::from_seed(1);

        assert_eq!(engine.put(key, b"a value"), Reply::Empty);
        assert_eq!(engine.get(key), Reply::Value(b"a value".to_vec()));
    }

    #[test]
    fn get_of_absent_key_is_empty_not_an_error() {
        let mut engine = engine(1 << 12);
        assert_eq!(engine.get(Key::from_seed(404)), Reply::Empty);
    }

    #[test]
    fn latest_put_wins() {
        let mut engine = engine(1 << 12);
        let key = Key::from_seed(2);
        engine.put(key, b"old");
        engine.put(key, b"new");
        assert_eq!(engine.get(key), Reply::Value(b"new".to_vec()));
    }

    #[test]
    fn empty_and_maximum_values_are_legal() {
        let mut engine = engine(1 << 12);
        let empty = Key::from_seed(3);
        let full = Key::from_seed(4);

        assert_eq!(engine.put(empty, b""), Reply::Empty);
        assert_eq!(engine.get(empty), Reply::Value(vec![]));

        assert_eq!(engine.put(full, &[7; 32]), Reply::Empty);
        assert_eq!(engine.get(full), Reply::Value(vec![7; 32]));
    }

    #[test]
    fn oversize_put_is_rejected_and_mutates_nothing() {
        let mut engine = engine(1 << 12);
        let key = Key::from_seed(5);
        engine.put(key, b"kept");

        assert_eq!(engine.put(key, &[0; 33]), Reply::Rejected);
        assert_eq!(engine.get(key), Reply::Value(b"kept".to_vec()));
    }

    #[test]
    fn bucket_collisions_resolve_by_tag() {
        let mut engine = engine(1 << 12);
        engine.put(colliding_key(1), b"one");
        engine.put(colliding_key(2), b"two");

        assert_eq!(engine.get(colliding_key(1)), Reply::Value(b"one".to_vec()));
        assert_eq!(engine.get(colliding_key(2)), Reply::Value(b"two".to_vec()));
    }

    #[test]
    fn lapped_entries_read_as_missing() {
        // A 128-byte log holding 17-byte records: eight fit, the ninth
        // laps the first.
        let mut engine = Engine::new(EngineConfig {
            num_buckets: 64,
            log_capacity: 128,
            max_value_len: 32,
        })
        .unwrap();

        let keys: Vec<Key> = (0..9).map(Key::from_seed).collect();
        for key in &keys {
            engine.put(*key, &key.to_bytes());
        }

        assert_eq!(engine.get(keys[0]), Reply::Empty);
        assert_eq!(
            engine.get(keys[8]),
            Reply::Value(keys[8].to_bytes().to_vec())
        );
    }

    #[test]
    fn batch_replies_preserve_order() {
        let mut engine = engine(1 << 12);
        let (a, b) = (Key::from_seed(10), Key::from_seed(11));

        let replies = engine.execute_batch([
            Op { kind: OpKind::Put, key: a, value: b"first" },
            Op { kind: OpKind::Get, key: b, value: b"" },
            Op { kind: OpKind::Get, key: a, value: b"" },
            Op { kind: OpKind::Put, key: b, value: &[0; 40] },
        ]);

        assert_eq!(
            replies,
            vec![
                Reply::Empty,
                Reply::Empty,
                Reply::Value(b"first".to_vec()),
                Reply::Rejected,
            ]
        );
    }

    #[test]
    fn config_validation() {
        let ok = EngineConfig {
            num_buckets: 16,
            log_capacity: 1 << 10,
            max_value_len: 32,
        };
        assert!(Engine::new(ok).is_ok());

        assert_eq!(
            Engine::new(EngineConfig { num_buckets: 12, ..ok }).unwrap_err(),
            Error::Buckets(12)
        );
        assert_eq!(
            Engine::new(EngineConfig { log_capacity: 1000, ..ok }).unwrap_err(),
            Error::LogCapacity(1000)
        );
        assert_eq!(
            Engine::new(EngineConfig { max_value_len: 0, ..ok }).unwrap_err(),
            Error::MaxValueLen(0)
        );
        assert_eq!(
            Engine::new(EngineConfig { log_capacity: 64, max_value_len: 255, ..ok }).unwrap_err(),
            Error::LogTooSmall { capacity: 64, record: 256 }
        );
    }
}
