//! PUSH ストリームのスロット管理

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tfp_schema::{Delivery, StreamSpec};
use tfp_session::PushStream;
use tfp_transport::{Chunk, ChunkOutcome, StreamError};
use tracing::{debug, trace};

/// コールバックの識別子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct StreamKey {
    pub uid: u32,
    pub function_id: u8,
}

impl StreamKey {
    pub fn new(uid: u32, function_id: u8) -> Self {
        StreamKey { uid, function_id }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// function ID に PUSH ストリームが登録されていない
    #[error("no push stream registered for function id {function_id}")]
    UnknownStream { function_id: u8 },
    /// PULL の仕様を PUSH スロットに登録しようとした
    #[error("stream `{stream}` is not delivered by callback")]
    NotPush { stream: String },
    #[error("function id {function_id} is already registered")]
    AlreadyRegistered { function_id: u8 },
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// 統計情報
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub slots: usize,
    pub chunks_fed: u64,
    pub values_completed: u64,
    pub errors: u64,
}

/// (UID, function ID) ごとの PUSH ストリーム
///
/// 仕様は function ID ごとに登録し、スロットは最初のチャンクが
/// 届いたときに作る。
pub struct StreamRegistry<T> {
    specs: RwLock<HashMap<u8, StreamSpec>>,
    slots: RwLock<HashMap<StreamKey, Arc<PushStream<T>>>>,
    chunks_fed: AtomicU64,
    values_completed: AtomicU64,
    errors: AtomicU64,
}

impl<T: Copy + Send> StreamRegistry<T> {
    pub fn new() -> Self {
        StreamRegistry {
            specs: RwLock::new(HashMap::new()),
            slots: RwLock::new(HashMap::new()),
            chunks_fed: AtomicU64::new(0),
            values_completed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// コールバックの function ID に PUSH ストリームの仕様を登録する
    pub fn register(&self, function_id: u8, spec: StreamSpec) -> Result<(), RegistryError> {
        if spec.delivery() != Delivery::Push {
            return Err(RegistryError::NotPush { stream: spec.name().to_owned() });
        }
        let mut specs = self.specs.write();
        if specs.contains_key(&function_id) {
            return Err(RegistryError::AlreadyRegistered { function_id });
        }
        debug!(function_id, stream = spec.name(), "push stream registered");
        specs.insert(function_id, spec);
        Ok(())
    }

    /// スロットを取り出す。なければ作る
    pub fn stream(&self, key: StreamKey) -> Result<Arc<PushStream<T>>, RegistryError> {
        if let Some(slot) = self.slots.read().get(&key) {
            return Ok(Arc::clone(slot));
        }
        let spec = self
            .specs
            .read()
            .get(&key.function_id)
            .cloned()
            .ok_or(RegistryError::UnknownStream { function_id: key.function_id })?;

        let mut slots = self.slots.write();
        let slot = slots.entry(key).or_insert_with(|| {
            trace!(uid = key.uid, function_id = key.function_id, "push slot created");
            Arc::new(PushStream::new(spec))
        });
        Ok(Arc::clone(slot))
    }

    /// ディスパッチスレッドから届いたチャンクを該当スロットに流す
    pub fn feed(&self, key: StreamKey, chunk: &Chunk<T>) -> Result<ChunkOutcome<T>, RegistryError> {
        let slot = self.stream(key)?;
        self.chunks_fed.fetch_add(1, Ordering::Relaxed);
        match slot.feed(chunk) {
            Ok(outcome) => {
                if matches!(outcome, ChunkOutcome::Complete(_)) {
                    self.values_completed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(outcome)
            }
            Err(err) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                Err(err.into())
            }
        }
    }

    /// デバイスのスロットをすべて取り除く。受信途中の値は取り消す
    pub fn remove_device(&self, uid: u32) -> usize {
        let removed: Vec<_> = {
            let mut slots = self.slots.write();
            let keys: Vec<_> = slots.keys().filter(|k| k.uid == uid).copied().collect();
            keys.into_iter().filter_map(|k| slots.remove(&k)).collect()
        };
        for slot in &removed {
            slot.abandon();
        }
        debug!(uid, slots = removed.len(), "device removed");
        removed.len()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            slots: self.len(),
            chunks_fed: self.chunks_fed.load(Ordering::Relaxed),
            values_completed: self.values_completed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

impl<T: Copy + Send> Default for StreamRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;
    use tfp_schema::Direction;
    use tfp_transport::fragment;

    fn push_spec(name: &str, cap: u32) -> StreamSpec {
        StreamSpec::builder(name, Direction::Out, cap)
            .delivery(Delivery::Push)
            .max_length(u16::MAX as u32)
            .build()
            .unwrap()
    }

    #[test]
    fn test_unknown_stream() {
        let registry = StreamRegistry::<u8>::new();
        let result = registry.feed(StreamKey::new(1, 40), &Chunk::new(0, vec![0]));
        assert_eq!(result, Err(RegistryError::UnknownStream { function_id: 40 }));
    }

    #[test]
    fn test_pull_spec_rejected() {
        let registry = StreamRegistry::<u8>::new();
        let spec = StreamSpec::builder("Data", Direction::Out, 10).build().unwrap();
        assert!(matches!(registry.register(40, spec), Err(RegistryError::NotPush { .. })));
    }

    #[test]
    fn test_duplicate_registration() {
        let registry = StreamRegistry::<u8>::new();
        registry.register(40, push_spec("A", 10)).unwrap();
        assert_eq!(
            registry.register(40, push_spec("B", 10)),
            Err(RegistryError::AlreadyRegistered { function_id: 40 })
        );
    }

    #[test]
    fn test_slots_are_independent_per_device() {
        let registry = StreamRegistry::<u8>::new();
        let spec = push_spec("Message", 10);
        registry.register(40, spec.clone()).unwrap();

        let a: Vec<u8> = (0..25).collect();
        let b: Vec<u8> = (100..115).collect();
        let mut chunks_a = fragment(&spec, &a);
        let mut chunks_b = fragment(&spec, &b);

        // 2 台のデバイスのチャンクが交互に届く
        let key_a = StreamKey::new(0x1a2b, 40);
        let key_b = StreamKey::new(0x3c4d, 40);
        registry.feed(key_a, &chunks_a.next().unwrap()).unwrap();
        registry.feed(key_b, &chunks_b.next().unwrap()).unwrap();
        registry.feed(key_a, &chunks_a.next().unwrap()).unwrap();
        let done_b = registry.feed(key_b, &chunks_b.next().unwrap()).unwrap();
        let done_a = registry.feed(key_a, &chunks_a.next().unwrap()).unwrap();

        assert_eq!(done_a, ChunkOutcome::Complete(a));
        assert_eq!(done_b, ChunkOutcome::Complete(b));
        assert_eq!(registry.len(), 2);
        let stats = registry.stats();
        assert_eq!(stats.chunks_fed, 5);
        assert_eq!(stats.values_completed, 2);
    }

    #[test]
    fn test_desync_counts_error() {
        let registry = StreamRegistry::<u8>::new();
        registry.register(40, push_spec("Message", 10)).unwrap();
        let key = StreamKey::new(1, 40);
        registry.feed(key, &Chunk::new(0, vec![0; 10]).with_total_length(30)).unwrap();
        let result = registry.feed(key, &Chunk::new(20, vec![0; 10]).with_total_length(30));
        assert_eq!(result, Err(RegistryError::Stream(StreamError::Desync { expected: 10, actual: 20 })));
        assert_eq!(registry.stats().errors, 1);
    }

    #[test]
    fn test_remove_device_cancels_waiters() {
        let registry = Arc::new(StreamRegistry::<u8>::new());
        registry.register(40, push_spec("Message", 10)).unwrap();
        let key = StreamKey::new(7, 40);
        registry.feed(key, &Chunk::new(0, vec![0; 10]).with_total_length(30)).unwrap();

        let slot = registry.stream(key).unwrap();
        let waiting = Arc::clone(&slot);
        let waiter = thread::spawn(move || waiting.wait_value(Duration::from_secs(5)));
        while slot.waiter_count() == 0 {
            thread::yield_now();
        }
        assert_eq!(registry.remove_device(7), 1);
        assert!(registry.is_empty());
        assert_eq!(waiter.join().unwrap(), Err(StreamError::Cancelled));
    }
}
