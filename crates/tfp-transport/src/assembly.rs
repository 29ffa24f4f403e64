//! チャンク列から値を再組み立てする
//!
//! ## セッションの状態遷移
//!
//! ```text
//!                 offset 0                  next_offset == expected
//! AWAITING_FIRST ─────────▶ IN_PROGRESS ──────────────────────────▶ COMPLETE
//!        │                    │   ▲  │
//!        │ (PULL) offset ≠ 0  │   └──┘ offset == next_offset
//!        ▼                    ▼
//!    ABANDONED ◀────────── offset ≠ next_offset / (PUSH) offset 0 で再開
//! ```
//!
//! COMPLETE / ABANDONED は終端状態。終端に達したセッションは取り除かれ、
//! 次のチャンクは新しいセッション（新しい `SessionId`）が受け取る。

use std::collections::VecDeque;
use std::mem;

use tfp_schema::{Delivery, LengthKind, StreamSpec};
use tracing::{debug, trace, warn};

use crate::chunk::Chunk;
use crate::error::StreamError;

/// 最初のチャンクで確保するバッファの上限（要素数）
///
/// total_length はデバイスから届く値なので、それだけを信じて確保しない。
const PREALLOC_LIMIT: usize = 4096;

/// ストリームセッションの識別子（1 始まりで単調増加）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl core::fmt::Display for SessionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    AwaitingFirst,
    InProgress,
    Complete,
    Abandoned,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Complete | SessionState::Abandoned)
    }
}

/// 状態遷移の通知
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub session: SessionId,
    pub state: SessionState,
}

/// 1 つの値の再組み立て状態
///
/// IN_PROGRESS の間は `next_offset == buffer.len()` かつ
/// `buffer.len() <= expected_length`。
#[derive(Debug, Clone)]
pub struct StreamSession<T> {
    id: SessionId,
    state: SessionState,
    expected_length: Option<u32>,
    buffer: Vec<T>,
    next_offset: u32,
}

impl<T> StreamSession<T> {
    fn new(id: SessionId) -> Self {
        StreamSession {
            id,
            state: SessionState::AwaitingFirst,
            expected_length: None,
            buffer: Vec::new(),
            next_offset: 0,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// 最初のチャンクを受け取るまでは `None`
    pub fn expected_length(&self) -> Option<u32> {
        self.expected_length
    }

    pub fn buffer(&self) -> &[T] {
        &self.buffer
    }

    pub fn next_offset(&self) -> u32 {
        self.next_offset
    }
}

/// `Reassembler::accept` の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome<T> {
    /// セッションを始められないチャンクだったので無視した（PUSH の途中参加）
    Ignored,
    /// 受け付けた。次に期待するオフセット
    Progress { next_offset: u32 },
    /// 値が揃った
    Complete(Vec<T>),
}

/// 1 本のストリームの再組み立てエンジン
///
/// 常に 1 つの進行中セッションを持つ。I/O もロックも持たないので、
/// 並行に使う場合は呼び出し側（tfp-session の `PushStream`）が排他する。
#[derive(Debug)]
pub struct Reassembler<T> {
    spec: StreamSpec,
    session: StreamSession<T>,
    next_id: u64,
    last_abandoned: Option<StreamSession<T>>,
    transitions: VecDeque<Transition>,
    completed_extras: Vec<u8>,
}

impl<T: Copy> Reassembler<T> {
    pub fn new(spec: StreamSpec) -> Self {
        Reassembler {
            spec,
            session: StreamSession::new(SessionId(1)),
            next_id: 2,
            last_abandoned: None,
            transitions: VecDeque::new(),
            completed_extras: Vec::new(),
        }
    }

    pub fn spec(&self) -> &StreamSpec {
        &self.spec
    }

    /// 現在のセッション（終端状態になることはない）
    pub fn session(&self) -> &StreamSession<T> {
        &self.session
    }

    /// 直近に ABANDONED になったセッション。バッファは破棄直前のまま残る
    pub fn last_abandoned(&self) -> Option<&StreamSession<T>> {
        self.last_abandoned.as_ref()
    }

    pub fn take_last_abandoned(&mut self) -> Option<StreamSession<T>> {
        self.last_abandoned.take()
    }

    /// 直近に揃った値の最後のチャンクが運んだ `Chunk::extras` を取り出す
    pub fn take_completed_extras(&mut self) -> Vec<u8> {
        mem::take(&mut self.completed_extras)
    }

    /// 溜まっている状態遷移の通知を古い順に取り出す
    pub fn drain_transitions(&mut self) -> Vec<Transition> {
        self.transitions.drain(..).collect()
    }

    /// チャンクを 1 つ適用する
    ///
    /// # エラー
    /// 終端エラーを返したとき、そのセッションは ABANDONED になっている。
    /// 次のチャンクは新しいセッションが受け取る。
    pub fn accept(&mut self, chunk: &Chunk<T>) -> Result<ChunkOutcome<T>, StreamError> {
        let outcome = self.apply(chunk);
        if let Ok(ChunkOutcome::Complete(_)) = &outcome {
            self.completed_extras = chunk.extras.clone();
        }
        outcome
    }

    fn apply(&mut self, chunk: &Chunk<T>) -> Result<ChunkOutcome<T>, StreamError> {
        match self.session.state {
            SessionState::AwaitingFirst => self.accept_first(chunk),
            SessionState::InProgress => {
                if chunk.offset == 0 && self.spec.delivery() == Delivery::Push {
                    debug!(
                        stream = self.spec.name(),
                        session = %self.session.id,
                        offset = self.session.next_offset,
                        "stream restarted at offset 0, abandoning session"
                    );
                    self.abandon_current();
                    return self.accept_first(chunk);
                }
                if chunk.offset != self.session.next_offset {
                    let expected = self.session.next_offset;
                    warn!(
                        stream = self.spec.name(),
                        session = %self.session.id,
                        expected,
                        offset = chunk.offset,
                        "stream out of sync"
                    );
                    self.abandon_current();
                    return Err(StreamError::Desync { expected, actual: chunk.offset });
                }
                if let (Some(expected), Some(actual)) = (self.session.expected_length, chunk.total_length) {
                    if self.spec.length_kind() == LengthKind::Variable && expected != actual {
                        warn!(
                            stream = self.spec.name(),
                            session = %self.session.id,
                            expected,
                            actual,
                            "total length changed mid-stream"
                        );
                        self.abandon_current();
                        return Err(StreamError::LengthChanged { expected, actual });
                    }
                }
                self.append(chunk)
            }
            // 終端状態のセッションは保持しない
            SessionState::Complete | SessionState::Abandoned => {
                self.replace_session();
                self.accept_first(chunk)
            }
        }
    }

    /// 現在のセッションを取り消す
    ///
    /// 受信途中の要素列を返す。`last_abandoned` には残さない。
    pub fn abandon(&mut self) -> Vec<T> {
        let mut old = self.replace_session();
        old.state = SessionState::Abandoned;
        self.record(old.id, SessionState::Abandoned);
        debug!(stream = self.spec.name(), session = %old.id, "session cancelled");
        mem::take(&mut old.buffer)
    }

    fn accept_first(&mut self, chunk: &Chunk<T>) -> Result<ChunkOutcome<T>, StreamError> {
        if chunk.offset != 0 {
            if self.spec.no_data_offset() == Some(chunk.offset) {
                debug!(stream = self.spec.name(), session = %self.session.id, "device reports no data");
                self.session.expected_length = Some(0);
                return Ok(ChunkOutcome::Complete(self.complete_current()));
            }
            return match self.spec.delivery() {
                Delivery::Push => {
                    trace!(stream = self.spec.name(), offset = chunk.offset, "ignoring mid-stream chunk");
                    Ok(ChunkOutcome::Ignored)
                }
                Delivery::Pull => {
                    warn!(stream = self.spec.name(), offset = chunk.offset, "first chunk not at offset 0");
                    self.abandon_current();
                    Err(StreamError::Desync { expected: 0, actual: chunk.offset })
                }
            };
        }

        let expected = match self.spec.length_kind() {
            LengthKind::Fixed(n) => n,
            LengthKind::Variable => {
                let Some(total) = chunk.total_length else {
                    self.abandon_current();
                    return Err(StreamError::Malformed("first chunk carries no total length"));
                };
                if !self.spec.accepts_length(total as usize) {
                    self.abandon_current();
                    return Err(StreamError::InvalidLength {
                        length: total as u64,
                        max: self.spec.length_limit(),
                    });
                }
                total
            }
        };

        self.session.expected_length = Some(expected);
        self.session.buffer.reserve((expected as usize).min(PREALLOC_LIMIT));
        self.session.state = SessionState::InProgress;
        self.record(self.session.id, SessionState::InProgress);
        trace!(stream = self.spec.name(), session = %self.session.id, expected, "session started");
        self.append(chunk)
    }

    fn append(&mut self, chunk: &Chunk<T>) -> Result<ChunkOutcome<T>, StreamError> {
        let expected = self.session.expected_length.unwrap_or(0);
        let remaining = (expected - self.session.next_offset) as usize;
        let take = remaining.min(self.spec.chunk_capacity() as usize).min(chunk.payload.len());

        if take == 0 && remaining > 0 {
            self.abandon_current();
            return Err(StreamError::Malformed("chunk carries no elements"));
        }

        self.session.buffer.extend_from_slice(&chunk.payload[..take]);
        self.session.next_offset += take as u32;

        if self.session.next_offset == expected {
            debug!(stream = self.spec.name(), session = %self.session.id, length = expected, "stream complete");
            Ok(ChunkOutcome::Complete(self.complete_current()))
        } else {
            Ok(ChunkOutcome::Progress { next_offset: self.session.next_offset })
        }
    }

    fn complete_current(&mut self) -> Vec<T> {
        let mut old = self.replace_session();
        old.state = SessionState::Complete;
        self.record(old.id, SessionState::Complete);
        mem::take(&mut old.buffer)
    }

    fn abandon_current(&mut self) {
        let mut old = self.replace_session();
        old.state = SessionState::Abandoned;
        self.record(old.id, SessionState::Abandoned);
        self.last_abandoned = Some(old);
    }

    /// 新しいセッションに差し替え、古いセッションを返す
    fn replace_session(&mut self) -> StreamSession<T> {
        let id = SessionId(self.next_id);
        self.next_id += 1;
        mem::replace(&mut self.session, StreamSession::new(id))
    }

    fn record(&mut self, session: SessionId, state: SessionState) {
        self.transitions.push_back(Transition { session, state });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::fragment;
    use proptest::prelude::*;
    use tfp_schema::Direction;

    const CAP: u32 = 10;

    fn spec(length: LengthKind, delivery: Delivery) -> StreamSpec {
        StreamSpec::builder("Data", Direction::Out, CAP)
            .length(length)
            .delivery(delivery)
            .max_length(u16::MAX as u32)
            .build()
            .unwrap()
    }

    fn roundtrip(spec: StreamSpec, values: &[u16]) -> Vec<u16> {
        let chunks: Vec<_> = fragment(&spec, values).collect();
        let mut reassembler = Reassembler::new(spec);
        let mut result = None;
        for chunk in &chunks {
            if let ChunkOutcome::Complete(value) = reassembler.accept(chunk).unwrap() {
                result = Some(value);
            }
        }
        result.unwrap()
    }

    #[test]
    fn test_roundtrip_all_kinds() {
        let cap = CAP as usize;
        for len in [0, 1, cap - 1, cap, cap + 1, 3 * cap] {
            let values: Vec<u16> = (0..len as u16).map(|v| v * 3 + 1).collect();
            for delivery in [Delivery::Pull, Delivery::Push] {
                for length in [LengthKind::Fixed(len as u32), LengthKind::Variable] {
                    assert_eq!(roundtrip(spec(length, delivery), &values), values, "len={len} {length:?} {delivery:?}");
                }
            }
        }
    }

    #[test]
    fn test_desync_leaves_buffer_untouched() {
        let spec = spec(LengthKind::Variable, Delivery::Pull);
        let values: Vec<u16> = (0..30).collect();
        let chunks: Vec<_> = fragment(&spec, &values).collect();
        let mut reassembler = Reassembler::new(spec);

        reassembler.accept(&chunks[0]).unwrap();
        let id = reassembler.session().id();
        let err = reassembler.accept(&chunks[2]).unwrap_err();
        assert_eq!(err, StreamError::Desync { expected: 10, actual: 20 });
        assert!(err.is_desync());

        let abandoned = reassembler.last_abandoned().unwrap();
        assert_eq!(abandoned.id(), id);
        assert_eq!(abandoned.state(), SessionState::Abandoned);
        assert_eq!(abandoned.buffer(), &values[..10]);
        assert_ne!(reassembler.session().id(), id);
        assert_eq!(reassembler.session().state(), SessionState::AwaitingFirst);
    }

    #[test]
    fn test_push_restart_on_offset_zero() {
        let spec = spec(LengthKind::Variable, Delivery::Push);
        let long: Vec<u16> = (0..40).collect();
        let mut reassembler = Reassembler::new(spec.clone());
        for chunk in fragment(&spec, &long).take(2) {
            reassembler.accept(&chunk).unwrap();
        }
        assert_eq!(reassembler.session().next_offset(), 20);
        let old = reassembler.session().id();

        let short = [9u16, 8, 7, 6, 5];
        let chunk = fragment(&spec, &short).next().unwrap();
        assert_eq!(reassembler.accept(&chunk).unwrap(), ChunkOutcome::Complete(short.to_vec()));

        let transitions = reassembler.drain_transitions();
        assert!(transitions.contains(&Transition { session: old, state: SessionState::Abandoned }));
        assert_eq!(transitions.last().map(|t| t.state), Some(SessionState::Complete));
        assert_eq!(reassembler.last_abandoned().map(|s| s.buffer().len()), Some(20));
    }

    #[test]
    fn test_pull_offset_zero_mid_stream_is_desync() {
        let spec = spec(LengthKind::Variable, Delivery::Pull);
        let values: Vec<u16> = (0..40).collect();
        let chunks: Vec<_> = fragment(&spec, &values).collect();
        let mut reassembler = Reassembler::new(spec);
        reassembler.accept(&chunks[0]).unwrap();
        assert!(matches!(
            reassembler.accept(&chunks[0]),
            Err(StreamError::Desync { expected: 10, actual: 0 })
        ));
    }

    #[test]
    fn test_push_ignores_mid_stream_join() {
        let spec = spec(LengthKind::Variable, Delivery::Push);
        let mut reassembler = Reassembler::<u16>::new(spec);
        let chunk = Chunk::new(30, vec![1; 10]).with_total_length(50);
        assert_eq!(reassembler.accept(&chunk).unwrap(), ChunkOutcome::Ignored);
        assert_eq!(reassembler.session().state(), SessionState::AwaitingFirst);
        assert!(reassembler.drain_transitions().is_empty());
    }

    #[test]
    fn test_pull_first_chunk_must_start_at_zero() {
        let spec = spec(LengthKind::Variable, Delivery::Pull);
        let mut reassembler = Reassembler::<u16>::new(spec);
        let chunk = Chunk::new(10, vec![1; 10]).with_total_length(50);
        assert_eq!(reassembler.accept(&chunk), Err(StreamError::Desync { expected: 0, actual: 10 }));
    }

    #[test]
    fn test_variable_first_chunk_needs_total_length() {
        let spec = spec(LengthKind::Variable, Delivery::Push);
        let mut reassembler = Reassembler::<u16>::new(spec);
        let chunk = Chunk::new(0, vec![1; 10]);
        assert!(matches!(reassembler.accept(&chunk), Err(StreamError::Malformed(_))));
    }

    #[test]
    fn test_total_length_over_limit() {
        let spec = StreamSpec::builder("Data", Direction::Out, CAP).max_length(100).build().unwrap();
        let mut reassembler = Reassembler::<u8>::new(spec);
        let chunk = Chunk::new(0, vec![0; 10]).with_total_length(101);
        assert_eq!(reassembler.accept(&chunk), Err(StreamError::InvalidLength { length: 101, max: 100 }));
    }

    #[test]
    fn test_total_length_changed() {
        let spec = spec(LengthKind::Variable, Delivery::Push);
        let mut reassembler = Reassembler::<u16>::new(spec);
        reassembler.accept(&Chunk::new(0, vec![1; 10]).with_total_length(30)).unwrap();
        let result = reassembler.accept(&Chunk::new(10, vec![1; 10]).with_total_length(25));
        assert_eq!(result, Err(StreamError::LengthChanged { expected: 30, actual: 25 }));
    }

    #[test]
    fn test_fixed_out_no_data_offset() {
        let spec = StreamSpec::builder("Image", Direction::Out, CAP)
            .length(LengthKind::Fixed(40))
            .max_length(0xFFFF)
            .delivery(Delivery::Push)
            .no_data_offset(Some(0xFFFF))
            .build()
            .unwrap();
        let mut reassembler = Reassembler::<u8>::new(spec);
        let outcome = reassembler.accept(&Chunk::new(0xFFFF, vec![0; 10])).unwrap();
        assert_eq!(outcome, ChunkOutcome::Complete(Vec::new()));
    }

    #[test]
    fn test_single_chunk_out() {
        let spec = StreamSpec::builder("Data", Direction::Out, 15)
            .single_chunk(true)
            .max_length(255)
            .build()
            .unwrap();
        let mut reassembler = Reassembler::<u8>::new(spec);
        let mut payload = vec![0u8; 15];
        payload[..3].copy_from_slice(&[1, 2, 3]);
        let outcome = reassembler.accept(&Chunk::new(0, payload.clone()).with_total_length(3)).unwrap();
        assert_eq!(outcome, ChunkOutcome::Complete(vec![1, 2, 3]));

        let too_long = reassembler.accept(&Chunk::new(0, payload).with_total_length(16));
        assert_eq!(too_long, Err(StreamError::InvalidLength { length: 16, max: 15 }));
    }

    #[test]
    fn test_empty_payload_mid_stream_is_malformed() {
        let spec = StreamSpec::builder("Data", Direction::Out, CAP).build().unwrap();
        let mut reassembler = Reassembler::<u8>::new(spec);
        let result = reassembler.accept(&Chunk::new(0, Vec::new()).with_total_length(5));
        assert!(matches!(result, Err(StreamError::Malformed(_))));
    }

    #[test]
    fn test_abandon_returns_partial() {
        let spec = spec(LengthKind::Variable, Delivery::Pull);
        let mut reassembler = Reassembler::<u16>::new(spec);
        reassembler.accept(&Chunk::new(0, vec![4; 10]).with_total_length(30)).unwrap();
        assert_eq!(reassembler.abandon(), vec![4; 10]);
        assert!(reassembler.last_abandoned().is_none());
        assert_eq!(reassembler.session().next_offset(), 0);
    }

    #[test]
    fn test_session_ids_increase() {
        let spec = spec(LengthKind::Fixed(1), Delivery::Push);
        let mut reassembler = Reassembler::<u16>::new(spec);
        let first = reassembler.session().id();
        reassembler.accept(&Chunk::new(0, vec![1; 10])).unwrap();
        let second = reassembler.session().id();
        assert!(second > first);
        assert_eq!(
            reassembler.drain_transitions(),
            vec![
                Transition { session: first, state: SessionState::InProgress },
                Transition { session: first, state: SessionState::Complete },
            ]
        );
    }

    #[test]
    fn test_extras_of_completing_chunk_are_kept() {
        let mut reassembler = Reassembler::new(spec(LengthKind::Variable, Delivery::Pull));
        let first = Chunk::new(0, vec![1u16; 10]).with_total_length(15).with_extras(vec![0xAA]);
        let last = Chunk::new(10, vec![2u16; 10]).with_total_length(15).with_extras(vec![0x01, 0x02]);

        reassembler.accept(&first).unwrap();
        assert!(reassembler.take_completed_extras().is_empty());
        assert!(matches!(reassembler.accept(&last).unwrap(), ChunkOutcome::Complete(_)));
        assert_eq!(reassembler.take_completed_extras(), vec![0x01, 0x02]);
        assert!(reassembler.take_completed_extras().is_empty());
    }

    proptest! {
        #[test]
        fn prop_roundtrip(
            values in proptest::collection::vec(any::<u16>(), 0..200),
            cap in 1u32..40,
            variable in any::<bool>(),
            push in any::<bool>(),
        ) {
            let length = if variable { LengthKind::Variable } else { LengthKind::Fixed(values.len() as u32) };
            let delivery = if push { Delivery::Push } else { Delivery::Pull };
            let spec = StreamSpec::builder("Data", Direction::Out, cap)
                .length(length)
                .delivery(delivery)
                .build()
                .unwrap();
            prop_assert_eq!(roundtrip(spec, &values), values);
        }
    }
}
