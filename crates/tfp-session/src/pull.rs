//! PULL 読み出し
//!
//! ホストが低レベル関数をチャンクごとに呼び出し、応答を再組み立てする。
//!
//! ```text
//! request(offset 0)  ──▶  Chunk { offset: 0,  total_length: 64 }   → IN_PROGRESS
//! request(offset 30) ──▶  Chunk { offset: 30, total_length: 64 }
//! request(offset 60) ──▶  Chunk { offset: 60, total_length: 64 }   → COMPLETE
//! ```
//!
//! 要求の上限回数は解決した長さに必要なチャンク数。進まないデバイスに
//! 対しても、必ず有限回の要求で終わる。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tfp_schema::StreamSpec;
use tfp_transport::{Chunk, ChunkOutcome, Reassembler, SessionId, SessionState, StreamError, TimeoutCause};
use tracing::{debug, warn};

use crate::config::{DesyncPolicy, TransferConfig};
use crate::transport::{ChunkRequest, ChunkTransport};

/// 転送のキャンセル要求
///
/// 複製は同じフラグを共有する。ドライバーはチャンクの要求・送信の
/// 合間にこのフラグを確認する。
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// 読み出しに成功した値
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed<T> {
    pub value: Vec<T>,
    /// 発行した要求の数
    pub requests: u32,
    pub session: SessionId,
    /// 最後の応答の役割を持たない要素（`Chunk::extras`）
    pub extras: Vec<u8>,
}

/// 失敗した転送
///
/// 受信途中の要素列は診断用に `partial` に残す。成功値として扱ってはならない。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFailure<T> {
    pub error: StreamError,
    pub partial: Vec<T>,
}

impl<T> core::fmt::Display for TransferFailure<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} ({} elements received)", self.error, self.partial.len())
    }
}

impl<T: core::fmt::Debug> std::error::Error for TransferFailure<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// PULL ストリームの読み出しドライバー
pub struct PullReader<T> {
    reassembler: Reassembler<T>,
    config: TransferConfig,
    cancel: CancelToken,
}

impl<T: Copy> PullReader<T> {
    pub fn new(spec: StreamSpec, config: TransferConfig) -> Self {
        PullReader {
            reassembler: Reassembler::new(spec),
            config,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn spec(&self) -> &StreamSpec {
        self.reassembler.spec()
    }

    /// 値を 1 つ読み出す
    ///
    /// 毎回新しいセッションから始める。終端エラーのとき、それ以上の要求は
    /// 発行しない（`DesyncPolicy::Drain` の読み捨てを除く）。
    pub fn read<X: ChunkTransport<T>>(&mut self, transport: &mut X) -> Result<Completed<T>, TransferFailure<T>> {
        if self.reassembler.session().state() != SessionState::AwaitingFirst {
            self.reassembler.abandon();
        }
        self.reassembler.drain_transitions();

        let deadline = self.config.stream_timeout().map(|timeout| Instant::now() + timeout);
        let session = self.reassembler.session().id();
        let mut requests = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                debug!(stream = self.spec().name(), %session, "read cancelled");
                return Err(self.fail(StreamError::Cancelled));
            }

            let limit = self.chunk_limit();
            if requests >= limit {
                warn!(stream = self.spec().name(), %session, limit, "chunk limit reached");
                return Err(self.fail(StreamError::Timeout(TimeoutCause::ChunkLimit { limit })));
            }

            let (timeout, bounded_by_stream) = match self.request_timeout(deadline) {
                Some(t) => t,
                None => return Err(self.fail(StreamError::Timeout(TimeoutCause::PerStream))),
            };

            let request = ChunkRequest { offset: self.reassembler.session().next_offset(), index: requests };
            requests += 1;

            let chunk = match transport.request_chunk(&request, timeout) {
                Ok(chunk) => chunk,
                Err(StreamError::Timeout(TimeoutCause::PerChunk)) if bounded_by_stream => {
                    return Err(self.fail(StreamError::Timeout(TimeoutCause::PerStream)));
                }
                Err(err) => {
                    warn!(stream = self.spec().name(), %session, offset = request.offset, error = %err, "chunk request failed");
                    return Err(self.fail(err));
                }
            };

            match self.reassembler.accept(&chunk) {
                Ok(ChunkOutcome::Complete(value)) => {
                    self.reassembler.drain_transitions();
                    let extras = self.reassembler.take_completed_extras();
                    return Ok(Completed { value, requests, session, extras });
                }
                Ok(ChunkOutcome::Progress { .. }) | Ok(ChunkOutcome::Ignored) => {}
                Err(err) => {
                    let broken = self.reassembler.take_last_abandoned();
                    let expected = broken
                        .as_ref()
                        .and_then(|s| s.expected_length())
                        .or(chunk.total_length)
                        .or(self.spec().fixed_length());
                    if err.is_desync() && self.config.desync_policy == DesyncPolicy::Drain {
                        if let Some(expected) = expected {
                            self.drain(transport, &chunk, expected, requests, deadline);
                        }
                    }
                    self.reassembler.drain_transitions();
                    let partial = broken.map(|s| s.buffer().to_vec()).unwrap_or_default();
                    return Err(TransferFailure { error: err, partial });
                }
            }
        }
    }

    /// 同期ずれしたデバイス側ストリームを最後まで読み捨てる
    fn drain<X: ChunkTransport<T>>(
        &mut self,
        transport: &mut X,
        last: &Chunk<T>,
        expected: u32,
        mut index: u32,
        deadline: Option<Instant>,
    ) {
        let cap = self.spec().chunk_capacity();
        let limit = self.spec().chunks_needed(expected);
        let mut offset = last.offset;
        let mut drained = 0u32;

        while offset.saturating_add(cap) < expected && drained < limit {
            if self.cancel.is_cancelled() {
                break;
            }
            let Some((timeout, _)) = self.request_timeout(deadline) else {
                break;
            };
            let request = ChunkRequest { offset: offset.saturating_add(cap), index };
            match transport.request_chunk(&request, timeout) {
                Ok(chunk) => offset = chunk.offset,
                Err(_) => break,
            }
            index += 1;
            drained += 1;
        }
        debug!(stream = self.spec().name(), drained, offset, "drained desynchronized stream");
    }

    fn chunk_limit(&self) -> u32 {
        self.config.chunk_limit(self.spec(), self.reassembler.session().expected_length())
    }

    /// 次の要求のタイムアウトと、それがストリームの期限で削られたか
    fn request_timeout(&self, deadline: Option<Instant>) -> Option<(Duration, bool)> {
        let per_chunk = self.config.chunk_timeout();
        match deadline {
            None => Some((per_chunk, false)),
            Some(deadline) => {
                let left = deadline.checked_duration_since(Instant::now())?;
                if left.is_zero() {
                    None
                } else if left < per_chunk {
                    Some((left, true))
                } else {
                    Some((per_chunk, false))
                }
            }
        }
    }

    fn fail(&mut self, error: StreamError) -> TransferFailure<T> {
        let partial = self.reassembler.abandon();
        self.reassembler.drain_transitions();
        TransferFailure { error, partial }
    }
}
