//! PUSH ストリーム
//!
//! デバイスのコールバックはディスパッチスレッドから届き、値を待つ側は
//! 別のスレッドにいる。再組み立ての読み出し・適用・書き戻しと、購読者への
//! 状態遷移の送信は 1 つのロックの中で行う。待機者への値はロックを外してから送る。

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tfp_schema::StreamSpec;
use tfp_transport::{Chunk, ChunkOutcome, Reassembler, SessionState, StreamError, TimeoutCause, Transition};
use tracing::trace;

/// PUSH ストリームで揃った値
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received<T> {
    pub value: Vec<T>,
    /// 最後のコールバックの役割を持たない要素（`Chunk::extras`）
    pub extras: Vec<u8>,
}

type Waiter<T> = Sender<Result<Received<T>, StreamError>>;

struct Inner<T> {
    reassembler: Reassembler<T>,
    waiters: Vec<(u64, Waiter<T>)>,
    next_waiter: u64,
    subscribers: Vec<Sender<Transition>>,
}

impl<T> Inner<T> {
    /// 受信側が破棄された購読者は取り除く
    fn notify(&mut self, transitions: &[Transition]) {
        if transitions.is_empty() {
            return;
        }
        self.subscribers
            .retain(|tx| transitions.iter().all(|t| tx.send(*t).is_ok()));
    }
}

/// 1 本の PUSH ストリームの受信口
///
/// `Arc` で共有して使う。
pub struct PushStream<T> {
    inner: Mutex<Inner<T>>,
}

impl<T: Copy + Send> PushStream<T> {
    pub fn new(spec: StreamSpec) -> Self {
        PushStream {
            inner: Mutex::new(Inner {
                reassembler: Reassembler::new(spec),
                waiters: Vec::new(),
                next_waiter: 0,
                subscribers: Vec::new(),
            }),
        }
    }

    /// コールバックのチャンクを 1 つ適用する
    ///
    /// 値が揃ったか、セッションが ABANDONED になったとき、待機中の
    /// `wait_value` をすべて解放する。途中で始め直した（オフセット 0 の
    /// チャンクが来た）場合、旧セッションの待機者は `Desync` を受け取る。
    ///
    /// 複数のスレッドから呼んでもよい。購読者には遷移の起きた順に届く。
    pub fn feed(&self, chunk: &Chunk<T>) -> Result<ChunkOutcome<T>, StreamError> {
        let (result, release, waiters) = {
            let mut inner = self.inner.lock();
            let before = inner.reassembler.session().next_offset();
            let result = inner.reassembler.accept(chunk);
            let transitions = inner.reassembler.drain_transitions();

            let release = match &result {
                Ok(ChunkOutcome::Complete(value)) => Some(Ok(Received {
                    value: value.clone(),
                    extras: inner.reassembler.take_completed_extras(),
                })),
                Err(err) => Some(Err(err.clone())),
                Ok(_) if transitions.iter().any(|t| t.state == SessionState::Abandoned) => {
                    Some(Err(StreamError::Desync { expected: before, actual: chunk.offset }))
                }
                Ok(_) => None,
            };
            inner.notify(&transitions);
            let waiters = if release.is_some() { std::mem::take(&mut inner.waiters) } else { Vec::new() };
            (result, release, waiters)
        };

        if let Some(release) = release {
            trace!(waiters = waiters.len(), ok = release.is_ok(), "releasing waiters");
            for (_, waiter) in waiters {
                let _ = waiter.send(release.clone());
            }
        }
        result
    }

    /// 次に揃う値を待つ
    ///
    /// # エラー
    /// - `timeout` 以内に揃わない: `Timeout(PerStream)`
    /// - 待っている間にセッションが ABANDONED になった: そのエラー
    pub fn wait_value(&self, timeout: Duration) -> Result<Vec<T>, StreamError> {
        self.wait_received(timeout).map(|received| received.value)
    }

    /// `wait_value` と同じ。最後のコールバックの `extras` も返す
    pub fn wait_received(&self, timeout: Duration) -> Result<Received<T>, StreamError> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_waiter;
            inner.next_waiter += 1;
            inner.waiters.push((id, tx));
            id
        };
        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                let registered = {
                    let mut inner = self.inner.lock();
                    let before = inner.waiters.len();
                    inner.waiters.retain(|(waiter, _)| *waiter != id);
                    inner.waiters.len() != before
                };
                if registered {
                    Err(StreamError::Timeout(TimeoutCause::PerStream))
                } else {
                    // 期限と同時に解放された。送られてくる結果を受け取る
                    rx.recv().unwrap_or(Err(StreamError::Disconnected))
                }
            }
            Err(RecvTimeoutError::Disconnected) => Err(StreamError::Disconnected),
        }
    }

    /// 状態遷移の通知を受け取る
    pub fn subscribe(&self) -> Receiver<Transition> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.inner.lock().subscribers.push(tx);
        rx
    }

    /// 受信中のセッションを取り消す。待機者は `Cancelled` を受け取る
    pub fn abandon(&self) -> Vec<T> {
        let (partial, waiters) = {
            let mut inner = self.inner.lock();
            let partial = inner.reassembler.abandon();
            let transitions = inner.reassembler.drain_transitions();
            inner.notify(&transitions);
            (partial, std::mem::take(&mut inner.waiters))
        };
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(StreamError::Cancelled));
        }
        partial
    }

    /// `wait_value` で待っている数
    pub fn waiter_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    pub fn session_state(&self) -> SessionState {
        self.inner.lock().reassembler.session().state()
    }

    pub fn next_offset(&self) -> u32 {
        self.inner.lock().reassembler.session().next_offset()
    }

    pub fn spec(&self) -> StreamSpec {
        self.inner.lock().reassembler.spec().clone()
    }
}
