//! IN ストリームの書き込みと short write のフロー制御
//!
//! short write 対応のストリームでは、デバイスが 1 チャンクのうち何要素を
//! 受け付けたか（stream_chunk_written）を返す。次のチャンクは
//! `offset + written` から値を切り直して作る。
//!
//! ```text
//! len 100, chunk_capacity 10, 応答が常に written 4 の場合:
//!   submit(offset 0, 10 要素)  → written 4
//!   submit(offset 4, 10 要素)  → written 4
//!   ...
//!   submit(offset 96, 4 要素)  → written 4   → 完了（25 回）
//! ```

use std::borrow::Cow;
use std::time::Instant;

use tfp_schema::StreamSpec;
use tfp_transport::{fragment_at, Chunk, StreamError, TimeoutCause};
use tracing::{debug, trace, warn};

use crate::config::TransferConfig;
use crate::pull::CancelToken;
use crate::transport::{ChunkSink, WriteAck};

/// `WriteCursor::acknowledge` の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// まだ送るチャンクがある
    Continue,
    /// 全要素を送り終えた（single-chunk の short write では 1 回の送信で終わる）
    Done,
}

/// 書き込みの進行状態（I/O なし）
///
/// `next_chunk` で送るチャンクを取り出し、デバイスの応答を
/// `acknowledge` に渡す、を `Done` まで繰り返す。
/// 仕様と値は借用しても所有してもよい（`WriteCursor::owned`）。
#[derive(Debug, Clone)]
pub struct WriteCursor<'a, T: Clone> {
    spec: Cow<'a, StreamSpec>,
    values: Cow<'a, [T]>,
    offset: u32,
    /// 送信中のチャンクが運ぶ実要素数（パディングを除く）
    in_flight: Option<u32>,
    zero_progress: u32,
    max_zero_progress: u32,
    submissions: u32,
    done: bool,
    extras: Vec<u8>,
}

impl<'a, T: Copy + Default> WriteCursor<'a, T> {
    /// # エラー
    /// 値の長さをこのストリームで送れない場合は `StreamError::InvalidLength`。
    /// 何も送信しない。
    pub fn new(spec: &'a StreamSpec, values: &'a [T], max_zero_progress: u32) -> Result<Self, StreamError> {
        Self::from_cow(Cow::Borrowed(spec), Cow::Borrowed(values), max_zero_progress)
    }

    /// 仕様と値を所有するカーソル
    pub fn owned(spec: StreamSpec, values: Vec<T>, max_zero_progress: u32) -> Result<WriteCursor<'static, T>, StreamError>
    where
        T: 'static,
    {
        WriteCursor::from_cow(Cow::Owned(spec), Cow::Owned(values), max_zero_progress)
    }

    fn from_cow(spec: Cow<'a, StreamSpec>, values: Cow<'a, [T]>, max_zero_progress: u32) -> Result<Self, StreamError> {
        if !spec.accepts_length(values.len()) {
            return Err(StreamError::InvalidLength {
                length: values.len() as u64,
                max: spec.length_limit(),
            });
        }
        Ok(WriteCursor {
            spec,
            values,
            offset: 0,
            in_flight: None,
            zero_progress: 0,
            max_zero_progress,
            submissions: 0,
            done: false,
            extras: Vec::new(),
        })
    }

    /// 次に送るチャンク。送り終えていれば `None`
    ///
    /// 応答を渡す前に再度呼ぶと同じチャンクを返す。
    pub fn next_chunk(&mut self) -> Option<Chunk<T>> {
        if self.done {
            return None;
        }
        let chunk = fragment_at(&self.spec, &self.values, self.offset)?;
        let carried = (self.values.len() - self.offset as usize).min(self.spec.chunk_capacity() as usize);
        self.in_flight = Some(carried as u32);
        Some(chunk)
    }

    /// デバイスの応答を適用する
    ///
    /// # エラー
    /// - 送信中のチャンクがない、written が送った要素数を超える: `Malformed`
    /// - 進捗 0 の応答が `max_zero_progress` 回を超えて続いた: `Stalled`
    pub fn acknowledge(&mut self, ack: WriteAck) -> Result<WriteStatus, StreamError> {
        let carried = self
            .in_flight
            .take()
            .ok_or(StreamError::Malformed("acknowledgement without a submitted chunk"))?;

        let written = if self.spec.is_short_write_capable() {
            let written = ack
                .written
                .ok_or(StreamError::Malformed("short write response carries no written count"))?;
            if written > carried {
                return Err(StreamError::Malformed("device reports more elements written than sent"));
            }
            written
        } else {
            carried
        };

        self.submissions += 1;
        self.offset += written;
        self.extras = ack.extras;
        trace!(stream = self.spec.name(), offset = self.offset, written, "chunk acknowledged");

        if self.spec.is_single_chunk() || self.offset as usize >= self.values.len() {
            self.done = true;
            return Ok(WriteStatus::Done);
        }

        if written == 0 {
            self.zero_progress += 1;
            if self.zero_progress > self.max_zero_progress {
                warn!(stream = self.spec.name(), offset = self.offset, attempts = self.zero_progress, "write stalled");
                return Err(StreamError::Stalled { offset: self.offset, attempts: self.zero_progress });
            }
        } else {
            self.zero_progress = 0;
        }
        Ok(WriteStatus::Continue)
    }

    /// デバイスが受け付けた要素数
    pub fn written(&self) -> u32 {
        self.offset
    }

    pub fn submissions(&self) -> u32 {
        self.submissions
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// 最後に受け取った応答の `WriteAck::extras`
    pub fn extras(&self) -> &[u8] {
        &self.extras
    }

    fn report(&self) -> WriteReport {
        WriteReport { written: self.offset, submissions: self.submissions, extras: self.extras.clone() }
    }

    fn failure(&self, error: StreamError) -> WriteFailure {
        WriteFailure { error, report: self.report() }
    }
}

/// 書き込みの結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReport {
    /// デバイスが受け付けた要素数
    pub written: u32,
    pub submissions: u32,
    /// 最後の応答の役割を持たない要素
    pub extras: Vec<u8>,
}

/// 失敗した書き込み
///
/// `report` はエラーまでにデバイスが受け付けた分。送信前に長さで
/// 弾かれた場合は 0 のまま。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteFailure {
    pub error: StreamError,
    pub report: WriteReport,
}

impl core::fmt::Display for WriteFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{} ({} elements written in {} submissions)",
            self.error, self.report.written, self.report.submissions
        )
    }
}

impl std::error::Error for WriteFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// IN ストリームの書き込みドライバー
pub struct StreamWriter {
    spec: StreamSpec,
    config: TransferConfig,
    cancel: CancelToken,
}

impl StreamWriter {
    pub fn new(spec: StreamSpec, config: TransferConfig) -> Self {
        StreamWriter { spec, config, cancel: CancelToken::new() }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn spec(&self) -> &StreamSpec {
        &self.spec
    }

    /// 値を書き込む
    ///
    /// single-chunk の short write では 1 回だけ送信し、受け付けられた要素数を
    /// `WriteReport::written` で返す。
    ///
    /// # エラー
    /// `WriteFailure::report` にエラーまでの進捗が入る。
    pub fn write<T, S>(&self, sink: &mut S, values: &[T]) -> Result<WriteReport, WriteFailure>
    where
        T: Copy + Default,
        S: ChunkSink<T>,
    {
        let mut cursor = WriteCursor::new(&self.spec, values, self.config.max_zero_progress).map_err(|error| {
            WriteFailure {
                error,
                report: WriteReport { written: 0, submissions: 0, extras: Vec::new() },
            }
        })?;
        let deadline = self.config.stream_timeout().map(|timeout| Instant::now() + timeout);
        let chunk_timeout = self.config.chunk_timeout();

        while let Some(chunk) = cursor.next_chunk() {
            if self.cancel.is_cancelled() {
                debug!(stream = self.spec.name(), offset = cursor.written(), "write cancelled");
                return Err(cursor.failure(StreamError::Cancelled));
            }
            if let Some(limit) = self.config.max_chunks {
                if cursor.submissions() >= limit {
                    return Err(cursor.failure(StreamError::Timeout(TimeoutCause::ChunkLimit { limit })));
                }
            }

            // ストリームの期限で削られたタイムアウトの満了は PerStream として報告する
            let (timeout, bounded_by_stream) = match deadline {
                None => (chunk_timeout, false),
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(left) if !left.is_zero() => (left.min(chunk_timeout), left < chunk_timeout),
                    _ => return Err(cursor.failure(StreamError::Timeout(TimeoutCause::PerStream))),
                },
            };

            let ack = match sink.submit_chunk(&chunk, timeout) {
                Ok(ack) => ack,
                Err(StreamError::Timeout(TimeoutCause::PerChunk)) if bounded_by_stream => {
                    warn!(stream = self.spec.name(), offset = chunk.offset, "write deadline reached");
                    return Err(cursor.failure(StreamError::Timeout(TimeoutCause::PerStream)));
                }
                Err(err) => {
                    warn!(stream = self.spec.name(), offset = chunk.offset, error = %err, "chunk submit failed");
                    return Err(cursor.failure(err));
                }
            };
            match cursor.acknowledge(ack) {
                Ok(WriteStatus::Done) => break,
                Ok(WriteStatus::Continue) => {}
                Err(err) => return Err(cursor.failure(err)),
            }
        }

        debug!(
            stream = self.spec.name(),
            written = cursor.written(),
            submissions = cursor.submissions(),
            "write complete"
        );
        Ok(cursor.report())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelSink;
    use proptest::prelude::*;
    use std::thread;
    use std::time::Duration;
    use tfp_schema::{Direction, LengthKind};

    fn short_write(cap: u32) -> StreamSpec {
        StreamSpec::builder("Message", Direction::In, cap)
            .short_write(true)
            .max_length(u16::MAX as u32)
            .build()
            .unwrap()
    }

    #[test]
    fn test_short_write_resumes_at_written_offset() {
        let spec = short_write(10);
        let values: Vec<u8> = (0..100).collect();
        let mut offsets = Vec::new();
        let mut received = Vec::new();
        let mut sink = |chunk: &Chunk<u8>, _: Duration| {
            offsets.push(chunk.offset);
            let take = 4.min(values.len() - chunk.offset as usize);
            received.extend_from_slice(&chunk.payload[..take]);
            Ok::<_, StreamError>(WriteAck::written(take as u32))
        };

        let report = StreamWriter::new(spec, TransferConfig::default()).write(&mut sink, &values).unwrap();
        assert_eq!(report, WriteReport { written: 100, submissions: 25, extras: Vec::new() });
        assert_eq!(offsets, (0..25).map(|i| i * 4).collect::<Vec<u32>>());
        assert_eq!(received, values);
    }

    #[test]
    fn test_full_writes_without_short_write() {
        let spec = StreamSpec::builder("Message", Direction::In, 30).build().unwrap();
        let values = vec![b'x'; 64];
        let mut count = 0;
        let mut sink = |_: &Chunk<u8>, _: Duration| {
            count += 1;
            Ok::<_, StreamError>(WriteAck::default())
        };
        let report = StreamWriter::new(spec, TransferConfig::default()).write(&mut sink, &values).unwrap();
        assert_eq!(report, WriteReport { written: 64, submissions: 3, extras: Vec::new() });
        assert_eq!(count, 3);
    }

    #[test]
    fn test_zero_progress_stalls() {
        let spec = short_write(10);
        let values = vec![0u8; 30];
        let mut sink = |_: &Chunk<u8>, _: Duration| Ok::<_, StreamError>(WriteAck::written(0));
        let result = StreamWriter::new(spec, TransferConfig::default()).write(&mut sink, &values);
        assert_eq!(result.unwrap_err().error, StreamError::Stalled { offset: 0, attempts: 4 });
    }

    #[test]
    fn test_zero_progress_counter_resets() {
        let spec = short_write(10);
        let values = vec![0u8; 20];
        let mut responses = [0, 0, 0, 5, 0, 0, 0, 10, 5].into_iter();
        let mut sink = |_: &Chunk<u8>, _: Duration| Ok::<_, StreamError>(WriteAck::written(responses.next().unwrap_or(0)));
        let report = StreamWriter::new(spec, TransferConfig::default()).write(&mut sink, &values).unwrap();
        assert_eq!(report.written, 20);
        assert_eq!(report.submissions, 9);
    }

    #[test]
    fn test_written_over_payload_is_malformed() {
        let spec = short_write(10);
        let values = vec![0u8; 5];
        let mut sink = |_: &Chunk<u8>, _: Duration| Ok::<_, StreamError>(WriteAck::written(6));
        let result = StreamWriter::new(spec, TransferConfig::default()).write(&mut sink, &values);
        assert!(matches!(result.unwrap_err().error, StreamError::Malformed(_)));
    }

    #[test]
    fn test_missing_written_is_malformed() {
        let spec = short_write(10);
        let mut cursor = WriteCursor::new(&spec, &[1u8, 2, 3], 3).unwrap();
        cursor.next_chunk().unwrap();
        assert!(matches!(cursor.acknowledge(WriteAck::default()), Err(StreamError::Malformed(_))));
    }

    #[test]
    fn test_acknowledge_without_chunk() {
        let spec = short_write(10);
        let mut cursor = WriteCursor::new(&spec, &[1u8], 3).unwrap();
        assert!(matches!(cursor.acknowledge(WriteAck::written(1)), Err(StreamError::Malformed(_))));
    }

    #[test]
    fn test_length_checked_before_submitting() {
        let fixed = StreamSpec::builder("Frame", Direction::In, 10)
            .length(LengthKind::Fixed(20))
            .build()
            .unwrap();
        let mut count = 0;
        let mut sink = |_: &Chunk<u8>, _: Duration| {
            count += 1;
            Ok::<_, StreamError>(WriteAck::default())
        };
        let result = StreamWriter::new(fixed, TransferConfig::default()).write(&mut sink, &[0u8; 19]);
        assert_eq!(result.unwrap_err().error, StreamError::InvalidLength { length: 19, max: 20 });
        assert_eq!(count, 0);
    }

    #[test]
    fn test_empty_value_sends_one_chunk() {
        let spec = short_write(10);
        let mut chunks = Vec::new();
        let mut sink = |chunk: &Chunk<u8>, _: Duration| {
            chunks.push(chunk.clone());
            Ok::<_, StreamError>(WriteAck::written(0))
        };
        let report = StreamWriter::new(spec, TransferConfig::default()).write(&mut sink, &[]).unwrap();
        assert_eq!(report, WriteReport { written: 0, submissions: 1, extras: Vec::new() });
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].total_length, Some(0));
    }

    #[test]
    fn test_single_chunk_short_write_submits_once() {
        let spec = StreamSpec::builder("Frame", Direction::In, 15)
            .single_chunk(true)
            .short_write(true)
            .max_length(255)
            .build()
            .unwrap();
        let mut count = 0;
        let mut sink = |_: &Chunk<u8>, _: Duration| {
            count += 1;
            Ok::<_, StreamError>(WriteAck::written(3))
        };
        let report = StreamWriter::new(spec, TransferConfig::default()).write(&mut sink, &[1u8; 8]).unwrap();
        assert_eq!(report, WriteReport { written: 3, submissions: 1, extras: Vec::new() });
        assert_eq!(count, 1);
    }

    #[test]
    fn test_write_over_channel_thread() {
        let spec = short_write(10);
        let values: Vec<u8> = (0..35).collect();
        let (mut sink, chunks, acks) = ChannelSink::<u8>::pair();
        let handle = thread::spawn(move || {
            let mut received = Vec::new();
            for chunk in chunks.iter() {
                let total = chunk.total_length.unwrap_or(0) as usize;
                let take = 7.min(total - chunk.offset as usize);
                received.extend_from_slice(&chunk.payload[..take]);
                if acks.send(WriteAck::written(take as u32)).is_err() {
                    break;
                }
                if received.len() == total {
                    break;
                }
            }
            received
        });

        let report = StreamWriter::new(spec, TransferConfig::default()).write(&mut sink, &values).unwrap();
        assert_eq!(report.written, 35);
        assert_eq!(report.submissions, 5);
        assert_eq!(handle.join().unwrap(), values);
    }

    #[test]
    fn test_owned_cursor_drives_itself() {
        let spec = short_write(10);
        let mut cursor = WriteCursor::owned(spec, vec![1u8; 12], 3).unwrap();
        let mut offsets = Vec::new();
        while let Some(chunk) = cursor.next_chunk() {
            offsets.push(chunk.offset);
            if cursor.acknowledge(WriteAck::written(6)).unwrap() == WriteStatus::Done {
                break;
            }
        }
        assert_eq!(offsets, vec![0, 6]);
        assert!(cursor.is_done());
        assert!(cursor.next_chunk().is_none());
    }

    #[test]
    fn test_write_stream_deadline() {
        let spec = short_write(10);
        let values = vec![0u8; 40];
        let mut sink = |chunk: &Chunk<u8>, timeout: Duration| {
            if chunk.offset > 0 {
                thread::sleep(timeout);
                return Err(StreamError::Timeout(TimeoutCause::PerChunk));
            }
            Ok(WriteAck::written(10))
        };
        let config = TransferConfig { stream_timeout_ms: Some(30), ..TransferConfig::default() };
        let failure = StreamWriter::new(spec, config).write(&mut sink, &values).unwrap_err();
        assert_eq!(failure.error, StreamError::Timeout(TimeoutCause::PerStream));
        assert_eq!(failure.report.written, 10);
    }

    #[test]
    fn test_chunk_timeout_without_deadline_stays_per_chunk() {
        let spec = short_write(10);
        let mut sink = |_: &Chunk<u8>, _: Duration| Err::<WriteAck, _>(StreamError::Timeout(TimeoutCause::PerChunk));
        let failure = StreamWriter::new(spec, TransferConfig::default()).write(&mut sink, &[0u8; 5]).unwrap_err();
        assert_eq!(failure.error, StreamError::Timeout(TimeoutCause::PerChunk));
    }

    #[test]
    fn test_failure_reports_progress() {
        let spec = short_write(10);
        let values = vec![0u8; 50];
        let mut calls = 0;
        let mut sink = |_: &Chunk<u8>, _: Duration| {
            calls += 1;
            if calls == 4 {
                return Err(StreamError::Disconnected);
            }
            Ok(WriteAck::written(7).with_extras(vec![calls as u8]))
        };
        let failure = StreamWriter::new(spec, TransferConfig::default()).write(&mut sink, &values).unwrap_err();
        assert_eq!(failure.error, StreamError::Disconnected);
        assert_eq!(failure.report, WriteReport { written: 21, submissions: 3, extras: vec![3] });
    }

    #[test]
    fn test_report_carries_last_extras() {
        let spec = short_write(10);
        let mut status = 0u8;
        let mut sink = |chunk: &Chunk<u8>, _: Duration| {
            status += 1;
            let take = 10.min(25 - chunk.offset);
            Ok::<_, StreamError>(WriteAck::written(take).with_extras(vec![status, 0xEE]))
        };
        let report = StreamWriter::new(spec, TransferConfig::default()).write(&mut sink, &[1u8; 25]).unwrap();
        assert_eq!(report.submissions, 3);
        assert_eq!(report.extras, vec![3, 0xEE]);
    }

    #[test]
    fn test_cancelled_write() {
        let spec = short_write(10);
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut sink = |_: &Chunk<u8>, _: Duration| Ok::<_, StreamError>(WriteAck::written(10));
        let writer = StreamWriter::new(spec, TransferConfig::default()).with_cancel_token(cancel);
        assert_eq!(writer.write(&mut sink, &[0u8; 20]).unwrap_err().error, StreamError::Cancelled);
    }

    proptest! {
        /// 毎回 1 要素以上受け付けるデバイスなら、応答の並びによらず値が順に届く
        #[test]
        fn prop_short_write_delivers_in_order(
            values in proptest::collection::vec(any::<u8>(), 0..200),
            cap in 1u32..20,
            accepts in proptest::collection::vec(1u32..20, 1..16),
        ) {
            let spec = short_write(cap);
            let mut received = Vec::new();
            let mut pattern = accepts.iter().cycle();
            let mut sink = |chunk: &Chunk<u8>, _: Duration| {
                let carried = (values.len() - chunk.offset as usize).min(cap as usize) as u32;
                let take = pattern.next().copied().unwrap_or(1).min(carried);
                received.extend_from_slice(&chunk.payload[..take as usize]);
                Ok::<_, StreamError>(WriteAck::written(take))
            };
            let report = StreamWriter::new(spec, TransferConfig::default()).write(&mut sink, &values).unwrap();
            prop_assert_eq!(report.written as usize, values.len());
            prop_assert_eq!(received, values);
        }
    }
}
