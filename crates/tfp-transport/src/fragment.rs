//! 値をチャンク列に分割する
//!
//! `fragment` は入力だけで決まる純粋関数で、遅延評価のイテレータを返す。
//! 要素はチャンクへコピーされるので、呼び出し側のバッファは各チャンクの
//! 生成後すぐに解放・変更してよい。同じ入力からは常に同じ列が得られ、
//! `Clone` すれば先頭からやり直せる。

use tfp_schema::{LengthKind, StreamSpec};
use tracing::trace;

use crate::chunk::Chunk;

/// `fragment` が返すチャンク列
#[derive(Debug, Clone)]
pub struct Fragments<'a, T> {
    spec: &'a StreamSpec,
    values: &'a [T],
    /// 次に生成するチャンクの先頭要素オフセット
    next: usize,
    /// 残りのチャンク数
    remaining: usize,
}

/// 値をチャンク列に分割する
///
/// 生成されるチャンク数は `spec.chunks_needed(len)`。空の値でも長さを
/// 通知するためにチャンクを 1 つ生成する。
/// `spec.pads_final_chunk()` のとき末尾チャンクは `T::default()` で
/// chunk_capacity まで埋める。
///
/// 長さの妥当性は検証しない。送信前に `StreamSpec::accepts_length` で確認する。
pub fn fragment<'a, T: Copy + Default>(spec: &'a StreamSpec, values: &'a [T]) -> Fragments<'a, T> {
    Fragments::new(spec, values, 0)
}

/// 要素オフセット `offset` から始まるチャンクを 1 つだけ生成する
///
/// `offset` が値の末尾以降なら `None`（空の値の offset 0 は除く）。
pub fn fragment_at<T: Copy + Default>(spec: &StreamSpec, values: &[T], offset: u32) -> Option<Chunk<T>> {
    Fragments::new(spec, values, offset as usize).next()
}

impl<'a, T: Copy + Default> Fragments<'a, T> {
    fn new(spec: &'a StreamSpec, values: &'a [T], start: usize) -> Self {
        let cap = spec.chunk_capacity() as usize;
        let start = start.min(values.len());
        let remaining = if start == 0 {
            spec.chunks_needed(saturating_u32(values.len())) as usize
        } else if spec.is_single_chunk() {
            0
        } else {
            (values.len() - start).div_ceil(cap)
        };
        trace!(stream = spec.name(), offset = start, chunks = remaining, "fragmenting value");
        Fragments { spec, values, next: start, remaining }
    }

    /// 同じ値を要素オフセット `offset` から分割し直す
    ///
    /// short write の応答で受け付けられた位置から送り直すときに使う。
    pub fn starting_at(self, offset: u32) -> Self {
        Fragments::new(self.spec, self.values, offset as usize)
    }

    /// 次に生成するチャンクのオフセット
    pub fn offset(&self) -> u32 {
        saturating_u32(self.next)
    }
}

impl<T: Copy + Default> Iterator for Fragments<'_, T> {
    type Item = Chunk<T>;

    fn next(&mut self) -> Option<Chunk<T>> {
        if self.remaining == 0 {
            return None;
        }
        let cap = self.spec.chunk_capacity() as usize;
        let end = self.values.len().min(self.next + cap);

        let mut payload = Vec::with_capacity(if self.spec.pads_final_chunk() { cap } else { end - self.next });
        payload.extend_from_slice(&self.values[self.next..end]);
        if self.spec.pads_final_chunk() {
            payload.resize(cap, T::default());
        }

        let mut chunk = Chunk::new(saturating_u32(self.next), payload);
        if self.spec.length_kind() == LengthKind::Variable {
            chunk.total_length = Some(saturating_u32(self.values.len()));
        }

        self.next = end;
        self.remaining -= 1;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<T: Copy + Default> ExactSizeIterator for Fragments<'_, T> {}

fn saturating_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}
