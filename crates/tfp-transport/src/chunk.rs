//! 低レベル呼び出し 1 回分のチャンク

use serde::{Deserialize, Serialize};

/// ストリームの 1 チャンク
///
/// TFP パケットの役割付き要素（stream_length / stream_chunk_offset /
/// stream_chunk_data / stream_chunk_written）を型付きで持つ。
/// バイト列へのシリアライズはこの層の外で行う。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk<T> {
    /// 先頭要素の値全体におけるオフセット（要素単位）
    pub offset: u32,
    /// 値全体の要素数。可変長ストリームでのみ使う
    pub total_length: Option<u32>,
    /// 要素列。末尾チャンクは 0 埋めされていることがある
    pub payload: Vec<T>,
    /// デバイスが受け付けた要素数（short write の応答）
    pub written: Option<u32>,
    /// 役割を持たない要素（ステータスなど）。パケットに並ぶ順のバイト列
    ///
    /// この層では解釈しない。値が揃ったときの最後のチャンクの分が
    /// 値と一緒に呼び出し側へ渡る。
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extras: Vec<u8>,
}

impl<T> Chunk<T> {
    pub fn new(offset: u32, payload: Vec<T>) -> Self {
        Chunk { offset, total_length: None, payload, written: None, extras: Vec::new() }
    }

    pub fn with_total_length(mut self, total_length: u32) -> Self {
        self.total_length = Some(total_length);
        self
    }

    pub fn with_written(mut self, written: u32) -> Self {
        self.written = Some(written);
        self
    }

    pub fn with_extras(mut self, extras: Vec<u8>) -> Self {
        self.extras = extras;
        self
    }

    /// ペイロードの要素数（パディングを含む）
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
