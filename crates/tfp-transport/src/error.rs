//! tfp-transport エラー型

/// タイムアウトの原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutCause {
    /// 1 チャンクの応答が来なかった
    PerChunk,
    /// ストリーム全体の制限時間を超えた
    PerStream,
    /// 要求チャンク数の上限に達しても完了しなかった
    ChunkLimit { limit: u32 },
}

impl core::fmt::Display for TimeoutCause {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TimeoutCause::PerChunk => write!(f, "no chunk arrived in time"),
            TimeoutCause::PerStream => write!(f, "stream deadline exceeded"),
            TimeoutCause::ChunkLimit { limit } => write!(f, "not complete after {limit} chunks"),
        }
    }
}

/// ストリーム転送のエラー
///
/// どれも終端エラーで、発生したセッションは ABANDONED になる。
/// エンジンはこれらを自動で再試行しない。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// 期待したオフセットと違うチャンクが届いた
    #[error("stream out of sync: expected offset {expected}, got {actual}")]
    Desync { expected: u32, actual: u32 },
    /// 転送の途中で total_length が変わった
    #[error("stream out of sync: total length changed from {expected} to {actual}")]
    LengthChanged { expected: u32, actual: u32 },
    #[error("stream timed out: {0}")]
    Timeout(TimeoutCause),
    /// short write で進捗 0 の応答が続いた
    #[error("stream stalled at offset {offset} after {attempts} zero-progress writes")]
    Stalled { offset: u32, attempts: u32 },
    /// チャンクの内容が仕様と矛盾する
    #[error("malformed chunk: {0}")]
    Malformed(&'static str),
    /// 値の長さが仕様の範囲外
    #[error("invalid stream length {length}, limit is {max}")]
    InvalidLength { length: u64, max: u32 },
    #[error("stream transfer cancelled")]
    Cancelled,
    /// トランスポートが閉じられた
    #[error("transport disconnected")]
    Disconnected,
}

impl StreamError {
    /// 同期ずれ系のエラーか
    pub fn is_desync(&self) -> bool {
        matches!(self, StreamError::Desync { .. } | StreamError::LengthChanged { .. })
    }
}
