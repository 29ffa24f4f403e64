//! 転送設定

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tfp_schema::{ConfigError, StreamSpec};

use crate::{DEFAULT_CHUNK_TIMEOUT_MS, DEFAULT_MAX_ZERO_PROGRESS};

/// 同期ずれを検出した後の振る舞い
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesyncPolicy {
    /// それ以上チャンクを要求せずにエラーを返す
    #[default]
    Abort,
    /// デバイス側のストリームが終わるまで読み捨ててからエラーを返す
    ///
    /// 次の読み出しがオフセット 0 から同期した状態で始まる。
    Drain,
}

/// ストリーム転送の設定
///
/// JSON から読み込む場合、省略したフィールドは既定値になる。
///
/// ```json
/// { "chunk_timeout_ms": 1000, "desync_policy": "drain" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// 1 チャンクの応答待ち（ミリ秒）
    pub chunk_timeout_ms: u64,
    /// ストリーム全体の制限時間（ミリ秒）。`None` は無制限
    pub stream_timeout_ms: Option<u64>,
    /// 1 回の転送で要求・送信するチャンク数の上限。
    /// `None` のときは解決した長さに必要なチャンク数
    pub max_chunks: Option<u32>,
    /// 進捗 0 の short write 応答を続けて許す回数
    pub max_zero_progress: u32,
    pub desync_policy: DesyncPolicy,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            chunk_timeout_ms: DEFAULT_CHUNK_TIMEOUT_MS,
            stream_timeout_ms: None,
            max_chunks: None,
            max_zero_progress: DEFAULT_MAX_ZERO_PROGRESS,
            desync_policy: DesyncPolicy::Abort,
        }
    }
}

impl TransferConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }

    pub fn stream_timeout(&self) -> Option<Duration> {
        self.stream_timeout_ms.map(Duration::from_millis)
    }

    /// 1 回の読み出しで発行してよい要求の数
    ///
    /// `max_chunks` がなければ、解決した長さ `expected` に必要なチャンク数。
    /// 長さが分かるのは最初の応答からなので、それまでは 1。
    pub fn chunk_limit(&self, spec: &StreamSpec, expected: Option<u32>) -> u32 {
        match (self.max_chunks, expected) {
            (Some(limit), _) => limit,
            (None, Some(expected)) => spec.chunks_needed(expected),
            (None, None) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransferConfig::default();
        assert_eq!(config.chunk_timeout(), Duration::from_millis(2500));
        assert_eq!(config.stream_timeout(), None);
        assert_eq!(config.max_chunks, None);
        assert_eq!(config.max_zero_progress, 3);
        assert_eq!(config.desync_policy, DesyncPolicy::Abort);
    }

    #[test]
    fn test_partial_json() {
        let config = TransferConfig::from_json(r#"{"stream_timeout_ms": 10000, "desync_policy": "drain"}"#).unwrap();
        assert_eq!(config.stream_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(config.desync_policy, DesyncPolicy::Drain);
        assert_eq!(config.chunk_timeout_ms, DEFAULT_CHUNK_TIMEOUT_MS);
    }

    #[test]
    fn test_chunk_limit() {
        let spec = StreamSpec::builder("Message", tfp_schema::Direction::Out, 30).build().unwrap();
        let config = TransferConfig::default();
        assert_eq!(config.chunk_limit(&spec, None), 1);
        assert_eq!(config.chunk_limit(&spec, Some(64)), 3);
        let explicit = TransferConfig { max_chunks: Some(10), ..TransferConfig::default() };
        assert_eq!(explicit.chunk_limit(&spec, Some(64)), 10);
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            TransferConfig::from_json(r#"{"desync_policy": "retry"}"#),
            Err(ConfigError::Json(_))
        ));
    }
}
