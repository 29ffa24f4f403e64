//! tfp-schema エラー型

/// ストリーム仕様の構築エラー
///
/// パケット定義そのものが矛盾している場合にだけ発生する。
/// 実行時ではなくバインディング生成時（ビルド時）の問題として扱う。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// chunk_capacity が 0 になった
    #[error("stream `{stream}` has zero chunk capacity")]
    ZeroChunkCapacity { stream: String },
    /// 要素幅が 0 ビット
    #[error("stream `{stream}` has zero element width")]
    ZeroElementWidth { stream: String },
    /// パケットに high_level 宣言がない
    #[error("packet `{packet}` declares no high-level stream")]
    NotAStream { packet: String },
    /// 必要な役割の要素が見つからない
    #[error("stream `{stream}` is missing its `{role}` element")]
    MissingRole { stream: String, role: &'static str },
    /// 同じ役割の要素が複数ある
    #[error("stream `{stream}` declares `{role}` more than once")]
    DuplicateRole { stream: String, role: &'static str },
    /// 役割の要素が想定と逆方向
    #[error("stream `{stream}`: `{role}` element has the wrong direction")]
    WrongDirection { stream: String, role: &'static str },
    /// 長さ・オフセット・書き込み数の要素が符号なし整数でない
    #[error("stream `{stream}`: `{role}` element must be an unsigned integer")]
    NotUnsigned { stream: String, role: &'static str },
    /// short_write は IN ストリームのみ
    #[error("stream `{stream}`: short writes are only possible on IN streams")]
    ShortWriteOnOutStream { stream: String },
    /// single_chunk と固定長は同時に指定できない
    #[error("stream `{stream}`: single-chunk streams cannot have a fixed length")]
    SingleChunkWithFixedLength { stream: String },
    /// パケット全体が TFP のペイロード上限を超える
    #[error("packet `{packet}` carries {bytes} bytes in one direction, limit is {limit}")]
    PayloadTooLarge { packet: String, bytes: usize, limit: usize },
    /// 固定長が長さフィールドで表現できない
    #[error("stream `{stream}`: fixed length {length} exceeds offset range {max}")]
    FixedLengthOutOfRange { stream: String, length: u32, max: u32 },
    /// JSON のパースに失敗
    #[error("invalid packet schema JSON: {0}")]
    Json(String),
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Json(err.to_string())
    }
}
