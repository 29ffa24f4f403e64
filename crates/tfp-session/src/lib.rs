//! # tfp-session
//!
//! ストリーム転送のドライバー。
//!
//! tfp-transport の分割・再組み立て（I/O なし）に、タイムアウト・
//! キャンセル・short write の再送・PUSH の完了待ちを組み合わせる。
//!
//! ## 配送方式ごとの担当
//!
//! ```text
//! PULL (stream_out, function) : PullReader   チャンクを 1 つずつ要求して再組み立て
//! PUSH (stream_out, callback) : PushStream   ディスパッチスレッドが feed、利用側が wait_value
//! IN   (stream_in,  function) : StreamWriter WriteCursor で分割し、written を見て再送位置を決める
//! ```
//!
//! ## タイムアウト
//!
//! すべて `TransferConfig` の値を `Duration` として使う。
//! チャンク単位の既定値は TFP バインディングの応答タイムアウトと同じ 2500ms。

pub mod config;
pub mod pull;
pub mod push;
pub mod transport;
pub mod write;

pub use config::{DesyncPolicy, TransferConfig};
pub use pull::{CancelToken, Completed, PullReader, TransferFailure};
pub use push::{PushStream, Received};
pub use transport::{ChannelSink, ChannelTransport, ChunkRequest, ChunkSink, ChunkTransport, WriteAck};
pub use write::{StreamWriter, WriteCursor, WriteFailure, WriteReport, WriteStatus};

/// 1 チャンクの応答待ちタイムアウト（ミリ秒）
pub const DEFAULT_CHUNK_TIMEOUT_MS: u64 = 2500;

/// 進捗 0 の short write 応答を何回まで続けて許すか
pub const DEFAULT_MAX_ZERO_PROGRESS: u32 = 3;
