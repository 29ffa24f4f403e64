//! # tfp-transport
//!
//! 高レベルストリームの値とチャンク列の相互変換。
//!
//! 1 つの値（配列・文字列）を `StreamSpec` の chunk_capacity ごとに区切り、
//! 低レベル呼び出し 1 回分の `Chunk` にする。受信側は `Reassembler` が
//! オフセットを検証しながらバッファに積み上げ、値を復元する。
//!
//! ## チャンク列
//!
//! ```text
//! value: [e0 e1 ... e63]              chunk_capacity = 30
//!
//! Chunk { offset:  0, total_length: Some(64), payload: e0..e29  }
//! Chunk { offset: 30, total_length: Some(64), payload: e30..e59 }
//! Chunk { offset: 60, total_length: Some(64), payload: e60..e63 + 0 × 26 }
//! ```
//!
//! I/O は一切行わない。チャンクの送受信・タイムアウトは tfp-session が担当する。

pub mod assembly;
pub mod chunk;
pub mod error;
pub mod fragment;

pub use assembly::{ChunkOutcome, Reassembler, SessionId, SessionState, StreamSession, Transition};
pub use chunk::Chunk;
pub use error::{StreamError, TimeoutCause};
pub use fragment::{fragment, fragment_at, Fragments};
