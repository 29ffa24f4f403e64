//! # tfp-schema
//!
//! デバイスのパケット定義（config）と、そこから導出する高レベルストリーム仕様。
//!
//! ## パケット定義とストリーム
//!
//! 1 つのパケットには最大 64 バイトのペイロードしか載らない。
//! それより長い配列・文字列は、以下の役割（role）を持つ要素を使って
//! 複数の低レベル呼び出しに分割される。
//!
//! ```text
//! ('Message Total Length', 'uint16', 1,  'in')   role = stream_length
//! ('Message Chunk Offset', 'uint16', 1,  'in')   role = stream_chunk_offset
//! ('Message Chunk Data',   'char',   60, 'in')   role = stream_chunk_data
//! ('Message Chunk Written','uint8',  1,  'out')  role = stream_chunk_written
//! ```
//!
//! `StreamSpec::from_packet` はこれらの役割を一度だけ解決し、
//! 型付きの `StreamSpec` に変換する。以降の Fragment 分割・再組み立ては
//! `StreamSpec` だけを見て動作する。

pub mod error;
pub mod packet;
pub mod spec;

pub use error::ConfigError;
pub use packet::{
    DeviceSchema, ElementDirection, ElementRole, ElementSchema, ElementType, HighLevel,
    PacketKind, PacketSchema, StreamDeclaration,
};
pub use spec::{Delivery, Direction, ElementWidth, LengthKind, StreamSpec};

/// TFP パケット 1 つに載るペイロードの最大バイト数
/// （ヘッダー 8 バイトを除く）
pub const TFP_MAX_PAYLOAD_LEN: usize = 64;
