//! # tfp-wasm
//!
//! wasm-bindgen エクスポート：JavaScript バインディングから呼び出す公開 API。
//!
//! すべて I/O なしで動く。低レベル関数の呼び出し・タイムアウトは JS 側
//! （Promise とタイマー）が担当し、この層はチャンクの分割・検証・
//! 再組み立てだけを行う。要素は JS の number（`f64`）として扱う。
//!
//! ## 使用方法（TypeScript）
//!
//! ```typescript
//! import { StreamSpecJs, PullReaderJs, WriteCursorJs, ChunkJs, init_panic_hook } from '../tfp-wasm-pkg/tfp_wasm';
//!
//! init_panic_hook();
//!
//! // パケット定義から仕様を作る
//! const spec = StreamSpecJs.fromPacketJson(readLowLevelJson);
//!
//! // PULL 読み出し
//! const reader = new PullReaderJs(spec);
//! let value;
//! while (value === undefined) {
//!     const offset = reader.request();
//!     const r = await device.readLowLevel();          // timeout: reader.chunkTimeoutMs
//!     value = reader.feed(new ChunkJs(r.chunkOffset, r.chunkData, r.length));
//! }
//!
//! // short write
//! const cursor = new WriteCursorJs(writeSpec, values);
//! for (let chunk = cursor.nextChunk(); chunk; chunk = cursor.nextChunk()) {
//!     const written = await device.writeLowLevel(chunk.totalLength, chunk.offset, chunk.payload);
//!     if (cursor.acknowledge(written)) break;
//! }
//! ```

use wasm_bindgen::prelude::*;

pub mod reader;
pub mod spec;
pub mod writer;

pub use reader::{PullReaderJs, StreamRegistryJs};
pub use spec::{fragment_stream, ChunkJs, StreamSpecJs};
pub use writer::WriteCursorJs;

/// パニック時にブラウザコンソールにスタックトレースを出力する
///
/// 開発時に必ず呼び出すこと。本番ビルドでは feature flag で無効化可能。
#[wasm_bindgen]
pub fn init_panic_hook() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

/// 既定の転送設定を JSON 文字列で返す
///
/// ```json
/// {"chunk_timeout_ms":2500,"stream_timeout_ms":null,"max_chunks":null,"max_zero_progress":3,"desync_policy":"abort"}
/// ```
#[wasm_bindgen(js_name = "defaultTransferConfig")]
pub fn default_transfer_config() -> String {
    serde_json::to_string(&tfp_session::TransferConfig::default()).unwrap_or_default()
}

pub(crate) fn js_error(err: impl core::fmt::Display) -> JsError {
    JsError::new(&err.to_string())
}

pub(crate) fn parse_config(json: Option<String>) -> Result<tfp_session::TransferConfig, JsError> {
    match json {
        Some(json) => tfp_session::TransferConfig::from_json(&json).map_err(js_error),
        None => Ok(tfp_session::TransferConfig::default()),
    }
}
