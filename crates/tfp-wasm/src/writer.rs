//! IN ストリーム書き込みの JS 向けラッパー

use wasm_bindgen::prelude::*;

use tfp_session::{WriteAck, WriteCursor, WriteStatus, DEFAULT_MAX_ZERO_PROGRESS};

use crate::js_error;
use crate::spec::{ChunkJs, StreamSpecJs};

/// short write 対応の書き込みカーソル（I/O なし）
#[wasm_bindgen]
pub struct WriteCursorJs {
    cursor: WriteCursor<'static, f64>,
}

#[wasm_bindgen]
impl WriteCursorJs {
    /// # エラー
    /// 値の長さをこのストリームで送れない（固定長と違う、上限を超える）
    #[wasm_bindgen(constructor)]
    pub fn new(spec: &StreamSpecJs, values: Vec<f64>, max_zero_progress: Option<u32>) -> Result<WriteCursorJs, JsError> {
        let cursor = WriteCursor::owned(
            spec.inner.clone(),
            values,
            max_zero_progress.unwrap_or(DEFAULT_MAX_ZERO_PROGRESS),
        )
        .map_err(js_error)?;
        Ok(WriteCursorJs { cursor })
    }

    /// 次に送るチャンク。送り終えていれば undefined
    #[wasm_bindgen(js_name = "nextChunk")]
    pub fn next_chunk(&mut self) -> Option<ChunkJs> {
        self.cursor.next_chunk().map(ChunkJs::from)
    }

    /// 書き込み関数の応答を渡す
    ///
    /// # 引数
    /// - `written`: stream_chunk_written の値。short write でなければ undefined
    /// - `extras`: 応答の役割を持たない要素
    ///
    /// # 戻り値
    /// 書き込みが終わったら true
    pub fn acknowledge(&mut self, written: Option<u32>, extras: Option<Vec<u8>>) -> Result<bool, JsError> {
        let ack = WriteAck { written, extras: extras.unwrap_or_default() };
        let status = self.cursor.acknowledge(ack).map_err(js_error)?;
        Ok(status == WriteStatus::Done)
    }

    #[wasm_bindgen(getter)]
    pub fn written(&self) -> u32 {
        self.cursor.written()
    }

    #[wasm_bindgen(getter)]
    pub fn submissions(&self) -> u32 {
        self.cursor.submissions()
    }

    /// 最後の応答の役割を持たない要素
    #[wasm_bindgen(getter)]
    pub fn extras(&self) -> Vec<u8> {
        self.cursor.extras().to_vec()
    }

    #[wasm_bindgen(getter, js_name = "isDone")]
    pub fn is_done(&self) -> bool {
        self.cursor.is_done()
    }
}
