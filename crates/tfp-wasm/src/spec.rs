//! StreamSpec / Chunk の JS 向けラッパー

use wasm_bindgen::prelude::*;

use tfp_schema::{Delivery, DeviceSchema, Direction, LengthKind, PacketSchema, StreamSpec};
use tfp_transport::{fragment, Chunk};

use crate::js_error;

/// 高レベルストリーム仕様
#[wasm_bindgen]
#[derive(Debug, Clone)]
pub struct StreamSpecJs {
    pub(crate) inner: StreamSpec,
}

#[wasm_bindgen]
impl StreamSpecJs {
    /// パケット定義 JSON から仕様を導出する
    ///
    /// # 引数
    /// - `json`: `{"type": "function", "name": ..., "elements": [...], "high_level": {...}}`
    /// - `delivery`: `"pull"` / `"push"`。省略時は function → pull、callback → push
    ///
    /// # エラー
    /// - JSON のパース失敗
    /// - パケット定義の矛盾（役割の欠落、ペイロード超過など）
    #[wasm_bindgen(js_name = "fromPacketJson")]
    pub fn from_packet_json(json: &str, delivery: Option<String>) -> Result<StreamSpecJs, JsError> {
        let packet = PacketSchema::from_json(json).map_err(js_error)?;
        from_packet(&packet, delivery.as_deref())
    }

    /// デバイス定義 JSON の中の 1 パケットから仕様を導出する
    #[wasm_bindgen(js_name = "fromDeviceJson")]
    pub fn from_device_json(json: &str, packet_name: &str, delivery: Option<String>) -> Result<StreamSpecJs, JsError> {
        let device = DeviceSchema::from_json(json).map_err(js_error)?;
        let packet = device
            .packets
            .iter()
            .find(|p| p.name == packet_name)
            .ok_or_else(|| JsError::new(&format!("device `{}` has no packet `{}`", device.name, packet_name)))?;
        from_packet(packet, delivery.as_deref())
    }

    #[wasm_bindgen(getter)]
    pub fn name(&self) -> String {
        self.inner.name().to_owned()
    }

    /// `"in"` / `"out"`
    #[wasm_bindgen(getter)]
    pub fn direction(&self) -> String {
        match self.inner.direction() {
            Direction::In => "in".into(),
            Direction::Out => "out".into(),
        }
    }

    /// `"pull"` / `"push"`
    #[wasm_bindgen(getter)]
    pub fn delivery(&self) -> String {
        match self.inner.delivery() {
            Delivery::Pull => "pull".into(),
            Delivery::Push => "push".into(),
        }
    }

    /// 固定長ストリームの長さ。可変長なら undefined
    #[wasm_bindgen(getter, js_name = "fixedLength")]
    pub fn fixed_length(&self) -> Option<u32> {
        match self.inner.length_kind() {
            LengthKind::Fixed(n) => Some(n),
            LengthKind::Variable => None,
        }
    }

    #[wasm_bindgen(getter, js_name = "chunkCapacity")]
    pub fn chunk_capacity(&self) -> u32 {
        self.inner.chunk_capacity()
    }

    #[wasm_bindgen(getter, js_name = "elementBits")]
    pub fn element_bits(&self) -> u16 {
        self.inner.element_width().bits()
    }

    #[wasm_bindgen(getter, js_name = "maxLength")]
    pub fn max_length(&self) -> u32 {
        self.inner.length_limit()
    }

    #[wasm_bindgen(getter, js_name = "shortWrite")]
    pub fn short_write(&self) -> bool {
        self.inner.is_short_write_capable()
    }

    #[wasm_bindgen(getter, js_name = "singleChunk")]
    pub fn single_chunk(&self) -> bool {
        self.inner.is_single_chunk()
    }

    #[wasm_bindgen(js_name = "chunksNeeded")]
    pub fn chunks_needed(&self, total_length: u32) -> u32 {
        self.inner.chunks_needed(total_length)
    }

    /// 仕様を JSON 文字列で返す（デバッグ用）
    #[wasm_bindgen(js_name = "toJson")]
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.inner).unwrap_or_default()
    }
}

fn from_packet(packet: &PacketSchema, delivery: Option<&str>) -> Result<StreamSpecJs, JsError> {
    let spec = match delivery {
        None => StreamSpec::from_packet_auto(packet),
        Some("pull") => StreamSpec::from_packet(packet, Delivery::Pull),
        Some("push") => StreamSpec::from_packet(packet, Delivery::Push),
        Some(other) => return Err(JsError::new(&format!("unknown delivery `{}`", other))),
    }
    .map_err(js_error)?;
    Ok(StreamSpecJs { inner: spec })
}

/// 低レベル呼び出し 1 回分のチャンク
#[wasm_bindgen]
#[derive(Debug, Clone)]
pub struct ChunkJs {
    pub(crate) inner: Chunk<f64>,
}

#[wasm_bindgen]
impl ChunkJs {
    #[wasm_bindgen(constructor)]
    pub fn new(
        offset: u32,
        payload: Vec<f64>,
        total_length: Option<u32>,
        written: Option<u32>,
        extras: Option<Vec<u8>>,
    ) -> ChunkJs {
        ChunkJs {
            inner: Chunk { offset, total_length, payload, written, extras: extras.unwrap_or_default() },
        }
    }

    #[wasm_bindgen(getter)]
    pub fn offset(&self) -> u32 {
        self.inner.offset
    }

    #[wasm_bindgen(getter, js_name = "totalLength")]
    pub fn total_length(&self) -> Option<u32> {
        self.inner.total_length
    }

    #[wasm_bindgen(getter)]
    pub fn payload(&self) -> Vec<f64> {
        self.inner.payload.clone()
    }

    #[wasm_bindgen(getter)]
    pub fn written(&self) -> Option<u32> {
        self.inner.written
    }

    /// 役割を持たない要素のバイト列
    #[wasm_bindgen(getter)]
    pub fn extras(&self) -> Vec<u8> {
        self.inner.extras.clone()
    }
}

impl From<Chunk<f64>> for ChunkJs {
    fn from(inner: Chunk<f64>) -> Self {
        ChunkJs { inner }
    }
}

/// 値をチャンク列に分割する
///
/// # 戻り値
/// `ChunkJs` の配列。空の値でも長さを通知するチャンクが 1 つ入る。
#[wasm_bindgen(js_name = "fragmentStream")]
pub fn fragment_stream(spec: &StreamSpecJs, values: &[f64]) -> Result<js_sys::Array, JsError> {
    if !spec.inner.accepts_length(values.len()) {
        return Err(JsError::new(&format!(
            "invalid stream length {}, limit is {}",
            values.len(),
            spec.inner.length_limit()
        )));
    }
    let result = js_sys::Array::new();
    for chunk in fragment(&spec.inner, values) {
        result.push(&JsValue::from(ChunkJs::from(chunk)));
    }
    Ok(result)
}
