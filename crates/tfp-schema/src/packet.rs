//! パケット定義（config）のデータモデル
//!
//! JSON バインディングが出力する形式をそのまま読み込む。
//!
//! ```json
//! {
//!   "type": "function",
//!   "name": "Write Low Level",
//!   "function_id": 1,
//!   "elements": [
//!     {"name": "Message Length",       "type": "uint16", "cardinality": 1,  "direction": "in"},
//!     {"name": "Message Chunk Offset", "type": "uint16", "cardinality": 1,  "direction": "in"},
//!     {"name": "Message Chunk Data",   "type": "char",   "cardinality": 60, "direction": "in"}
//!   ],
//!   "high_level": {"stream_in": {"name": "Message"}}
//! }
//! ```

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// 要素の型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float,
    /// 8 個ずつ 1 バイトにパックされる
    Bool,
    Char,
    String,
}

impl ElementType {
    /// 1 要素あたりのビット数
    pub fn bit_width(self) -> u16 {
        match self {
            ElementType::Bool => 1,
            ElementType::Int8 | ElementType::Uint8 | ElementType::Char | ElementType::String => 8,
            ElementType::Int16 | ElementType::Uint16 => 16,
            ElementType::Int32 | ElementType::Uint32 | ElementType::Float => 32,
            ElementType::Int64 | ElementType::Uint64 => 64,
        }
    }

    /// 符号なし整数型が表現できる最大値（u32 に丸める）
    ///
    /// 長さ・オフセットフィールドにしか使わないため、符号付きや浮動小数は `None`。
    pub fn unsigned_max(self) -> Option<u32> {
        match self {
            ElementType::Uint8 => Some(u8::MAX as u32),
            ElementType::Uint16 => Some(u16::MAX as u32),
            ElementType::Uint32 | ElementType::Uint64 => Some(u32::MAX),
            _ => None,
        }
    }
}

/// 要素の方向（関数呼び出しの引数か戻り値か）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementDirection {
    In,
    Out,
}

/// ストリーム関連の要素の役割
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementRole {
    StreamLength,
    StreamChunkOffset,
    StreamChunkData,
    StreamChunkWritten,
}

impl ElementRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ElementRole::StreamLength => "stream_length",
            ElementRole::StreamChunkOffset => "stream_chunk_offset",
            ElementRole::StreamChunkData => "stream_chunk_data",
            ElementRole::StreamChunkWritten => "stream_chunk_written",
        }
    }
}

fn one() -> u16 {
    1
}

/// パケットの 1 要素
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ElementType,
    #[serde(default = "one")]
    pub cardinality: u16,
    pub direction: ElementDirection,
    /// 明示的な役割。省略時は要素名から推定する（`PacketSchema::role_of`）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<ElementRole>,
}

impl ElementSchema {
    /// 要素が占めるビット数
    pub fn bit_len(&self) -> usize {
        self.ty.bit_width() as usize * self.cardinality as usize
    }
}

/// high_level 宣言の中身
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamDeclaration {
    /// 高レベル値の名前（例: "Message"）
    #[serde(default)]
    pub name: String,
    /// 総要素数が固定の場合にその長さ
    #[serde(default, alias = "fixed_total_length", skip_serializing_if = "Option::is_none")]
    pub fixed_length: Option<u32>,
    /// デバイスが送信要素の一部だけを受け付けることがある
    #[serde(default)]
    pub short_write: bool,
    /// 値全体が常に 1 パケットに収まる（オフセットフィールドなし）
    #[serde(default)]
    pub single_chunk: bool,
}

/// `{"stream_in": {...}}` または `{"stream_out": {...}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HighLevel {
    StreamIn(StreamDeclaration),
    StreamOut(StreamDeclaration),
}

impl HighLevel {
    pub fn declaration(&self) -> &StreamDeclaration {
        match self {
            HighLevel::StreamIn(decl) | HighLevel::StreamOut(decl) => decl,
        }
    }
}

/// パケットの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketKind {
    /// ホストが呼び出し、デバイスが応答する
    Function,
    /// デバイスが自発的に送る
    Callback,
}

/// パケット 1 つ分の宣言
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketSchema {
    #[serde(rename = "type")]
    pub kind: PacketKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_id: Option<u8>,
    pub elements: Vec<ElementSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_level: Option<HighLevel>,
}

impl PacketSchema {
    /// JSON 文字列からパケット定義を読み込む
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// ストリーム名。宣言の名前が空ならパケット名を使う
    pub fn stream_name(&self) -> Option<&str> {
        let decl = self.high_level.as_ref()?.declaration();
        Some(if decl.name.is_empty() { &self.name } else { &decl.name })
    }

    /// 要素の役割を返す
    ///
    /// 明示的な `role` があればそれを使い、なければストリーム名と要素名から推定する。
    /// 推定規則（ストリーム名 "Message" の場合）:
    /// - "Message Length" / "Message Total Length" → stream_length
    /// - "Message Chunk Offset" → stream_chunk_offset
    /// - "Message Chunk Data"（single_chunk では "Message Data"）→ stream_chunk_data
    /// - "Message Chunk Written" / "Message Written" → stream_chunk_written
    pub fn role_of(&self, element: &ElementSchema) -> Option<ElementRole> {
        if element.role.is_some() {
            return element.role;
        }

        let decl = self.high_level.as_ref()?.declaration();
        let suffix = element
            .name
            .strip_prefix(self.stream_name()?)?
            .strip_prefix(' ')?;

        match suffix {
            "Length" | "Total Length" => Some(ElementRole::StreamLength),
            "Chunk Offset" => Some(ElementRole::StreamChunkOffset),
            "Chunk Data" => Some(ElementRole::StreamChunkData),
            "Data" if decl.single_chunk => Some(ElementRole::StreamChunkData),
            "Chunk Written" | "Written" => Some(ElementRole::StreamChunkWritten),
            _ => None,
        }
    }

    /// 指定した役割を持つ要素をすべて返す
    pub fn elements_with_role(&self, role: ElementRole) -> impl Iterator<Item = &ElementSchema> {
        self.elements
            .iter()
            .filter(move |elem| self.role_of(elem) == Some(role))
    }

    /// 指定方向の要素の合計バイト数（bool はパックして切り上げ）
    pub fn payload_len(&self, direction: ElementDirection) -> usize {
        self.elements
            .iter()
            .filter(|elem| elem.direction == direction)
            .map(|elem| elem.bit_len().div_ceil(8))
            .sum()
    }
}

/// デバイス 1 台分の定義（JSON バインディングの出力全体）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSchema {
    pub name: String,
    #[serde(default)]
    pub device_identifier: u16,
    pub packets: Vec<PacketSchema>,
}

impl DeviceSchema {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// high_level 宣言を持つパケットだけを返す
    pub fn stream_packets(&self) -> impl Iterator<Item = &PacketSchema> {
        self.packets.iter().filter(|p| p.high_level.is_some())
    }
}
