//! 高レベルストリーム仕様
//!
//! パケット定義の役割タグを解決した結果。1 つのストリーム値につき 1 つ、
//! 構築後は変更しない。

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;
use crate::packet::{ElementDirection, ElementRole, ElementSchema, HighLevel, PacketKind, PacketSchema};
use crate::TFP_MAX_PAYLOAD_LEN;

/// ストリームの方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// ホスト → デバイス（stream_in）
    In,
    /// デバイス → ホスト（stream_out）
    Out,
}

/// チャンクの届き方
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Delivery {
    /// ホストがチャンクごとに低レベル関数を呼び出し、応答を待つ
    Pull,
    /// デバイスがコールバックとして自発的にチャンクを送る
    Push,
}

/// 総要素数の決まり方
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LengthKind {
    /// コンパイル時に決まっている
    Fixed(u32),
    /// 最初のチャンクの長さフィールドで通知される
    Variable,
}

/// 1 要素のビット幅
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementWidth(pub u16);

impl ElementWidth {
    /// パックされた bool
    pub const BIT: Self = ElementWidth(1);
    /// uint8 / char
    pub const BYTE: Self = ElementWidth(8);

    pub fn bits(self) -> u16 {
        self.0
    }
}

/// 高レベルストリーム仕様
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSpec {
    name: String,
    direction: Direction,
    delivery: Delivery,
    length: LengthKind,
    element_width: ElementWidth,
    chunk_capacity: u32,
    short_write: bool,
    single_chunk: bool,
    pad_final_chunk: bool,
    max_length: u32,
    no_data_offset: Option<u32>,
}

impl StreamSpec {
    /// 明示的なパラメータからストリーム仕様を構築する
    ///
    /// 単一チャンク・パディング・最大長などは既定値になる。変更する場合は
    /// `StreamSpec::builder` を使う。
    pub fn new(
        name: impl Into<String>,
        direction: Direction,
        delivery: Delivery,
        length: LengthKind,
        element_width: ElementWidth,
        chunk_capacity: u32,
        short_write: bool,
    ) -> Result<Self, ConfigError> {
        StreamSpec::builder(name, direction, chunk_capacity)
            .delivery(delivery)
            .length(length)
            .element_width(element_width)
            .short_write(short_write)
            .build()
    }

    pub fn builder(name: impl Into<String>, direction: Direction, chunk_capacity: u32) -> StreamSpecBuilder {
        StreamSpecBuilder {
            name: name.into(),
            direction,
            delivery: Delivery::Pull,
            length: LengthKind::Variable,
            element_width: ElementWidth::BYTE,
            chunk_capacity,
            short_write: false,
            single_chunk: false,
            pad_final_chunk: true,
            max_length: None,
            no_data_offset: None,
        }
    }

    /// パケット定義の役割タグからストリーム仕様を導出する
    ///
    /// # エラー
    /// パケット定義が矛盾している場合（役割の欠落・重複、方向違い、
    /// ペイロード超過など）は `ConfigError`。
    pub fn from_packet(packet: &PacketSchema, delivery: Delivery) -> Result<Self, ConfigError> {
        let high_level = packet.high_level.as_ref().ok_or_else(|| ConfigError::NotAStream {
            packet: packet.name.clone(),
        })?;
        let decl = high_level.declaration();
        let stream = packet.stream_name().unwrap_or(&packet.name).to_string();

        let (direction, data_dir) = match high_level {
            HighLevel::StreamIn(_) => (Direction::In, ElementDirection::In),
            HighLevel::StreamOut(_) => (Direction::Out, ElementDirection::Out),
        };

        let data = single_role(packet, &stream, ElementRole::StreamChunkData)?
            .ok_or_else(|| ConfigError::MissingRole {
                stream: stream.clone(),
                role: ElementRole::StreamChunkData.as_str(),
            })?;
        let length_elem = single_role(packet, &stream, ElementRole::StreamLength)?;
        let offset_elem = single_role(packet, &stream, ElementRole::StreamChunkOffset)?;
        let written_elem = single_role(packet, &stream, ElementRole::StreamChunkWritten)?;

        for (elem, role, expected) in [
            (Some(data), ElementRole::StreamChunkData, data_dir),
            (length_elem, ElementRole::StreamLength, data_dir),
            (offset_elem, ElementRole::StreamChunkOffset, data_dir),
            (written_elem, ElementRole::StreamChunkWritten, ElementDirection::Out),
        ] {
            if let Some(elem) = elem {
                if elem.direction != expected {
                    return Err(ConfigError::WrongDirection { stream: stream.clone(), role: role.as_str() });
                }
            }
        }

        let length_max = unsigned_max(length_elem, &stream, ElementRole::StreamLength)?;
        let offset_max = unsigned_max(offset_elem, &stream, ElementRole::StreamChunkOffset)?;
        unsigned_max(written_elem, &stream, ElementRole::StreamChunkWritten)?;

        let length = match decl.fixed_length {
            Some(n) => LengthKind::Fixed(n),
            None => LengthKind::Variable,
        };

        if length == LengthKind::Variable && length_elem.is_none() {
            return Err(ConfigError::MissingRole {
                stream,
                role: ElementRole::StreamLength.as_str(),
            });
        }
        if !decl.single_chunk && offset_elem.is_none() {
            return Err(ConfigError::MissingRole {
                stream,
                role: ElementRole::StreamChunkOffset.as_str(),
            });
        }
        if decl.short_write && written_elem.is_none() {
            return Err(ConfigError::MissingRole {
                stream,
                role: ElementRole::StreamChunkWritten.as_str(),
            });
        }

        for dir in [ElementDirection::In, ElementDirection::Out] {
            let bytes = packet.payload_len(dir);
            if bytes > TFP_MAX_PAYLOAD_LEN {
                return Err(ConfigError::PayloadTooLarge {
                    packet: packet.name.clone(),
                    bytes,
                    limit: TFP_MAX_PAYLOAD_LEN,
                });
            }
        }

        // 長さ・オフセットの両方で表現できる範囲が最大長になる
        let max_length = match (length_max, offset_max) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => u32::MAX,
        };

        let mut builder = StreamSpec::builder(stream, direction, data.cardinality as u32)
            .delivery(delivery)
            .length(length)
            .element_width(ElementWidth(data.ty.bit_width()))
            .short_write(decl.short_write)
            .single_chunk(decl.single_chunk)
            .max_length(max_length);

        // 固定長 OUT ストリームは「オフセット最大値 = データなし」を使う
        if let (Direction::Out, LengthKind::Fixed(_), Some(sentinel)) = (direction, length, offset_max) {
            builder = builder.no_data_offset(Some(sentinel));
        }

        let spec = builder.build()?;
        debug!(
            stream = %spec.name,
            packet = %packet.name,
            ?direction,
            ?delivery,
            chunk_capacity = spec.chunk_capacity,
            "derived stream spec"
        );
        Ok(spec)
    }

    /// パケットの種類から配送方式を決めて導出する
    ///
    /// function パケットは PULL、callback パケットは PUSH。
    pub fn from_packet_auto(packet: &PacketSchema) -> Result<Self, ConfigError> {
        let delivery = match packet.kind {
            PacketKind::Function => Delivery::Pull,
            PacketKind::Callback => Delivery::Push,
        };
        StreamSpec::from_packet(packet, delivery)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn delivery(&self) -> Delivery {
        self.delivery
    }

    pub fn length_kind(&self) -> LengthKind {
        self.length
    }

    pub fn fixed_length(&self) -> Option<u32> {
        match self.length {
            LengthKind::Fixed(n) => Some(n),
            LengthKind::Variable => None,
        }
    }

    pub fn element_width(&self) -> ElementWidth {
        self.element_width
    }

    /// 1 チャンクに載る最大要素数
    pub fn chunk_capacity(&self) -> u32 {
        self.chunk_capacity
    }

    pub fn is_short_write_capable(&self) -> bool {
        self.short_write
    }

    pub fn is_single_chunk(&self) -> bool {
        self.single_chunk
    }

    pub fn pads_final_chunk(&self) -> bool {
        self.pad_final_chunk
    }

    /// 長さフィールドで表現できる最大の総要素数
    pub fn max_length(&self) -> u32 {
        self.max_length
    }

    /// 「データなし」を示すチャンクオフセット（固定長 OUT ストリームのみ）
    pub fn no_data_offset(&self) -> Option<u32> {
        self.no_data_offset
    }

    /// 総要素数 `total_length` の転送に必要なチャンク数
    ///
    /// 空の値でも長さを通知するためにチャンクを 1 つ使う。
    pub fn chunks_needed(&self, total_length: u32) -> u32 {
        if self.single_chunk {
            return 1;
        }
        total_length.div_ceil(self.chunk_capacity).max(1)
    }

    /// `chunk_index` 番目のチャンクの先頭要素オフセット
    pub fn offset_of(&self, chunk_index: u32) -> u32 {
        chunk_index.saturating_mul(self.chunk_capacity)
    }

    /// この仕様で送れる値の長さか
    ///
    /// - 固定長: ちょうど固定長
    /// - 単一チャンク: chunk_capacity 以下
    /// - 可変長: max_length 以下
    pub fn accepts_length(&self, length: usize) -> bool {
        match self.length {
            LengthKind::Fixed(n) => length == n as usize,
            LengthKind::Variable if self.single_chunk => {
                length <= self.chunk_capacity.min(self.max_length) as usize
            }
            LengthKind::Variable => length <= self.max_length as usize,
        }
    }

    /// `accepts_length` が受け付ける最大長
    pub fn length_limit(&self) -> u32 {
        match self.length {
            LengthKind::Fixed(n) => n,
            LengthKind::Variable if self.single_chunk => self.chunk_capacity.min(self.max_length),
            LengthKind::Variable => self.max_length,
        }
    }
}

/// `StreamSpec` のビルダー
#[derive(Debug, Clone)]
pub struct StreamSpecBuilder {
    name: String,
    direction: Direction,
    delivery: Delivery,
    length: LengthKind,
    element_width: ElementWidth,
    chunk_capacity: u32,
    short_write: bool,
    single_chunk: bool,
    pad_final_chunk: bool,
    max_length: Option<u32>,
    no_data_offset: Option<u32>,
}

impl StreamSpecBuilder {
    pub fn delivery(mut self, delivery: Delivery) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn length(mut self, length: LengthKind) -> Self {
        self.length = length;
        self
    }

    pub fn element_width(mut self, width: ElementWidth) -> Self {
        self.element_width = width;
        self
    }

    pub fn short_write(mut self, short_write: bool) -> Self {
        self.short_write = short_write;
        self
    }

    pub fn single_chunk(mut self, single_chunk: bool) -> Self {
        self.single_chunk = single_chunk;
        self
    }

    pub fn pad_final_chunk(mut self, pad: bool) -> Self {
        self.pad_final_chunk = pad;
        self
    }

    pub fn max_length(mut self, max_length: u32) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn no_data_offset(mut self, offset: Option<u32>) -> Self {
        self.no_data_offset = offset;
        self
    }

    pub fn build(self) -> Result<StreamSpec, ConfigError> {
        if self.chunk_capacity == 0 {
            return Err(ConfigError::ZeroChunkCapacity { stream: self.name });
        }
        if self.element_width.bits() == 0 {
            return Err(ConfigError::ZeroElementWidth { stream: self.name });
        }
        if self.short_write && self.direction == Direction::Out {
            return Err(ConfigError::ShortWriteOnOutStream { stream: self.name });
        }
        if self.single_chunk && matches!(self.length, LengthKind::Fixed(_)) {
            return Err(ConfigError::SingleChunkWithFixedLength { stream: self.name });
        }

        let max_length = match (self.length, self.max_length) {
            (LengthKind::Fixed(n), Some(max)) if n > max => {
                return Err(ConfigError::FixedLengthOutOfRange { stream: self.name, length: n, max });
            }
            (LengthKind::Fixed(n), _) => n,
            (LengthKind::Variable, Some(max)) => max,
            (LengthKind::Variable, None) => u32::MAX,
        };

        Ok(StreamSpec {
            name: self.name,
            direction: self.direction,
            delivery: self.delivery,
            length: self.length,
            element_width: self.element_width,
            chunk_capacity: self.chunk_capacity,
            short_write: self.short_write,
            single_chunk: self.single_chunk,
            pad_final_chunk: self.pad_final_chunk,
            max_length,
            no_data_offset: self.no_data_offset,
        })
    }
}

fn single_role<'a>(
    packet: &'a PacketSchema,
    stream: &str,
    role: ElementRole,
) -> Result<Option<&'a ElementSchema>, ConfigError> {
    let mut found = packet.elements_with_role(role);
    let first = found.next();
    if found.next().is_some() {
        return Err(ConfigError::DuplicateRole { stream: stream.to_owned(), role: role.as_str() });
    }
    Ok(first)
}

fn unsigned_max(
    elem: Option<&ElementSchema>,
    stream: &str,
    role: ElementRole,
) -> Result<Option<u32>, ConfigError> {
    match elem {
        None => Ok(None),
        Some(elem) => elem
            .ty
            .unsigned_max()
            .map(Some)
            .ok_or_else(|| ConfigError::NotUnsigned { stream: stream.to_owned(), role: role.as_str() }),
    }
}
