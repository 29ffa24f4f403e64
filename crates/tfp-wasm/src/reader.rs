//! 受信側（PULL 読み出し・コールバック）の JS 向けラッパー

use tracing::{debug, warn};
use wasm_bindgen::prelude::*;

use tfp_session::TransferConfig;
use tfp_stream::{StreamKey, StreamRegistry};
use tfp_transport::{ChunkOutcome, Reassembler, StreamError, TimeoutCause};

use crate::spec::{ChunkJs, StreamSpecJs};
use crate::{js_error, parse_config};

/// PULL ストリームの読み出し（I/O なし）
///
/// `request()` で次に読むオフセットを受け取り、低レベル関数の応答を
/// `feed()` に渡す。値が揃うと `feed()` が値を返す。
#[wasm_bindgen]
pub struct PullReaderJs {
    reassembler: Reassembler<f64>,
    config: TransferConfig,
    requests: u32,
    completed: u64,
    failed: u64,
}

#[wasm_bindgen]
impl PullReaderJs {
    /// # 引数
    /// - `config_json`: `TransferConfig` の JSON。省略時は既定値
    #[wasm_bindgen(constructor)]
    pub fn new(spec: &StreamSpecJs, config_json: Option<String>) -> Result<PullReaderJs, JsError> {
        Ok(PullReaderJs {
            reassembler: Reassembler::new(spec.inner.clone()),
            config: parse_config(config_json)?,
            requests: 0,
            completed: 0,
            failed: 0,
        })
    }

    /// 次の要求を発行する。戻り値は期待するオフセット
    ///
    /// # エラー
    /// 要求数の上限に達した（セッションは取り消される）
    pub fn request(&mut self) -> Result<u32, JsError> {
        let limit = self
            .config
            .chunk_limit(self.reassembler.spec(), self.reassembler.session().expected_length());
        if self.requests >= limit {
            return Err(js_error(self.fail(StreamError::Timeout(TimeoutCause::ChunkLimit { limit }))));
        }
        self.requests += 1;
        Ok(self.reassembler.session().next_offset())
    }

    /// 応答のチャンクを適用する
    ///
    /// # 戻り値
    /// 値が揃えばその値、まだなら undefined
    ///
    /// # エラー
    /// 同期ずれ・長さの不正など。セッションは ABANDONED になり、次の読み出しは
    /// オフセット 0 から始まる。
    pub fn feed(&mut self, chunk: &ChunkJs) -> Result<Option<Vec<f64>>, JsError> {
        match self.reassembler.accept(&chunk.inner) {
            Ok(ChunkOutcome::Complete(value)) => {
                self.reassembler.drain_transitions();
                self.requests = 0;
                self.completed += 1;
                debug!(stream = self.reassembler.spec().name(), length = value.len(), "value read");
                Ok(Some(value))
            }
            Ok(_) => Ok(None),
            Err(err) => {
                self.reassembler.drain_transitions();
                self.requests = 0;
                self.failed += 1;
                warn!(stream = self.reassembler.spec().name(), error = %err, "read failed");
                Err(js_error(err))
            }
        }
    }

    /// タイムアウトやキャンセル時に呼ぶ。受信途中の要素を返す
    pub fn cancel(&mut self) -> Vec<f64> {
        let partial = self.reassembler.abandon();
        self.reassembler.drain_transitions();
        self.requests = 0;
        partial
    }

    /// 1 チャンクの応答待ち（ミリ秒）
    #[wasm_bindgen(getter, js_name = "chunkTimeoutMs")]
    pub fn chunk_timeout_ms(&self) -> f64 {
        self.config.chunk_timeout_ms as f64
    }

    #[wasm_bindgen(getter, js_name = "nextOffset")]
    pub fn next_offset(&self) -> u32 {
        self.reassembler.session().next_offset()
    }

    /// 統計を JSON 文字列で返す
    ///
    /// ```json
    /// {"requests":2,"next_offset":60,"expected_length":64,"completed":10,"failed":0}
    /// ```
    #[wasm_bindgen(js_name = "getStats")]
    pub fn get_stats(&self) -> String {
        let session = self.reassembler.session();
        serde_json::json!({
            "requests": self.requests,
            "next_offset": session.next_offset(),
            "expected_length": session.expected_length(),
            "completed": self.completed,
            "failed": self.failed,
        })
        .to_string()
    }
}

impl PullReaderJs {
    fn fail(&mut self, err: StreamError) -> StreamError {
        self.cancel();
        self.failed += 1;
        err
    }
}

/// コールバックで届く PUSH ストリームの受信口
///
/// デバイスのコールバックを (UID, function ID) ごとのスロットに振り分ける。
#[wasm_bindgen]
pub struct StreamRegistryJs {
    registry: StreamRegistry<f64>,
}

#[wasm_bindgen]
impl StreamRegistryJs {
    #[wasm_bindgen(constructor)]
    pub fn new() -> StreamRegistryJs {
        StreamRegistryJs { registry: StreamRegistry::new() }
    }

    /// コールバックの function ID に PUSH ストリームを登録する
    pub fn register(&self, function_id: u8, spec: &StreamSpecJs) -> Result<(), JsError> {
        self.registry.register(function_id, spec.inner.clone()).map_err(js_error)
    }

    /// コールバックのチャンクを適用する
    ///
    /// # 戻り値
    /// 値が揃えばその値、まだなら undefined
    pub fn feed(&self, uid: u32, function_id: u8, chunk: &ChunkJs) -> Result<Option<Vec<f64>>, JsError> {
        match self.registry.feed(StreamKey::new(uid, function_id), &chunk.inner) {
            Ok(ChunkOutcome::Complete(value)) => Ok(Some(value)),
            Ok(_) => Ok(None),
            Err(err) => Err(js_error(err)),
        }
    }

    /// デバイス切断時に呼ぶ。取り除いたスロット数を返す
    #[wasm_bindgen(js_name = "removeDevice")]
    pub fn remove_device(&self, uid: u32) -> usize {
        self.registry.remove_device(uid)
    }

    /// 統計を JSON 文字列で返す
    ///
    /// ```json
    /// {"slots":2,"chunks_fed":130,"values_completed":10,"errors":0}
    /// ```
    #[wasm_bindgen(js_name = "getStats")]
    pub fn get_stats(&self) -> String {
        serde_json::to_string(&self.registry.stats()).unwrap_or_default()
    }
}

impl Default for StreamRegistryJs {
    fn default() -> Self {
        Self::new()
    }
}
