//! チャンクの送受信口
//!
//! ドライバーはパケットのエンコードや UID を知らない。バインディング側が
//! `ChunkTransport`（PULL 読み出し）と `ChunkSink`（IN 書き込み）を実装し、
//! 低レベル関数の呼び出しに変換する。

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tfp_transport::{Chunk, StreamError, TimeoutCause};

/// PULL 読み出しの 1 回分の要求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRequest {
    /// ホストが次に期待する要素オフセット
    pub offset: u32,
    /// この転送で何回目の要求か（0 始まり）
    pub index: u32,
}

/// IN 書き込みの応答
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WriteAck {
    /// stream_chunk_written の値。short write でないストリームでは `None`
    pub written: Option<u32>,
    /// 応答の役割を持たない要素（`Chunk::extras` と同じ形式）
    pub extras: Vec<u8>,
}

impl WriteAck {
    pub fn written(written: u32) -> Self {
        WriteAck { written: Some(written), extras: Vec::new() }
    }

    pub fn with_extras(mut self, extras: Vec<u8>) -> Self {
        self.extras = extras;
        self
    }
}

/// 低レベルの読み出し関数を呼び、応答のチャンクを返す
pub trait ChunkTransport<T> {
    /// `timeout` 以内に応答がなければ `StreamError::Timeout(TimeoutCause::PerChunk)`
    fn request_chunk(&mut self, request: &ChunkRequest, timeout: Duration) -> Result<Chunk<T>, StreamError>;
}

impl<T, F> ChunkTransport<T> for F
where
    F: FnMut(&ChunkRequest, Duration) -> Result<Chunk<T>, StreamError>,
{
    fn request_chunk(&mut self, request: &ChunkRequest, timeout: Duration) -> Result<Chunk<T>, StreamError> {
        self(request, timeout)
    }
}

/// 低レベルの書き込み関数を呼び、応答を返す
pub trait ChunkSink<T> {
    fn submit_chunk(&mut self, chunk: &Chunk<T>, timeout: Duration) -> Result<WriteAck, StreamError>;
}

impl<T, F> ChunkSink<T> for F
where
    F: FnMut(&Chunk<T>, Duration) -> Result<WriteAck, StreamError>,
{
    fn submit_chunk(&mut self, chunk: &Chunk<T>, timeout: Duration) -> Result<WriteAck, StreamError> {
        self(chunk, timeout)
    }
}

/// 別スレッドのデバイスとチャネルでつながる `ChunkTransport`
pub struct ChannelTransport<T> {
    requests: Sender<ChunkRequest>,
    responses: Receiver<Chunk<T>>,
}

impl<T> ChannelTransport<T> {
    /// 要求の送信口と応答の受信口から作る
    pub fn new(requests: Sender<ChunkRequest>, responses: Receiver<Chunk<T>>) -> Self {
        ChannelTransport { requests, responses }
    }

    /// トランスポートと、デバイス側が使う（要求の受信口, 応答の送信口）の組を作る
    pub fn pair() -> (Self, Receiver<ChunkRequest>, Sender<Chunk<T>>) {
        let (req_tx, req_rx) = crossbeam_channel::unbounded();
        let (resp_tx, resp_rx) = crossbeam_channel::unbounded();
        (ChannelTransport::new(req_tx, resp_rx), req_rx, resp_tx)
    }
}

impl<T> ChunkTransport<T> for ChannelTransport<T> {
    fn request_chunk(&mut self, request: &ChunkRequest, timeout: Duration) -> Result<Chunk<T>, StreamError> {
        self.requests.send(*request).map_err(|_| StreamError::Disconnected)?;
        recv(&self.responses, timeout)
    }
}

/// 別スレッドのデバイスとチャネルでつながる `ChunkSink`
pub struct ChannelSink<T> {
    chunks: Sender<Chunk<T>>,
    acks: Receiver<WriteAck>,
}

impl<T: Clone> ChannelSink<T> {
    pub fn new(chunks: Sender<Chunk<T>>, acks: Receiver<WriteAck>) -> Self {
        ChannelSink { chunks, acks }
    }

    /// シンクと、デバイス側が使う（チャンクの受信口, 応答の送信口）の組を作る
    pub fn pair() -> (Self, Receiver<Chunk<T>>, Sender<WriteAck>) {
        let (chunk_tx, chunk_rx) = crossbeam_channel::unbounded();
        let (ack_tx, ack_rx) = crossbeam_channel::unbounded();
        (ChannelSink::new(chunk_tx, ack_rx), chunk_rx, ack_tx)
    }
}

impl<T: Clone> ChunkSink<T> for ChannelSink<T> {
    fn submit_chunk(&mut self, chunk: &Chunk<T>, timeout: Duration) -> Result<WriteAck, StreamError> {
        self.chunks.send(chunk.clone()).map_err(|_| StreamError::Disconnected)?;
        recv(&self.acks, timeout)
    }
}

fn recv<R>(rx: &Receiver<R>, timeout: Duration) -> Result<R, StreamError> {
    rx.recv_timeout(timeout).map_err(|err| match err {
        RecvTimeoutError::Timeout => StreamError::Timeout(TimeoutCause::PerChunk),
        RecvTimeoutError::Disconnected => StreamError::Disconnected,
    })
}
