//! # tfp-stream
//!
//! 1 つのデバイスのコールバックは 1 本のチャネルで届く。
//! どの高レベルストリームのチャンクかは (UID, function ID) で決まるので、
//! その組ごとに `PushStream` のスロットを 1 つだけ持つ。
//!
//! ```text
//! dispatch thread                          StreamRegistry
//!   callback(uid, fid, chunk) ──feed──▶  ┌ (uid 0x1a2b, fid 40) → PushStream ┐
//!                                        │ (uid 0x1a2b, fid 41) → PushStream │──▶ wait_value()
//!                                        └ (uid 0x3c4d, fid 40) → PushStream ┘
//! ```
//!
//! 同じスロットで途中から新しい値が始まった場合は、オフセット 0 の
//! チャンクで旧セッションを捨てて始め直す（tfp-transport の規則）。

pub mod registry;

pub use registry::{RegistryError, RegistryStats, StreamKey, StreamRegistry};
