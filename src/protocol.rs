//! Wire protocol between the transfer orchestrator and the DMM coordinator.
//!
//! Every message is a 4-byte big-endian length prefix followed by that many
//! bytes of JSON. Before the tagged message, the connection completes an
//! HMAC challenge (see [`crate::auth`]); only then does the server read the
//! envelope below.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum accepted message size — guards against a misbehaving peer sending
/// an unbounded length prefix.
const MAX_MESSAGE_BYTES: u32 = 64 * 1024 * 1024;

/// Write `value` as a 4-byte big-endian length prefix followed by its JSON encoding.
pub async fn write_framed<S, T>(stream: &mut S, value: &T) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(body.len()).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&body).await?;
    stream.flush().await
}

/// Read one length-prefixed JSON message.
pub async fn read_framed<S, T>(stream: &mut S) -> std::io::Result<T>
where
    S: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_MESSAGE_BYTES {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "message exceeds maximum size"));
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    serde_json::from_slice(&body).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// The outer envelope every connection sends exactly one of.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "tag", content = "payload", rename_all = "UPPERCASE")]
pub enum Envelope {
    Preparer(PreparerPayload),
    Submitter(SubmitterPayload),
    Finisher(FinisherPayload),
}

/// `rule_id → "src&dst" → entry`.
pub type RulePairMap<T> = HashMap<String, HashMap<String, T>>;

pub type PreparerPayload = RulePairMap<PreparerEntry>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreparerEntry {
    pub transfer_ids: Vec<String>,
    pub priority: u64,
    pub n_bytes_total: u64,
    pub n_transfers_total: u64,
}

pub type SubmitterPayload = RulePairMap<SubmitterEntry>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitterEntry {
    pub priority: u64,
    pub n_transfers_submitted: u64,
}

/// `rule_id → "src&dst" → { src_rse: src_ipv6, dst_rse: dst_ipv6 }`.
pub type SubmitterReply = HashMap<String, HashMap<String, HashMap<String, String>>>;

pub type FinisherPayload = RulePairMap<FinisherEntry>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinisherEntry {
    pub n_transfers_finished: u64,
    pub n_bytes_transferred: u64,
}

/// Split a `"src&dst"` pair key into `(src_rse, dst_rse)`.
pub fn split_pair_id(pair_id: &str) -> Option<(&str, &str)> {
    pair_id.split_once('&')
}

pub fn pair_id(src_rse: &str, dst_rse: &str) -> String {
    format!("{src_rse}&{dst_rse}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_pair_id_round_trips() {
        assert_eq!(split_pair_id("XRD1&XRD3"), Some(("XRD1", "XRD3")));
        assert_eq!(pair_id("XRD1", "XRD3"), "XRD1&XRD3");
    }

    #[tokio::test]
    async fn framed_message_round_trips() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let envelope = Envelope::Submitter(HashMap::new());
        write_framed(&mut a, &envelope).await.unwrap();
        let decoded: Envelope = read_framed(&mut b).await.unwrap();
        assert!(matches!(decoded, Envelope::Submitter(_)));
    }

    #[test]
    fn preparer_envelope_round_trips_through_json() {
        let mut inner = HashMap::new();
        inner.insert(
            "XRD1&XRD3".to_string(),
            PreparerEntry {
                transfer_ids: vec!["a".into(), "b".into()],
                priority: 3,
                n_bytes_total: 4_194_304,
                n_transfers_total: 4,
            },
        );
        let mut payload = HashMap::new();
        payload.insert("R".to_string(), inner);
        let envelope = Envelope::Preparer(payload);

        let json = serde_json::to_string(&envelope).unwrap();
        let decoded: Envelope = serde_json::from_str(&json).unwrap();
        match decoded {
            Envelope::Preparer(p) => assert_eq!(p["R"]["XRD1&XRD3"].priority, 3),
            _ => panic!("expected Preparer variant"),
        }
    }
}
