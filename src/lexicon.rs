use chrono::{DateTime, Utc};
use ipld_core::cid::Cid;
use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

/// Namespace of the repo event stream; frame headers carry the fragment
/// (`#commit`, `#handle`, ...) and the full `$type` is `NSID` + fragment.
pub const NSID: &str = "com.atproto.sync.subscribeRepos";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoOperation {
    pub action: String,
    pub path: String,
    pub cid: Option<Cid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub seq: i64,
    pub rebase: bool,
    #[serde(rename = "tooBig")]
    pub too_big: bool,
    pub repo: String,
    pub rev: String,
    pub since: Option<String>,
    #[serde(with = "serde_bytes")]
    pub blocks: Vec<u8>,
    pub ops: Vec<RepoOperation>,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handle {
    pub seq: i64,
    pub did: String,
    pub handle: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub seq: i64,
    pub did: String,
    pub time: DateTime<Utc>,
    pub handle: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tombstone {
    pub seq: i64,
    pub did: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub seq: i64,
    pub did: String,
    pub time: DateTime<Utc>,
    pub active: bool,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    pub message: Option<String>,
}

#[derive(Debug)]
pub enum RepoMessage {
    Commit(Commit),
    Handle(Handle),
    Identity(Identity),
    Tombstone(Tombstone),
    Account(Account),
    Info(Info),
}

impl RepoMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            RepoMessage::Commit(_) => "#commit",
            RepoMessage::Handle(_) => "#handle",
            RepoMessage::Identity(_) => "#identity",
            RepoMessage::Tombstone(_) => "#tombstone",
            RepoMessage::Account(_) => "#account",
            RepoMessage::Info(_) => "#info",
        }
    }

    /// Sequence number, absent only for `#info`.
    pub fn seq(&self) -> Option<i64> {
        match self {
            RepoMessage::Commit(m) => Some(m.seq),
            RepoMessage::Handle(m) => Some(m.seq),
            RepoMessage::Identity(m) => Some(m.seq),
            RepoMessage::Tombstone(m) => Some(m.seq),
            RepoMessage::Account(m) => Some(m.seq),
            RepoMessage::Info(_) => None,
        }
    }
}

/// Construct the typed message for a frame's type fragment. Unknown
/// fragments (new protocol revisions, `#sync`) return `None` so the caller
/// can skip them instead of failing the stream.
pub fn parse_message(t: &str, body: &[u8]) -> Result<Option<RepoMessage>, IndexerError> {
    let decode_err =
        |e: serde_ipld_dagcbor::DecodeError<std::convert::Infallible>| -> IndexerError {
            IndexerError::InvalidRecord(format!("{}{} body: {}", NSID, t, e))
        };

    let message = match t {
        "#commit" => RepoMessage::Commit(serde_ipld_dagcbor::from_slice(body).map_err(decode_err)?),
        "#handle" => RepoMessage::Handle(serde_ipld_dagcbor::from_slice(body).map_err(decode_err)?),
        "#identity" => {
            RepoMessage::Identity(serde_ipld_dagcbor::from_slice(body).map_err(decode_err)?)
        }
        "#tombstone" => {
            RepoMessage::Tombstone(serde_ipld_dagcbor::from_slice(body).map_err(decode_err)?)
        }
        "#account" => {
            RepoMessage::Account(serde_ipld_dagcbor::from_slice(body).map_err(decode_err)?)
        }
        "#info" => RepoMessage::Info(serde_ipld_dagcbor::from_slice(body).map_err(decode_err)?),
        _ => return Ok(None),
    };

    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commit_body() {
        let commit = Commit {
            seq: 42,
            rebase: false,
            too_big: false,
            repo: "did:plc:alice".to_string(),
            rev: "3jt5".to_string(),
            since: None,
            blocks: vec![],
            ops: vec![RepoOperation {
                action: "create".to_string(),
                path: "app.bsky.feed.post/3k".to_string(),
                cid: None,
            }],
            time: Utc::now(),
        };
        let body = serde_ipld_dagcbor::to_vec(&commit).unwrap();

        let parsed = parse_message("#commit", &body).unwrap().unwrap();
        assert_eq!(parsed.seq(), Some(42));
        match parsed {
            RepoMessage::Commit(c) => {
                assert_eq!(c.repo, "did:plc:alice");
                assert_eq!(c.ops.len(), 1);
                assert_eq!(c.ops[0].action, "create");
            }
            other => panic!("expected commit, got {}", other.kind()),
        }
    }

    #[test]
    fn parses_handle_and_tombstone() {
        let handle = Handle {
            seq: 7,
            did: "did:plc:bob".to_string(),
            handle: "bob.example.com".to_string(),
            time: Utc::now(),
        };
        let body = serde_ipld_dagcbor::to_vec(&handle).unwrap();
        let parsed = parse_message("#handle", &body).unwrap().unwrap();
        assert_eq!(parsed.kind(), "#handle");

        let tombstone = Tombstone {
            seq: 8,
            did: "did:plc:bob".to_string(),
            time: Utc::now(),
        };
        let body = serde_ipld_dagcbor::to_vec(&tombstone).unwrap();
        let parsed = parse_message("#tombstone", &body).unwrap().unwrap();
        assert_eq!(parsed.seq(), Some(8));
    }

    #[test]
    fn unknown_fragment_is_skipped() {
        assert!(parse_message("#sync", &[0xa0]).unwrap().is_none());
    }

    #[test]
    fn invalid_body_is_rejected() {
        let err = parse_message("#commit", &[0xff, 0x00]).unwrap_err();
        assert!(matches!(err, IndexerError::InvalidRecord(_)));
    }
}
