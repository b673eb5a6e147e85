//! Structured request keys.
//!
//! Every resource a Keeper reads, writes or deletes, locally or on a peer, is
//! named by `<mainID>/<typeTag>/<option1>/<option2>/...`. Handlers dispatch
//! purely on the type tag plus the [`Opcode`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::TransportError;

/// Operation requested on a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Opcode {
    Get,
    Put,
    Delete,
}

/// Resource type named by the second key segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    /// Challenge issued to a provider.
    Challenge,
    /// Proof answering a challenge.
    Proof,
    /// Where a block is stored and up to which segment.
    BlockPos,
    /// Bucket layout and stripe count.
    Bucket,
    /// Repair request for one block.
    Repair,
    /// Request to co-sign a payment.
    Sign,
    /// A co-signature returned to the master.
    Signature,
    /// Storage usage statistics.
    Storage,
    /// User session heartbeat.
    Session,
    /// Provider admission for a new user.
    Providers,
    /// Stored block data, only ever deleted by a Keeper.
    Block,
    /// A user's proof-verification public key.
    PublicKey,
    /// Persisted group membership.
    Group,
    /// Persisted challenge history.
    ChalHistory,
    /// Persisted last payment.
    LastPay,
    /// Persisted keeper identity.
    Identity,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Challenge => "chal",
            Self::Proof => "proof",
            Self::BlockPos => "blockpos",
            Self::Bucket => "bucket",
            Self::Repair => "repair",
            Self::Sign => "sign",
            Self::Signature => "signature",
            Self::Storage => "storage",
            Self::Session => "session",
            Self::Providers => "providers",
            Self::Block => "block",
            Self::PublicKey => "pubkey",
            Self::Group => "group",
            Self::ChalHistory => "chalhistory",
            Self::LastPay => "lastpay",
            Self::Identity => "identity",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        let key_type = match tag {
            "chal" => Self::Challenge,
            "proof" => Self::Proof,
            "blockpos" => Self::BlockPos,
            "bucket" => Self::Bucket,
            "repair" => Self::Repair,
            "sign" => Self::Sign,
            "signature" => Self::Signature,
            "storage" => Self::Storage,
            "session" => Self::Session,
            "providers" => Self::Providers,
            "block" => Self::Block,
            "pubkey" => Self::PublicKey,
            "group" => Self::Group,
            "chalhistory" => Self::ChalHistory,
            "lastpay" => Self::LastPay,
            "identity" => Self::Identity,
            _ => return None,
        };
        Some(key_type)
    }
}

/// A parsed structured key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MetaKey {
    pub main_id: String,
    pub key_type: KeyType,
    pub options: Vec<String>,
}

impl MetaKey {
    pub fn new(main_id: impl Into<String>, key_type: KeyType) -> Self {
        Self {
            main_id: main_id.into(),
            key_type,
            options: Vec::new(),
        }
    }

    /// Append an option segment.
    pub fn with(mut self, option: impl ToString) -> Self {
        self.options.push(option.to_string());
        self
    }

    /// Option segment at `index`, if present.
    pub fn option(&self, index: usize) -> Option<&str> {
        self.options.get(index).map(String::as_str)
    }

    /// The `<mainID>/<typeTag>/` prefix shared by all keys of this type.
    pub fn type_prefix(main_id: &str, key_type: KeyType) -> String {
        format!("{main_id}/{}/", key_type.as_str())
    }
}

impl fmt::Display for MetaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.main_id, self.key_type.as_str())?;
        for option in &self.options {
            write!(f, "/{option}")?;
        }
        Ok(())
    }
}

impl FromStr for MetaKey {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        let main_id = parts
            .next()
            .filter(|m| !m.is_empty())
            .ok_or_else(|| TransportError::MalformedKey(s.to_string()))?;
        let key_type = parts
            .next()
            .and_then(KeyType::from_tag)
            .ok_or_else(|| TransportError::MalformedKey(s.to_string()))?;
        let options: Vec<String> = parts.map(str::to_string).collect();
        if options.iter().any(String::is_empty) {
            return Err(TransportError::MalformedKey(s.to_string()));
        }
        Ok(Self {
            main_id: main_id.to_string(),
            key_type,
            options,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_and_parse() {
        let key = MetaKey::new("q1", KeyType::Proof).with("p1").with(1700);
        assert_eq!(key.to_string(), "q1/proof/p1/1700");
        let parsed: MetaKey = "q1/proof/p1/1700".parse().expect("parse");
        assert_eq!(parsed, key);
        assert_eq!(parsed.option(1), Some("1700"));
        assert_eq!(parsed.option(2), None);
    }

    #[test]
    fn test_key_without_options() {
        let parsed: MetaKey = "u1/session".parse().expect("parse");
        assert_eq!(parsed.key_type, KeyType::Session);
        assert!(parsed.options.is_empty());
    }

    #[test]
    fn test_rejects_unknown_tag_and_empty_segments() {
        assert!("q1/nope/x".parse::<MetaKey>().is_err());
        assert!("/proof/x".parse::<MetaKey>().is_err());
        assert!("q1".parse::<MetaKey>().is_err());
        assert!("q1/proof//x".parse::<MetaKey>().is_err());
    }

    #[test]
    fn test_every_tag_roundtrips() {
        let all = [
            KeyType::Challenge,
            KeyType::Proof,
            KeyType::BlockPos,
            KeyType::Bucket,
            KeyType::Repair,
            KeyType::Sign,
            KeyType::Signature,
            KeyType::Storage,
            KeyType::Session,
            KeyType::Providers,
            KeyType::Block,
            KeyType::PublicKey,
            KeyType::Group,
            KeyType::ChalHistory,
            KeyType::LastPay,
            KeyType::Identity,
        ];
        for key_type in all {
            assert_eq!(KeyType::from_tag(key_type.as_str()), Some(key_type));
        }
    }

    #[test]
    fn test_type_prefix() {
        assert_eq!(MetaKey::type_prefix("k1", KeyType::Group), "k1/group/");
    }
}
