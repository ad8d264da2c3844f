//! # Identifiers
//!
//! Strongly typed identifiers for the entities the services traffic in:
//! profiles, groups, posts, post IVs, and public keys.
//!
//! Each identifier has a canonical text form, `tag:segment/.../segment`,
//! and parsing is the exact inverse of formatting. Only the trailing
//! segment may itself contain `/`.

use crate::Result;
use crate::SerializationError;

/// A profile on one social network. Text form: `profile:<network>/<user>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProfileIdentifier {
    pub network: String,
    pub user: String,
}

impl ProfileIdentifier {
    pub fn new(network: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            user: user.into(),
        }
    }
}

impl std::fmt::Display for ProfileIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "profile:{}/{}", self.network, self.user)
    }
}

/// A user group on one social network. Text form: `group:<network>/<group>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupIdentifier {
    pub network: String,
    pub group: String,
}

impl GroupIdentifier {
    pub fn new(network: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            group: group.into(),
        }
    }
}

impl std::fmt::Display for GroupIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "group:{}/{}", self.network, self.group)
    }
}

/// A post authored by a profile. Text form: `post:<network>/<user>/<post>`.
///
/// **Invariant**: the author's `network` and `user` must not contain `/`;
/// the post segment may.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PostIdentifier {
    pub profile: ProfileIdentifier,
    pub post: String,
}

impl PostIdentifier {
    pub fn new(profile: ProfileIdentifier, post: impl Into<String>) -> Self {
        Self {
            profile,
            post: post.into(),
        }
    }
}

impl std::fmt::Display for PostIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "post:{}/{}/{}",
            self.profile.network, self.profile.user, self.post
        )
    }
}

/// The initialization vector that locates an encrypted post.
/// Text form: `post-iv:<network>/<iv>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PostIvIdentifier {
    pub network: String,
    pub iv: String,
}

impl PostIvIdentifier {
    pub fn new(network: impl Into<String>, iv: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            iv: iv.into(),
        }
    }
}

impl std::fmt::Display for PostIvIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "post-iv:{}/{}", self.network, self.iv)
    }
}

/// An elliptic-curve public key. Text form: `key:<curve>/<encoded>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyIdentifier {
    pub curve: String,
    pub encoded: String,
}

impl KeyIdentifier {
    pub fn new(curve: impl Into<String>, encoded: impl Into<String>) -> Self {
        Self {
            curve: curve.into(),
            encoded: encoded.into(),
        }
    }
}

impl std::fmt::Display for KeyIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "key:{}/{}", self.curve, self.encoded)
    }
}

/// Any identifier kind, as carried inside a [`crate::Value`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Identifier {
    Profile(ProfileIdentifier),
    Group(GroupIdentifier),
    Post(PostIdentifier),
    PostIv(PostIvIdentifier),
    Key(KeyIdentifier),
}

impl Identifier {
    /// Canonical text form, suitable for the wire.
    pub fn to_text(&self) -> String {
        self.to_string()
    }

    /// Parses a canonical text form back into an identifier.
    ///
    /// This is the exact inverse of [`Identifier::to_text`].
    pub fn from_text(text: &str) -> Result<Self> {
        let malformed = || SerializationError::BadIdentifier(text.to_string());
        let (tag, body) = text.split_once(':').ok_or_else(malformed)?;
        match tag {
            "profile" => {
                let (network, user) = body.split_once('/').ok_or_else(malformed)?;
                Ok(Identifier::Profile(ProfileIdentifier::new(network, user)))
            }
            "group" => {
                let (network, group) = body.split_once('/').ok_or_else(malformed)?;
                Ok(Identifier::Group(GroupIdentifier::new(network, group)))
            }
            "post" => {
                let mut parts = body.splitn(3, '/');
                let network = parts.next().ok_or_else(malformed)?;
                let user = parts.next().ok_or_else(malformed)?;
                let post = parts.next().ok_or_else(malformed)?;
                let profile = ProfileIdentifier::new(network, user);
                Ok(Identifier::Post(PostIdentifier::new(profile, post)))
            }
            "post-iv" => {
                let (network, iv) = body.split_once('/').ok_or_else(malformed)?;
                Ok(Identifier::PostIv(PostIvIdentifier::new(network, iv)))
            }
            "key" => {
                let (curve, encoded) = body.split_once('/').ok_or_else(malformed)?;
                Ok(Identifier::Key(KeyIdentifier::new(curve, encoded)))
            }
            _ => Err(malformed()),
        }
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Identifier::Profile(id) => write!(f, "{}", id),
            Identifier::Group(id) => write!(f, "{}", id),
            Identifier::Post(id) => write!(f, "{}", id),
            Identifier::PostIv(id) => write!(f, "{}", id),
            Identifier::Key(id) => write!(f, "{}", id),
        }
    }
}

impl From<ProfileIdentifier> for Identifier {
    fn from(id: ProfileIdentifier) -> Self {
        Identifier::Profile(id)
    }
}

impl From<GroupIdentifier> for Identifier {
    fn from(id: GroupIdentifier) -> Self {
        Identifier::Group(id)
    }
}

impl From<PostIdentifier> for Identifier {
    fn from(id: PostIdentifier) -> Self {
        Identifier::Post(id)
    }
}

impl From<PostIvIdentifier> for Identifier {
    fn from(id: PostIvIdentifier) -> Self {
        Identifier::PostIv(id)
    }
}

impl From<KeyIdentifier> for Identifier {
    fn from(id: KeyIdentifier) -> Self {
        Identifier::Key(id)
    }
}
