//! Credentials carried by thread groups

use crate::spec::Capabilities;
use serde::{Deserialize, Serialize};

/// User id in the root user namespace.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kuid(pub u32);

/// Group id in the root user namespace.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kgid(pub u32);

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub kuid: Kuid,
    pub kgid: Kgid,
    pub extra_kgids: Vec<Kgid>,
    pub capabilities: Option<Capabilities>,
}

impl Credentials {
    /// Root credentials: uid 0, gid 0, all declared capabilities.
    pub fn root() -> Credentials {
        Credentials::default()
    }

    pub fn user(
        kuid: Kuid,
        kgid: Kgid,
        extra_kgids: Vec<Kgid>,
        capabilities: Option<Capabilities>,
    ) -> Credentials {
        Credentials {
            kuid,
            kgid,
            extra_kgids,
            capabilities,
        }
    }

    pub fn is_root(&self) -> bool {
        self.kuid.0 == 0
    }
}
