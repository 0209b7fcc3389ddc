//
// Copyright (c) The Egressd Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, HashMap};
use std::future::Future;

use derive_new::new;

use crate::error::Error;

/// A resolved identity: a numeric id and the label set it stands for.
#[derive(Clone, Debug, Eq, PartialEq, new)]
pub struct Identity {
    pub id: u64,
    pub labels: BTreeMap<String, String>,
}

/// Seam to the identity resolution service.
///
/// Both operations may take a while on a cold cluster; callers bound them
/// with a timeout.
pub trait IdentityResolver: Send + Sync + 'static {
    /// Completes once the initial global identity set has been loaded.
    fn wait_for_initial_identities(
        &self,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Resolves a numeric identity into its label set.
    fn lookup_identity_by_id(
        &self,
        id: u64,
    ) -> impl Future<Output = Option<Identity>> + Send;
}

/// Identity resolver backed by a static table, for standalone deployments
/// where identities are part of the daemon configuration.
#[derive(Debug, Default)]
pub struct StaticResolver {
    identities: HashMap<u64, Identity>,
}

// ===== impl StaticResolver =====

impl StaticResolver {
    pub fn new(
        identities: impl IntoIterator<Item = Identity>,
    ) -> StaticResolver {
        StaticResolver {
            identities: identities
                .into_iter()
                .map(|identity| (identity.id, identity))
                .collect(),
        }
    }
}

impl IdentityResolver for StaticResolver {
    async fn wait_for_initial_identities(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn lookup_identity_by_id(&self, id: u64) -> Option<Identity> {
        self.identities.get(&id).cloned()
    }
}
