//! Signs canonical vote encodings and publishes the JSON to the vote store.

use alloy_primitives::Address;
use alloy_signer_local::PrivateKeySigner;
use anyhow::{Context, Result};
use serde::Serialize;
use stakepool_common::{store::VoteStore, vote};

pub struct VotePublisher {
    signer: PrivateKeySigner,
    store: VoteStore,
}

impl VotePublisher {
    pub fn new(signer: PrivateKeySigner, store: VoteStore) -> Self {
        Self { signer, store }
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Signs `encoded` and publishes the vote built from the signature under
    /// `<address>/<name>`. Returns once the object is confirmed visible.
    pub async fn publish<V, F>(&self, name: &str, encoded: &[u8], build: F) -> Result<()>
    where
        V: Serialize,
        F: FnOnce(String) -> V,
    {
        let signature = vote::sign_vote(&self.signer, encoded)?;
        let vote = build(signature);
        self.store
            .publish(self.signer.address(), name, &vote)
            .await
            .with_context(|| format!("failed to publish {name}"))
    }
}
