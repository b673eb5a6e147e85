//! Group creation, refresh and cleanup against the ledger.

use std::sync::Arc;

use keeper_transport::key::{KeyType, MetaKey, Opcode};
use keeper_types::contract::UpKeepingInfo;
use tracing::{debug, info, warn};

use crate::group::Group;
use crate::service::Keeper;
use crate::{KeeperError, Result};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub refreshed: usize,
    pub pending: usize,
    pub dropped: usize,
}

impl Keeper {
    /// The group for a user request, created from the ledger on first contact.
    ///
    /// A group is created when the contract lists this keeper, or as a
    /// pending group while the user's query is still open.
    pub async fn load_group(&self, user_id: &str, group_id: &str) -> Result<Arc<Group>> {
        if let Some(group) = self.groups.get(group_id) {
            if group.user_id != user_id {
                return Err(KeeperError::WrongKey(format!("{user_id} does not own {group_id}")));
            }
            return Ok(group);
        }

        if let Some(contract) = self.chain.get_upkeeping(user_id, group_id).await? {
            if contract.user_id != user_id || !contract.keepers.contains(&self.id) {
                return Err(KeeperError::NotMyUser(user_id.to_string()));
            }
            let (group, created) = self.groups.get_or_create(user_id, group_id);
            if created {
                self.apply_ledger_contract(&group, contract).await;
                info!(group = %group_id, user = %user_id, "group created");
            }
            return Ok(group);
        }

        match self.chain.get_query_info(user_id, group_id).await? {
            Some(query) if !query.completed && query.user_id == user_id => {
                let (group, created) = self.groups.get_or_create(user_id, group_id);
                if created {
                    self.persist_group_logged(&group);
                    info!(group = %group_id, user = %user_id, "pending group created");
                }
                Ok(group)
            }
            _ => Err(KeeperError::NotMyUser(user_id.to_string())),
        }
    }

    /// Adopt a contract and the provider manager sets, then persist.
    async fn apply_ledger_contract(&self, group: &Group, contract: UpKeepingInfo) {
        let providers = contract.providers.clone();
        let query_id = contract.query_id.clone();
        group.apply_contract(contract);

        for provider in &providers {
            match self.chain.get_provider_keepers(provider).await {
                Ok(Some(managers)) => group.set_provider_managers(provider, managers),
                Ok(None) => {}
                Err(e) => debug!(provider = %provider, error = %e, "manager lookup failed"),
            }
        }
        match self.chain.get_root(&query_id).await {
            Ok(Some(root)) => group.set_root(Some(root)),
            Ok(None) => {}
            Err(e) => debug!(group = %group.group_id, error = %e, "root lookup failed"),
        }
        self.persist_group_logged(group);
    }

    /// Re-read every group's contract; drop groups the ledger no longer has.
    pub async fn refresh_groups(&self) -> RefreshReport {
        let mut report = RefreshReport::default();
        for group in self.groups.all() {
            if group.is_self_owned() {
                continue;
            }
            match self.chain.get_upkeeping(&group.user_id, &group.group_id).await {
                Ok(Some(contract)) => {
                    self.apply_ledger_contract(&group, contract).await;
                    report.refreshed += 1;
                }
                Ok(None) => {
                    let open = matches!(
                        self.chain.get_query_info(&group.user_id, &group.group_id).await,
                        Ok(Some(query)) if !query.completed
                    );
                    if open && group.contract().is_none() {
                        report.pending += 1;
                        continue;
                    }
                    info!(group = %group.group_id, "upkeeping absent, dropping group");
                    for provider in group.providers() {
                        let key = MetaKey::new(group.group_id.clone(), KeyType::Block)
                            .with(&group.user_id);
                        self.send_detached(Opcode::Delete, key, Vec::new(), provider);
                    }
                    self.drop_group(&group.group_id);
                    report.dropped += 1;
                }
                Err(e) => {
                    warn!(group = %group.group_id, error = %e, "group refresh failed");
                }
            }
        }
        report
    }

    /// Forget a group and its persisted state.
    pub(crate) fn drop_group(&self, group_id: &str) {
        self.groups.remove(group_id);
        match self.delete_group_state(group_id) {
            Ok(keys) => debug!(group = %group_id, keys, "group state deleted"),
            Err(e) => warn!(group = %group_id, error = %e, "group state not deleted"),
        }
    }
}
