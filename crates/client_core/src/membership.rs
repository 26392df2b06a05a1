use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use shared::domain::{GroupId, GroupRecord, MembershipState, UserId};
use shared::error::CoreError;
use tracing::{info, warn};

use store::{decode, Store, StoreSubscription};

use crate::paths;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    Left,
    /// The caller was the last member; the group and its messages are gone.
    GroupDeleted,
}

/// Group membership actions and the admin invariant behind them: a group
/// with members always keeps at least one admin. The store itself enforces
/// nothing; every mutation goes through here.
pub struct MembershipGuard {
    store: Arc<dyn Store>,
}

impl MembershipGuard {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn load_group(&self, group_id: &GroupId) -> Result<GroupRecord, CoreError> {
        let snapshot = self.store.read_once(&paths::group(group_id)).await?;
        decode::<GroupRecord>(&snapshot)?
            .ok_or_else(|| CoreError::not_found(format!("group {group_id}")))
    }

    /// Watch one user's membership in a group. Emits the current state
    /// first, then deduplicated changes; `Absent` after membership means
    /// the user was removed and their view must shut down.
    pub async fn watch(&self, group_id: &GroupId, user_id: &UserId) -> MembershipWatch {
        let subscription = self
            .store
            .subscribe(&paths::group_member(group_id, user_id))
            .await;
        MembershipWatch {
            subscription,
            last: None,
        }
    }

    /// Leave a group. A sole admin cannot abandon remaining members; the
    /// last member leaving deletes the group, messages first so no
    /// orphaned log outlives its group record.
    pub async fn leave_group(
        &self,
        group_id: &GroupId,
        user_id: &UserId,
    ) -> Result<LeaveOutcome, CoreError> {
        let group = self.load_group(group_id).await?;
        match group.membership_of(user_id) {
            MembershipState::Absent => {
                return Err(CoreError::validation("not a member of this group"))
            }
            MembershipState::Admin
                if group.member_count() > 1 && group.admin_count_excluding(user_id) == 0 =>
            {
                return Err(CoreError::validation(
                    "promote another member to admin before leaving",
                ));
            }
            _ => {}
        }

        if group.member_count() == 1 {
            self.store.remove(&paths::group_messages(group_id)).await?;
            self.store.remove(&paths::group(group_id)).await?;
            info!(group_id = %group_id, "membership: last member left, group deleted");
            return Ok(LeaveOutcome::GroupDeleted);
        }

        self.store
            .remove(&paths::group_member(group_id, user_id))
            .await?;
        info!(group_id = %group_id, user_id = %user_id, "membership: left group");
        Ok(LeaveOutcome::Left)
    }

    pub async fn promote(
        &self,
        group_id: &GroupId,
        actor: &UserId,
        target: &UserId,
    ) -> Result<(), CoreError> {
        let group = self.require_admin(group_id, actor).await?;
        if group.membership_of(target) == MembershipState::Absent {
            return Err(CoreError::not_found(format!("member {target}")));
        }
        self.store
            .write(&paths::group_member(group_id, target), json!(true))
            .await?;
        info!(group_id = %group_id, target = %target, "membership: promoted to admin");
        Ok(())
    }

    /// Refused when it would leave a populated group with no admin.
    pub async fn demote(
        &self,
        group_id: &GroupId,
        actor: &UserId,
        target: &UserId,
    ) -> Result<(), CoreError> {
        let group = self.require_admin(group_id, actor).await?;
        if group.membership_of(target) != MembershipState::Admin {
            return Err(CoreError::validation("target is not an admin"));
        }
        if group.member_count() > 1 && group.admin_count_excluding(target) == 0 {
            return Err(CoreError::validation(
                "a group with members needs at least one admin",
            ));
        }
        self.store
            .write(&paths::group_member(group_id, target), json!(false))
            .await?;
        Ok(())
    }

    /// Self-removal goes through `leave_group` so the admin invariant
    /// applies.
    pub async fn remove_member(
        &self,
        group_id: &GroupId,
        actor: &UserId,
        target: &UserId,
    ) -> Result<(), CoreError> {
        if actor == target {
            return Err(CoreError::validation("use leave_group to remove yourself"));
        }
        let group = self.require_admin(group_id, actor).await?;
        if group.membership_of(target) == MembershipState::Absent {
            return Err(CoreError::not_found(format!("member {target}")));
        }
        self.store
            .remove(&paths::group_member(group_id, target))
            .await?;
        info!(group_id = %group_id, target = %target, "membership: member removed");
        Ok(())
    }

    /// New members join as non-admins; existing members keep their role.
    pub async fn add_members(
        &self,
        group_id: &GroupId,
        actor: &UserId,
        new_members: &[UserId],
    ) -> Result<(), CoreError> {
        let group = self.require_admin(group_id, actor).await?;
        let mut children = HashMap::new();
        for member in new_members {
            if group.membership_of(member) == MembershipState::Absent {
                children.insert(member.as_str().to_string(), Value::Bool(false));
            }
        }
        if children.is_empty() {
            return Ok(());
        }
        let added = children.len();
        self.store
            .update(&paths::group_members(group_id), children)
            .await?;
        info!(group_id = %group_id, added, "membership: members added");
        Ok(())
    }

    async fn require_admin(
        &self,
        group_id: &GroupId,
        actor: &UserId,
    ) -> Result<GroupRecord, CoreError> {
        let group = self.load_group(group_id).await?;
        if !group.is_admin(actor) {
            return Err(CoreError::validation("admin privileges required"));
        }
        Ok(group)
    }
}

/// Stream of one user's membership state in one group.
pub struct MembershipWatch {
    subscription: StoreSubscription,
    last: Option<MembershipState>,
}

impl MembershipWatch {
    pub async fn next(&mut self) -> Option<MembershipState> {
        while let Some(snapshot) = self.subscription.recv().await {
            let state = match snapshot {
                Value::Null => MembershipState::Absent,
                Value::Bool(true) => MembershipState::Admin,
                Value::Bool(false) => MembershipState::Member,
                other => {
                    warn!(?other, "membership: unexpected member flag shape");
                    continue;
                }
            };
            if self.last == Some(state) {
                continue;
            }
            self.last = Some(state);
            return Some(state);
        }
        None
    }
}
