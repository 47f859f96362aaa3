//! Access control: roles, capabilities, bans, chat authorization and the
//! force-subscribe check.
//!
//! Every gate is a pure lookup. Roles come from the immutable configured
//! owner/admin sets, bans and authorized chats from the database, channel
//! membership from the transport through [`MembershipCheck`]. Nothing in
//! here mutates state; a rejection is just an [`AccessDenied`] value.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::config::{ChannelRef, Settings};
use crate::core::error::AppResult;
use crate::storage::{db, get_connection, DbPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    User,
    Admin,
    Owner,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::User => "user",
            Role::Admin => "admin",
            Role::Owner => "owner",
        };
        f.write_str(name)
    }
}

/// Things a command can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// /start, /help, /about, /cancel, /merge and sending media
    UseBot,
    ViewStats,
    AdminPanel,
    ModerateUsers,
    ManageChats,
    Broadcast,
}

impl Capability {
    pub fn min_role(self) -> Role {
        match self {
            Capability::UseBot => Role::User,
            Capability::ViewStats | Capability::AdminPanel | Capability::ModerateUsers | Capability::ManageChats => {
                Role::Admin
            }
            Capability::Broadcast => Role::Owner,
        }
    }
}

impl Role {
    pub fn allows(self, capability: Capability) -> bool {
        self >= capability.min_role()
    }

    pub fn is_staff(self) -> bool {
        self >= Role::Admin
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    Private,
    Group,
    Channel,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AccessDenied {
    #[error("🚫 You are banned from using this bot.")]
    Banned,

    #[error("🔒 This chat is not authorized to use the bot. Ask an admin to run /authorize here.")]
    ChatNotAuthorized { chat_id: i64 },

    #[error("📢 Please join {channel} to use this bot.")]
    NotSubscribed { channel: String },

    #[error("⛔ This command requires the {required} role.")]
    InsufficientRole { required: Role },
}

/// Channel membership lookup provided by the transport.
#[async_trait]
pub trait MembershipCheck: Send + Sync {
    async fn is_member(&self, channel: &ChannelRef, user_id: i64) -> Result<bool, String>;
}

/// Membership check for deployments without force-subscribe.
pub struct NoMembershipCheck;

#[async_trait]
impl MembershipCheck for NoMembershipCheck {
    async fn is_member(&self, _channel: &ChannelRef, _user_id: i64) -> Result<bool, String> {
        Ok(true)
    }
}

pub struct AccessControl {
    owner_id: i64,
    admin_ids: BTreeSet<i64>,
    static_chats: BTreeSet<i64>,
    force_sub: Option<ChannelRef>,
    membership: Arc<dyn MembershipCheck>,
    db_pool: Arc<DbPool>,
}

impl AccessControl {
    pub fn new(settings: &Settings, db_pool: Arc<DbPool>, membership: Arc<dyn MembershipCheck>) -> Self {
        Self {
            owner_id: settings.owner_id,
            admin_ids: settings.admin_ids.clone(),
            static_chats: settings.authorized_chats.clone(),
            force_sub: settings.force_sub_channel.clone(),
            membership,
            db_pool,
        }
    }

    pub fn role_of(&self, user_id: i64) -> Role {
        if self.is_owner(user_id) {
            Role::Owner
        } else if self.is_admin(user_id) {
            Role::Admin
        } else {
            Role::User
        }
    }

    pub fn is_owner(&self, user_id: i64) -> bool {
        user_id == self.owner_id
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.is_owner(user_id) || self.admin_ids.contains(&user_id)
    }

    pub fn force_sub_channel(&self) -> Option<&ChannelRef> {
        self.force_sub.as_ref()
    }

    pub fn is_banned(&self, user_id: i64) -> AppResult<bool> {
        let conn = get_connection(&self.db_pool)?;
        Ok(db::is_banned(&conn, user_id)?)
    }

    /// Statically configured chats count as authorized alongside the
    /// persisted set.
    pub fn is_authorized(&self, chat_id: i64) -> AppResult<bool> {
        if self.static_chats.contains(&chat_id) {
            return Ok(true);
        }
        let conn = get_connection(&self.db_pool)?;
        Ok(db::is_chat_authorized(&conn, chat_id)?)
    }

    /// Always true when force-subscribe is disabled. A failed lookup counts
    /// as "not joined".
    pub async fn has_joined_required_channel(&self, user_id: i64) -> bool {
        let Some(channel) = &self.force_sub else {
            return true;
        };
        match self.membership.is_member(channel, user_id).await {
            Ok(joined) => joined,
            Err(e) => {
                log::warn!("Membership check for user {} in {} failed: {}", user_id, channel, e);
                false
            }
        }
    }

    /// Role gate for a capability.
    pub fn require(&self, user_id: i64, capability: Capability) -> Result<Role, AccessDenied> {
        let role = self.role_of(user_id);
        if role.allows(capability) {
            Ok(role)
        } else {
            Err(AccessDenied::InsufficientRole {
                required: capability.min_role(),
            })
        }
    }

    /// Full admission check for a request that may consume resources.
    ///
    /// Order: role, ban, chat authorization, force-subscribe. Staff skip the
    /// force-subscribe check, and staff-only capabilities also work in
    /// unauthorized chats so that `/authorize` can be run there.
    pub async fn check_request(
        &self,
        user_id: i64,
        chat_id: i64,
        chat_kind: ChatKind,
        capability: Capability,
    ) -> AppResult<Role> {
        let role = self.require(user_id, capability)?;

        if !role.is_staff() && self.is_banned(user_id)? {
            log::info!("🚫 Rejected banned user {}", user_id);
            return Err(AccessDenied::Banned.into());
        }

        let staff_command = capability.min_role() >= Role::Admin;
        if chat_kind != ChatKind::Private && !staff_command && !self.is_authorized(chat_id)? {
            log::info!("🔒 Rejected request from unauthorized chat {}", chat_id);
            return Err(AccessDenied::ChatNotAuthorized { chat_id }.into());
        }

        if !role.is_staff() && !self.has_joined_required_channel(user_id).await {
            let channel = self.force_sub.as_ref().map(|c| c.to_string()).unwrap_or_default();
            return Err(AccessDenied::NotSubscribed { channel }.into());
        }

        Ok(role)
    }
}
