//! # Domain Models
//!
//! Rows the task engine reads and writes: contacts and their sessions, the
//! contact fires that drive timers and campaigns, outgoing messages and calls,
//! broadcasts and flow starts, and the per-org configuration loaded into
//! [`crate::services::assets::OrgAssets`].
//!
//! Ids are `i64` newtypes. Status columns are stored as single-character
//! codes; the enums below convert to and from them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Raised when a stored code or id cannot be parsed
#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid {kind} value: {value}")]
pub struct CodeError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord,
            Serialize, Deserialize, sqlx::Type,
        )]
        #[serde(transparent)]
        #[sqlx(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl FromStr for $name {
            type Err = CodeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim().parse::<i64>().map(Self).map_err(|_| CodeError {
                    kind: stringify!($name),
                    value: s.to_string(),
                })
            }
        }
    };
}

macro_rules! coded_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $code:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, ::serde::Serialize, ::serde::Deserialize,
        )]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Single-character database code
            pub fn code(&self) -> &'static str {
                match self {
                    $(Self::$variant => $code),+
                }
            }

            pub fn from_code(code: &str) -> Option<Self> {
                match code.trim() {
                    $($code => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = $crate::models::CodeError;

            fn try_from(code: String) -> Result<Self, Self::Error> {
                Self::from_code(&code).ok_or($crate::models::CodeError {
                    kind: stringify!($name),
                    value: code,
                })
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.code())
            }
        }
    };
}

pub(crate) use coded_enum;

pub mod broadcast;
pub mod call;
pub mod campaign;
pub mod channel;
pub mod contact;
pub mod contact_fire;
pub mod flow;
pub mod flow_start;
pub mod group;
pub mod incident;
pub mod msg;
pub mod org;
pub mod recipients;
pub mod session;

pub use broadcast::{BatchStatus, Broadcast};
pub use call::{Call, CallStatus};
pub use campaign::{CampaignPoint, StartMode};
pub use channel::Channel;
pub use contact::{Contact, ContactStatus};
pub use contact_fire::{ContactFire, FireType, NewContactFire};
pub use flow::Flow;
pub use flow_start::FlowStart;
pub use group::{Group, GroupStatus};
pub use incident::Incident;
pub use msg::{Msg, MsgStatus};
pub use org::Org;
pub use recipients::{Exclusions, Recipients};
pub use session::{Session, SessionStatus};

id_type!(
    /// Tenant id, also the fairness key of every queued task
    OrgId
);
id_type!(ContactId);
id_type!(FlowId);
id_type!(GroupId);
id_type!(ChannelId);
id_type!(MsgId);
id_type!(CallId);
id_type!(PointId);
id_type!(BroadcastId);
id_type!(StartId);
id_type!(IncidentId);
id_type!(FireId);
