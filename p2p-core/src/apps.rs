//! Application registry: maps (EUF-GUID, AppID) from an invitation to transfer parameters.

use std::collections::HashMap;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::header::V1Flags;
use crate::slp::SlpMessage;
use crate::transfer::TransferSetup;

pub const FILE_TRANSFER_EUF_GUID: Uuid = Uuid::from_u128(0x5D3E02AB_6190_11D3_BBBB_00C04F795683);
pub const MSN_OBJECT_EUF_GUID: Uuid = Uuid::from_u128(0xA4268EEC_FEC5_49E5_95C3_F126696BDBF6);
pub const ACTIVITY_EUF_GUID: Uuid = Uuid::from_u128(0x6A13AF9C_5308_4F35_923A_67E8DDA40C2F);

pub type AppId = u32;

/// What an accepted invitation needs to build its transfer.
#[derive(Debug, Clone)]
pub struct InviteContext {
    pub session_id: u32,
    pub call_id: Uuid,
    pub app_id: AppId,
}

pub type AppConstructor = fn(&InviteContext) -> TransferSetup;

#[derive(Clone)]
pub struct AppEntry {
    pub name: &'static str,
    pub constructor: AppConstructor,
}

impl std::fmt::Debug for AppEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppEntry").field("name", &self.name).finish()
    }
}

/// Explicit table of supported applications, built at startup and passed by reference.
#[derive(Debug, Clone, Default)]
pub struct AppRegistry {
    entries: HashMap<(Uuid, AppId), AppEntry>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// File transfer, display picture, custom emoticon and activity invitations.
    pub fn with_defaults() -> Self {
        let mut r = Self::new();
        r.register(FILE_TRANSFER_EUF_GUID, 2, "file transfer", file_transfer);
        r.register(MSN_OBJECT_EUF_GUID, 1, "display picture", msn_object);
        r.register(MSN_OBJECT_EUF_GUID, 12, "display picture", msn_object);
        r.register(MSN_OBJECT_EUF_GUID, 11, "custom emoticon", msn_object);
        r.register(ACTIVITY_EUF_GUID, 0, "activity", activity);
        r
    }

    pub fn register(&mut self, euf_guid: Uuid, app_id: AppId, name: &'static str, constructor: AppConstructor) {
        self.entries.insert((euf_guid, app_id), AppEntry { name, constructor });
    }

    pub fn lookup(&self, euf_guid: Uuid, app_id: AppId) -> Option<&AppEntry> {
        self.entries.get(&(euf_guid, app_id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Read `EUF-GUID`, `AppID` and `SessionID` from an invitation and build its transfer setup.
    pub fn resolve_invite(&self, invite: &SlpMessage) -> Result<TransferSetup> {
        let euf_guid = invite
            .body_value("EUF-GUID")
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .ok_or_else(|| Error::ProtocolViolation("invite without a valid EUF-GUID".into()))?;
        let app_id: AppId = invite
            .body_value("AppID")
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| Error::ProtocolViolation("invite without a valid AppID".into()))?;
        let session_id = invite
            .session_id()
            .ok_or_else(|| Error::ProtocolViolation("invite without a SessionID".into()))?;
        let entry = self
            .lookup(euf_guid, app_id)
            .ok_or_else(|| Error::ProtocolViolation(format!("unknown application {euf_guid} / {app_id}")))?;
        let ctx = InviteContext {
            session_id,
            call_id: invite.call_id().unwrap_or_else(Uuid::nil),
            app_id,
        };
        Ok((entry.constructor)(&ctx))
    }
}

fn file_transfer(ctx: &InviteContext) -> TransferSetup {
    TransferSetup {
        session_id: ctx.session_id,
        message_flag: V1Flags::FILE_DATA,
        footer: ctx.app_id,
        call_id: ctx.call_id,
    }
}

fn msn_object(ctx: &InviteContext) -> TransferSetup {
    TransferSetup {
        session_id: ctx.session_id,
        message_flag: V1Flags::MSN_OBJECT_DATA,
        footer: ctx.app_id,
        call_id: ctx.call_id,
    }
}

fn activity(ctx: &InviteContext) -> TransferSetup {
    TransferSetup {
        session_id: ctx.session_id,
        message_flag: V1Flags::NORMAL,
        footer: ctx.app_id,
        call_id: ctx.call_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slp::{format_guid, SESSION_REQUEST_CONTENT_TYPE};

    fn invite(euf: Uuid, app_id: u32) -> SlpMessage {
        SlpMessage::request("INVITE", "bob", "alice", Uuid::from_u128(7), 0, SESSION_REQUEST_CONTENT_TYPE)
            .with_body_value("EUF-GUID", format_guid(euf))
            .with_body_value("SessionID", "31337")
            .with_body_value("AppID", app_id.to_string())
    }

    #[test]
    fn resolves_file_transfer() {
        let registry = AppRegistry::with_defaults();
        let setup = registry.resolve_invite(&invite(FILE_TRANSFER_EUF_GUID, 2)).unwrap();
        assert_eq!(setup.session_id, 31337);
        assert_eq!(setup.message_flag, V1Flags::FILE_DATA);
        assert_eq!(setup.footer, 2);
        assert_eq!(setup.call_id, Uuid::from_u128(7));
    }

    #[test]
    fn resolves_after_wire_roundtrip() {
        let registry = AppRegistry::with_defaults();
        let parsed = SlpMessage::parse(&invite(MSN_OBJECT_EUF_GUID, 12).to_bytes()).unwrap();
        let setup = registry.resolve_invite(&parsed).unwrap();
        assert_eq!(setup.message_flag, V1Flags::MSN_OBJECT_DATA);
        assert_eq!(setup.footer, 12);
    }

    #[test]
    fn unknown_application_is_protocol_violation() {
        let registry = AppRegistry::with_defaults();
        let err = registry.resolve_invite(&invite(Uuid::new_v4(), 2)).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
        assert!(AppRegistry::new().resolve_invite(&invite(FILE_TRANSFER_EUF_GUID, 2)).is_err());
    }
}
