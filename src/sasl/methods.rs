use std::{fmt, str::FromStr};

/// Abstract operations a host can ask the engine to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    ClearText,
    NativeClearTextOk,
    NativeNoClearText,
    Apop,
    SmbNtResponse,
    SmbLanManager,
    MsChap2,
    CramMd5Relay,
    TwoWayRandom,
    SetPassword,
    SetPasswordAsRoot,
    ChangePassword,
    NewUser,
    DeleteUser,
    GetPolicy,
    GetEffectivePolicy,
    SetPolicy,
    GetUserData,
    SetUserData,
    MppeKeys,
    GetGlobalPolicy,
    SetGlobalPolicy,
    GetIdByName,
    ListReplicas,
    SyncPull,
    SyncPush,
    SyncProcess,
    SyncSetupReplica,
}

/// How the engine drives a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    /// The engine computes the exchange from the caller's secret.
    Credential,
    /// The caller already holds a challenge and its response.
    Relay,
    /// The caller answers each server challenge through a continuation.
    Interactive,
    /// Needs an authenticated administrator, then issues one command.
    Administrative,
    /// No negotiation at all; only a validated connection.
    Bypass,
}

/// Static facts about a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodInfo {
    pub mechanism: Option<&'static str>,
    pub kind: MethodKind,
    /// A successful exchange leaves the connection authenticated.
    pub establishes_session: bool,
    pub can_set_password: bool,
}

pub const DIGEST_MD5: &str = "DIGEST-MD5";
pub const CRAM_MD5: &str = "CRAM-MD5";
pub const PLAIN: &str = "PLAIN";
pub const TWO_WAY_RANDOM: &str = "TWOWAYRANDOM";

const fn entry(
    mechanism: Option<&'static str>,
    kind: MethodKind,
    establishes_session: bool,
    can_set_password: bool,
) -> MethodInfo {
    MethodInfo {
        mechanism,
        kind,
        establishes_session,
        can_set_password,
    }
}

impl AuthMethod {
    pub const ALL: [AuthMethod; 28] = [
        AuthMethod::ClearText,
        AuthMethod::NativeClearTextOk,
        AuthMethod::NativeNoClearText,
        AuthMethod::Apop,
        AuthMethod::SmbNtResponse,
        AuthMethod::SmbLanManager,
        AuthMethod::MsChap2,
        AuthMethod::CramMd5Relay,
        AuthMethod::TwoWayRandom,
        AuthMethod::SetPassword,
        AuthMethod::SetPasswordAsRoot,
        AuthMethod::ChangePassword,
        AuthMethod::NewUser,
        AuthMethod::DeleteUser,
        AuthMethod::GetPolicy,
        AuthMethod::GetEffectivePolicy,
        AuthMethod::SetPolicy,
        AuthMethod::GetUserData,
        AuthMethod::SetUserData,
        AuthMethod::MppeKeys,
        AuthMethod::GetGlobalPolicy,
        AuthMethod::SetGlobalPolicy,
        AuthMethod::GetIdByName,
        AuthMethod::ListReplicas,
        AuthMethod::SyncPull,
        AuthMethod::SyncPush,
        AuthMethod::SyncProcess,
        AuthMethod::SyncSetupReplica,
    ];

    /// The mechanism map.
    pub const fn info(self) -> MethodInfo {
        use AuthMethod::*;
        use MethodKind::*;

        match self {
            ClearText => entry(Some(DIGEST_MD5), Credential, true, true),
            NativeClearTextOk => entry(Some(PLAIN), Credential, true, true),
            NativeNoClearText => entry(Some(CRAM_MD5), Credential, true, false),
            Apop => entry(Some("APOP"), Relay, false, false),
            SmbNtResponse => entry(Some("SMB-NT"), Relay, false, false),
            SmbLanManager => entry(Some("SMB-LAN-MANAGER"), Relay, false, false),
            MsChap2 => entry(Some("MS-CHAPv2"), Relay, false, false),
            CramMd5Relay => entry(Some(CRAM_MD5), Relay, false, false),
            TwoWayRandom => entry(Some(TWO_WAY_RANDOM), Interactive, true, false),
            SetPassword | SetPasswordAsRoot | ChangePassword | NewUser => {
                entry(Some(DIGEST_MD5), Administrative, true, true)
            }
            DeleteUser | GetPolicy | GetEffectivePolicy | SetPolicy | GetUserData
            | SetUserData | MppeKeys | SetGlobalPolicy => {
                entry(Some(DIGEST_MD5), Administrative, true, false)
            }
            GetGlobalPolicy | GetIdByName | ListReplicas | SyncPull | SyncPush | SyncProcess
            | SyncSetupReplica => entry(None, Bypass, false, false),
        }
    }

    pub fn name(self) -> &'static str {
        use AuthMethod::*;

        match self {
            ClearText => "clear-text",
            NativeClearTextOk => "native-clear-text-ok",
            NativeNoClearText => "native-no-clear-text",
            Apop => "apop",
            SmbNtResponse => "smb-nt",
            SmbLanManager => "smb-lan-manager",
            MsChap2 => "ms-chap2",
            CramMd5Relay => "cram-md5-relay",
            TwoWayRandom => "two-way-random",
            SetPassword => "set-password",
            SetPasswordAsRoot => "set-password-as-root",
            ChangePassword => "change-password",
            NewUser => "new-user",
            DeleteUser => "delete-user",
            GetPolicy => "get-policy",
            GetEffectivePolicy => "get-effective-policy",
            SetPolicy => "set-policy",
            GetUserData => "get-user-data",
            SetUserData => "set-user-data",
            MppeKeys => "mppe-keys",
            GetGlobalPolicy => "get-global-policy",
            SetGlobalPolicy => "set-global-policy",
            GetIdByName => "get-id-by-name",
            ListReplicas => "list-replicas",
            SyncPull => "sync-pull",
            SyncPush => "sync-push",
            SyncProcess => "sync-process",
            SyncSetupReplica => "sync-setup-replica",
        }
    }

    /// Methods that may ride on an earlier administrator authentication
    /// when nothing is configured explicitly.
    pub fn default_reuse_allow_list() -> Vec<AuthMethod> {
        use AuthMethod::*;

        vec![
            SetPassword,
            SetPasswordAsRoot,
            NewUser,
            DeleteUser,
            GetPolicy,
            GetEffectivePolicy,
            SetPolicy,
            GetUserData,
            SetUserData,
            SetGlobalPolicy,
        ]
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AuthMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AuthMethod::ALL
            .iter()
            .copied()
            .find(|m| m.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown auth method '{s}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for method in AuthMethod::ALL {
            assert_eq!(method.name().parse::<AuthMethod>().unwrap(), method);
        }
    }

    #[test]
    #[should_panic(expected = "unknown auth method")]
    fn unknown_name() {
        "kerberos".parse::<AuthMethod>().unwrap();
    }

    #[test]
    fn map_entries() {
        assert_eq!(AuthMethod::ClearText.info().mechanism, Some(DIGEST_MD5));
        assert!(AuthMethod::ClearText.info().can_set_password);
        assert_eq!(AuthMethod::NativeNoClearText.info().mechanism, Some(CRAM_MD5));
        assert_eq!(AuthMethod::ListReplicas.info().kind, MethodKind::Bypass);
        assert_eq!(AuthMethod::SyncPull.info().mechanism, None);
        assert_eq!(AuthMethod::MsChap2.info().kind, MethodKind::Relay);
        assert!(!AuthMethod::Apop.info().establishes_session);
    }

    #[test]
    fn bypass_methods_have_no_mechanism() {
        for method in AuthMethod::ALL {
            let info = method.info();
            assert_eq!(info.kind == MethodKind::Bypass, info.mechanism.is_none());
        }
    }
}
