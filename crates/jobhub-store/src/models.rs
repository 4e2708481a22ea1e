use std::borrow::Cow;

use jobhub_types::UserId;

/// Keys the web client writes to local storage. Kept byte-compatible so a
/// store exported from the browser can be imported as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKey {
    AccessToken,
    /// Written by the login flow.
    UserId,
    /// Written by older builds of the profile page.
    UserIdLegacy,
    LastChatOpen(UserId),
    Language,
}

impl StorageKey {
    pub fn as_str(&self) -> Cow<'static, str> {
        match self {
            Self::AccessToken => Cow::Borrowed("access_token"),
            Self::UserId => Cow::Borrowed("user_id"),
            Self::UserIdLegacy => Cow::Borrowed("userId"),
            Self::LastChatOpen(id) => Cow::Owned(format!("lastChatOpen_{}", id)),
            Self::Language => Cow::Borrowed("language"),
        }
    }
}
