//! Sharing-mode arbitration types (spec §3 `FileState`, §4.2).

/// Access a caller is requesting on open. Bitflags-shaped but kept as a
/// small struct of bools for clarity — the set is fixed and tiny.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DesiredAccess {
    pub read: bool,
    pub write: bool,
    pub delete: bool,
}

impl DesiredAccess {
    #[must_use]
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            ..Self::default()
        }
    }
}

/// Sharing a caller grants to *other* concurrent openers. A bit set means
/// "other opens with this permission are allowed to coexist with mine".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SharingMode {
    pub share_read: bool,
    pub share_write: bool,
    pub share_delete: bool,
}

impl SharingMode {
    #[must_use]
    pub fn deny_none() -> Self {
        Self {
            share_read: true,
            share_write: true,
            share_delete: true,
        }
    }

    #[must_use]
    pub fn deny_write() -> Self {
        Self {
            share_read: true,
            share_write: false,
            share_delete: true,
        }
    }

    #[must_use]
    pub fn exclusive() -> Self {
        Self::default()
    }

    /// Whether this sharing mode permits another opener to have `access`.
    #[must_use]
    fn permits(self, access: DesiredAccess) -> bool {
        (!access.read || self.share_read)
            && (!access.write || self.share_write)
            && (!access.delete || self.share_delete)
    }
}

/// Parameters a caller supplies when requesting to open a virtual path
/// (spec §4.2's `FileOpenParams`).
#[derive(Debug, Clone, Copy)]
pub struct FileOpenParams {
    pub desired_access: DesiredAccess,
    pub sharing_mode: SharingMode,
}

/// A ticket issued by the cache's sharing arbiter on a successful grant.
/// Must be returned via `FileStateCache::release_file_access` on close
/// (spec GLOSSARY).
#[derive(Debug, Clone, Copy)]
pub struct AccessToken {
    id: u64,
    pub desired_access: DesiredAccess,
    pub sharing_mode: SharingMode,
}

impl AccessToken {
    pub(crate) fn new(id: u64, params: FileOpenParams) -> Self {
        Self {
            id,
            desired_access: params.desired_access,
            sharing_mode: params.sharing_mode,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Evaluates spec §4.2's grant rule against the currently held tokens:
/// grant iff every existing token's sharing permits the incoming desired
/// access, and the incoming sharing permits every existing token's desired
/// access.
#[must_use]
pub fn can_grant(existing: &[AccessToken], incoming: &FileOpenParams) -> bool {
    existing.iter().all(|tok| {
        tok.sharing_mode.permits(incoming.desired_access)
            && incoming.sharing_mode.permits(tok.desired_access)
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn token(id: u64, access: DesiredAccess, sharing: SharingMode) -> AccessToken {
        AccessToken::new(
            id,
            FileOpenParams {
                desired_access: access,
                sharing_mode: sharing,
            },
        )
    }

    #[test]
    fn two_read_share_read_deny_write_openers_both_succeed() {
        let first = token(1, DesiredAccess::read_only(), SharingMode::deny_write());
        let incoming = FileOpenParams {
            desired_access: DesiredAccess::read_only(),
            sharing_mode: SharingMode::deny_write(),
        };
        assert!(can_grant(&[first], &incoming));
    }

    #[test]
    fn read_write_after_two_readers_is_denied() {
        let readers = vec![
            token(1, DesiredAccess::read_only(), SharingMode::deny_write()),
            token(2, DesiredAccess::read_only(), SharingMode::deny_write()),
        ];
        let incoming = FileOpenParams {
            desired_access: DesiredAccess::read_write(),
            sharing_mode: SharingMode::deny_none(),
        };
        assert!(!can_grant(&readers, &incoming));
    }

    #[test]
    fn exclusive_open_blocks_any_further_open() {
        let first = token(1, DesiredAccess::read_write(), SharingMode::exclusive());
        let incoming = FileOpenParams {
            desired_access: DesiredAccess::read_only(),
            sharing_mode: SharingMode::deny_none(),
        };
        assert!(!can_grant(&[first], &incoming));
    }

    #[test]
    fn empty_existing_set_always_grants() {
        let incoming = FileOpenParams {
            desired_access: DesiredAccess::read_write(),
            sharing_mode: SharingMode::exclusive(),
        };
        assert!(can_grant(&[], &incoming));
    }

    #[test]
    fn deny_none_sharing_allows_concurrent_read_write() {
        let first = token(1, DesiredAccess::read_write(), SharingMode::deny_none());
        let incoming = FileOpenParams {
            desired_access: DesiredAccess::read_write(),
            sharing_mode: SharingMode::deny_none(),
        };
        assert!(can_grant(&[first], &incoming));
    }
}
