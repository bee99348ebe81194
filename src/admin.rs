use std::collections::HashSet;

use crate::registry::OwnerId;

/// Answers whether an owner is an administrator and should be left out of audits.
pub(crate) trait AdminPredicate: Send + Sync {
    fn is_admin(&self, owner_id: OwnerId) -> bool;
}

impl<F> AdminPredicate for F
where
    F: Fn(OwnerId) -> bool + Send + Sync,
{
    fn is_admin(&self, owner_id: OwnerId) -> bool {
        self(owner_id)
    }
}

/// Static set of administrator ids, usually taken from config.
#[derive(Debug, Clone, Default)]
pub(crate) struct AdminList {
    ids: HashSet<OwnerId>,
}

impl AdminList {
    pub(crate) fn new(ids: impl IntoIterator<Item = OwnerId>) -> Self {
        Self {
            ids: ids.into_iter().filter(|id| *id > 0).collect(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }
}

impl AdminPredicate for AdminList {
    fn is_admin(&self, owner_id: OwnerId) -> bool {
        self.ids.contains(&owner_id)
    }
}
