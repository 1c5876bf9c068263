// =============================================================================
// User fleet — one venue client per configured account
// =============================================================================

use std::sync::Arc;

use crate::venue::VenueClient;

/// One end-user account: identity plus its own (retry-wrapped) venue client.
pub struct UserAccount {
    pub user_id: String,
    pub venue: Arc<dyn VenueClient>,
}

/// The fixed set of accounts every signal fans out to.
pub struct Fleet {
    pub users: Vec<UserAccount>,
}

impl Fleet {
    pub fn new(users: Vec<UserAccount>) -> Self {
        Self { users }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
