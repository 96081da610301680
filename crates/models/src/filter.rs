use crate::{MigrationState, StoreClass};

/// MigrationFilter narrows the Control API's `list` operation (§6). All
/// fields are conjunctive; `None` leaves that dimension unconstrained.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct MigrationFilter {
    pub store_class: Option<StoreClass>,
    pub state: Option<MigrationState>,
}
