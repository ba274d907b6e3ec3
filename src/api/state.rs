use crate::lifecycle::Monitor;
use crate::props::PropertyStore;
use crate::storage::Dao;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub dao: Dao,
    pub props: PropertyStore,
    pub monitor: Arc<Monitor>,
}
