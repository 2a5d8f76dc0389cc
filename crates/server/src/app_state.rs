use crate::registry::RegistryStore;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) store: RegistryStore,
}
