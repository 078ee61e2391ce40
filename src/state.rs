use crate::coordinator::Coordinator;

// app's shared state
pub struct AppState {
    pub coordinator: Coordinator,
}

impl AppState {
    pub fn new(coordinator: Coordinator) -> Self {
        Self { coordinator }
    }
}
