use fieldwatch_core::Dashboard;
use parking_lot::Mutex;
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

/// The one engine instance; every task locks it for a single step.
pub type SharedDashboard = Shared<Dashboard>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}
