use parking_lot::Mutex;
use std::sync::Arc;

/// Independently lockable state, one per node entry
pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}
