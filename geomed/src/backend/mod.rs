//! Database access, data loaders and notifications.

pub mod error;
pub mod loader;
pub mod notify;
pub mod status;

pub use error::Error;
pub use notify::Listener;
pub use status::{LoadRequest, Status, Store};

use once_cell::sync::OnceCell;

use crate::config::config;

static STORE: OnceCell<Store> = OnceCell::new();

/// Process-wide status store, built from the current configuration
/// on first use. The pool it owns stays in this process.
pub fn store() -> Result<&'static Store, Error> {
    STORE.get_or_try_init(|| Store::new(&config()))
}
