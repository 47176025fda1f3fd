//! Logging init. A bare-metal kernel would print over a UART console;
//! a hosted build instead has a home for the `log` facade.

use once_cell::sync::OnceCell;

static INIT: OnceCell<()> = OnceCell::new();

/// Initializes the global logger exactly once. Safe to call repeatedly
/// (from every test's setup, for instance); only the first call has any
/// effect.
pub fn init() {
    INIT.get_or_init(|| {
        let _ = env_logger::builder().is_test(cfg!(test)).try_init();
    });
}
