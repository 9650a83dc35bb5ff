//! Built-in handlers.

use crate::config::HandlerRegistry;
use crate::Error;

pub mod fetchers;
pub mod modifiers;
pub mod parsers;
pub mod receivers;

/// Registers every built-in handler into `registry`.
pub fn register_builtins(registry: &mut HandlerRegistry) -> Result<(), Error> {
    fetchers::register_builtins(registry)?;
    parsers::register_builtins(registry)?;
    modifiers::register_builtins(registry)?;
    receivers::register_builtins(registry)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn register_all_builtins() {
        let mut registry = HandlerRegistry::new();
        register_builtins(&mut registry).unwrap();
    }
}
