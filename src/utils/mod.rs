//! Small internal data structures.
//!
//! Currently just the [`Slab`] used by the reactor's registration
//! registry: fast indexed storage with reuse of freed slots.

mod slab;

pub(crate) use slab::Slab;
