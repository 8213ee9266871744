// actor-mesh: facade crate.
//
// Re-exports the workspace members so applications depend on one crate:
// wire types (`protocol`), the runtime (`runtime`), and the state-store
// contract with its reference backends (`state`).

pub use am_protocol as protocol;
pub use am_runtime as runtime;
pub use am_state as state;
