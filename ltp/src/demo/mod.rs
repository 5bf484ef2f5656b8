//! Thin, ambient stand-ins for the bundle layer above LTP. None of this
//! parses or understands bundles; it exists so tests and the CLI have
//! something block-shaped to hand the engine.

pub mod bundle;
