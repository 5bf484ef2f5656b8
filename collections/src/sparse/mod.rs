mod inner;
#[allow(dead_code)]
mod slab;

pub use ring::Ring;

pub mod ring;
