mod safe;
#[allow(dead_code)]
mod unaligned;

pub use safe::Core;
