//! Small elementwise/reduction layers.

pub mod argmax;
pub mod argmin;
pub mod one_hot;

pub use argmax::Argmax;
pub use argmin::Argmin;
pub use one_hot::OneHot;
