pub mod evaluate;
pub mod refine;
