pub mod executor;
pub mod rules;
pub mod translate;
