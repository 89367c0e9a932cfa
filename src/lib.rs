pub mod constants;
pub mod errors;
pub mod provision;
pub mod settings;
