// Core modules implementing key normalization, record storage, and error modeling.
pub mod backend;
pub mod error;
pub mod key;
pub mod record;
pub mod store;
